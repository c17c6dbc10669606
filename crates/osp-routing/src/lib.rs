//! Next-hop routing for an OSP node.
//!
//! - [`RoutingTable`]: static next hops per destination, a default route and
//!   bridge peers per foreign sub-network.
//! - [`Router`]: route selection over the node's channels, admission checks and
//!   cross-net classification.
//! - [`PolicySet`]: per-token open and pay policies with a default fallback.

pub mod error;
pub mod policy;
pub mod router;
pub mod table;

pub use error::RoutingError;
pub use policy::{PolicySet, TokenPolicy};
pub use router::{ChannelCapacity, ChannelDirectory, NetHop, RouteChoice, RouteKind, Router};
pub use table::RoutingTable;
