//! OSP full node.
//!
//! [`Node`] is the composition root: it owns the channel registry, the
//! [`PayEngine`] that moves pays through their states, the [`SyncProtocol`]
//! that reconciles channel state with peers, and the on-chain
//! reconciliation engine. Peers reach it through a [`PeerTransport`];
//! clients through the HTTP API in [`api`].

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod node;
pub mod pay_engine;
pub mod sync;
pub mod transport;

pub use config::OspConfig;
pub use error::{ErrorKind, NodeError};
pub use node::{Node, NodeStatus, PeerStatusView};
pub use pay_engine::{PayEngine, PayUpdate, SendRequest};
pub use sync::{SyncProtocol, SyncReport};
pub use transport::{HttpTransport, LocalEndpoint, LocalHub, PeerHandler, PeerStatus, PeerTransport, TransportError};
