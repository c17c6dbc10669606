//! Per-channel balance ledger and the serializer that orders access to it.

pub mod error;
pub mod ledger;
pub mod registry;

pub use error::LedgerError;
pub use ledger::{AcceptOutcome, ChannelLedger, ChannelSummary, CommitOutcome, Side};
pub use registry::{lock_pair, ChannelHandle, ChannelRegistry};
