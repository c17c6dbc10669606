//! On-chain side of an OSP node.
//!
//! The [`LedgerChain`] trait is the only way the node talks to the ledger
//! contract. [`TxWaiter`] turns submissions into confirmed receipts,
//! [`EventMonitor`] streams contract events, and [`ReconciliationEngine`]
//! drives every on-chain operation and folds events back into the channel
//! ledgers. [`SimulatedChain`] is an in-process chain for tests and devnets.

pub mod chain;
pub mod error;
pub mod monitor;
pub mod reconcile;
pub mod refill;
pub mod simulated;
pub mod waiter;

pub use chain::{
    ChainEvent, ChainLog, ChannelInfo, CooperativeWithdrawTx, DepositRequest, LedgerChain, OnChainStatus,
    OpenChannelTx, PayInfo, Payout, Receipt, TxHash, WithdrawIntent,
};
pub use error::{ChainError, ReconcileError};
pub use monitor::{EventMonitor, MonitorConfig};
pub use reconcile::{EventFollowup, PeerApprovals, ReconcileConfig, ReconciliationEngine};
pub use refill::{RefillConfig, RefillController};
pub use simulated::{SimulatedChain, SimulatedChainConfig};
pub use waiter::{TxWaiter, WaitConfig};
