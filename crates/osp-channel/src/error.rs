use osp_core::{ChannelId, ChannelStatus, CoreError};
use osp_crypto::CryptoError;
use osp_store::StoreError;

/// Errors raised by a channel ledger. A rejected operation never changes the
/// committed state.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("stale seq num: expected {expected}, got {got}")]
    StaleSeqNum { expected: u64, got: u64 },

    #[error("proposed state does not match the declared change: {0}")]
    StateMismatch(String),

    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: u128, required: u128 },

    #[error("a proposal is already outstanding on channel {0}")]
    ProposalOutstanding(ChannelId),

    #[error("no pending proposal to commit")]
    NoPendingProposal,

    #[error("channel is {0}")]
    ChannelNotOpen(ChannelStatus),

    #[error("channel halted: {0}")]
    ChannelHalted(String),

    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("both locks requested on the same channel {0}")]
    SameChannel(ChannelId),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Errors after which the channel must not be used until an operator looks at it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ChannelHalted(_) | Self::InvariantViolation(_))
    }
}
