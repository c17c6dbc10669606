use osp_channel::LedgerError;
use osp_core::{ChannelId, CoreError};
use osp_crypto::CryptoError;
use osp_store::StoreError;

/// Errors returned by a ledger chain backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChainError {
    /// The transaction is not visible yet; poll again.
    #[error("transaction not found yet")]
    NotFoundYet,

    /// A temporary RPC failure worth retrying.
    #[error("transient chain error: {0}")]
    Transient(String),

    #[error("chain rpc error: {0}")]
    Rpc(String),

    #[error("transaction reverted: {0}")]
    TxFailed(String),

    /// The call was refused before a transaction was created.
    #[error("rejected by contract: {0}")]
    Rejected(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl ChainError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFoundYet | Self::Transient(_))
    }
}

/// Errors raised while reconciling channels with the chain.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("peer refused: {0}")]
    PeerRefused(String),

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("channel {0} is migrating")]
    Migrating(ChannelId),

    #[error("invalid request: {0}")]
    Invalid(String),
}
