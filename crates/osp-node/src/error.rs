use osp_channel::LedgerError;
use osp_core::{ChannelId, CoreError, PayId, RejectCode};
use osp_crypto::CryptoError;
use osp_routing::RoutingError;
use osp_settlement::{ChainError, ReconcileError};
use osp_store::StoreError;
use serde::Serialize;

use crate::transport::TransportError;

/// Broad class of a failure, used to pick retries and HTTP statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or unauthorized input; retrying the same request fails again.
    Protocol,
    /// Not enough balance or capacity right now.
    Capacity,
    /// A peer or the chain did not answer; worth retrying later.
    Liveness,
    /// The two sides disagree about channel state; a sync is needed.
    Consistency,
    /// Local state can no longer be trusted.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("peer rejected: {code}: {reason}")]
    PeerRejected { code: RejectCode, reason: String },

    #[error("unknown pay {0}")]
    UnknownPay(PayId),

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("pay {0} is past its resolve deadline")]
    Expired(PayId),

    #[error("pay {0} already exists")]
    DuplicatePay(PayId),

    #[error("conditions of pay {0} are not met")]
    ConditionsNotMet(PayId),

    /// Our outgoing leg of a forwarded pay has not reached a final state.
    #[error("outgoing leg of pay {0} is not settled yet")]
    DownstreamPending(PayId),

    /// The counterparty has not caught up yet; the request can be retried.
    #[error("busy: {0}")]
    Busy(String),
}

impl From<ChainError> for NodeError {
    fn from(e: ChainError) -> Self {
        Self::Reconcile(ReconcileError::Chain(e))
    }
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Ledger(e) => ledger_kind(e),
            Self::Routing(e) => match e {
                RoutingError::InsufficientCapacity { .. } => ErrorKind::Capacity,
                RoutingError::NoRoute { .. } | RoutingError::Unreachable(_) | RoutingError::NoBridge(_) => {
                    ErrorKind::Liveness
                }
                RoutingError::PolicyViolation(_) | RoutingError::UnknownChannel(_) => ErrorKind::Protocol,
            },
            Self::Reconcile(e) => match e {
                ReconcileError::Chain(_) | ReconcileError::PeerRefused(_) => ErrorKind::Liveness,
                ReconcileError::Ledger(e) => ledger_kind(e),
                ReconcileError::Store(_) => ErrorKind::Fatal,
                _ => ErrorKind::Protocol,
            },
            Self::Store(_) => ErrorKind::Fatal,
            Self::Transport(_) | Self::Busy(_) | Self::DownstreamPending(_) => ErrorKind::Liveness,
            Self::PeerRejected { code, .. } => match code {
                RejectCode::InsufficientBalance => ErrorKind::Capacity,
                RejectCode::StaleSeqNum => ErrorKind::Consistency,
                RejectCode::NoRoute | RejectCode::Unreachable | RejectCode::Busy => ErrorKind::Liveness,
                _ => ErrorKind::Protocol,
            },
            _ => ErrorKind::Protocol,
        }
    }

    /// Code sent back to a peer whose request failed with this error.
    pub fn reject_code(&self) -> RejectCode {
        match self {
            Self::Ledger(e) | Self::Reconcile(ReconcileError::Ledger(e)) => match e {
                LedgerError::StaleSeqNum { .. } => RejectCode::StaleSeqNum,
                LedgerError::StateMismatch(_) => RejectCode::InvalidState,
                LedgerError::InsufficientBalance { .. } => RejectCode::InsufficientBalance,
                LedgerError::ProposalOutstanding(_) => RejectCode::Busy,
                LedgerError::ChannelHalted(_) => RejectCode::ChannelHalted,
                LedgerError::UnknownChannel(_) => RejectCode::UnknownChannel,
                LedgerError::Crypto(_) => RejectCode::InvalidSignature,
                LedgerError::Core(CoreError::DuplicatePay(_)) => RejectCode::DuplicatePay,
                LedgerError::Core(CoreError::UnknownPay(_)) => RejectCode::UnknownPay,
                LedgerError::Store(_) | LedgerError::InvariantViolation(_) => RejectCode::Internal,
                _ => RejectCode::InvalidState,
            },
            Self::Routing(e) => match e {
                RoutingError::NoRoute { .. } | RoutingError::NoBridge(_) => RejectCode::NoRoute,
                RoutingError::Unreachable(_) => RejectCode::Unreachable,
                RoutingError::InsufficientCapacity { .. } => RejectCode::InsufficientBalance,
                RoutingError::PolicyViolation(_) => RejectCode::PolicyViolation,
                RoutingError::UnknownChannel(_) => RejectCode::UnknownChannel,
            },
            Self::Reconcile(ReconcileError::Migrating(_)) => RejectCode::Migrating,
            Self::Reconcile(ReconcileError::Policy(_)) => RejectCode::PolicyViolation,
            Self::Reconcile(ReconcileError::UnknownChannel(_)) | Self::UnknownChannel(_) => RejectCode::UnknownChannel,
            Self::Reconcile(ReconcileError::Crypto(_)) | Self::Crypto(_) => RejectCode::InvalidSignature,
            Self::Reconcile(ReconcileError::Invalid(_))
            | Self::InvalidRequest(_)
            | Self::Core(_)
            | Self::DownstreamPending(_) => {
                RejectCode::InvalidState
            }
            Self::PeerRejected { code, .. } => *code,
            Self::UnknownPay(_) => RejectCode::UnknownPay,
            Self::Expired(_) => RejectCode::Expired,
            Self::DuplicatePay(_) => RejectCode::DuplicatePay,
            Self::ConditionsNotMet(_) => RejectCode::PolicyViolation,
            Self::Busy(_) => RejectCode::Busy,
            Self::Transport(_) => RejectCode::Unreachable,
            Self::Reconcile(_) | Self::Store(_) => RejectCode::Internal,
        }
    }
}

fn ledger_kind(e: &LedgerError) -> ErrorKind {
    if e.is_fatal() {
        return ErrorKind::Fatal;
    }
    match e {
        LedgerError::InsufficientBalance { .. } => ErrorKind::Capacity,
        LedgerError::StaleSeqNum { .. } | LedgerError::StateMismatch(_) => ErrorKind::Consistency,
        LedgerError::ProposalOutstanding(_) => ErrorKind::Liveness,
        _ => ErrorKind::Protocol,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osp_core::{Address, PayId};

    #[test]
    fn test_kinds() {
        let e = NodeError::Ledger(LedgerError::InsufficientBalance {
            available: 1,
            required: 2,
        });
        assert_eq!(e.kind(), ErrorKind::Capacity);
        assert_eq!(e.reject_code(), RejectCode::InsufficientBalance);

        let e = NodeError::Ledger(LedgerError::StaleSeqNum { expected: 3, got: 2 });
        assert_eq!(e.kind(), ErrorKind::Consistency);
        assert_eq!(e.reject_code(), RejectCode::StaleSeqNum);

        let e = NodeError::Ledger(LedgerError::InvariantViolation("negative balance".into()));
        assert_eq!(e.kind(), ErrorKind::Fatal);

        let e = NodeError::Transport(TransportError::Unreachable(Address([1; 20])));
        assert_eq!(e.kind(), ErrorKind::Liveness);

        let e = NodeError::from(ChainError::Transient("rpc".into()));
        assert_eq!(e.kind(), ErrorKind::Liveness);
    }

    #[test]
    fn test_routing_reject_codes() {
        let e = NodeError::Routing(RoutingError::NoRoute {
            dest: Address([4; 20]),
        });
        assert_eq!(e.reject_code(), RejectCode::NoRoute);
        assert_eq!(e.kind(), ErrorKind::Liveness);
        let e = NodeError::Reconcile(ReconcileError::Migrating(ChannelId([1; 32])));
        assert_eq!(e.reject_code(), RejectCode::Migrating);
    }

    #[test]
    fn test_downstream_pending_aborts_the_proposal() {
        // Anything but Busy or StaleSeqNum makes the payer drop its proposal
        // and propose again on a later sweep.
        let e = NodeError::DownstreamPending(PayId([7; 32]));
        assert_eq!(e.reject_code(), RejectCode::InvalidState);
        assert_eq!(e.kind(), ErrorKind::Liveness);
    }
}
