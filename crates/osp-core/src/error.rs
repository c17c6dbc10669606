use crate::state_machine::{PayEvent, PayState};
use crate::types::PayId;

/// Core protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid pay state transition from {from} on {event:?}")]
    InvalidStateTransition { from: PayState, event: PayEvent },

    #[error("validation failed: {0}")]
    ValidationError(String),

    #[error("invalid {kind} length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("pay {0} is already pending in this simplex")]
    DuplicatePay(PayId),

    #[error("pay {0} is not pending in this simplex")]
    UnknownPay(PayId),

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
