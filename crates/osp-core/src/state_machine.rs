use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// State of one leg (one channel) of a pay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayState {
    /// No balance change has been proposed for this leg.
    Null,
    /// The payer signed a proposal; the payee has not countersigned yet.
    OnesigPending,
    /// The payee countersigned; the two views are not yet known to match.
    OnesigPaid,
    /// Both sides committed the lock; waiting for resolution.
    CosignedPending,
    /// Both sides committed the transfer. Final.
    CosignedPaid,
    /// Both sides committed the unlock back to the payer. Final.
    CosignedCanceled,
}

impl PayState {
    /// Whether this is a final (terminal) state.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::CosignedPaid | Self::CosignedCanceled)
    }

    /// Progress rank used to recognise replays of events already applied.
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::OnesigPending => 1,
            Self::OnesigPaid => 2,
            Self::CosignedPending => 3,
            Self::CosignedPaid | Self::CosignedCanceled => 4,
        }
    }
}

impl fmt::Display for PayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::OnesigPending => write!(f, "ONESIG_PENDING"),
            Self::OnesigPaid => write!(f, "ONESIG_PAID"),
            Self::CosignedPending => write!(f, "COSIGNED_PENDING"),
            Self::CosignedPaid => write!(f, "COSIGNED_PAID"),
            Self::CosignedCanceled => write!(f, "COSIGNED_CANCELED"),
        }
    }
}

/// Events that drive a leg's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayEvent {
    /// We signed a proposal adding the pay to our outgoing simplex.
    Proposed,
    /// The payee's countersignature exists (received by the payer, produced by the payee).
    Countersigned,
    /// Both sides are known to have committed the lock or transfer.
    MutuallyCommitted { conditional: bool },
    /// A settlement with a positive amount was committed.
    Resolved,
    /// A settlement with a zero amount was committed, or the proposal was refused.
    Canceled,
}

impl PayEvent {
    fn target(&self) -> PayState {
        match self {
            Self::Proposed => PayState::OnesigPending,
            Self::Countersigned => PayState::OnesigPaid,
            Self::MutuallyCommitted { conditional: true } => PayState::CosignedPending,
            Self::MutuallyCommitted { conditional: false } => PayState::CosignedPaid,
            Self::Resolved => PayState::CosignedPaid,
            Self::Canceled => PayState::CosignedCanceled,
        }
    }
}

/// Pure transition function for pay legs.
///
/// Valid transitions:
/// - Null → OnesigPending (Proposed)
/// - Null | OnesigPending → OnesigPaid (Countersigned)
/// - OnesigPaid → CosignedPending | CosignedPaid (MutuallyCommitted)
/// - CosignedPending → CosignedPaid (Resolved)
/// - any non-final → CosignedCanceled (Canceled)
///
/// Re-applying an event whose effect is already reflected is a no-op that
/// returns the current state; anything else out of a final state is an error.
pub struct PayStateMachine;

impl PayStateMachine {
    pub fn transition(current: PayState, event: PayEvent) -> Result<PayState, CoreError> {
        let target = event.target();
        if current == target {
            return Ok(current);
        }

        let next = match (current, event) {
            (PayState::Null, PayEvent::Proposed) => PayState::OnesigPending,
            (PayState::Null | PayState::OnesigPending, PayEvent::Countersigned) => PayState::OnesigPaid,
            (PayState::OnesigPaid, PayEvent::MutuallyCommitted { .. }) => target,
            (PayState::CosignedPending, PayEvent::Resolved) => PayState::CosignedPaid,
            (s, PayEvent::Canceled) if !s.is_final() => PayState::CosignedCanceled,

            // Stale events for a leg that already moved past them.
            (s, e) if !s.is_final() && s.rank() > e.target().rank() => return Ok(s),

            _ => {
                return Err(CoreError::InvalidStateTransition {
                    from: current,
                    event,
                })
            }
        };

        tracing::debug!(from = %current, to = %next, event = ?event, "pay leg transition");

        Ok(next)
    }

    /// Check if a transition is valid without performing it.
    pub fn can_transition(current: PayState, event: PayEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_happy_path() {
        let s = PayStateMachine::transition(PayState::Null, PayEvent::Proposed).unwrap();
        assert_eq!(s, PayState::OnesigPending);
        let s = PayStateMachine::transition(s, PayEvent::Countersigned).unwrap();
        assert_eq!(s, PayState::OnesigPaid);
        let s = PayStateMachine::transition(s, PayEvent::MutuallyCommitted { conditional: true }).unwrap();
        assert_eq!(s, PayState::CosignedPending);
        let s = PayStateMachine::transition(s, PayEvent::Resolved).unwrap();
        assert_eq!(s, PayState::CosignedPaid);
        assert!(s.is_final());
    }

    #[test]
    fn test_direct_pay_skips_pending() {
        let s = PayStateMachine::transition(PayState::OnesigPaid, PayEvent::MutuallyCommitted { conditional: false })
            .unwrap();
        assert_eq!(s, PayState::CosignedPaid);
    }

    #[test]
    fn test_payee_starts_at_onesig_paid() {
        let s = PayStateMachine::transition(PayState::Null, PayEvent::Countersigned).unwrap();
        assert_eq!(s, PayState::OnesigPaid);
    }

    #[test]
    fn test_cancel_from_every_pending_state() {
        for s in [
            PayState::Null,
            PayState::OnesigPending,
            PayState::OnesigPaid,
            PayState::CosignedPending,
        ] {
            assert_eq!(
                PayStateMachine::transition(s, PayEvent::Canceled).unwrap(),
                PayState::CosignedCanceled
            );
        }
    }

    #[test]
    fn test_canceled_never_transitions_again() {
        assert!(PayStateMachine::transition(PayState::CosignedCanceled, PayEvent::Resolved).is_err());
        assert!(PayStateMachine::transition(PayState::CosignedCanceled, PayEvent::Countersigned).is_err());
        assert!(
            PayStateMachine::transition(PayState::CosignedCanceled, PayEvent::MutuallyCommitted { conditional: false })
                .is_err()
        );
    }

    #[test]
    fn test_paid_cannot_be_canceled() {
        assert!(PayStateMachine::transition(PayState::CosignedPaid, PayEvent::Canceled).is_err());
    }

    #[test]
    fn test_replays_are_noops() {
        assert_eq!(
            PayStateMachine::transition(PayState::OnesigPaid, PayEvent::Countersigned).unwrap(),
            PayState::OnesigPaid
        );
        assert_eq!(
            PayStateMachine::transition(PayState::CosignedPaid, PayEvent::Resolved).unwrap(),
            PayState::CosignedPaid
        );
        assert_eq!(
            PayStateMachine::transition(PayState::CosignedCanceled, PayEvent::Canceled).unwrap(),
            PayState::CosignedCanceled
        );
        assert_eq!(
            PayStateMachine::transition(PayState::CosignedPending, PayEvent::Countersigned).unwrap(),
            PayState::CosignedPending
        );
    }

    #[test]
    fn test_resolve_requires_mutual_commit() {
        assert!(!PayStateMachine::can_transition(PayState::OnesigPending, PayEvent::Resolved));
        assert!(!PayStateMachine::can_transition(PayState::Null, PayEvent::Resolved));
    }

    #[test]
    fn test_display() {
        assert_eq!(PayState::CosignedCanceled.to_string(), "COSIGNED_CANCELED");
        assert_eq!(PayState::OnesigPending.to_string(), "ONESIG_PENDING");
    }
}
