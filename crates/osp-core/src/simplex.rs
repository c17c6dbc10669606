//! One direction of a channel: the balance flowing from `peer_from` to the
//! other participant, plus the pays currently locked in that direction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::types::{amount_str, hex_bytes, Address, Amount, BlockNumber, ChannelId, PayId};

/// Amount and deadline of a pay locked in a simplex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPay {
    #[serde(with = "amount_str")]
    pub amount: Amount,
    pub resolve_deadline: BlockNumber,
}

/// Per-pay lock table of a simplex, keyed by pay id.
pub type PendingPays = BTreeMap<PayId, PendingPay>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplexState {
    pub channel_id: ChannelId,
    pub peer_from: Address,
    pub seq_num: u64,
    /// Cumulative amount already transferred to the other participant.
    #[serde(with = "amount_str")]
    pub transfer_to_peer: Amount,
    pub pending_pay_ids: Vec<PayId>,
    #[serde(with = "amount_str")]
    pub total_pending_amount: Amount,
    pub last_pay_resolve_deadline: BlockNumber,
}

impl SimplexState {
    pub fn initial(channel_id: ChannelId, peer_from: Address) -> Self {
        Self {
            channel_id,
            peer_from,
            seq_num: 0,
            transfer_to_peer: 0,
            pending_pay_ids: Vec::new(),
            total_pending_amount: 0,
            last_pay_resolve_deadline: 0,
        }
    }

    /// Canonical bytes both participants sign.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(128 + self.pending_pay_ids.len() * 32);
        payload.extend_from_slice(b"osp.simplex.v1");
        payload.extend_from_slice(self.channel_id.as_bytes());
        payload.extend_from_slice(self.peer_from.as_bytes());
        payload.extend_from_slice(&self.seq_num.to_be_bytes());
        payload.extend_from_slice(&self.transfer_to_peer.to_be_bytes());
        payload.extend_from_slice(&(self.pending_pay_ids.len() as u32).to_be_bytes());
        for id in &self.pending_pay_ids {
            payload.extend_from_slice(id.as_bytes());
        }
        payload.extend_from_slice(&self.total_pending_amount.to_be_bytes());
        payload.extend_from_slice(&self.last_pay_resolve_deadline.to_be_bytes());
        payload
    }

    /// Compute the successor of this state under `change`.
    ///
    /// Both participants run this on their own copy of the committed state, so a
    /// proposal is only countersigned if it is exactly what this function yields.
    pub fn apply(
        &self,
        change: &StateChange,
        pending: &PendingPays,
    ) -> Result<(SimplexState, PendingPays), CoreError> {
        let mut next = self.clone();
        let mut pending = pending.clone();
        next.seq_num = self
            .seq_num
            .checked_add(1)
            .ok_or(CoreError::Overflow("seq_num"))?;

        match change {
            StateChange::AddPay {
                pay_id,
                amount,
                resolve_deadline,
            } => {
                if *amount == 0 {
                    return Err(CoreError::InvalidAmount("locked amount must be positive".into()));
                }
                if pending.contains_key(pay_id) {
                    return Err(CoreError::DuplicatePay(*pay_id));
                }
                pending.insert(
                    *pay_id,
                    PendingPay {
                        amount: *amount,
                        resolve_deadline: *resolve_deadline,
                    },
                );
                next.pending_pay_ids.push(*pay_id);
                next.total_pending_amount = next
                    .total_pending_amount
                    .checked_add(*amount)
                    .ok_or(CoreError::Overflow("total_pending_amount"))?;
                next.last_pay_resolve_deadline = next.last_pay_resolve_deadline.max(*resolve_deadline);
            }
            StateChange::DirectPay { amount, .. } => {
                if *amount == 0 {
                    return Err(CoreError::InvalidAmount("direct pay amount must be positive".into()));
                }
                next.transfer_to_peer = next
                    .transfer_to_peer
                    .checked_add(*amount)
                    .ok_or(CoreError::Overflow("transfer_to_peer"))?;
            }
            StateChange::SettlePays { settlements } => {
                if settlements.is_empty() {
                    return Err(CoreError::ValidationError("empty settlement list".into()));
                }
                for settlement in settlements {
                    let locked = pending
                        .remove(&settlement.pay_id)
                        .ok_or(CoreError::UnknownPay(settlement.pay_id))?;
                    if settlement.amount > locked.amount {
                        return Err(CoreError::InvalidAmount(format!(
                            "settled {} exceeds locked {}",
                            settlement.amount, locked.amount
                        )));
                    }
                    next.total_pending_amount = next
                        .total_pending_amount
                        .checked_sub(locked.amount)
                        .ok_or(CoreError::Overflow("total_pending_amount"))?;
                    next.transfer_to_peer = next
                        .transfer_to_peer
                        .checked_add(settlement.amount)
                        .ok_or(CoreError::Overflow("transfer_to_peer"))?;
                    next.pending_pay_ids.retain(|id| id != &settlement.pay_id);
                }
                next.last_pay_resolve_deadline = pending
                    .values()
                    .map(|p| p.resolve_deadline)
                    .max()
                    .unwrap_or(self.last_pay_resolve_deadline);
            }
        }

        Ok((next, pending))
    }
}

/// The balance change a proposal declares. The acceptor recomputes the new
/// state from it instead of trusting the proposer's arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChange {
    /// Lock `amount` for a conditional pay.
    AddPay {
        pay_id: PayId,
        #[serde(with = "amount_str")]
        amount: Amount,
        resolve_deadline: BlockNumber,
    },
    /// Transfer `amount` immediately (single-hop unconditional pay).
    DirectPay {
        pay_id: PayId,
        #[serde(with = "amount_str")]
        amount: Amount,
    },
    /// Unlock pays, moving the settled part to the peer and the rest back.
    SettlePays { settlements: Vec<PaySettlement> },
}

impl StateChange {
    /// Pay ids this change touches.
    pub fn pay_ids(&self) -> Vec<PayId> {
        match self {
            Self::AddPay { pay_id, .. } | Self::DirectPay { pay_id, .. } => vec![*pay_id],
            Self::SettlePays { settlements } => settlements.iter().map(|s| s.pay_id).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaySettlement {
    pub pay_id: PayId,
    #[serde(with = "amount_str")]
    pub amount: Amount,
}

/// A simplex state with the signatures collected so far. An empty signature
/// means that participant has not signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSimplexState {
    pub state: SimplexState,
    #[serde(with = "hex_bytes")]
    pub sig_of_peer_from: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub sig_of_peer_to: Vec<u8>,
}

impl SignedSimplexState {
    pub fn unsigned(state: SimplexState) -> Self {
        Self {
            state,
            sig_of_peer_from: Vec::new(),
            sig_of_peer_to: Vec::new(),
        }
    }

    pub fn is_cosigned(&self) -> bool {
        !self.sig_of_peer_from.is_empty() && !self.sig_of_peer_to.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SimplexState {
        SimplexState::initial(ChannelId([1; 32]), Address([2; 20]))
    }

    #[test]
    fn test_add_pay_locks_amount() {
        let pay_id = PayId([5; 32]);
        let (next, pending) = base()
            .apply(
                &StateChange::AddPay {
                    pay_id,
                    amount: 30,
                    resolve_deadline: 12,
                },
                &PendingPays::new(),
            )
            .unwrap();
        assert_eq!(next.seq_num, 1);
        assert_eq!(next.total_pending_amount, 30);
        assert_eq!(next.pending_pay_ids, vec![pay_id]);
        assert_eq!(next.last_pay_resolve_deadline, 12);
        assert_eq!(pending[&pay_id].amount, 30);
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let pay_id = PayId([5; 32]);
        let change = StateChange::AddPay {
            pay_id,
            amount: 30,
            resolve_deadline: 12,
        };
        let (next, pending) = base().apply(&change, &PendingPays::new()).unwrap();
        assert!(matches!(next.apply(&change, &pending), Err(CoreError::DuplicatePay(_))));
    }

    #[test]
    fn test_settle_partial_returns_remainder() {
        let pay_id = PayId([5; 32]);
        let (locked, pending) = base()
            .apply(
                &StateChange::AddPay {
                    pay_id,
                    amount: 30,
                    resolve_deadline: 12,
                },
                &PendingPays::new(),
            )
            .unwrap();
        let (settled, pending) = locked
            .apply(
                &StateChange::SettlePays {
                    settlements: vec![PaySettlement { pay_id, amount: 10 }],
                },
                &pending,
            )
            .unwrap();
        assert_eq!(settled.seq_num, 2);
        assert_eq!(settled.transfer_to_peer, 10);
        assert_eq!(settled.total_pending_amount, 0);
        assert!(settled.pending_pay_ids.is_empty());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_settle_more_than_locked_rejected() {
        let pay_id = PayId([5; 32]);
        let (locked, pending) = base()
            .apply(
                &StateChange::AddPay {
                    pay_id,
                    amount: 30,
                    resolve_deadline: 12,
                },
                &PendingPays::new(),
            )
            .unwrap();
        let result = locked.apply(
            &StateChange::SettlePays {
                settlements: vec![PaySettlement { pay_id, amount: 31 }],
            },
            &pending,
        );
        assert!(matches!(result, Err(CoreError::InvalidAmount(_))));
    }

    #[test]
    fn test_settle_unknown_pay_rejected() {
        let result = base().apply(
            &StateChange::SettlePays {
                settlements: vec![PaySettlement {
                    pay_id: PayId([8; 32]),
                    amount: 0,
                }],
            },
            &PendingPays::new(),
        );
        assert!(matches!(result, Err(CoreError::UnknownPay(_))));
    }

    #[test]
    fn test_signing_payload_covers_seq() {
        let a = base();
        let mut b = base();
        b.seq_num = 1;
        assert_ne!(a.signing_payload(), b.signing_payload());
    }
}
