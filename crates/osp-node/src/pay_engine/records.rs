use osp_core::{Amount, PayEvent, PayId, PayLeg, PayRecord, PayState, PayStateMachine};
use osp_store::{Store, StoreBatch};
use std::collections::BTreeMap;

use crate::error::NodeError;

/// A record written by a transaction, with the client-visible state it had
/// before.
#[derive(Debug, Clone)]
pub(crate) struct PayChange {
    pub before: PayState,
    pub record: PayRecord,
}

/// Pay records read and modified within one store transaction. Every record
/// loaded here is written back by [`finish`](Self::finish).
pub(crate) struct RecordSet<'a> {
    store: &'a dyn Store,
    entries: BTreeMap<PayId, PayChange>,
}

impl<'a> RecordSet<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&mut self, pay_id: &PayId) -> Result<Option<&mut PayRecord>, NodeError> {
        if !self.entries.contains_key(pay_id) {
            let Some(record) = self.store.get_pay(pay_id)? else {
                return Ok(None);
            };
            self.entries.insert(
                *pay_id,
                PayChange {
                    before: record.state(),
                    record,
                },
            );
        }
        Ok(self.entries.get_mut(pay_id).map(|e| &mut e.record))
    }

    pub fn expect(&mut self, pay_id: &PayId) -> Result<&mut PayRecord, NodeError> {
        self.get(pay_id)?.ok_or(NodeError::UnknownPay(*pay_id))
    }

    pub fn insert(&mut self, record: PayRecord) -> &mut PayRecord {
        let pay_id = record.pay_id;
        let before = self.entries.get(&pay_id).map(|e| e.before).unwrap_or(PayState::Null);
        let entry = self.entries.entry(pay_id).or_insert(PayChange { before, record: record.clone() });
        entry.record = record;
        &mut entry.record
    }

    pub fn finish(self, batch: &mut StoreBatch) -> Vec<PayChange> {
        self.entries
            .into_values()
            .map(|mut change| {
                change.record.touch();
                batch.put_pay(change.record.clone());
                change
            })
            .collect()
    }
}

/// Apply `events` to a leg in order.
pub(crate) fn advance(leg: &mut PayLeg, events: &[PayEvent]) -> Result<(), NodeError> {
    for event in events {
        leg.state = PayStateMachine::transition(leg.state, *event)?;
    }
    Ok(())
}

/// Close a leg with a committed settlement. A settlement can only exist for
/// a lock both sides committed, so a leg still short of that is advanced
/// first. Final legs are left alone.
pub(crate) fn settle_leg(leg: &mut PayLeg, amount: Amount) -> Result<(), NodeError> {
    if leg.state.is_final() {
        return Ok(());
    }
    if amount == 0 {
        advance(leg, &[PayEvent::Canceled])?;
    } else {
        let committed = PayEvent::MutuallyCommitted { conditional: true };
        match leg.state {
            PayState::Null | PayState::OnesigPending => {
                advance(leg, &[PayEvent::Countersigned, committed])?;
            }
            PayState::OnesigPaid => advance(leg, &[committed])?,
            _ => {}
        }
        advance(leg, &[PayEvent::Resolved])?;
    }
    leg.settled_amount = Some(amount);
    Ok(())
}
