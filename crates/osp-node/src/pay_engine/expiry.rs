use osp_core::{PayId, PayRecord, PayState, PaySettlement};
use std::sync::Arc;

use super::PayEngine;
use crate::error::NodeError;

impl PayEngine {
    /// Settle every pay we locked whose resolve deadline has passed: with
    /// the amount the chain resolved it to, or zero. Only legs both sides
    /// committed are settled; a proposal the peer never answered stays open
    /// until a sync tells us whether it was countersigned. Returns the pays
    /// a settlement was proposed for.
    pub async fn settle_expired_pays(self: &Arc<Self>) -> Result<Vec<PayId>, NodeError> {
        let head = self.head().await?;
        let mut proposed = Vec::new();
        for handle in self.registry.all() {
            if !self.transport.is_reachable(&handle.peer) {
                continue;
            }
            let expired = {
                let ledger = handle.lock().await;
                if ledger.pending_proposal().is_some() {
                    continue;
                }
                ledger.outgoing_pays_expired(head)
            };
            let mut settlements = Vec::new();
            for pay_id in expired {
                let Some(record) = self.pay_record(&pay_id)? else {
                    continue;
                };
                let committed = record
                    .outgoing
                    .as_ref()
                    .is_some_and(|l| l.channel_id == handle.channel_id && l.state == PayState::CosignedPending);
                if !committed {
                    continue;
                }
                let amount = self.reconcile.onchain_resolved_amount(pay_id).await?.unwrap_or(0);
                settlements.push(PaySettlement { pay_id, amount });
            }
            if settlements.is_empty() {
                continue;
            }
            let ids: Vec<_> = settlements.iter().map(|s| s.pay_id).collect();
            tracing::info!(channel = %handle.channel_id.short(), count = ids.len(), "settling expired pays");
            match self.settle_outgoing(handle.channel_id, settlements).await {
                Ok(_) => proposed.extend(ids),
                Err(e) => {
                    tracing::warn!(channel = %handle.channel_id.short(), error = %e, "could not settle expired pays");
                }
            }
        }
        Ok(proposed)
    }

    /// Restart stalled work on pays we receive: re-send settle proofs,
    /// resolve on chain when the payer runs out the clock, hand finished
    /// downstream results upstream, and resume destination work lost in a
    /// restart. Records touched within `stale_after` are left alone.
    pub async fn maintain(self: &Arc<Self>, stale_after: chrono::Duration) -> Result<(), NodeError> {
        let head = self.head().await?;
        let cutoff = chrono::Utc::now() - stale_after;
        let margin = self.config.onchain_resolve_margin;
        for record in self.store().active_pays()? {
            let Some(leg) = record.incoming.as_ref() else {
                continue;
            };
            if leg.state.is_final() || record.updated_at > cutoff || self.is_working(&record.pay_id) {
                continue;
            }
            let pay_id = record.pay_id;
            match record.settle_requested {
                Some(amount)
                    if amount > 0
                        && leg.state == PayState::CosignedPending
                        && record.onchain_resolved.is_none()
                        && head + margin >= record.pay.resolve_deadline
                        && head <= record.pay.resolve_deadline =>
                {
                    self.spawn_pay_work(pay_id, "resolve on chain", move |engine| async move {
                        engine.resolve_on_chain(pay_id).await
                    });
                }
                Some(_) => {
                    if !self.transport.is_reachable(&leg.peer) {
                        continue;
                    }
                    self.touch(&pay_id)?;
                    self.spawn_pay_work(pay_id, "resend settle proof", move |engine| async move {
                        let Some(record) = engine.pay_record(&pay_id)? else {
                            return Ok(());
                        };
                        engine.deliver_settle_proof(&record).await
                    });
                }
                None => self.resume(&record, head)?,
            }
        }
        Ok(())
    }

    fn resume(self: &Arc<Self>, record: &PayRecord, head: u64) -> Result<(), NodeError> {
        let pay_id = record.pay_id;
        let downstream_done = match self.store().cross_net_by_original(&pay_id)? {
            Some(x) => self.pay_record(&x.derived_pay_id)?,
            None => Some(record.clone()),
        }
        .and_then(|r| r.outgoing.map(|l| (r.pay_id, l.state.is_final())));

        match downstream_done {
            Some((downstream_id, true)) => {
                self.touch(&pay_id)?;
                self.spawn_pay_work(pay_id, "propagate", move |engine| async move {
                    engine.propagate_upstream(downstream_id).await
                });
            }
            Some((_, false)) => {}
            None if record.pay.dest == self.local() && head < record.pay.resolve_deadline => {
                self.touch(&pay_id)?;
                self.spawn_pay_work(pay_id, "destination", move |engine| async move {
                    engine.finish_as_destination(pay_id).await
                });
            }
            None => {}
        }
        Ok(())
    }

    fn touch(&self, pay_id: &PayId) -> Result<(), NodeError> {
        self.update_records(|_, records| {
            records.expect(pay_id)?;
            Ok(())
        })
    }
}
