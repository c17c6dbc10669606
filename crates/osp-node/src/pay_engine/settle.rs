use osp_core::wire::{PaySettleProof, Preimage, StateProposal};
use osp_core::{
    Address, Amount, BlockNumber, CancelReason, ChannelId, Condition, ConditionalPay, ConfirmDecision, PayId,
    PayLeg, PayRecord, PayState, PaySettlement, PeerMessage, PeerReply, RejectCode, RelayDirection, StateChange,
};
use osp_crypto::verify_preimage;
use std::sync::Arc;

use super::{confirm_incoming, settle_leg, Delivery, PayEngine};
use crate::error::NodeError;

impl PayEngine {
    /// Ask our payer to settle `pay_id` in full, or to cancel it when
    /// `cancel` is set. The request is recorded first so it survives a
    /// restart and can be re-sent.
    pub(crate) async fn send_settle_proof(&self, pay_id: PayId, cancel: Option<CancelReason>) -> Result<(), NodeError> {
        let record = self.update_records(|_, records| {
            let record = records.expect(&pay_id)?;
            let Some(leg) = record.incoming.as_ref() else {
                return Err(NodeError::InvalidRequest("pay has no incoming leg".into()));
            };
            if leg.state.is_final() {
                return Ok(None);
            }
            record.settle_requested = Some(if cancel.is_some() { 0 } else { record.pay.amount });
            if let Some(reason) = cancel {
                record.cancel_reason.get_or_insert(reason);
            }
            Ok(Some(record.clone()))
        })?;
        match record {
            Some(record) => self.deliver_settle_proof(&record).await,
            None => Ok(()),
        }
    }

    /// Send the settle proof recorded on `record` to the payer.
    pub(crate) async fn deliver_settle_proof(&self, record: &PayRecord) -> Result<(), NodeError> {
        let Some(leg) = record.incoming.as_ref() else {
            return Ok(());
        };
        let cancel = match record.settle_requested {
            Some(0) => Some(record.cancel_reason.unwrap_or(CancelReason::Expired)),
            Some(_) => None,
            None => return Ok(()),
        };
        let preimages = if cancel.is_none() {
            self.known_preimages(&record.pay)?
        } else {
            Vec::new()
        };
        let proof = PaySettleProof {
            pay_id: record.pay_id,
            cancel,
            preimages,
        };

        let mut backoff = self.config.retry_backoff();
        for attempt in 0..self.config.retry_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            match self.request(&leg.peer, PeerMessage::PaySettleProof(proof.clone())).await? {
                PeerReply::Ack => {
                    tracing::debug!(pay_id = %record.pay_id.short(), cancel = ?proof.cancel, "settle proof accepted");
                    return Ok(());
                }
                PeerReply::Rejected {
                    code: RejectCode::Busy, ..
                } => continue,
                PeerReply::Rejected { code, reason } => return Err(NodeError::PeerRejected { code, reason }),
                other => {
                    return Err(NodeError::InvalidRequest(format!("unexpected reply to settle proof: {other:?}")));
                }
            }
        }
        Err(NodeError::Busy(format!("payer of {} is not ready to settle", record.pay_id.short())))
    }

    pub(crate) fn known_preimages(&self, pay: &ConditionalPay) -> Result<Vec<Preimage>, NodeError> {
        let mut out = Vec::new();
        for hash in pay.hash_locks() {
            if let Some(preimage) = self.store().get_secret(hash)? {
                out.push(Preimage { hash: *hash, preimage });
            }
        }
        Ok(out)
    }

    /// Amount `pay` resolves to given `preimages` and the current outcome of
    /// its contract conditions.
    pub(crate) async fn evaluate(&self, pay: &ConditionalPay, preimages: &[Preimage]) -> Result<Amount, NodeError> {
        let mut outcomes = Vec::with_capacity(pay.conditions.len());
        for condition in &pay.conditions {
            let met = match condition {
                Condition::HashLock { hash } => preimages
                    .iter()
                    .any(|p| p.hash == *hash && verify_preimage(hash, &p.preimage)),
                contract => self.reconcile.chain().query_condition(contract).await?,
            };
            outcomes.push(met);
        }
        Ok(pay.resolved_amount(&outcomes))
    }

    /// Payer side: our payee proved the conditions of a pay, or asked to
    /// cancel it. The settlement itself is proposed in the background.
    pub async fn handle_settle_proof(self: &Arc<Self>, from: Address, proof: PaySettleProof) -> Result<PeerReply, NodeError> {
        let pay_id = proof.pay_id;
        let record = self.pay_record(&pay_id)?.ok_or(NodeError::UnknownPay(pay_id))?;
        let Some(leg) = record.outgoing.as_ref().filter(|l| l.peer == from) else {
            return Err(NodeError::UnknownPay(pay_id));
        };
        if leg.state.is_final() {
            return Ok(PeerReply::Ack);
        }
        if leg.state != PayState::CosignedPending {
            return Err(NodeError::Busy(format!("pay {} is not committed yet", pay_id.short())));
        }
        let channel_id = leg.channel_id;

        for p in &proof.preimages {
            if !record.pay.hash_locks().any(|h| *h == p.hash) || !verify_preimage(&p.hash, &p.preimage) {
                return Err(NodeError::InvalidRequest("preimage does not open any lock of the pay".into()));
            }
        }

        let head = self.head().await?;
        let onchain = self.reconcile.onchain_resolved_amount(pay_id).await?;
        let amount = match proof.cancel {
            Some(_) => onchain.unwrap_or(0),
            None if head > record.pay.resolve_deadline => onchain.unwrap_or(0),
            None => {
                let amount = self.evaluate(&record.pay, &proof.preimages).await?;
                if amount == 0 {
                    return Err(NodeError::ConditionsNotMet(pay_id));
                }
                amount.max(onchain.unwrap_or(0))
            }
        };

        self.update_records(|batch, records| {
            for p in &proof.preimages {
                batch.put_secret(p.hash, p.preimage.clone());
            }
            let record = records.expect(&pay_id)?;
            if amount == 0 {
                let reason = proof.cancel.unwrap_or(CancelReason::Expired);
                record.cancel_reason.get_or_insert(reason);
            }
            Ok(())
        })?;

        tracing::info!(pay_id = %pay_id.short(), amount = %amount, "settling pay with payee");
        self.spawn_settle(channel_id, vec![PaySettlement { pay_id, amount }]);
        Ok(PeerReply::Ack)
    }

    pub(crate) fn spawn_settle(self: &Arc<Self>, channel_id: ChannelId, settlements: Vec<PaySettlement>) {
        let engine = self.clone();
        self.spawn(async move {
            if let Err(e) = engine.settle_outgoing(channel_id, settlements).await {
                tracing::warn!(channel = %channel_id.short(), error = %e, "settlement not committed, will retry");
            }
        });
    }

    /// Propose a settlement of pays we locked on `channel_id`. Pays no longer
    /// locked there are skipped.
    pub(crate) async fn settle_outgoing(
        self: &Arc<Self>,
        channel_id: ChannelId,
        settlements: Vec<PaySettlement>,
    ) -> Result<Option<Delivery>, NodeError> {
        let handle = self
            .registry
            .get(&channel_id)
            .ok_or(NodeError::UnknownChannel(channel_id))?;
        let _slot = handle.send_slot().await;
        let proposal = {
            let mut ledger = handle.lock().await;
            let locked = &ledger.outgoing().pending_pays;
            let settlements: Vec<_> = settlements
                .into_iter()
                .filter(|s| locked.contains_key(&s.pay_id))
                .collect();
            if settlements.is_empty() {
                return Ok(None);
            }
            self.transact_pay(&mut ledger, |ledger, _, _| {
                Ok(ledger.prepare_proposal(StateChange::SettlePays { settlements }, None, None)?)
            })?
        };
        let delivery = self.deliver(&handle, PeerMessage::PaySettleRequest(proposal)).await?;
        Ok(Some(delivery))
    }

    /// Payee side: countersign a settlement of pays locked toward us.
    pub async fn handle_settle_request(self: &Arc<Self>, from: Address, proposal: StateProposal) -> Result<PeerReply, NodeError> {
        let channel_id = proposal.state.channel_id;
        let handle = self.channel_of(&channel_id, &from)?;
        {
            let ledger = handle.lock().await;
            let incoming = ledger.incoming();
            if *incoming.state() == proposal.state && incoming.signed.sig_of_peer_from == proposal.sig {
                return Ok(PeerReply::StateAck {
                    sig: incoming.signed.sig_of_peer_to.clone(),
                });
            }
        }
        let StateChange::SettlePays { settlements } = &proposal.change else {
            return Err(NodeError::InvalidRequest("expected a settlement".into()));
        };

        let head = self.head().await?;
        for s in settlements {
            let record = self.pay_record(&s.pay_id)?.ok_or(NodeError::UnknownPay(s.pay_id))?;
            if record.incoming.as_ref().map(|l| l.channel_id) != Some(channel_id) {
                return Err(NodeError::UnknownPay(s.pay_id));
            }
            if s.amount < record.pay.amount {
                self.check_short_settlement(&record, s.amount, head).await?;
            }
        }

        let (sig, settled) = {
            let mut ledger = handle.lock().await;
            self.transact_pay(&mut ledger, |ledger, _, records| {
                let outcome = ledger.accept_state(&proposal)?;
                let confirmed = ledger.take_confirmed(outcome.prior_seq);
                confirm_incoming(records, &confirmed)?;
                let mut settled = Vec::with_capacity(settlements.len());
                for s in settlements {
                    ledger.drop_unconfirmed(&s.pay_id);
                    let record = records.expect(&s.pay_id)?;
                    if let Some(leg) = record.incoming.as_mut() {
                        settle_leg(leg, s.amount)?;
                    }
                    if s.amount == 0 {
                        record.cancel_reason.get_or_insert(CancelReason::Expired);
                    }
                    settled.push(s.pay_id);
                }
                Ok((outcome.sig, settled))
            })?
        };

        for pay_id in &settled {
            tracing::info!(pay_id = %pay_id.short(), from = %from.short(), "incoming pay settled");
        }
        self.finalize_cross_net(&settled)?;
        Ok(PeerReply::StateAck { sig })
    }

    /// A payer may settle below the full amount only where we cannot lose:
    /// never below what the chain resolved, never before our own outgoing
    /// leg of the pay is final, never below what that leg paid, and only
    /// after the deadline or when we asked for the cancel.
    async fn check_short_settlement(&self, record: &PayRecord, amount: Amount, head: BlockNumber) -> Result<(), NodeError> {
        let pay_id = record.pay_id;
        let onchain = self.reconcile.onchain_resolved_amount(pay_id).await?.unwrap_or(0);
        if amount < onchain {
            return Err(NodeError::InvalidRequest(format!(
                "settlement {amount} is below the on-chain resolved amount {onchain}"
            )));
        }
        if let Some(out) = self.downstream_leg(record)? {
            if !out.state.is_final() {
                return Err(NodeError::DownstreamPending(pay_id));
            }
            let paid = match out.state {
                PayState::CosignedPaid => out.settled_amount.unwrap_or(record.pay.amount),
                _ => 0,
            };
            if amount < paid {
                return Err(NodeError::InvalidRequest("the pay was already paid downstream".into()));
            }
        }
        let requested = record.settle_requested.is_some_and(|a| a <= amount)
            || record.decision == Some(ConfirmDecision::Rejected);
        if head <= record.pay.resolve_deadline && !requested {
            return Err(NodeError::InvalidRequest("pay is still pending".into()));
        }
        Ok(())
    }

    /// Our outgoing leg of this pay: on the same record for a forwarder, on
    /// the derived pay at a network border.
    fn downstream_leg(&self, record: &PayRecord) -> Result<Option<PayLeg>, NodeError> {
        let downstream = match self.store().cross_net_by_original(&record.pay_id)? {
            Some(x) if x.direction == RelayDirection::Ingress => self.pay_record(&x.derived_pay_id)?,
            _ => Some(record.clone()),
        };
        Ok(downstream.and_then(|r| r.outgoing))
    }

    fn finalize_cross_net(&self, pay_ids: &[PayId]) -> Result<(), NodeError> {
        let store = self.store();
        let mut finalized = Vec::new();
        for pay_id in pay_ids {
            let found = match store.cross_net_by_original(pay_id)? {
                Some(x) => Some(x),
                None => store.get_cross_net(pay_id)?,
            };
            if let Some(mut x) = found.filter(|x| !x.finalized) {
                x.finalized = true;
                finalized.push(x);
            }
        }
        if finalized.is_empty() {
            return Ok(());
        }
        self.update_records(|batch, _| {
            for x in finalized {
                batch.put_cross_net(x);
            }
            Ok(())
        })
    }

    /// Hand a finished outgoing leg's result to our own payer: the same pay
    /// for a forwarder, or the original pay at a network border.
    pub(crate) async fn propagate_upstream(&self, pay_id: PayId) -> Result<(), NodeError> {
        let Some(record) = self.pay_record(&pay_id)? else {
            return Ok(());
        };
        let Some(out) = record.outgoing.as_ref().filter(|l| l.state.is_final()) else {
            return Ok(());
        };
        let upstream_id = if record.incoming.is_some() {
            pay_id
        } else {
            match self.store().get_cross_net(&pay_id)? {
                Some(x) if x.direction == RelayDirection::Ingress => x.original_pay_id,
                // We are the source.
                _ => return Ok(()),
            }
        };
        let upstream = self.pay_record(&upstream_id)?.ok_or(NodeError::UnknownPay(upstream_id))?;
        let pending = upstream.incoming.as_ref().is_some_and(|l| !l.state.is_final());
        if !pending || upstream.settle_requested.is_some() {
            return Ok(());
        }
        match out.state {
            PayState::CosignedPaid => self.send_settle_proof(upstream_id, None).await,
            _ => {
                let reason = record.cancel_reason.unwrap_or(CancelReason::Expired);
                self.send_settle_proof(upstream_id, Some(reason)).await
            }
        }
    }

    /// The chain resolved a pay. Payees record it; payers fold it into an
    /// off-chain settlement.
    pub(crate) fn note_onchain_resolution(self: &Arc<Self>, pay_id: PayId, amount: Amount) -> Result<(), NodeError> {
        let Some(record) = self.pay_record(&pay_id)? else {
            return Ok(());
        };
        self.update_records(|_, records| {
            records.expect(&pay_id)?.onchain_resolved = Some(amount);
            Ok(())
        })?;
        tracing::info!(pay_id = %pay_id.short(), amount = %amount, "pay resolved on chain");
        if let Some(leg) = record.outgoing.filter(|l| l.state == PayState::CosignedPending) {
            self.spawn_settle(leg.channel_id, vec![PaySettlement { pay_id, amount }]);
        }
        Ok(())
    }

    /// Payee fallback: resolve a pay on chain with the secrets we hold when
    /// our payer did not settle before the deadline draws near.
    pub(crate) async fn resolve_on_chain(&self, pay_id: PayId) -> Result<(), NodeError> {
        let record = self.pay_record(&pay_id)?.ok_or(NodeError::UnknownPay(pay_id))?;
        let preimages = self
            .known_preimages(&record.pay)?
            .into_iter()
            .map(|p| p.preimage)
            .collect();
        tracing::warn!(pay_id = %pay_id.short(), "payer did not settle in time, resolving on chain");
        self.reconcile
            .settle_conditional_pay_on_chain(record.pay.clone(), preimages)
            .await?;
        let amount = self.reconcile.onchain_resolved_amount(pay_id).await?;
        self.update_records(|_, records| {
            records.expect(&pay_id)?.onchain_resolved = amount;
            Ok(())
        })
    }
}
