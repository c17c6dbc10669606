use osp_channel::{lock_pair, ChannelHandle};
use osp_core::wire::{CondPayRequest, RoutedBody, RoutedMessage};
use osp_core::{
    Address, CancelReason, ChannelId, ConditionalPay, ConfirmDecision, CrossNetRecord, Hash32, PayEvent, PayId, PayLeg, PayRecord,
    PayState, PeerMessage, PeerReply, RejectCode, RelayDirection, StateChange,
};
use osp_crypto::{sign, verify_preimage};
use osp_routing::{NetHop, RouteKind};
use std::sync::Arc;

use super::relay::ROUTED_TTL;
use super::{advance, cancel_reason_of, confirm_incoming, Delivery, PayEngine};
use crate::error::NodeError;

/// What this node does with a pay it just accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Destination,
    /// First hop inside our network of a pay from another network.
    Ingress,
    Forwarder,
}

impl PayEngine {
    pub(crate) fn channel_of(&self, channel_id: &ChannelId, from: &Address) -> Result<Arc<ChannelHandle>, NodeError> {
        let handle = self
            .registry
            .get(channel_id)
            .ok_or(NodeError::UnknownChannel(*channel_id))?;
        if handle.peer != *from {
            return Err(NodeError::InvalidRequest(format!(
                "channel {} is not shared with {}",
                channel_id.short(),
                from.short()
            )));
        }
        Ok(handle)
    }

    fn is_destination(&self, pay: &ConditionalPay) -> bool {
        pay.dest == self.local() && pay.dest_net == self.router.local_net()
    }

    /// Check that the proposal carries exactly `pay`.
    fn check_incoming_pay(&self, handle: &ChannelHandle, change: &StateChange, pay: &ConditionalPay) -> Result<(), NodeError> {
        let pay_id = pay.pay_id();
        if pay.token != handle.token {
            return Err(NodeError::InvalidRequest("pay token differs from channel token".into()));
        }
        match change {
            StateChange::AddPay {
                pay_id: id,
                amount,
                resolve_deadline,
            } if *id == pay_id && *amount == pay.amount && *resolve_deadline == pay.resolve_deadline => {}
            StateChange::DirectPay { pay_id: id, amount }
                if *id == pay_id && *amount == pay.amount && pay.is_unconditional() && self.is_destination(pay) => {}
            _ => return Err(NodeError::InvalidRequest("proposal does not match the pay".into())),
        }
        pay.validate()?;
        Ok(())
    }

    /// Countersign a pay locked (or transferred) to us and start whatever our
    /// role requires.
    pub async fn handle_cond_pay(self: &Arc<Self>, from: Address, req: CondPayRequest) -> Result<PeerReply, NodeError> {
        let CondPayRequest { proposal, pay, note } = req;
        let pay_id = pay.pay_id();
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

        self.check_incoming_pay(&handle, &proposal.change, &pay)?;
        let head = self.head().await?;
        if pay.resolve_deadline <= head {
            return Err(NodeError::Expired(pay_id));
        }
        self.reconcile.check_migration(&channel_id, pay.resolve_deadline)?;

        let direct = matches!(proposal.change, StateChange::DirectPay { .. });
        let seq = proposal.state.seq_num;
        let sig = {
            let mut ledger = handle.lock().await;
            self.transact_pay(&mut ledger, |ledger, _, records| {
                if let Some(existing) = records.get(&pay_id)? {
                    if existing.incoming.is_some() || existing.outgoing.is_some() {
                        return Err(NodeError::DuplicatePay(pay_id));
                    }
                }
                let outcome = ledger.accept_state(&proposal)?;
                let confirmed = ledger.take_confirmed(outcome.prior_seq);
                confirm_incoming(records, &confirmed)?;

                let mut leg = PayLeg::new(channel_id, from);
                leg.commit_seq = seq;
                advance(&mut leg, &[PayEvent::Countersigned])?;
                let record = records.insert(PayRecord::new(pay.clone()));
                record.direct = direct;
                record.note = note.clone();
                record.incoming = Some(leg);
                ledger.track_unconfirmed(pay_id, seq);
                Ok(outcome.sig)
            })?
        };

        let role = if self.is_destination(&pay) {
            Role::Destination
        } else if self.router.classify(&pay) == NetHop::Ingress {
            Role::Ingress
        } else {
            Role::Forwarder
        };
        tracing::info!(
            pay_id = %pay_id.short(),
            from = %from.short(),
            amount = %pay.amount,
            role = ?role,
            "accepted pay"
        );

        match role {
            Role::Destination if direct => {}
            Role::Destination => self.spawn_pay_work(pay_id, "destination", move |engine| async move {
                engine.finish_as_destination(pay_id).await
            }),
            Role::Ingress => self.spawn_pay_work(pay_id, "ingress", move |engine| async move {
                engine.relay_ingress(pay).await
            }),
            Role::Forwarder => self.spawn_pay_work(pay_id, "forward", move |engine| async move {
                engine.forward_pay(pay_id, pay).await
            }),
        }
        Ok(PeerReply::StateAck { sig })
    }

    // ---- destination ----------------------------------------------------------

    /// Collect the secrets of a pay addressed to us and ask our payer to
    /// settle. Pays with contract conditions wait for a confirm or reject.
    pub(crate) async fn finish_as_destination(self: &Arc<Self>, pay_id: PayId) -> Result<(), NodeError> {
        let record = self.pay_record(&pay_id)?.ok_or(NodeError::UnknownPay(pay_id))?;
        if record.pay.needs_confirmation() && record.decision.is_none() {
            tracing::info!(pay_id = %pay_id.short(), "pay waits for confirm or reject");
            return Ok(());
        }
        match self.collect_secrets(&record.pay).await {
            Ok(()) => self.send_settle_proof(pay_id, None).await,
            Err(e) => {
                tracing::warn!(pay_id = %pay_id.short(), error = %e, "could not get pay secrets, canceling");
                self.send_settle_proof(pay_id, Some(CancelReason::Unreachable)).await
            }
        }
    }

    /// Fetch every hash-lock secret of `pay` we do not hold yet from its source.
    pub(crate) async fn collect_secrets(&self, pay: &ConditionalPay) -> Result<(), NodeError> {
        for hash in pay.hash_locks() {
            if self.store().get_secret(hash)?.is_some() {
                continue;
            }
            let preimage = self.fetch_secret(pay, *hash).await?;
            self.update_records(|batch, _| {
                batch.put_secret(*hash, preimage);
                Ok(())
            })?;
        }
        Ok(())
    }

    async fn fetch_secret(&self, pay: &ConditionalPay, hash: Hash32) -> Result<Vec<u8>, NodeError> {
        let local = self.local();
        let body = RoutedBody::SecretRequest {
            pay_id: pay.pay_id(),
            hash,
        };
        let payload = RoutedMessage::signing_payload(&local, &pay.src, &body);
        let msg = RoutedMessage {
            origin: local,
            origin_key: self.keypair.public_key().to_vec(),
            dest: pay.src,
            dest_net: pay.src_net,
            body,
            sig: sign(&payload, &self.keypair).to_vec(),
            ttl: ROUTED_TTL,
        };

        let mut backoff = self.config.retry_backoff();
        let mut last = NodeError::Busy("no attempt made".into());
        for attempt in 0..self.config.retry_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            let next = match self.router.select_message_hop(&self.directory, &pay.src, pay.src_net) {
                Ok(next) => next,
                Err(e) => {
                    last = e.into();
                    continue;
                }
            };
            match self.request(&next, PeerMessage::Routed(msg.clone())).await {
                Ok(PeerReply::Secret(p)) if p.hash == hash && verify_preimage(&hash, &p.preimage) => {
                    return Ok(p.preimage);
                }
                Ok(PeerReply::Secret(_)) => {
                    return Err(NodeError::InvalidRequest("source returned a wrong preimage".into()));
                }
                Ok(PeerReply::Rejected { code, reason }) => {
                    last = NodeError::PeerRejected { code, reason };
                    if !matches!(code, RejectCode::Busy | RejectCode::Unreachable | RejectCode::NoRoute) {
                        return Err(last);
                    }
                }
                Ok(other) => {
                    return Err(NodeError::InvalidRequest(format!("unexpected reply to secret request: {other:?}")));
                }
                Err(e) => last = e.into(),
            }
        }
        Err(last)
    }

    /// Accept a pay that waits for an explicit decision.
    pub async fn confirm_pay(self: &Arc<Self>, pay_id: PayId) -> Result<(), NodeError> {
        let record = self.decidable(&pay_id).await?;
        self.collect_secrets(&record.pay).await?;
        let preimages = self.known_preimages(&record.pay)?;
        if self.evaluate(&record.pay, &preimages).await? == 0 {
            return Err(NodeError::ConditionsNotMet(pay_id));
        }
        self.update_records(|_, records| {
            records.expect(&pay_id)?.decision = Some(ConfirmDecision::Confirmed);
            Ok(())
        })?;
        tracing::info!(pay_id = %pay_id.short(), "pay confirmed");
        self.send_settle_proof(pay_id, None).await
    }

    /// Turn down a pay that waits for an explicit decision.
    pub async fn reject_pay(self: &Arc<Self>, pay_id: PayId) -> Result<(), NodeError> {
        self.decidable(&pay_id).await?;
        self.update_records(|_, records| {
            records.expect(&pay_id)?.decision = Some(ConfirmDecision::Rejected);
            Ok(())
        })?;
        tracing::info!(pay_id = %pay_id.short(), "pay rejected");
        self.send_settle_proof(pay_id, Some(CancelReason::Rejected)).await
    }

    async fn decidable(&self, pay_id: &PayId) -> Result<PayRecord, NodeError> {
        let record = self.pay_record(pay_id)?.ok_or(NodeError::UnknownPay(*pay_id))?;
        let Some(leg) = record.incoming.as_ref().filter(|_| self.is_destination(&record.pay)) else {
            return Err(NodeError::InvalidRequest("we are not the destination of this pay".into()));
        };
        if !record.pay.needs_confirmation() {
            return Err(NodeError::InvalidRequest("pay does not need a decision".into()));
        }
        if record.decision.is_some() || leg.state.is_final() {
            return Err(NodeError::InvalidRequest("pay already decided".into()));
        }
        if self.head().await? > record.pay.resolve_deadline {
            return Err(NodeError::Expired(*pay_id));
        }
        Ok(record)
    }

    // ---- forwarding -------------------------------------------------------------

    /// Re-issue a pay that entered our network and forward the derived pay.
    async fn relay_ingress(self: &Arc<Self>, pay: ConditionalPay) -> Result<(), NodeError> {
        let original = pay.pay_id();
        let derived = self.router.derive_ingress(&pay);
        let derived_id = derived.pay_id();
        let record = CrossNetRecord {
            original_pay_id: original,
            derived_pay_id: derived_id,
            direction: RelayDirection::Ingress,
            src_net: pay.src_net,
            dest_net: pay.dest_net,
            finalized: false,
            created_at: chrono::Utc::now(),
        };
        self.update_records(|batch, _| {
            batch.put_cross_net(record);
            Ok(())
        })?;
        tracing::info!(original = %original.short(), derived = %derived_id.short(), "re-issued pay for local network");
        self.forward_pay(original, derived).await
    }

    /// Lock `pay` toward the next hop. `upstream` is the pay id on our
    /// incoming leg, which differs from `pay`'s id at a network border. Any
    /// failure cancels the incoming leg.
    pub(crate) async fn forward_pay(self: &Arc<Self>, upstream: PayId, pay: ConditionalPay) -> Result<(), NodeError> {
        match self.try_forward(upstream, &pay).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = cancel_reason_of(&e);
                tracing::info!(pay_id = %upstream.short(), error = %e, ?reason, "cannot forward pay, canceling");
                self.send_settle_proof(upstream, Some(reason)).await
            }
        }
    }

    async fn try_forward(self: &Arc<Self>, upstream: PayId, pay: &ConditionalPay) -> Result<(), NodeError> {
        let pay_id = pay.pay_id();
        let record = self.pay_record(&upstream)?.ok_or(NodeError::UnknownPay(upstream))?;
        let in_leg = record.incoming.clone().ok_or(NodeError::UnknownPay(upstream))?;
        if pay.resolve_deadline <= self.head().await? {
            return Err(NodeError::Expired(upstream));
        }

        let route = self.router.select_forward_route(
            &self.directory,
            &pay.dest,
            &pay.token,
            pay.amount,
            pay.dest_net,
            &in_leg.peer,
        )?;
        self.reconcile.check_migration(&route.channel_id, pay.resolve_deadline)?;
        self.router.admit(&self.directory, &route.channel_id, pay.amount)?;
        if route.kind == RouteKind::Bridge {
            let record = CrossNetRecord {
                original_pay_id: pay_id,
                derived_pay_id: pay_id,
                direction: RelayDirection::Egress,
                src_net: pay.src_net,
                dest_net: pay.dest_net,
                finalized: false,
                created_at: chrono::Utc::now(),
            };
            self.update_records(|batch, _| {
                batch.put_cross_net(record);
                Ok(())
            })?;
        }

        let in_handle = self
            .registry
            .get(&in_leg.channel_id)
            .ok_or(NodeError::UnknownChannel(in_leg.channel_id))?;
        let out_handle = self
            .registry
            .get(&route.channel_id)
            .ok_or(NodeError::UnknownChannel(route.channel_id))?;

        let _slot = out_handle.send_slot().await;
        let proposal = {
            let (in_ledger, mut out_ledger) = lock_pair(&in_handle, &out_handle).await?;
            if !in_ledger.incoming().pending_pays.contains_key(&upstream) {
                return Err(NodeError::InvalidRequest("incoming lock is gone".into()));
            }
            let change = StateChange::AddPay {
                pay_id,
                amount: pay.amount,
                resolve_deadline: pay.resolve_deadline,
            };
            self.transact_pay(&mut out_ledger, |ledger, _, records| {
                let incoming_ok = records
                    .expect(&upstream)?
                    .incoming
                    .as_ref()
                    .is_some_and(|l| matches!(l.state, PayState::OnesigPaid | PayState::CosignedPending));
                if !incoming_ok {
                    return Err(NodeError::InvalidRequest("incoming leg is not locked".into()));
                }
                let proposal = ledger.prepare_proposal(change, Some(pay.clone()), None)?;
                let mut leg = PayLeg::new(route.channel_id, route.next_hop);
                leg.commit_seq = proposal.state.seq_num;
                advance(&mut leg, &[PayEvent::Proposed])?;
                if records.get(&pay_id)?.is_none() {
                    records.insert(PayRecord::new(pay.clone()));
                }
                let record = records.expect(&pay_id)?;
                if record.outgoing.is_some() {
                    return Err(NodeError::DuplicatePay(pay_id));
                }
                record.outgoing = Some(leg);
                Ok(proposal)
            })?
        };

        tracing::debug!(
            pay_id = %pay_id.short(),
            next_hop = %route.next_hop.short(),
            kind = ?route.kind,
            "forwarding pay"
        );
        let msg = PeerMessage::CondPayRequest(CondPayRequest {
            proposal,
            pay: pay.clone(),
            note: None,
        });
        // A refusal cancels the outgoing leg and propagates from there.
        if let Delivery::Refused { code, reason } = self.deliver(&out_handle, msg).await? {
            tracing::info!(pay_id = %pay_id.short(), %code, %reason, "next hop refused pay");
        }
        Ok(())
    }
}
