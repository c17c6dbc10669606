//! Pay engine: drives every pay this node sends, receives or forwards
//! through the per-leg state machine.
//!
//! All record and ledger mutations for one step happen in a single store
//! batch (see [`PayEngine::transact_pay`]), so a crash leaves either the old
//! or the new state of both. Peer round trips happen outside ledger locks;
//! proposals on a channel are serialized by the channel's send slot.

mod expiry;
mod receive;
mod records;
mod relay;
mod send;
mod settle;

pub use send::SendRequest;

pub(crate) use records::{advance, settle_leg, PayChange, RecordSet};

use dashmap::DashMap;
use osp_channel::{ChannelHandle, ChannelLedger, ChannelRegistry, CommitOutcome, LedgerError};
use osp_core::wire::{CondPayRequest, StateProposal};
use osp_core::{
    Address, Amount, BlockNumber, CancelReason, Envelope, PayEvent, PayId, PayRecord, PayState, PeerMessage,
    PeerReply, PendingProposal, RejectCode, StateChange,
};
use osp_crypto::KeyPair;
use osp_routing::Router;
use osp_settlement::ReconciliationEngine;
use osp_store::{Store, StoreBatch, StoreError};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::Instrument;

use crate::config::PaymentConfig;
use crate::directory::NodeDirectory;
use crate::error::NodeError;
use crate::transport::{PeerTransport, TransportError};

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Client-visible change of a pay's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayUpdate {
    pub pay_id: PayId,
    pub state: PayState,
    #[serde(with = "osp_core::types::amount_str::option")]
    pub settled_amount: Option<Amount>,
    pub cancel_reason: Option<CancelReason>,
}

/// What became of a proposal sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    Committed,
    Refused { code: RejectCode, reason: String },
    /// No answer; the proposal stays outstanding until a sync settles it.
    Undelivered,
}

pub struct PayEngine {
    keypair: Arc<KeyPair>,
    registry: Arc<ChannelRegistry>,
    router: Arc<Router>,
    directory: NodeDirectory,
    transport: Arc<dyn PeerTransport>,
    reconcile: Arc<ReconciliationEngine>,
    config: PaymentConfig,
    /// Serializes read-modify-write of pay records across channels.
    records_lock: Mutex<()>,
    /// Pays with background work running.
    working: DashMap<PayId, ()>,
    updates: broadcast::Sender<PayUpdate>,
    last_timestamp: AtomicU64,
    /// Flipped once on shutdown; background work stops at its next await.
    stop: watch::Sender<bool>,
    span: tracing::Span,
}

impl PayEngine {
    pub fn new(
        keypair: Arc<KeyPair>,
        registry: Arc<ChannelRegistry>,
        router: Arc<Router>,
        transport: Arc<dyn PeerTransport>,
        reconcile: Arc<ReconciliationEngine>,
        config: PaymentConfig,
        span: tracing::Span,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            directory: NodeDirectory::new(registry.clone(), transport.clone()),
            keypair,
            registry,
            router,
            transport,
            reconcile,
            config,
            records_lock: Mutex::new(()),
            working: DashMap::new(),
            updates,
            last_timestamp: AtomicU64::new(0),
            stop,
            span,
        })
    }

    pub fn local(&self) -> Address {
        self.keypair.address()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn reconcile(&self) -> &Arc<ReconciliationEngine> {
        &self.reconcile
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.registry.store().as_ref()
    }

    /// Stream of pay state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PayUpdate> {
        self.updates.subscribe()
    }

    pub fn pay_record(&self, pay_id: &PayId) -> Result<Option<PayRecord>, NodeError> {
        Ok(self.store().get_pay(pay_id)?)
    }

    pub(crate) async fn head(&self) -> Result<BlockNumber, NodeError> {
        Ok(self.reconcile.block_number().await?)
    }

    /// Microsecond timestamp, strictly increasing per node so two pays built
    /// in the same instant get different ids.
    pub(crate) fn next_timestamp(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let prev = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(prev + 1)
    }

    // ---- transactions -----------------------------------------------------

    fn records_guard(&self) -> Result<MutexGuard<'_, ()>, NodeError> {
        self.records_lock.lock().map_err(|_| NodeError::Store(StoreError::Poisoned))
    }

    /// Run `f` against a locked ledger and the pay records it touches, and
    /// persist both in one batch.
    pub(crate) fn transact_pay<T, F>(&self, ledger: &mut ChannelLedger, f: F) -> Result<T, NodeError>
    where
        F: FnOnce(&mut ChannelLedger, &mut StoreBatch, &mut RecordSet<'_>) -> Result<T, NodeError>,
    {
        let changes;
        let out = {
            let _guard = self.records_guard()?;
            let store = self.store();
            let mut collected = Vec::new();
            let out = self.registry.transact_locked(ledger, |ledger, batch| {
                let mut records = RecordSet::new(store);
                let out = f(ledger, batch, &mut records)?;
                collected = records.finish(batch);
                Ok::<_, NodeError>(out)
            })?;
            changes = collected;
            out
        };
        self.publish(changes);
        Ok(out)
    }

    /// Record-only counterpart of [`transact_pay`](Self::transact_pay).
    pub(crate) fn update_records<T, F>(&self, f: F) -> Result<T, NodeError>
    where
        F: FnOnce(&mut StoreBatch, &mut RecordSet<'_>) -> Result<T, NodeError>,
    {
        let changes;
        let out = {
            let _guard = self.records_guard()?;
            let store = self.store();
            let mut batch = StoreBatch::new();
            let mut records = RecordSet::new(store);
            let out = f(&mut batch, &mut records)?;
            changes = records.finish(&mut batch);
            store.write(batch)?;
            out
        };
        self.publish(changes);
        Ok(out)
    }

    fn publish(&self, changes: Vec<PayChange>) {
        for change in changes {
            let state = change.record.state();
            if state == change.before {
                continue;
            }
            let settled_amount = match state {
                PayState::CosignedPaid | PayState::CosignedCanceled => change
                    .record
                    .outgoing
                    .as_ref()
                    .or(change.record.incoming.as_ref())
                    .and_then(|l| l.settled_amount),
                _ => None,
            };
            if state.is_final() {
                tracing::info!(
                    parent: &self.span,
                    pay_id = %change.record.pay_id.short(),
                    state = %state,
                    reason = ?change.record.cancel_reason,
                    "pay finished"
                );
            }
            let _ = self.updates.send(PayUpdate {
                pay_id: change.record.pay_id,
                state,
                settled_amount,
                cancel_reason: change.record.cancel_reason,
            });
        }
    }

    // ---- peer round trips ---------------------------------------------------

    pub(crate) async fn request(&self, peer: &Address, msg: PeerMessage) -> Result<PeerReply, TransportError> {
        let envelope = Envelope {
            from: self.local(),
            msg,
        };
        self.transport.request(peer, envelope).await
    }

    /// Send our outstanding proposal on `handle` and fold the answer back into
    /// the ledger and the pay records. The caller holds the channel's send slot.
    pub(crate) async fn deliver(self: &Arc<Self>, handle: &ChannelHandle, msg: PeerMessage) -> Result<Delivery, NodeError> {
        let kind = msg.kind();
        let reply = match self.request(&handle.peer, msg).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(
                    parent: &self.span,
                    peer = %handle.peer.short(),
                    kind,
                    error = %e,
                    "proposal not delivered, left for sync"
                );
                return Ok(Delivery::Undelivered);
            }
        };

        match reply {
            PeerReply::StateAck { sig } => {
                let mut ledger = handle.lock().await;
                let finished = self.transact_pay(&mut ledger, |ledger, _, records| {
                    match ledger.commit_with_peer_sig(sig) {
                        Ok(CommitOutcome::Applied(change)) => after_outgoing_commit(records, &change),
                        Ok(CommitOutcome::AlreadyCommitted) => Ok(Vec::new()),
                        // A concurrent sync already committed it.
                        Err(LedgerError::NoPendingProposal) => Ok(Vec::new()),
                        Err(e) => Err(e.into()),
                    }
                })?;
                drop(ledger);
                self.spawn_upstream(finished);
                Ok(Delivery::Committed)
            }
            PeerReply::Rejected { code, reason } => {
                tracing::info!(
                    parent: &self.span,
                    peer = %handle.peer.short(),
                    kind,
                    %code,
                    %reason,
                    "proposal refused"
                );
                if code == RejectCode::StaleSeqNum || code == RejectCode::Busy {
                    return Ok(Delivery::Refused { code, reason });
                }
                let mut ledger = handle.lock().await;
                let finished = self.transact_pay(&mut ledger, |ledger, _, records| {
                    match ledger.abort_pending() {
                        Some(aborted) => cancel_aborted(records, &aborted, cancel_reason_for(code)),
                        None => Ok(Vec::new()),
                    }
                })?;
                drop(ledger);
                self.spawn_upstream(finished);
                Ok(Delivery::Refused { code, reason })
            }
            other => Err(NodeError::InvalidRequest(format!("unexpected reply to {kind}: {other:?}"))),
        }
    }

    /// Re-send an outstanding proposal the peer never answered.
    pub(crate) async fn resend_pending(
        self: &Arc<Self>,
        handle: &ChannelHandle,
        pending: PendingProposal,
    ) -> Result<Delivery, NodeError> {
        let proposal = StateProposal {
            state: pending.state,
            change: pending.change,
            sig: pending.sig,
        };
        let msg = match &proposal.change {
            StateChange::AddPay { .. } | StateChange::DirectPay { .. } => match pending.pay {
                Some(pay) => PeerMessage::CondPayRequest(CondPayRequest {
                    proposal,
                    pay,
                    note: pending.note,
                }),
                None => {
                    return Err(NodeError::InvalidRequest("outstanding pay proposal lost its pay".into()));
                }
            },
            StateChange::SettlePays { .. } => PeerMessage::PaySettleRequest(proposal),
        };
        tracing::debug!(parent: &self.span, channel = %handle.channel_id.short(), "re-sending outstanding proposal");
        self.deliver(handle, msg).await
    }

    // ---- background work ----------------------------------------------------

    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stop = self.stop.subscribe();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = fut => {}
                    _ = stopped(stop) => {}
                }
            }
            .instrument(self.span.clone()),
        );
    }

    /// Stop all background work of this engine.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Run `work` for `pay_id` unless work for that pay is already running.
    pub(crate) fn spawn_pay_work<F, Fut>(self: &Arc<Self>, pay_id: PayId, what: &'static str, work: F)
    where
        F: FnOnce(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        if self.working.insert(pay_id, ()).is_some() {
            return;
        }
        let engine = self.clone();
        self.spawn(async move {
            if let Err(e) = work(engine.clone()).await {
                tracing::warn!(pay_id = %pay_id.short(), what, error = %e, "pay work failed");
            }
            engine.working.remove(&pay_id);
        });
    }

    pub(crate) fn is_working(&self, pay_id: &PayId) -> bool {
        self.working.contains_key(pay_id)
    }

    /// Tell the upstream payer about pays whose outgoing leg just finished.
    pub(crate) fn spawn_upstream(self: &Arc<Self>, finished: Vec<PayId>) {
        for pay_id in finished {
            let engine = self.clone();
            self.spawn(async move {
                if let Err(e) = engine.propagate_upstream(pay_id).await {
                    tracing::warn!(pay_id = %pay_id.short(), error = %e, "upstream settle failed, will retry");
                }
            });
        }
    }
}

/// Resolves once `stop` carries `true` or its sender is gone.
pub(crate) async fn stopped(mut stop: watch::Receiver<bool>) {
    loop {
        let done = *stop.borrow_and_update();
        if done || stop.changed().await.is_err() {
            return;
        }
    }
}

/// Update outgoing legs after the peer countersigned `change`. Returns the
/// pays whose outgoing leg became final.
pub(crate) fn after_outgoing_commit(records: &mut RecordSet<'_>, change: &StateChange) -> Result<Vec<PayId>, NodeError> {
    let mut finished = Vec::new();
    match change {
        StateChange::AddPay { pay_id, .. } => {
            if let Some(leg) = records.get(pay_id)?.and_then(|r| r.outgoing.as_mut()) {
                advance(
                    leg,
                    &[PayEvent::Countersigned, PayEvent::MutuallyCommitted { conditional: true }],
                )?;
            }
        }
        StateChange::DirectPay { pay_id, amount } => {
            if let Some(leg) = records.get(pay_id)?.and_then(|r| r.outgoing.as_mut()) {
                advance(
                    leg,
                    &[PayEvent::Countersigned, PayEvent::MutuallyCommitted { conditional: false }],
                )?;
                leg.settled_amount = Some(*amount);
                finished.push(*pay_id);
            }
        }
        StateChange::SettlePays { settlements } => {
            for s in settlements {
                let Some(record) = records.get(&s.pay_id)? else {
                    continue;
                };
                let Some(leg) = record.outgoing.as_mut() else {
                    continue;
                };
                settle_leg(leg, s.amount)?;
                if s.amount == 0 && record.cancel_reason.is_none() {
                    record.cancel_reason = Some(CancelReason::Expired);
                }
                finished.push(s.pay_id);
            }
        }
    }
    Ok(finished)
}

/// Mark incoming legs whose lock the peer has now proven committed.
pub(crate) fn confirm_incoming(records: &mut RecordSet<'_>, pay_ids: &[PayId]) -> Result<(), NodeError> {
    for pay_id in pay_ids {
        let Some(record) = records.get(pay_id)? else {
            continue;
        };
        let direct = record.direct;
        let amount = record.pay.amount;
        if let Some(leg) = record.incoming.as_mut() {
            advance(leg, &[PayEvent::MutuallyCommitted { conditional: !direct }])?;
            if direct {
                leg.settled_amount = Some(amount);
            }
        }
    }
    Ok(())
}

fn cancel_aborted(
    records: &mut RecordSet<'_>,
    aborted: &PendingProposal,
    reason: CancelReason,
) -> Result<Vec<PayId>, NodeError> {
    let (StateChange::AddPay { pay_id, .. } | StateChange::DirectPay { pay_id, .. }) = &aborted.change else {
        return Ok(Vec::new());
    };
    let Some(record) = records.get(pay_id)? else {
        return Ok(Vec::new());
    };
    let Some(leg) = record.outgoing.as_mut() else {
        return Ok(Vec::new());
    };
    advance(leg, &[PayEvent::Canceled])?;
    leg.settled_amount = Some(0);
    record.cancel_reason.get_or_insert(reason);
    Ok(vec![*pay_id])
}

pub(crate) fn cancel_reason_for(code: RejectCode) -> CancelReason {
    match code {
        RejectCode::InsufficientBalance => CancelReason::InsufficientBalance,
        RejectCode::NoRoute | RejectCode::Unreachable => CancelReason::Unreachable,
        RejectCode::Expired => CancelReason::Expired,
        _ => CancelReason::PeerRefused,
    }
}

pub(crate) fn cancel_reason_of(error: &NodeError) -> CancelReason {
    match error {
        NodeError::PeerRejected { code, .. } => cancel_reason_for(*code),
        NodeError::Expired(_) => CancelReason::Expired,
        e => cancel_reason_for(e.reject_code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use osp_channel::LedgerError;

    #[test]
    fn test_cancel_reasons() {
        assert_eq!(cancel_reason_for(RejectCode::InsufficientBalance), CancelReason::InsufficientBalance);
        assert_eq!(cancel_reason_for(RejectCode::NoRoute), CancelReason::Unreachable);
        assert_eq!(cancel_reason_for(RejectCode::PolicyViolation), CancelReason::PeerRefused);

        let e = NodeError::Ledger(LedgerError::InsufficientBalance {
            available: 0,
            required: 1,
        });
        assert_eq!(cancel_reason_of(&e), CancelReason::InsufficientBalance);
        assert_eq!(cancel_reason_of(&NodeError::Expired(PayId([1; 32]))), CancelReason::Expired);
    }
}
