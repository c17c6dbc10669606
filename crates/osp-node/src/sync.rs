//! Channel state sync between the two parties of a channel.
//!
//! Each side sends its committed outgoing and incoming simplex states. The
//! receiver adopts anything newer that carries both signatures, commits an
//! outstanding proposal the peer turns out to have countersigned, and
//! re-sends a proposal the peer never saw. Sync runs on reconnect, at
//! startup and when a proposal has gone unanswered.

use osp_channel::{ChannelHandle, CommitOutcome};
use osp_core::wire::{SyncReply, SyncRequest};
use osp_core::{Address, PayEvent, PayId, PeerMessage, PeerReply, SimplexEntry, StateChange};
use std::sync::Arc;

use crate::error::NodeError;
use crate::pay_engine::{advance, after_outgoing_commit, confirm_incoming, PayEngine, RecordSet};

const MAX_ROUNDS: usize = 3;

/// What one sync changed locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// A newer cosigned state was taken from the peer.
    pub adopted: bool,
    /// Our outstanding proposal turned out to be countersigned.
    pub committed: bool,
    /// Our outstanding proposal was sent again.
    pub resent: bool,
    /// Incoming legs whose mutual commit was proven.
    pub confirmed: usize,
}

impl SyncReport {
    fn progressed(&self) -> bool {
        self.adopted || self.committed || self.confirmed > 0
    }

    fn merge(&mut self, other: SyncReport) {
        self.adopted |= other.adopted;
        self.committed |= other.committed;
        self.resent |= other.resent;
        self.confirmed += other.confirmed;
    }
}

pub struct SyncProtocol {
    engine: Arc<PayEngine>,
}

impl SyncProtocol {
    pub fn new(engine: Arc<PayEngine>) -> Self {
        Self { engine }
    }

    /// Sync every channel shared with `peer`. Returns how many succeeded.
    pub async fn sync_peer(&self, peer: &Address) -> usize {
        let mut synced = 0;
        for handle in self.engine.registry().with_peer(peer) {
            match self.sync_channel(&handle).await {
                Ok(report) => {
                    synced += 1;
                    if report != SyncReport::default() {
                        tracing::info!(channel = %handle.channel_id.short(), ?report, "channel synced");
                    }
                }
                Err(e) => {
                    tracing::warn!(channel = %handle.channel_id.short(), error = %e, "channel sync failed");
                }
            }
        }
        synced
    }

    /// Initiator side of a sync. Holds the channel's send slot throughout.
    pub async fn sync_channel(&self, handle: &ChannelHandle) -> Result<SyncReport, NodeError> {
        let _slot = handle.send_slot().await;
        let mut report = SyncReport::default();
        for _ in 0..MAX_ROUNDS {
            let request = {
                let ledger = handle.lock().await;
                SyncRequest {
                    channel_id: handle.channel_id,
                    outgoing: ledger.outgoing().clone(),
                    incoming: ledger.incoming().clone(),
                    pending_seq: ledger.pending_proposal().map(|p| p.state.seq_num),
                }
            };
            let reply = match self.engine.request(&handle.peer, PeerMessage::SyncRequest(request)).await? {
                PeerReply::SyncReply(reply) => reply,
                PeerReply::Rejected { code, reason } => return Err(NodeError::PeerRejected { code, reason }),
                other => return Err(NodeError::InvalidRequest(format!("unexpected reply to sync: {other:?}"))),
            };

            let mut step = self.apply_peer_view(handle, &reply.outgoing, &reply.incoming).await?;
            let unseen = {
                let ledger = handle.lock().await;
                ledger
                    .pending_proposal()
                    .filter(|p| p.state.seq_num > reply.incoming.seq_num())
                    .cloned()
            };
            if let Some(pending) = unseen {
                self.engine.resend_pending(handle, pending).await?;
                step.resent = true;
            }
            let again = step.progressed() || step.resent;
            report.merge(step);
            if !again {
                break;
            }
        }
        Ok(report)
    }

    /// Responder side: fold the peer's view in and answer with ours.
    pub async fn handle_request(&self, from: Address, req: SyncRequest) -> Result<PeerReply, NodeError> {
        let handle = self.engine.channel_of(&req.channel_id, &from)?;
        self.apply_peer_view(&handle, &req.outgoing, &req.incoming).await?;

        let (reply, resend) = {
            let ledger = handle.lock().await;
            let resend = ledger
                .pending_proposal()
                .is_some_and(|p| p.state.seq_num > req.incoming.seq_num());
            (
                SyncReply {
                    outgoing: ledger.outgoing().clone(),
                    incoming: ledger.incoming().clone(),
                },
                resend,
            )
        };

        if resend {
            let engine = self.engine.clone();
            let peer_seen = req.incoming.seq_num();
            self.engine.spawn(async move {
                let _slot = handle.send_slot().await;
                let pending = {
                    let ledger = handle.lock().await;
                    ledger
                        .pending_proposal()
                        .filter(|p| p.state.seq_num > peer_seen)
                        .cloned()
                };
                if let Some(pending) = pending {
                    if let Err(e) = engine.resend_pending(&handle, pending).await {
                        tracing::warn!(channel = %handle.channel_id.short(), error = %e, "re-send after sync failed");
                    }
                }
            });
        }
        Ok(PeerReply::SyncReply(reply))
    }

    /// Take what the peer's committed states prove. `peer_outgoing` is the
    /// peer's view of our incoming simplex and `peer_incoming` of our outgoing.
    async fn apply_peer_view(
        &self,
        handle: &ChannelHandle,
        peer_outgoing: &SimplexEntry,
        peer_incoming: &SimplexEntry,
    ) -> Result<SyncReport, NodeError> {
        let mut ledger = handle.lock().await;
        let (report, finished) = self.engine.transact_pay(&mut ledger, |ledger, _, records| {
            let mut report = SyncReport::default();
            let mut finished = Vec::new();

            if peer_outgoing.signed.is_cosigned() {
                report.adopted |= ledger.adopt_incoming(peer_outgoing)?;
                // The peer holding this state cosigned proves every leg
                // committed at or below it.
                if peer_outgoing.seq_num() <= ledger.incoming().seq_num() {
                    let confirmed = ledger.take_confirmed(peer_outgoing.seq_num());
                    report.confirmed = confirmed.len();
                    confirm_incoming(records, &confirmed)?;
                }
            }

            if peer_incoming.signed.is_cosigned() && peer_incoming.seq_num() > ledger.outgoing().seq_num() {
                let matches_pending = ledger
                    .pending_proposal()
                    .is_some_and(|p| p.state == *peer_incoming.state());
                if matches_pending {
                    if let CommitOutcome::Applied(change) = ledger.commit_state(peer_incoming.signed.clone())? {
                        finished = after_outgoing_commit(records, &change)?;
                        report.committed = true;
                    }
                } else {
                    let pending = ledger.pending_proposal().cloned();
                    if ledger.adopt_outgoing(peer_incoming)? {
                        report.adopted = true;
                        if let Some(dropped) = pending.filter(|_| ledger.pending_proposal().is_none()) {
                            finished = reconcile_dropped(records, &dropped.change, peer_incoming)?;
                        }
                    }
                }
            }
            Ok((report, finished))
        })?;
        drop(ledger);
        self.engine.spawn_upstream(finished);
        Ok(report)
    }
}

/// Our outstanding proposal was superseded by a newer state the peer holds.
/// We sign one state per seq, so the proposal was committed as part of it.
fn reconcile_dropped(
    records: &mut RecordSet<'_>,
    change: &StateChange,
    adopted: &SimplexEntry,
) -> Result<Vec<PayId>, NodeError> {
    let mut finished = Vec::new();
    match change {
        StateChange::AddPay { pay_id, .. } => {
            let Some(leg) = records.get(pay_id)?.and_then(|r| r.outgoing.as_mut()) else {
                return Ok(finished);
            };
            if adopted.pending_pays.contains_key(pay_id) {
                advance(
                    leg,
                    &[PayEvent::Countersigned, PayEvent::MutuallyCommitted { conditional: true }],
                )?;
            } else if !leg.state.is_final() {
                tracing::warn!(pay_id = %pay_id.short(), "pay was added and settled in states we no longer hold");
            }
        }
        direct @ StateChange::DirectPay { pay_id, .. } => {
            finished = after_outgoing_commit(records, direct)?;
            tracing::debug!(pay_id = %pay_id.short(), "direct pay committed in adopted state");
        }
        settle @ StateChange::SettlePays { .. } => {
            finished = after_outgoing_commit(records, settle)?;
        }
    }
    Ok(finished)
}
