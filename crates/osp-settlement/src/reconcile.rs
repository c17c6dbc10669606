//! Keeping channel ledgers and the ledger chain in agreement.
//!
//! Every on-chain action a node takes goes through [`ReconciliationEngine`]:
//! opening and funding channels, withdrawals, unilateral settlement and
//! disputes, on-chain pay resolution and ledger migration. Chain events come
//! back in through [`ReconciliationEngine::handle_event`]; each handler is
//! idempotent so a replayed log changes nothing.

use async_trait::async_trait;
use dashmap::DashMap;
use osp_channel::{ChannelHandle, ChannelLedger, ChannelRegistry, Side};
use osp_core::wire::{OpenChannelRequest, OpenChannelTerms, WithdrawRequest, WithdrawTerms};
use osp_core::{
    Address, Amount, BlockNumber, Channel, ChannelId, ChannelStatus, ConditionalPay, MigrationRecord, MigrationState,
    PayId, SignedSimplexState, TokenInfo, WithdrawJob, WithdrawJobStatus,
};
use osp_crypto::{sign, verify, KeyPair, PublicKey};
use osp_store::{StoreBatch, META_EVENT_CURSOR};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use crate::chain::{
    ChainEvent, ChainLog, ChannelInfo, CooperativeWithdrawTx, DepositRequest, LedgerChain, OnChainStatus,
    OpenChannelTx, Receipt, TxHash,
};
use crate::error::ReconcileError;
use crate::waiter::TxWaiter;

/// Signatures the counterparty must contribute to two-party chain calls.
#[async_trait]
pub trait PeerApprovals: Send + Sync {
    /// Returns the responder's signature over the terms and its public key.
    async fn approve_open(
        &self,
        peer: Address,
        request: OpenChannelRequest,
    ) -> Result<(Vec<u8>, Vec<u8>), ReconcileError>;

    async fn approve_withdraw(&self, peer: Address, request: WithdrawRequest) -> Result<Vec<u8>, ReconcileError>;
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Ledger contract new channels are opened on.
    pub ledger: Address,
    pub open_timeout_blocks: u64,
    pub withdraw_timeout_blocks: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            ledger: Address::default(),
            open_timeout_blocks: 20,
            withdraw_timeout_blocks: 20,
        }
    }
}

/// What a chain event means for the rest of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFollowup {
    ChannelOpened(ChannelId),
    ChannelClosed(ChannelId),
    PayResolved { pay_id: PayId, amount: Amount },
}

pub struct ReconciliationEngine {
    waiter: TxWaiter,
    registry: Arc<ChannelRegistry>,
    keypair: Arc<KeyPair>,
    approvals: Arc<dyn PeerApprovals>,
    config: ReconcileConfig,
    running_jobs: DashMap<Uuid, ()>,
    span: tracing::Span,
}

impl ReconciliationEngine {
    pub fn new(
        waiter: TxWaiter,
        registry: Arc<ChannelRegistry>,
        keypair: Arc<KeyPair>,
        approvals: Arc<dyn PeerApprovals>,
        config: ReconcileConfig,
        span: tracing::Span,
    ) -> Self {
        Self {
            waiter,
            registry,
            keypair,
            approvals,
            config,
            running_jobs: DashMap::new(),
            span,
        }
    }

    pub fn chain(&self) -> &Arc<dyn LedgerChain> {
        self.waiter.chain()
    }

    pub fn waiter(&self) -> &TxWaiter {
        &self.waiter
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn local_address(&self) -> Address {
        self.keypair.address()
    }

    fn local(&self) -> Address {
        self.local_address()
    }

    fn handle(&self, channel_id: &ChannelId) -> Result<Arc<ChannelHandle>, ReconcileError> {
        self.registry
            .get(channel_id)
            .ok_or(ReconcileError::UnknownChannel(*channel_id))
    }

    pub async fn block_number(&self) -> Result<BlockNumber, ReconcileError> {
        Ok(self.chain().block_number().await?)
    }

    // ---- open & deposit ------------------------------------------------

    /// Open a channel with `peer`, funded by both sides as given.
    pub async fn open_channel(
        &self,
        peer: Address,
        token: TokenInfo,
        my_deposit: Amount,
        peer_deposit: Amount,
    ) -> Result<ChannelId, ReconcileError> {
        if peer == self.local() {
            return Err(ReconcileError::Invalid("cannot open a channel with ourselves".into()));
        }
        if self.registry.by_peer(&peer, &token).is_some() {
            return Err(ReconcileError::Invalid(format!("channel with {} already open", peer)));
        }
        let head = self.block_number().await?;
        let terms = OpenChannelTerms {
            token,
            initiator: self.local(),
            responder: peer,
            initiator_deposit: my_deposit,
            responder_deposit: peer_deposit,
            nonce: rand::random(),
            open_deadline: head + self.config.open_timeout_blocks,
            ledger: self.config.ledger,
        };
        let payload = terms.signing_payload();
        let sig = sign(&payload, &self.keypair).to_vec();
        let request = OpenChannelRequest {
            terms: terms.clone(),
            initiator_key: self.keypair.public_key().to_vec(),
            sig: sig.clone(),
        };

        let (responder_sig, responder_key) = self.approvals.approve_open(peer, request).await?;
        let peer_key = PublicKey::for_address(&responder_key, &peer)?;
        verify(&payload, &responder_sig, &peer_key)
            .map_err(|_| ReconcileError::PeerRefused("bad open approval signature".into()))?;

        let tx = OpenChannelTx {
            terms: terms.clone(),
            initiator_key: self.keypair.public_key().to_vec(),
            responder_key: responder_key.clone(),
            initiator_sig: sig,
            responder_sig,
        };
        let receipt = self.waiter.submit_and_wait(|chain| async move { chain.open_channel(tx).await }).await?;
        let channel_id = terms.channel_id();
        tracing::info!(channel = %channel_id, peer = %peer, block = receipt.block, "channel opened");
        self.register_from_chain(channel_id, peer, responder_key).await?;
        Ok(channel_id)
    }

    /// Responder side of an open: check and sign the initiator's terms.
    pub async fn approve_open_request(
        &self,
        request: &OpenChannelRequest,
    ) -> Result<(Vec<u8>, Vec<u8>), ReconcileError> {
        let terms = &request.terms;
        if terms.responder != self.local() {
            return Err(ReconcileError::Invalid("open request addressed to another node".into()));
        }
        if terms.ledger != self.config.ledger {
            return Err(ReconcileError::Policy(format!("unsupported ledger {}", terms.ledger)));
        }
        if self.registry.by_peer(&terms.initiator, &terms.token).is_some() {
            return Err(ReconcileError::Invalid("channel already open".into()));
        }
        let head = self.block_number().await?;
        if terms.open_deadline < head {
            return Err(ReconcileError::Invalid("open deadline passed".into()));
        }
        let initiator_key = PublicKey::for_address(&request.initiator_key, &terms.initiator)?;
        let payload = terms.signing_payload();
        verify(&payload, &request.sig, &initiator_key)?;
        Ok((sign(&payload, &self.keypair).to_vec(), self.keypair.public_key().to_vec()))
    }

    async fn register_from_chain(
        &self,
        channel_id: ChannelId,
        peer: Address,
        peer_key: Vec<u8>,
    ) -> Result<Arc<ChannelHandle>, ReconcileError> {
        if let Some(existing) = self.registry.get(&channel_id) {
            return Ok(existing);
        }
        let info = self
            .chain()
            .channel_info(channel_id)
            .await?
            .ok_or(ReconcileError::UnknownChannel(channel_id))?;
        let mut channel = Channel::new(channel_id, info.token, self.local(), peer, peer_key, info.ledger);
        channel.local_funds = info.funds_of(&self.local()).unwrap_or_default();
        channel.peer_funds = info.funds_of(&peer).unwrap_or_default();
        channel.withdraw_seq = info.withdraw_seq;
        Ok(self.registry.insert(channel)?)
    }

    pub async fn deposit(&self, channel_id: ChannelId, amount: Amount) -> Result<Receipt, ReconcileError> {
        self.handle(&channel_id)?;
        let request = DepositRequest {
            channel_id,
            receiver: self.local(),
            amount,
        };
        let receipt = self.waiter.submit_and_wait(|chain| async move { chain.deposit(request).await }).await?;
        self.sync_channel(&channel_id).await?;
        Ok(receipt)
    }

    /// Fund several channels in one transaction.
    pub async fn deposit_in_batch(&self, requests: Vec<DepositRequest>) -> Result<Receipt, ReconcileError> {
        let channels: Vec<ChannelId> = requests.iter().map(|r| r.channel_id).collect();
        let receipt = self
            .waiter
            .submit_and_wait(|chain| async move { chain.deposit_in_batch(requests).await })
            .await?;
        for channel_id in channels {
            self.sync_channel(&channel_id).await?;
        }
        Ok(receipt)
    }

    // ---- on-chain state sync -------------------------------------------

    /// Re-read every live channel from chain.
    pub async fn sync_onchain_channel_states(&self) -> Result<usize, ReconcileError> {
        let mut synced = 0;
        for handle in self.registry.all() {
            match self.sync_channel(&handle.channel_id).await {
                Ok(()) => synced += 1,
                Err(e) => tracing::warn!(channel = %handle.channel_id, error = %e, "on-chain sync failed"),
            }
        }
        Ok(synced)
    }

    /// Overwrite a channel's on-chain view (funds, status, ledger, withdraw
    /// counter) with what the chain reports.
    pub async fn sync_channel(&self, channel_id: &ChannelId) -> Result<(), ReconcileError> {
        let Some(handle) = self.registry.get(channel_id) else {
            return Ok(());
        };
        let info = self
            .chain()
            .channel_info(*channel_id)
            .await?
            .ok_or(ReconcileError::UnknownChannel(*channel_id))?;
        let head = self.block_number().await?;
        let local = self.local();
        self.registry
            .transact::<_, ReconcileError, _>(&handle, |ledger, _| {
                apply_chain_view(ledger, &info, &local, head);
                Ok(())
            })
            .await
    }

    // ---- cooperative withdraw ------------------------------------------

    /// Withdraw `amount` of our free balance with the peer's cosignature and
    /// wait for it to land.
    pub async fn cooperative_withdraw(&self, channel_id: ChannelId, amount: Amount) -> Result<Receipt, ReconcileError> {
        self.run_cooperative_withdraw(channel_id, amount, |_| Ok(())).await
    }

    async fn run_cooperative_withdraw<F>(
        &self,
        channel_id: ChannelId,
        amount: Amount,
        on_submit: F,
    ) -> Result<Receipt, ReconcileError>
    where
        F: FnOnce(TxHash) -> Result<(), ReconcileError>,
    {
        if amount == 0 {
            return Err(ReconcileError::Invalid("withdraw amount must be positive".into()));
        }
        let handle = self.handle(&channel_id)?;
        let head = self.block_number().await?;
        let receiver = self.local();
        let deadline = head + self.config.withdraw_timeout_blocks;
        let terms = self
            .registry
            .transact::<_, ReconcileError, _>(&handle, |ledger, _| {
                let seq = ledger.next_withdraw_seq();
                ledger.reserve_withdraw(Side::Local, amount, seq, deadline)?;
                Ok(WithdrawTerms {
                    channel_id,
                    seq,
                    receiver,
                    amount,
                    deadline,
                })
            })
            .await?;

        let result = self.submit_cooperative_withdraw(&handle, terms, on_submit).await;
        if let Err(e) = &result {
            tracing::warn!(channel = %channel_id, error = %e, "cooperative withdraw failed");
            let released = self
                .registry
                .transact::<_, ReconcileError, _>(&handle, |ledger, _| {
                    ledger.release_withdraw(Side::Local);
                    Ok(())
                })
                .await;
            if let Err(e) = released {
                tracing::error!(channel = %channel_id, error = %e, "failed to release withdraw reservation");
            }
        }
        // The chain is the authority on the withdraw counter either way.
        if let Err(e) = self.sync_channel(&channel_id).await {
            tracing::warn!(channel = %channel_id, error = %e, "post-withdraw sync failed");
        }
        result
    }

    async fn submit_cooperative_withdraw<F>(
        &self,
        handle: &ChannelHandle,
        terms: WithdrawTerms,
        on_submit: F,
    ) -> Result<Receipt, ReconcileError>
    where
        F: FnOnce(TxHash) -> Result<(), ReconcileError>,
    {
        let payload = terms.signing_payload();
        let sig = sign(&payload, &self.keypair).to_vec();
        let approver_sig = self
            .approvals
            .approve_withdraw(
                handle.peer,
                WithdrawRequest {
                    terms: terms.clone(),
                    sig: sig.clone(),
                },
            )
            .await?;
        let peer_key = handle.lock().await.peer_key().clone();
        verify(&payload, &approver_sig, &peer_key)
            .map_err(|_| ReconcileError::PeerRefused("bad withdraw approval signature".into()))?;

        let tx = self
            .chain()
            .cooperative_withdraw(CooperativeWithdrawTx {
                terms,
                requester_sig: sig,
                approver_sig,
            })
            .await?;
        on_submit(tx)?;
        Ok(self.waiter.wait(tx).await?)
    }

    /// Responder side: reserve the peer's balance and cosign its withdraw.
    pub async fn approve_withdraw_request(&self, request: &WithdrawRequest) -> Result<Vec<u8>, ReconcileError> {
        let terms = &request.terms;
        let handle = self.handle(&terms.channel_id)?;
        if terms.receiver != handle.peer {
            return Err(ReconcileError::Invalid("withdraw receiver is not the requesting peer".into()));
        }
        let head = self.block_number().await?;
        if terms.deadline < head {
            return Err(ReconcileError::Invalid("withdraw deadline passed".into()));
        }
        let payload = terms.signing_payload();
        let terms = terms.clone();
        let sig = request.sig.clone();
        self.registry
            .transact::<_, ReconcileError, _>(&handle, |ledger, _| {
                verify(&payload, &sig, ledger.peer_key())?;
                let already = ledger.channel().peer_withdraw.is_some_and(|r| {
                    r.seq == terms.seq && r.amount == terms.amount && r.deadline == terms.deadline
                });
                if !already {
                    ledger.reserve_withdraw(Side::Remote, terms.amount, terms.seq, terms.deadline)?;
                }
                Ok(())
            })
            .await?;
        tracing::info!(channel = %request.terms.channel_id, amount = %request.terms.amount, "approved peer withdraw");
        Ok(sign(&payload, &self.keypair).to_vec())
    }

    /// Start a cooperative withdraw in the background and return its job id.
    pub async fn cooperative_withdraw_nonblocking(
        self: &Arc<Self>,
        channel_id: ChannelId,
        amount: Amount,
    ) -> Result<Uuid, ReconcileError> {
        self.handle(&channel_id)?;
        let job = WithdrawJob::new(channel_id, amount, self.local());
        let job_id = job.job_id;
        self.put_job(job.clone())?;
        self.running_jobs.insert(job_id, ());

        let engine = self.clone();
        tokio::spawn(
            async move {
                engine.run_withdraw_job(job).await;
                engine.running_jobs.remove(&job_id);
            }
            .instrument(self.span.clone()),
        );
        Ok(job_id)
    }

    async fn run_withdraw_job(&self, mut job: WithdrawJob) {
        let submitted = |tx: TxHash| {
            let mut update = job.clone();
            update.status = WithdrawJobStatus::Submitted;
            update.tx = Some(tx);
            update.updated_at = chrono::Utc::now();
            self.put_job(update)
        };
        let result = self.run_cooperative_withdraw(job.channel_id, job.amount, submitted).await;
        if let Ok(Some(latest)) = self.registry.store().get_withdraw_job(&job.job_id) {
            job = latest;
        }
        match result {
            Ok(receipt) => {
                job.status = WithdrawJobStatus::Succeeded;
                job.tx = Some(receipt.tx);
            }
            Err(e) => {
                job.status = WithdrawJobStatus::Failed;
                job.error = Some(e.to_string());
            }
        }
        job.updated_at = chrono::Utc::now();
        tracing::info!(job = %job.job_id, status = ?job.status, "withdraw job finished");
        if let Err(e) = self.put_job(job) {
            tracing::error!(error = %e, "failed to persist withdraw job");
        }
    }

    fn put_job(&self, job: WithdrawJob) -> Result<(), ReconcileError> {
        let mut batch = StoreBatch::new();
        batch.put_withdraw_job(job);
        Ok(self.registry.store().write(batch)?)
    }

    /// Current status of a withdraw job. A job left `Submitted` by an earlier
    /// process is finished here from its receipt.
    pub async fn monitor_withdraw_job(&self, job_id: &Uuid) -> Result<Option<WithdrawJob>, ReconcileError> {
        let Some(mut job) = self.registry.store().get_withdraw_job(job_id)? else {
            return Ok(None);
        };
        if job.status.is_final() || self.running_jobs.contains_key(job_id) {
            return Ok(Some(job));
        }
        match (job.status, job.tx) {
            (WithdrawJobStatus::Submitted, Some(tx)) => match self.chain().receipt(tx).await {
                Ok(Some(receipt)) => {
                    job.status = if receipt.success {
                        WithdrawJobStatus::Succeeded
                    } else {
                        WithdrawJobStatus::Failed
                    };
                    if !receipt.success {
                        job.error = Some("transaction reverted".into());
                    }
                    job.updated_at = chrono::Utc::now();
                    self.put_job(job.clone())?;
                    self.sync_channel(&job.channel_id).await?;
                }
                Ok(None) => {}
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e.into()),
            },
            _ => {
                // Never submitted before the restart; the reservation expires on its own.
                job.status = WithdrawJobStatus::Failed;
                job.error = Some("interrupted before submission".into());
                job.updated_at = chrono::Utc::now();
                self.put_job(job.clone())?;
            }
        }
        Ok(Some(job))
    }

    // ---- unilateral withdraw -------------------------------------------

    pub async fn intend_withdraw(&self, channel_id: ChannelId, amount: Amount) -> Result<Receipt, ReconcileError> {
        let handle = self.handle(&channel_id)?;
        let available = handle.lock().await.free_balance(Side::Local)?;
        if available < amount {
            return Err(ReconcileError::Ledger(osp_channel::LedgerError::InsufficientBalance {
                available,
                required: amount,
            }));
        }
        let receiver = self.local();
        Ok(self
            .waiter
            .submit_and_wait(|chain| async move { chain.intend_withdraw(channel_id, receiver, amount).await })
            .await?)
    }

    pub async fn confirm_withdraw(&self, channel_id: ChannelId) -> Result<Receipt, ReconcileError> {
        let receipt = self
            .waiter
            .submit_and_wait(|chain| async move { chain.confirm_withdraw(channel_id).await })
            .await?;
        self.sync_channel(&channel_id).await?;
        Ok(receipt)
    }

    async fn check_peer_withdraw(
        &self,
        channel_id: ChannelId,
        receiver: Address,
        amount: Amount,
    ) -> Result<(), ReconcileError> {
        let Some(handle) = self.registry.get(&channel_id) else {
            return Ok(());
        };
        if receiver == self.local() {
            return Ok(());
        }
        let available = handle.lock().await.free_balance(Side::Remote)?;
        if amount <= available {
            return Ok(());
        }
        tracing::warn!(channel = %channel_id, amount = %amount, available = %available, "vetoing peer withdraw");
        let vetoer = self.local();
        self.waiter
            .submit_and_wait(|chain| async move { chain.veto_withdraw(channel_id, vetoer).await })
            .await?;
        Ok(())
    }

    // ---- settle & dispute ----------------------------------------------

    fn settle_states(ledger: &ChannelLedger) -> Vec<SignedSimplexState> {
        [ledger.outgoing(), ledger.incoming()]
            .into_iter()
            .filter(|entry| entry.signed.is_cosigned())
            .map(|entry| entry.signed.clone())
            .collect()
    }

    /// Start a unilateral settle with our latest cosigned states.
    pub async fn intend_settle(&self, channel_id: ChannelId) -> Result<Receipt, ReconcileError> {
        let handle = self.handle(&channel_id)?;
        let states = Self::settle_states(&*handle.lock().await);
        let submitter = self.local();
        let receipt = self
            .waiter
            .submit_and_wait(|chain| async move { chain.intend_settle(submitter, channel_id, states).await })
            .await?;
        tracing::info!(channel = %channel_id, "intended settle");
        self.sync_channel(&channel_id).await?;
        Ok(receipt)
    }

    pub async fn confirm_settle(&self, channel_id: ChannelId) -> Result<Receipt, ReconcileError> {
        let receipt = self
            .waiter
            .submit_and_wait(|chain| async move { chain.confirm_settle(channel_id).await })
            .await?;
        self.sync_channel(&channel_id).await?;
        Ok(receipt)
    }

    /// Answer the peer's settle with newer states when it submitted stale ones.
    async fn dispute_if_stale(&self, channel_id: ChannelId, seqs: [Option<u64>; 2]) -> Result<(), ReconcileError> {
        let Some(handle) = self.registry.get(&channel_id) else {
            return Ok(());
        };
        let info = self
            .chain()
            .channel_info(channel_id)
            .await?
            .ok_or(ReconcileError::UnknownChannel(channel_id))?;
        let (Some(me), Some(peer)) = (info.index_of(&self.local()), info.index_of(&handle.peer)) else {
            return Ok(());
        };
        let newer: Vec<SignedSimplexState> = {
            let ledger = handle.lock().await;
            Self::settle_states(&ledger)
                .into_iter()
                .filter(|s| {
                    let idx = if s.state.peer_from == self.local() { me } else { peer };
                    seqs[idx].map_or(true, |seq| s.state.seq_num > seq)
                })
                .collect()
        };
        if newer.is_empty() {
            return Ok(());
        }
        tracing::warn!(channel = %channel_id, states = newer.len(), "disputing stale settle");
        let submitter = self.local();
        self.waiter
            .submit_and_wait(|chain| async move { chain.intend_settle(submitter, channel_id, newer).await })
            .await?;
        Ok(())
    }

    // ---- pay resolution --------------------------------------------------

    /// Resolve `pay` on chain with the preimages we hold.
    pub async fn settle_conditional_pay_on_chain(
        &self,
        pay: ConditionalPay,
        preimages: Vec<Vec<u8>>,
    ) -> Result<Receipt, ReconcileError> {
        let pay_id = pay.pay_id();
        let receipt = self
            .waiter
            .submit_and_wait(|chain| async move { chain.resolve_payment_by_conditions(pay, preimages).await })
            .await?;
        tracing::info!(pay_id = %pay_id.short(), "resolved pay on chain");
        Ok(receipt)
    }

    /// Amount the chain's pay registry resolved `pay_id` to, if any.
    pub async fn onchain_resolved_amount(&self, pay_id: PayId) -> Result<Option<Amount>, ReconcileError> {
        Ok(self.chain().pay_info(pay_id).await?.map(|info| info.amount))
    }

    // ---- migration -------------------------------------------------------

    /// Refuse pays on a migrating channel whose deadline reaches the
    /// migration deadline.
    pub fn check_migration(&self, channel_id: &ChannelId, resolve_deadline: BlockNumber) -> Result<(), ReconcileError> {
        match self.registry.store().get_migration(channel_id)? {
            Some(record) if resolve_deadline >= record.deadline => Err(ReconcileError::Migrating(*channel_id)),
            _ => Ok(()),
        }
    }

    /// Replay the channel's latest cosigned states onto the announced ledger.
    pub async fn migrate_channel(&self, channel_id: ChannelId) -> Result<Receipt, ReconcileError> {
        let mut record = self
            .registry
            .store()
            .get_migration(&channel_id)?
            .ok_or_else(|| ReconcileError::Invalid(format!("no migration pending for {}", channel_id)))?;
        let handle = self.handle(&channel_id)?;
        let states = Self::settle_states(&*handle.lock().await);
        let to = record.to_ledger;
        let receipt = self
            .waiter
            .submit_and_wait(|chain| async move { chain.migrate_channel(channel_id, to, states).await })
            .await?;
        if record.state == MigrationState::Pending {
            record.state = MigrationState::Replayed;
            let mut batch = StoreBatch::new();
            batch.put_migration(record);
            self.registry.store().write(batch)?;
        }
        Ok(receipt)
    }

    // ---- events ----------------------------------------------------------

    /// Index of the next chain log this node has not applied.
    pub fn event_cursor(&self) -> Result<u64, ReconcileError> {
        let raw = self.registry.store().get_meta(META_EVENT_CURSOR)?;
        Ok(raw
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0))
    }

    pub fn save_event_cursor(&self, next: u64) -> Result<(), ReconcileError> {
        let mut batch = StoreBatch::new();
        batch.put_meta(META_EVENT_CURSOR, next.to_be_bytes().to_vec());
        Ok(self.registry.store().write(batch)?)
    }

    /// Apply one chain log to local state.
    pub async fn handle_event(&self, log: &ChainLog) -> Result<Option<EventFollowup>, ReconcileError> {
        tracing::debug!(index = log.index, block = log.block, "chain event");
        match &log.event {
            ChainEvent::ChannelOpened {
                channel_id,
                participants,
                keys,
                ..
            } => {
                let local = self.local();
                let Some(me) = participants.iter().position(|p| p == &local) else {
                    return Ok(None);
                };
                let other = 1 - me;
                self.register_from_chain(*channel_id, participants[other], keys[other].clone())
                    .await?;
                self.sync_channel(channel_id).await?;
                Ok(Some(EventFollowup::ChannelOpened(*channel_id)))
            }
            ChainEvent::Deposit { channel_id, .. }
            | ChainEvent::ConfirmWithdraw { channel_id, .. }
            | ChainEvent::CooperativeWithdraw { channel_id, .. }
            | ChainEvent::VetoWithdraw { channel_id, .. } => {
                self.sync_channel(channel_id).await?;
                Ok(None)
            }
            ChainEvent::IntendWithdraw {
                channel_id,
                receiver,
                amount,
            } => {
                self.check_peer_withdraw(*channel_id, *receiver, *amount).await?;
                Ok(None)
            }
            ChainEvent::IntendSettle {
                channel_id,
                submitter,
                seqs,
                ..
            } => {
                if *submitter != self.local() {
                    self.dispute_if_stale(*channel_id, *seqs).await?;
                }
                self.sync_channel(channel_id).await?;
                Ok(None)
            }
            ChainEvent::ConfirmSettle { channel_id, payouts } => {
                self.sync_channel(channel_id).await?;
                let Some(payout) = payouts.iter().find(|p| p.receiver == self.local()) else {
                    return Ok(None);
                };
                tracing::info!(channel = %channel_id, amount = %payout.amount, "channel settled");
                Ok(Some(EventFollowup::ChannelClosed(*channel_id)))
            }
            ChainEvent::LedgerMigrationIntent {
                channel_id,
                to_ledger,
                deadline,
            } => {
                let Some(handle) = self.registry.get(channel_id) else {
                    return Ok(None);
                };
                let store = self.registry.store();
                if store.get_migration(channel_id)?.is_some() {
                    return Ok(None);
                }
                let from_ledger = handle.lock().await.channel().ledger;
                let mut batch = StoreBatch::new();
                batch.put_migration(MigrationRecord {
                    channel_id: *channel_id,
                    from_ledger,
                    to_ledger: *to_ledger,
                    state: MigrationState::Pending,
                    deadline: *deadline,
                });
                store.write(batch)?;
                tracing::info!(channel = %channel_id, to = %to_ledger, deadline, "channel migration announced");
                Ok(None)
            }
            ChainEvent::ChannelMigrated { channel_id, ledger } => {
                let Some(handle) = self.registry.get(channel_id) else {
                    return Ok(None);
                };
                let (channel_id, ledger) = (*channel_id, *ledger);
                self.registry
                    .transact::<_, ReconcileError, _>(&handle, |l, batch| {
                        l.set_ledger(ledger);
                        batch.delete_migration(channel_id);
                        Ok(())
                    })
                    .await?;
                tracing::info!(channel = %channel_id, ledger = %ledger, "channel repointed");
                Ok(None)
            }
            ChainEvent::PayResolved { pay_id, amount } => Ok(Some(EventFollowup::PayResolved {
                pay_id: *pay_id,
                amount: *amount,
            })),
        }
    }
}

/// Fold the chain's view of a channel into its ledger.
fn apply_chain_view(ledger: &mut ChannelLedger, info: &ChannelInfo, local: &Address, head: BlockNumber) {
    let status = match info.status {
        OnChainStatus::Operable => ChannelStatus::Opened,
        OnChainStatus::Settling => ChannelStatus::Settling,
        OnChainStatus::Closed => ChannelStatus::Closed,
    };
    ledger.set_status(status);
    ledger.set_settle_finalize_block(info.settle_finalize_block);
    ledger.set_ledger(info.ledger);
    // Payouts of a closed channel include pays resolved on chain, which the
    // off-chain balances cannot express; keep the last funds we tracked.
    if status == ChannelStatus::Closed {
        return;
    }

    let peer = ledger.peer();
    let channel = ledger.channel();
    for (side, reservation) in [(Side::Local, channel.local_withdraw), (Side::Remote, channel.peer_withdraw)] {
        if reservation.is_some_and(|r| info.withdraw_seq >= r.seq) {
            ledger.release_withdraw(side);
        }
    }
    ledger.expire_reservations(head);
    ledger.set_onchain_funds(
        info.funds_of(local).unwrap_or_default(),
        info.funds_of(&peer).unwrap_or_default(),
    );
    let channel = ledger.channel();
    if channel.local_withdraw.is_none() && channel.peer_withdraw.is_none() {
        ledger.set_withdraw_seq(info.withdraw_seq);
    }
}
