//! The OSP node.
//!
//! Ties together the channel registry, pay engine, sync protocol and the
//! on-chain reconciliation engine. Background loops follow chain events,
//! sweep expired and stalled pays, refill low channels, and resync channels
//! when peers come back. Every operation a client can ask for is a method on
//! [`Node`]; the HTTP API in [`crate::api`] is a thin layer over them.

use async_trait::async_trait;
use dashmap::DashMap;
use osp_channel::{ChannelHandle, ChannelRegistry, ChannelSummary};
use osp_core::{
    Address, Amount, ChannelId, Condition, Envelope, NetId, PayId, PayRecord, PeerMessage, PeerReply, TokenInfo,
    TransferLogic, WithdrawJob,
};
use osp_crypto::KeyPair;
use osp_routing::Router;
use osp_settlement::{
    ChainLog, EventFollowup, EventMonitor, LedgerChain, Receipt, ReconcileConfig, ReconcileError,
    ReconciliationEngine, RefillController, TxWaiter,
};
use osp_store::{HistoryPage, HistoryQuery, Store};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::OspConfig;
use crate::error::NodeError;
use crate::pay_engine::{stopped, PayEngine, PayUpdate, SendRequest};
use crate::sync::SyncProtocol;
use crate::transport::{PeerHandler, PeerStatus, PeerTransport, TransportApprovals};

/// Sweeps between two full on-chain channel syncs.
const ONCHAIN_SYNC_EVERY: u64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub version: String,
    pub address: Address,
    pub net_id: NetId,
    pub uptime_secs: u64,
    pub channels: usize,
    pub peers_online: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatusView {
    pub peer: Address,
    pub online: bool,
    pub channels: Vec<ChannelSummary>,
}

pub struct Node {
    config: OspConfig,
    keypair: Arc<KeyPair>,
    chain: Arc<dyn LedgerChain>,
    transport: Arc<dyn PeerTransport>,
    registry: Arc<ChannelRegistry>,
    reconcile: Arc<ReconciliationEngine>,
    engine: Arc<PayEngine>,
    sync: Arc<SyncProtocol>,
    refill: Arc<RefillController>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Channels with a sync in flight.
    syncing: DashMap<ChannelId, ()>,
    started_at: Instant,
    span: tracing::Span,
}

impl Node {
    /// Build a node over an opened store. Channels already in the store are
    /// loaded; nothing runs until [`start`](Self::start).
    pub fn new(
        config: OspConfig,
        keypair: Arc<KeyPair>,
        store: Arc<dyn Store>,
        chain: Arc<dyn LedgerChain>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>, NodeError> {
        let local = keypair.address();
        let span = tracing::info_span!("node", node = %local.short());

        let registry = Arc::new(ChannelRegistry::new(store, keypair.clone()));
        let loaded = registry.load()?;

        let approvals = Arc::new(TransportApprovals::new(local, transport.clone()));
        let reconcile = Arc::new(ReconciliationEngine::new(
            TxWaiter::new(chain.clone(), config.chain.wait_config()),
            registry.clone(),
            keypair.clone(),
            approvals,
            ReconcileConfig {
                ledger: config.chain.ledger,
                open_timeout_blocks: config.chain.open_timeout_blocks,
                withdraw_timeout_blocks: config.chain.withdraw_timeout_blocks,
            },
            span.clone(),
        ));
        let router = Arc::new(Router::new(
            config.routing.build_table(),
            config.policy.build(),
            config.node.net_id,
            config.chain.pay_resolver,
        ));
        let engine = PayEngine::new(
            keypair.clone(),
            registry.clone(),
            router,
            transport.clone(),
            reconcile.clone(),
            config.payment.clone(),
            span.clone(),
        );
        let sync = Arc::new(SyncProtocol::new(engine.clone()));
        let refill = Arc::new(RefillController::new(reconcile.clone(), config.refill.clone()));

        span.in_scope(|| {
            tracing::info!(name = %config.node.name, net = config.node.net_id, channels = loaded, "node created");
        });

        Ok(Arc::new(Self {
            config,
            keypair,
            chain,
            transport,
            registry,
            reconcile,
            engine,
            sync,
            refill,
            tasks: Mutex::new(Vec::new()),
            syncing: DashMap::new(),
            started_at: Instant::now(),
            span,
        }))
    }

    pub fn local(&self) -> Address {
        self.keypair.address()
    }

    pub fn config(&self) -> &OspConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<PayEngine> {
        &self.engine
    }

    pub fn reconcile(&self) -> &Arc<ReconciliationEngine> {
        &self.reconcile
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    // ---- lifecycle --------------------------------------------------------

    /// Start the background loops: chain events, the sweeper, and peer
    /// status driven sync. Also syncs every reachable peer once.
    pub fn start(self: &Arc<Self>) {
        let status = self.transport.subscribe();
        let handles = vec![
            self.spawn_task(|node| node.event_loop()),
            self.spawn_task(|node| node.sweeper()),
            self.spawn_task(move |node| node.peer_status_loop(status)),
        ];
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend(handles),
            Err(_) => tracing::error!(parent: &self.span, "task list poisoned"),
        }
        self.sync_all_peers();
        tracing::info!(parent: &self.span, "node started");
    }

    /// Serve the HTTP API until the node is shut down.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let addr: SocketAddr = self.config.api_addr().parse()?;
        crate::api::start_api_server(addr, self.clone(), stopped(self.engine.stop_signal())).await
    }

    /// Stop every loop and all pay work, and wait for the loops to exit.
    pub async fn shutdown(&self) {
        tracing::info!(parent: &self.span, "shutting down");
        self.engine.stop();
        let tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        futures::future::join_all(tasks).await;
        tracing::info!(parent: &self.span, "node stopped");
    }

    fn spawn_task<F, Fut>(self: &Arc<Self>, task: F) -> JoinHandle<()>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = self.engine.stop_signal();
        let fut = task(self.clone());
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = fut => {}
                    _ = stopped(stop) => {}
                }
            }
            .instrument(self.span.clone()),
        )
    }

    // ---- background loops -------------------------------------------------

    async fn event_loop(self: Arc<Self>) {
        let from = match self.reconcile.event_cursor() {
            Ok(from) => from,
            Err(e) => {
                tracing::error!(error = %e, "cannot read event cursor, chain events not followed");
                return;
            }
        };
        let (monitor, mut logs) =
            EventMonitor::spawn(self.chain.clone(), from, self.config.chain.monitor_config(), self.span.clone());
        while let Some(log) = logs.recv().await {
            self.apply_chain_log(&log).await;
        }
        if let Some(next) = monitor.cancel().await {
            tracing::debug!(next, "event loop finished");
        }
    }

    async fn apply_chain_log(&self, log: &ChainLog) {
        let mut attempt = 0;
        let followup = loop {
            match self.reconcile.handle_event(log).await {
                Ok(followup) => break followup,
                Err(ReconcileError::Chain(e)) if e.is_retryable() && attempt < self.config.payment.retry_attempts => {
                    attempt += 1;
                    tracing::debug!(index = log.index, attempt, error = %e, "retrying chain event");
                    tokio::time::sleep(self.config.payment.retry_backoff() * attempt).await;
                }
                Err(e) => {
                    tracing::warn!(index = log.index, block = log.block, error = %e, "chain event not applied");
                    break None;
                }
            }
        };
        match followup {
            Some(EventFollowup::PayResolved { pay_id, amount }) => {
                if let Err(e) = self.engine.note_onchain_resolution(pay_id, amount) {
                    tracing::warn!(pay_id = %pay_id.short(), error = %e, "could not record on-chain resolution");
                }
            }
            Some(EventFollowup::ChannelOpened(channel_id)) => {
                tracing::info!(channel = %channel_id.short(), "channel is live");
            }
            Some(EventFollowup::ChannelClosed(channel_id)) => {
                tracing::info!(channel = %channel_id.short(), "channel closed");
            }
            None => {}
        }
        if let Err(e) = self.reconcile.save_event_cursor(log.index + 1) {
            tracing::error!(index = log.index, error = %e, "failed to save event cursor");
        }
    }

    async fn sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.payment.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweeps: u64 = 0;
        loop {
            interval.tick().await;
            sweeps += 1;
            self.sweep(sweeps).await;
        }
    }

    async fn sweep(self: &Arc<Self>, sweeps: u64) {
        if let Err(e) = self.engine.settle_expired_pays().await {
            tracing::warn!(error = %e, "expiry sweep failed");
        }

        let stale_after =
            chrono::Duration::from_std(self.config.payment.sweep_interval() * 3).unwrap_or(chrono::Duration::zero());
        if let Err(e) = self.engine.maintain(stale_after).await {
            tracing::warn!(error = %e, "pay maintenance failed");
        }

        self.sync_stalled_channels().await;

        if sweeps % ONCHAIN_SYNC_EVERY == 0 {
            if let Err(e) = self.reconcile.sync_onchain_channel_states().await {
                tracing::warn!(error = %e, "periodic on-chain sync failed");
            }
        }

        self.transport.probe().await;

        if self.refill.config().enabled {
            for summary in self.registry.summaries() {
                self.refill.observe(&summary);
            }
            match self.refill.tick().await {
                Ok(0) => {}
                Ok(funded) => tracing::info!(funded, "refilled channels"),
                Err(e) => tracing::warn!(error = %e, "refill failed"),
            }
        }
    }

    /// Sync channels whose outstanding proposal has gone unanswered, or
    /// that hold incoming legs the peer has not yet proven committed.
    async fn sync_stalled_channels(self: &Arc<Self>) {
        let waited = chrono::Duration::from_std(self.config.payment.peer_timeout() * 2).unwrap_or(chrono::Duration::zero());
        let cutoff = chrono::Utc::now() - waited;
        for handle in self.registry.all() {
            if self.syncing.contains_key(&handle.channel_id) || !self.transport.is_reachable(&handle.peer) {
                continue;
            }
            let stalled = {
                let ledger = handle.lock().await;
                ledger.pending_proposal().is_some_and(|p| p.created_at < cutoff)
                    || ledger.oldest_unconfirmed().is_some_and(|since| since < cutoff)
            };
            if stalled {
                self.spawn_channel_sync(handle);
            }
        }
    }

    async fn peer_status_loop(self: Arc<Self>, mut status: broadcast::Receiver<PeerStatus>) {
        let local = self.local();
        loop {
            match status.recv().await {
                Ok(PeerStatus { peer, online: true }) if peer == local => self.sync_all_peers(),
                Ok(PeerStatus { peer, online: true }) => {
                    tracing::debug!(peer = %peer.short(), "peer online");
                    self.sync_with(&peer);
                }
                Ok(PeerStatus { peer, online: false }) => {
                    tracing::debug!(peer = %peer.short(), "peer offline");
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "peer status receiver lagged");
                    self.sync_all_peers();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("peer status channel closed");
                    break;
                }
            }
        }
    }

    fn sync_all_peers(self: &Arc<Self>) {
        let peers: BTreeSet<Address> = self.registry.all().iter().map(|h| h.peer).collect();
        for peer in peers {
            if self.transport.is_reachable(&peer) {
                self.sync_with(&peer);
            }
        }
    }

    fn sync_with(self: &Arc<Self>, peer: &Address) {
        for handle in self.registry.with_peer(peer) {
            self.spawn_channel_sync(handle);
        }
    }

    fn spawn_channel_sync(self: &Arc<Self>, handle: Arc<ChannelHandle>) {
        if self.syncing.insert(handle.channel_id, ()).is_some() {
            return;
        }
        let node = self.clone();
        self.engine.spawn(async move {
            match node.sync.sync_channel(&handle).await {
                Ok(report) => tracing::debug!(channel = %handle.channel_id.short(), ?report, "channel sync done"),
                Err(e) => tracing::info!(channel = %handle.channel_id.short(), error = %e, "channel sync failed"),
            }
            node.syncing.remove(&handle.channel_id);
        });
    }

    // ---- peer messages ----------------------------------------------------

    async fn dispatch(&self, from: Address, msg: PeerMessage) -> Result<PeerReply, NodeError> {
        match msg {
            PeerMessage::CondPayRequest(req) => self.engine.handle_cond_pay(from, req).await,
            PeerMessage::PaySettleProof(proof) => self.engine.handle_settle_proof(from, proof).await,
            PeerMessage::PaySettleRequest(proposal) => self.engine.handle_settle_request(from, proposal).await,
            PeerMessage::Routed(routed) => self.engine.handle_routed(from, routed).await,
            PeerMessage::SyncRequest(req) => self.sync.handle_request(from, req).await,
            PeerMessage::OpenChannelRequest(req) => {
                if req.terms.initiator != from {
                    return Err(NodeError::InvalidRequest("open request from a party other than the initiator".into()));
                }
                self.engine.router().admit_open(
                    &req.terms.token,
                    req.terms.initiator_deposit,
                    req.terms.responder_deposit,
                )?;
                let (sig, responder_key) = self.reconcile.approve_open_request(&req).await?;
                Ok(PeerReply::OpenChannelApproval { sig, responder_key })
            }
            PeerMessage::WithdrawRequest(req) => {
                self.engine.channel_of(&req.terms.channel_id, &from)?;
                let sig = self.reconcile.approve_withdraw_request(&req).await?;
                Ok(PeerReply::WithdrawApproval { sig })
            }
            PeerMessage::Ping => Ok(PeerReply::Pong),
        }
    }

    // ---- channels ---------------------------------------------------------

    /// Open a channel with `peer`. The peer must approve the terms.
    pub async fn open_channel(
        &self,
        peer: Address,
        token: TokenInfo,
        my_deposit: Amount,
        peer_deposit: Amount,
    ) -> Result<ChannelId, NodeError> {
        Ok(self.reconcile.open_channel(peer, token, my_deposit, peer_deposit).await?)
    }

    pub async fn deposit(&self, channel_id: ChannelId, amount: Amount) -> Result<Receipt, NodeError> {
        Ok(self.reconcile.deposit(channel_id, amount).await?)
    }

    pub async fn cooperative_withdraw(&self, channel_id: ChannelId, amount: Amount) -> Result<Receipt, NodeError> {
        Ok(self.reconcile.cooperative_withdraw(channel_id, amount).await?)
    }

    /// Start a cooperative withdraw and return the job to poll with
    /// [`monitor_withdraw_job`](Self::monitor_withdraw_job).
    pub async fn cooperative_withdraw_nonblocking(
        &self,
        channel_id: ChannelId,
        amount: Amount,
    ) -> Result<Uuid, NodeError> {
        Ok(self.reconcile.cooperative_withdraw_nonblocking(channel_id, amount).await?)
    }

    pub async fn monitor_withdraw_job(&self, job_id: &Uuid) -> Result<WithdrawJob, NodeError> {
        self.reconcile
            .monitor_withdraw_job(job_id)
            .await?
            .ok_or_else(|| NodeError::InvalidRequest(format!("unknown withdraw job {}", job_id)))
    }

    pub async fn intend_withdraw(&self, channel_id: ChannelId, amount: Amount) -> Result<Receipt, NodeError> {
        Ok(self.reconcile.intend_withdraw(channel_id, amount).await?)
    }

    pub async fn confirm_withdraw(&self, channel_id: ChannelId) -> Result<Receipt, NodeError> {
        Ok(self.reconcile.confirm_withdraw(channel_id).await?)
    }

    pub async fn intend_settle(&self, channel_id: ChannelId) -> Result<Receipt, NodeError> {
        Ok(self.reconcile.intend_settle(channel_id).await?)
    }

    pub async fn confirm_settle(&self, channel_id: ChannelId) -> Result<Receipt, NodeError> {
        Ok(self.reconcile.confirm_settle(channel_id).await?)
    }

    pub async fn sync_onchain_channel_states(&self) -> Result<usize, NodeError> {
        Ok(self.reconcile.sync_onchain_channel_states().await?)
    }

    /// Replay a migrating channel onto its announced ledger.
    pub async fn migrate_channel(&self, channel_id: ChannelId) -> Result<Receipt, NodeError> {
        Ok(self.reconcile.migrate_channel(channel_id).await?)
    }

    pub fn channels(&self) -> Vec<ChannelSummary> {
        self.registry.summaries()
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Result<ChannelSummary, NodeError> {
        self.registry
            .summary(channel_id)
            .ok_or(NodeError::UnknownChannel(*channel_id))
    }

    /// Sync every channel shared with `peer` now. Returns how many synced.
    pub async fn sync_peer(&self, peer: &Address) -> usize {
        self.sync.sync_peer(peer).await
    }

    pub fn get_peer_status(&self, peer: &Address) -> PeerStatusView {
        let channels = self
            .registry
            .with_peer(peer)
            .iter()
            .filter_map(|h| self.registry.summary(&h.channel_id))
            .collect();
        PeerStatusView {
            peer: *peer,
            online: self.transport.is_reachable(peer),
            channels,
        }
    }

    pub fn status(&self) -> NodeStatus {
        let peers: BTreeSet<Address> = self.registry.all().iter().map(|h| h.peer).collect();
        NodeStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            address: self.local(),
            net_id: self.config.node.net_id,
            uptime_secs: self.started_at.elapsed().as_secs(),
            channels: self.registry.all().len(),
            peers_online: peers.iter().filter(|p| self.transport.is_reachable(p)).count(),
        }
    }

    // ---- pays -------------------------------------------------------------

    pub async fn send_payment(&self, req: SendRequest) -> Result<PayId, NodeError> {
        self.engine.send_payment(req).await
    }

    pub async fn send_payment_with_conditions(
        &self,
        dest: Address,
        token: TokenInfo,
        amount: Amount,
        conditions: Vec<Condition>,
        logic: TransferLogic,
    ) -> Result<PayId, NodeError> {
        let req = SendRequest::new(dest, token, amount).conditions(conditions).logic(logic);
        self.engine.send_payment(req).await
    }

    pub async fn confirm_pay(&self, pay_id: PayId) -> Result<(), NodeError> {
        self.engine.confirm_pay(pay_id).await
    }

    pub async fn reject_pay(&self, pay_id: PayId) -> Result<(), NodeError> {
        self.engine.reject_pay(pay_id).await
    }

    pub async fn settle_expired_pays(&self) -> Result<Vec<PayId>, NodeError> {
        self.engine.settle_expired_pays().await
    }

    /// Resolve an incoming pay on chain with the secrets we hold.
    pub async fn resolve_pay_on_chain(&self, pay_id: PayId) -> Result<(), NodeError> {
        self.engine.resolve_on_chain(pay_id).await
    }

    pub fn get_pay_status(&self, pay_id: &PayId) -> Result<PayRecord, NodeError> {
        self.engine.pay_record(pay_id)?.ok_or(NodeError::UnknownPay(*pay_id))
    }

    pub fn get_pay_history(&self, query: &HistoryQuery) -> Result<HistoryPage, NodeError> {
        Ok(self.registry.store().pay_history(query)?)
    }

    pub fn subscribe_pays(&self) -> broadcast::Receiver<PayUpdate> {
        self.engine.subscribe()
    }
}

#[async_trait]
impl PeerHandler for Node {
    async fn handle_envelope(&self, envelope: Envelope) -> PeerReply {
        let Envelope { from, msg } = envelope;
        let kind = msg.kind();
        let result = self.dispatch(from, msg).instrument(self.span.clone()).await;
        match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(parent: &self.span, peer = %from.short(), kind, error = %e, "peer request rejected");
                PeerReply::rejected(e.reject_code(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalHub;
    use osp_core::wire::{OpenChannelRequest, OpenChannelTerms};
    use osp_settlement::{SimulatedChain, SimulatedChainConfig};
    use osp_store::MemoryStore;
    use std::time::Duration;

    fn test_node() -> Arc<Node> {
        let keypair = Arc::new(KeyPair::from_seed(&[1; 32]));
        let hub = LocalHub::new(Duration::from_millis(100));
        let transport = hub.endpoint(keypair.address());
        Node::new(
            OspConfig::default(),
            keypair,
            Arc::new(MemoryStore::new()),
            Arc::new(SimulatedChain::new(SimulatedChainConfig::default())),
            transport,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let node = test_node();
        let reply = node
            .handle_envelope(Envelope {
                from: Address([9; 20]),
                msg: PeerMessage::Ping,
            })
            .await;
        assert!(matches!(reply, PeerReply::Pong));
    }

    #[tokio::test]
    async fn test_open_request_must_come_from_initiator() {
        let node = test_node();
        let terms = OpenChannelTerms {
            token: TokenInfo::native(),
            initiator: Address([7; 20]),
            responder: node.local(),
            initiator_deposit: 10,
            responder_deposit: 0,
            nonce: 1,
            open_deadline: 100,
            ledger: Address([0x1e; 20]),
        };
        let reply = node
            .handle_envelope(Envelope {
                from: Address([8; 20]),
                msg: PeerMessage::OpenChannelRequest(OpenChannelRequest {
                    terms,
                    initiator_key: Vec::new(),
                    sig: Vec::new(),
                }),
            })
            .await;
        assert!(matches!(reply, PeerReply::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_fresh_node_lookups() {
        let node = test_node();
        let status = node.status();
        assert_eq!(status.channels, 0);
        assert_eq!(status.net_id, 1);
        assert!(matches!(
            node.get_pay_status(&PayId([3; 32])),
            Err(NodeError::UnknownPay(_))
        ));
        assert!(matches!(
            node.channel(&ChannelId([4; 32])),
            Err(NodeError::UnknownChannel(_))
        ));
        assert!(node.get_peer_status(&Address([5; 20])).channels.is_empty());
    }
}
