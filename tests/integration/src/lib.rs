//! Harness for multi-node scenarios.
//!
//! Every node in a [`TestNet`] talks to the others through one in-process
//! [`LocalHub`] and to one shared [`SimulatedChain`]. Stores are in-memory
//! and survive a [`TestNet::restart`], which is how crash recovery is
//! exercised. Blocks only advance when a test mines them.

use osp_core::{Address, Amount, ChannelId, ChannelStatus, NetId, PayId, PayRecord, PayState, TokenInfo};
use osp_crypto::KeyPair;
use osp_channel::ChannelSummary;
use osp_node::config::{NetRoute, StaticRoute, StorageBackend};
use osp_node::{LocalHub, Node, OspConfig};
use osp_settlement::{SimulatedChain, SimulatedChainConfig};
use osp_store::MemoryStore;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Deposit each side makes in the standard scenarios: 5 * 10^18.
pub const DEPOSIT: Amount = 5_000_000_000_000_000_000;

const WAIT: Duration = Duration::from_secs(15);
const POLL: Duration = Duration::from_millis(20);

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}

pub fn seed_address(seed: u8) -> Address {
    KeyPair::from_seed(&[seed; 32]).address()
}

/// Config with short timeouts, instant receipts and an open policy that
/// matches two-sided deposits.
pub fn fast_config(net_id: NetId) -> OspConfig {
    let mut config = OspConfig::default();
    config.node.net_id = net_id;
    config.storage.backend = StorageBackend::Memory;
    config.chain.block_delay = 0;
    config.chain.poll_interval_ms = 10;
    config.chain.receipt_timeout_ms = 5_000;
    config.chain.backoff_initial_ms = 5;
    config.chain.backoff_max_ms = 50;
    config.chain.ledger = SimulatedChainConfig::default().ledger;
    config.payment.peer_timeout_ms = 500;
    config.payment.sweep_interval_ms = 50;
    config.payment.retry_backoff_ms = 20;
    config.policy.default.max_my_deposit = DEPOSIT * 10;
    config
}

pub fn route(dest: Address, next_hop: Address) -> StaticRoute {
    StaticRoute { dest, next_hop }
}

pub fn net_route(net: NetId, bridge: Address) -> NetRoute {
    NetRoute { net, bridge }
}

pub struct TestNet {
    pub hub: Arc<LocalHub>,
    pub chain: Arc<SimulatedChain>,
}

impl TestNet {
    pub fn new() -> Self {
        init_tracing();
        Self {
            hub: LocalHub::new(Duration::from_millis(500)),
            chain: Arc::new(SimulatedChain::new(SimulatedChainConfig::default())),
        }
    }

    /// Start a node whose key is derived from `seed`.
    pub fn spawn(&self, seed: u8, config: OspConfig) -> TestNode {
        let keypair = Arc::new(KeyPair::from_seed(&[seed; 32]));
        self.start(keypair, Arc::new(MemoryStore::new()), config)
    }

    /// Stop `old` the way a crash would leave it (nothing flushed beyond
    /// what the store already holds) and start a fresh node over its store.
    pub async fn restart(&self, old: TestNode) -> TestNode {
        let TestNode {
            keypair,
            store,
            config,
            node,
        } = old;
        node.shutdown().await;
        self.hub.detach(&keypair.address());
        drop(node);
        self.start(keypair, store, config)
    }

    fn start(&self, keypair: Arc<KeyPair>, store: Arc<MemoryStore>, config: OspConfig) -> TestNode {
        let address = keypair.address();
        let node = Node::new(
            config.clone(),
            keypair.clone(),
            store.clone(),
            self.chain.clone(),
            self.hub.endpoint(address),
        )
        .expect("node should build over the store");
        let handler: Weak<Node> = Arc::downgrade(&node);
        self.hub.attach(address, handler);
        node.start();
        TestNode {
            keypair,
            store,
            config,
            node,
        }
    }
}

impl Default for TestNet {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TestNode {
    pub keypair: Arc<KeyPair>,
    pub store: Arc<MemoryStore>,
    pub config: OspConfig,
    pub node: Arc<Node>,
}

impl TestNode {
    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    pub fn summary(&self, channel_id: &ChannelId) -> ChannelSummary {
        self.node.channel(channel_id).expect("channel should be known")
    }

    pub fn record(&self, pay_id: &PayId) -> Option<PayRecord> {
        self.node.get_pay_status(pay_id).ok()
    }

    /// Outgoing leg if we forwarded or sent the pay, incoming leg otherwise.
    pub fn pay_state(&self, pay_id: &PayId) -> Option<PayState> {
        self.record(pay_id).map(|r| r.state())
    }

    pub fn incoming_state(&self, pay_id: &PayId) -> Option<PayState> {
        self.record(pay_id).and_then(|r| r.incoming.map(|l| l.state))
    }
}

/// Open a channel from `a` to `b`, each depositing `deposit`, and wait
/// until both sides track it as open and funded.
pub async fn connect(a: &TestNode, b: &TestNode, deposit: Amount) -> ChannelId {
    let channel_id = a
        .node
        .open_channel(b.address(), TokenInfo::native(), deposit, deposit)
        .await
        .expect("channel should open");
    eventually("channel open on both sides", || {
        [a, b].iter().all(|n| {
            n.node.channel(&channel_id).is_ok_and(|s| {
                s.status == ChannelStatus::Opened && s.free_local == deposit && s.free_remote == deposit
            })
        })
    })
    .await;
    channel_id
}

/// Poll `check` until it holds, panicking after a generous timeout.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(POLL).await;
    }
}

/// [`eventually`] for checks that have to await, such as chain queries.
pub async fn eventually_async<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(POLL).await;
    }
}
