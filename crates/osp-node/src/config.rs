//! Node configuration loading and management.

use osp_core::{Address, NetId, TokenInfo};
use osp_routing::{PolicySet, RoutingTable, TokenPolicy};
use osp_settlement::{MonitorConfig, RefillConfig, WaitConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full configuration of an OSP node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OspConfig {
    #[serde(default)]
    pub node: NodeSection,

    /// Client/admin API settings.
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Ledger chain access and transaction waiting.
    #[serde(default)]
    pub chain: ChainConfig,

    /// Pay deadlines, peer timeouts and the expiry sweeper.
    #[serde(default)]
    pub payment: PaymentConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    /// Channel-open and pay admission policy.
    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub refill: RefillConfig,

    /// Known peers and where to reach them.
    #[serde(default)]
    pub peers: Vec<PeerEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Path to the keypair file; generated on first start.
    #[serde(default)]
    pub keypair_path: Option<PathBuf>,
    /// Sub-network this node belongs to.
    #[serde(default = "default_net_id")]
    pub net_id: NetId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_addr")]
    pub listen_addr: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Rocksdb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Blocks a transaction must be buried under before it counts.
    #[serde(default = "default_block_delay")]
    pub block_delay: u64,
    #[serde(default = "default_chain_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Bound of the queue between the event poller and the node.
    #[serde(default = "default_event_queue")]
    pub event_queue_capacity: usize,
    /// Ledger contract new channels are opened on.
    #[serde(default)]
    pub ledger: Address,
    /// Pay resolver contract of this sub-network.
    #[serde(default)]
    pub pay_resolver: Address,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_blocks: u64,
    #[serde(default = "default_withdraw_timeout")]
    pub withdraw_timeout_blocks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Resolve deadline of new pays, in blocks after the current head.
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_blocks: u64,
    /// Longest wait for a peer to answer one request.
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// A payee resolves on chain when the payer has not settled this many
    /// blocks before the deadline.
    #[serde(default = "default_resolve_margin")]
    pub onchain_resolve_margin: u64,
    /// Attempts for settle proofs and secret requests the peer answered `busy`.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRoute {
    pub dest: Address,
    pub next_hop: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetRoute {
    pub net: NetId,
    /// Peer that bridges into `net`.
    pub bridge: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_route: Option<Address>,
    #[serde(default)]
    pub routes: Vec<StaticRoute>,
    #[serde(default)]
    pub net_routes: Vec<NetRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPolicyEntry {
    pub token: TokenInfo,
    pub policy: TokenPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyConfig {
    #[serde(default)]
    pub default: TokenPolicy,
    #[serde(default)]
    pub tokens: Vec<TokenPolicyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub address: Address,
    /// Base URL of the peer's API, e.g. `http://10.0.0.2:9101`.
    pub url: String,
}

fn default_node_name() -> String {
    "osp".into()
}
fn default_net_id() -> NetId {
    1
}
fn default_api_addr() -> String {
    "127.0.0.1".into()
}
fn default_api_port() -> u16 {
    9101
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_block_delay() -> u64 {
    2
}
fn default_chain_poll_ms() -> u64 {
    500
}
fn default_receipt_timeout_ms() -> u64 {
    120_000
}
fn default_backoff_initial_ms() -> u64 {
    200
}
fn default_backoff_max_ms() -> u64 {
    5_000
}
fn default_event_queue() -> usize {
    1024
}
fn default_open_timeout() -> u64 {
    20
}
fn default_withdraw_timeout() -> u64 {
    20
}
fn default_resolve_timeout() -> u64 {
    20
}
fn default_peer_timeout_ms() -> u64 {
    10_000
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}
fn default_resolve_margin() -> u64 {
    2
}
fn default_retry_attempts() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            keypair_path: None,
            net_id: default_net_id(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_api_addr(),
            port: default_api_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: StorageBackend::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            block_delay: default_block_delay(),
            poll_interval_ms: default_chain_poll_ms(),
            receipt_timeout_ms: default_receipt_timeout_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            event_queue_capacity: default_event_queue(),
            ledger: Address::default(),
            pay_resolver: Address::default(),
            open_timeout_blocks: default_open_timeout(),
            withdraw_timeout_blocks: default_withdraw_timeout(),
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_blocks: default_resolve_timeout(),
            peer_timeout_ms: default_peer_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            onchain_resolve_margin: default_resolve_margin(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ChainConfig {
    pub fn wait_config(&self) -> WaitConfig {
        WaitConfig {
            block_delay: self.block_delay,
            poll_interval_ms: self.poll_interval_ms,
            timeout_ms: self.receipt_timeout_ms,
            backoff_initial_ms: self.backoff_initial_ms,
            backoff_max_ms: self.backoff_max_ms,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            queue_capacity: self.event_queue_capacity,
        }
    }
}

impl PaymentConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl RoutingConfig {
    pub fn build_table(&self) -> RoutingTable {
        let table = RoutingTable::new();
        for route in &self.routes {
            table.add_route(route.dest, route.next_hop);
        }
        table.set_default_route(self.default_route);
        for net in &self.net_routes {
            table.set_net_route(net.net, net.bridge);
        }
        table
    }
}

impl PolicyConfig {
    pub fn build(&self) -> PolicySet {
        PolicySet::new(
            self.default.clone(),
            self.tokens.iter().map(|e| (e.token, e.policy.clone())),
        )
    }
}

impl OspConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: OspConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the current config to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn keypair_path(&self) -> PathBuf {
        self.node
            .keypair_path
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("node.key"))
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.listen_addr, self.api.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OspConfig::default();
        assert_eq!(config.api.port, 9101);
        assert_eq!(config.node.net_id, 1);
        assert_eq!(config.storage.backend, StorageBackend::Rocksdb);
        assert_eq!(config.payment.resolve_timeout_blocks, 20);
        assert!(!config.refill.enabled);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = OspConfig::default();
        config.routing.routes.push(StaticRoute {
            dest: Address([2; 20]),
            next_hop: Address([3; 20]),
        });
        config.policy.tokens.push(TokenPolicyEntry {
            token: TokenInfo::native(),
            policy: TokenPolicy {
                max_my_deposit: 1_000,
                ..TokenPolicy::default()
            },
        });
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let decoded: OspConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(decoded.routing.routes.len(), 1);
        assert_eq!(decoded.policy.tokens[0].policy.max_my_deposit, 1_000);
        assert_eq!(decoded.api.port, config.api.port);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let config = OspConfig::load(Path::new("/nonexistent/osp.toml")).unwrap();
        assert_eq!(config.api.port, 9101);
    }

    #[test]
    fn test_config_from_toml_partial() {
        let toml_str = r#"
[node]
net_id = 7

[storage]
backend = "memory"

[routing]
default_route = "0x0303030303030303030303030303030303030303"

[[routing.net_routes]]
net = 2
bridge = "0x0404040404040404040404040404040404040404"

[[peers]]
address = "0x0505050505050505050505050505050505050505"
url = "http://127.0.0.1:9102"
"#;
        let config: OspConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.node.net_id, 7);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.peers.len(), 1);

        let table = config.routing.build_table();
        assert_eq!(table.default_route(), Some(Address([3; 20])));
        assert_eq!(table.net_route(2), Some(Address([4; 20])));
        // Defaults for unspecified
        assert_eq!(config.chain.block_delay, 2);
    }
}
