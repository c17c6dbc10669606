//! The router's view of this node's channels and peers.

use osp_channel::{ChannelRegistry, ChannelSummary};
use osp_core::{Address, ChannelId, ChannelStatus, TokenInfo};
use osp_routing::{ChannelCapacity, ChannelDirectory};
use std::sync::Arc;

use crate::transport::PeerTransport;

pub struct NodeDirectory {
    registry: Arc<ChannelRegistry>,
    transport: Arc<dyn PeerTransport>,
}

impl NodeDirectory {
    pub fn new(registry: Arc<ChannelRegistry>, transport: Arc<dyn PeerTransport>) -> Self {
        Self { registry, transport }
    }
}

fn capacity(summary: ChannelSummary) -> ChannelCapacity {
    ChannelCapacity {
        channel_id: summary.channel_id,
        peer: summary.peer,
        token: summary.token,
        free_local: summary.free_local,
        usable: summary.status == ChannelStatus::Opened && summary.halted.is_none(),
    }
}

impl ChannelDirectory for NodeDirectory {
    fn channel_to(&self, peer: &Address, token: &TokenInfo) -> Option<ChannelCapacity> {
        let handle = self.registry.by_peer(peer, token)?;
        self.registry.summary(&handle.channel_id).map(capacity)
    }

    fn capacity(&self, channel_id: &ChannelId) -> Option<ChannelCapacity> {
        self.registry.summary(channel_id).map(capacity)
    }

    fn has_channel_with(&self, peer: &Address) -> bool {
        self.registry
            .with_peer(peer)
            .iter()
            .filter_map(|h| self.registry.summary(&h.channel_id))
            .any(|s| capacity(s).usable)
    }

    fn is_reachable(&self, peer: &Address) -> bool {
        self.transport.is_reachable(peer)
    }
}
