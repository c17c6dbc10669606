//! Peer message transports.
//!
//! [`PeerTransport`] delivers one [`Envelope`] to a peer and returns its
//! [`PeerReply`]. [`LocalHub`] connects nodes living in one process (tests,
//! devnets) and can take any of them offline; [`HttpTransport`] posts JSON
//! envelopes to the peer's `/peer/v1/message` endpoint.

use async_trait::async_trait;
use dashmap::DashMap;
use osp_core::wire::{OpenChannelRequest, WithdrawRequest};
use osp_core::{Address, Envelope, PeerMessage, PeerReply};
use osp_settlement::{PeerApprovals, ReconcileError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::PeerEndpoint;

const STATUS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(Address),

    #[error("peer {0} did not answer in time")]
    Timeout(Address),

    #[error("http error: {0}")]
    Http(String),

    #[error("malformed reply: {0}")]
    Codec(String),
}

/// A peer came online or went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub peer: Address,
    pub online: bool,
}

/// Server side of a transport: whatever answers envelopes for a node.
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn handle_envelope(&self, envelope: Envelope) -> PeerReply;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn request(&self, peer: &Address, envelope: Envelope) -> Result<PeerReply, TransportError>;

    fn is_reachable(&self, peer: &Address) -> bool;

    /// Stream of peer status changes.
    fn subscribe(&self) -> broadcast::Receiver<PeerStatus>;

    /// Re-check peers currently considered down.
    async fn probe(&self) {}
}

// ---- in-process hub -----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Fail before the handler sees the message.
    DropRequest,
    /// Deliver the message but lose the answer.
    DropReply,
}

/// In-process switchboard between nodes. Handlers are held weakly, so a
/// dropped node simply becomes unreachable.
pub struct LocalHub {
    handlers: DashMap<Address, Weak<dyn PeerHandler>>,
    offline: DashMap<Address, ()>,
    faults: DashMap<Address, Vec<Fault>>,
    status: broadcast::Sender<PeerStatus>,
    timeout: Duration,
}

impl LocalHub {
    pub fn new(timeout: Duration) -> Arc<Self> {
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Arc::new(Self {
            handlers: DashMap::new(),
            offline: DashMap::new(),
            faults: DashMap::new(),
            status,
            timeout,
        })
    }

    /// Transport as seen by the node at `local`.
    pub fn endpoint(self: &Arc<Self>, local: Address) -> Arc<LocalEndpoint> {
        Arc::new(LocalEndpoint {
            hub: self.clone(),
            local,
        })
    }

    /// Register (or replace) the handler for `address` and announce it online.
    pub fn attach(&self, address: Address, handler: Weak<dyn PeerHandler>) {
        self.handlers.insert(address, handler);
        self.set_online(address, true);
    }

    pub fn detach(&self, address: &Address) {
        self.handlers.remove(address);
        self.set_online(*address, false);
    }

    pub fn set_online(&self, address: Address, online: bool) {
        let changed = if online {
            self.offline.remove(&address).is_some() || !self.offline.contains_key(&address)
        } else {
            self.offline.insert(address, ()).is_none()
        };
        if changed {
            tracing::debug!(peer = %address.short(), online, "hub peer status");
            let _ = self.status.send(PeerStatus { peer: address, online });
        }
    }

    /// The next message sent to `address` is lost before delivery.
    pub fn drop_next_request(&self, address: Address) {
        self.faults.entry(address).or_default().push(Fault::DropRequest);
    }

    /// The next message sent to `address` is handled but its reply is lost.
    pub fn drop_next_reply(&self, address: Address) {
        self.faults.entry(address).or_default().push(Fault::DropReply);
    }

    fn take_fault(&self, address: &Address) -> Option<Fault> {
        let mut faults = self.faults.get_mut(address)?;
        if faults.is_empty() {
            None
        } else {
            Some(faults.remove(0))
        }
    }

    fn handler(&self, address: &Address) -> Option<Arc<dyn PeerHandler>> {
        if self.offline.contains_key(address) {
            return None;
        }
        self.handlers.get(address).and_then(|h| h.value().upgrade())
    }

    fn is_online(&self, address: &Address) -> bool {
        self.handler(address).is_some()
    }
}

pub struct LocalEndpoint {
    hub: Arc<LocalHub>,
    local: Address,
}

#[async_trait]
impl PeerTransport for LocalEndpoint {
    async fn request(&self, peer: &Address, envelope: Envelope) -> Result<PeerReply, TransportError> {
        if self.hub.offline.contains_key(&self.local) {
            return Err(TransportError::Unreachable(*peer));
        }
        let handler = self.hub.handler(peer).ok_or(TransportError::Unreachable(*peer))?;
        let fault = self.hub.take_fault(peer);
        if fault == Some(Fault::DropRequest) {
            tracing::debug!(peer = %peer.short(), kind = envelope.msg.kind(), "hub dropped request");
            return Err(TransportError::Timeout(*peer));
        }
        let reply = tokio::time::timeout(self.hub.timeout, handler.handle_envelope(envelope))
            .await
            .map_err(|_| TransportError::Timeout(*peer))?;
        if fault == Some(Fault::DropReply) {
            tracing::debug!(peer = %peer.short(), "hub dropped reply");
            return Err(TransportError::Timeout(*peer));
        }
        Ok(reply)
    }

    fn is_reachable(&self, peer: &Address) -> bool {
        !self.hub.offline.contains_key(&self.local) && self.hub.is_online(peer)
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerStatus> {
        self.hub.status.subscribe()
    }
}

// ---- HTTP -----------------------------------------------------------------

/// Path every node serves peer envelopes on.
pub const PEER_MESSAGE_PATH: &str = "/peer/v1/message";

pub struct HttpTransport {
    local: Address,
    client: reqwest::Client,
    peers: DashMap<Address, String>,
    down: DashMap<Address, ()>,
    status: broadcast::Sender<PeerStatus>,
}

impl HttpTransport {
    pub fn new(local: Address, peers: &[PeerEndpoint], timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let transport = Self {
            local,
            client,
            peers: DashMap::new(),
            down: DashMap::new(),
            status,
        };
        for peer in peers {
            transport.add_peer(peer.address, peer.url.clone());
        }
        Ok(transport)
    }

    pub fn add_peer(&self, address: Address, url: String) {
        self.peers.insert(address, url.trim_end_matches('/').to_string());
    }

    fn mark(&self, peer: &Address, online: bool) {
        let changed = if online {
            self.down.remove(peer).is_some()
        } else {
            self.down.insert(*peer, ()).is_none()
        };
        if changed {
            tracing::info!(peer = %peer.short(), online, "peer status changed");
            let _ = self.status.send(PeerStatus { peer: *peer, online });
        }
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn request(&self, peer: &Address, envelope: Envelope) -> Result<PeerReply, TransportError> {
        let base = self
            .peers
            .get(peer)
            .map(|u| u.value().clone())
            .ok_or(TransportError::Unreachable(*peer))?;
        let url = format!("{}{}", base, PEER_MESSAGE_PATH);
        let resp = match self.client.post(&url).json(&envelope).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(TransportError::Timeout(*peer)),
            Err(e) => {
                tracing::debug!(peer = %peer.short(), error = %e, "peer request failed");
                self.mark(peer, false);
                return Err(TransportError::Unreachable(*peer));
            }
        };
        self.mark(peer, true);
        if !resp.status().is_success() {
            return Err(TransportError::Http(format!("{} answered {}", peer, resp.status())));
        }
        resp.json::<PeerReply>()
            .await
            .map_err(|e| TransportError::Codec(e.to_string()))
    }

    fn is_reachable(&self, peer: &Address) -> bool {
        self.peers.contains_key(peer) && !self.down.contains_key(peer)
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerStatus> {
        self.status.subscribe()
    }

    async fn probe(&self) {
        let down: Vec<Address> = self.down.iter().map(|e| *e.key()).collect();
        for peer in down {
            let ping = Envelope {
                from: self.local,
                msg: PeerMessage::Ping,
            };
            if let Ok(PeerReply::Pong) = self.request(&peer, ping).await {
                tracing::debug!(peer = %peer.short(), "peer answered probe");
            }
        }
    }
}

// ---- approvals over a transport ----------------------------------------

/// Collects the counterparty signatures of two-party chain calls by asking
/// the peer over the node's transport.
pub struct TransportApprovals {
    local: Address,
    transport: Arc<dyn PeerTransport>,
}

impl TransportApprovals {
    pub fn new(local: Address, transport: Arc<dyn PeerTransport>) -> Self {
        Self { local, transport }
    }

    async fn ask(&self, peer: Address, msg: PeerMessage) -> Result<PeerReply, ReconcileError> {
        let envelope = Envelope { from: self.local, msg };
        match self.transport.request(&peer, envelope).await {
            Ok(PeerReply::Rejected { code, reason }) => {
                Err(ReconcileError::PeerRefused(format!("{}: {}", code, reason)))
            }
            Ok(reply) => Ok(reply),
            Err(e) => Err(ReconcileError::PeerRefused(e.to_string())),
        }
    }
}

#[async_trait]
impl PeerApprovals for TransportApprovals {
    async fn approve_open(
        &self,
        peer: Address,
        request: OpenChannelRequest,
    ) -> Result<(Vec<u8>, Vec<u8>), ReconcileError> {
        match self.ask(peer, PeerMessage::OpenChannelRequest(request)).await? {
            PeerReply::OpenChannelApproval { sig, responder_key } => Ok((sig, responder_key)),
            other => Err(ReconcileError::PeerRefused(format!("unexpected reply to open: {:?}", other))),
        }
    }

    async fn approve_withdraw(&self, peer: Address, request: WithdrawRequest) -> Result<Vec<u8>, ReconcileError> {
        match self.ask(peer, PeerMessage::WithdrawRequest(request)).await? {
            PeerReply::WithdrawApproval { sig } => Ok(sig),
            other => Err(ReconcileError::PeerRefused(format!("unexpected reply to withdraw: {:?}", other))),
        }
    }
}
