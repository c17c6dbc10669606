use osp_core::wire::{Preimage, RoutedBody, RoutedMessage};
use osp_core::{Address, PayState, PeerMessage, PeerReply, RelayDirection};
use osp_crypto::{verify, PublicKey};
use osp_routing::RoutingError;
use std::sync::Arc;

use super::PayEngine;
use crate::error::NodeError;

/// Hops a routed message may take before it is dropped.
pub(crate) const ROUTED_TTL: u8 = 16;

impl PayEngine {
    /// Answer a routed message addressed to us, or pass it one hop closer to
    /// its destination.
    pub async fn handle_routed(self: &Arc<Self>, from: Address, mut msg: RoutedMessage) -> Result<PeerReply, NodeError> {
        if msg.dest == self.local() && msg.dest_net == self.router.local_net() {
            return self.answer_routed(&msg);
        }
        if msg.ttl == 0 {
            return Err(RoutingError::NoRoute { dest: msg.dest }.into());
        }
        msg.ttl -= 1;

        // Past a network border the source knows the pay by its original id.
        let RoutedBody::SecretRequest { pay_id, .. } = &mut msg.body;
        if let Some(x) = self.store().get_cross_net(pay_id)? {
            if x.direction == RelayDirection::Ingress {
                *pay_id = x.original_pay_id;
            }
        }

        let next = self.router.select_message_hop(&self.directory, &msg.dest, msg.dest_net)?;
        if next == from {
            return Err(RoutingError::NoRoute { dest: msg.dest }.into());
        }
        tracing::debug!(
            origin = %msg.origin.short(),
            dest = %msg.dest.short(),
            next = %next.short(),
            ttl = msg.ttl,
            "relaying routed message"
        );
        Ok(self.request(&next, PeerMessage::Routed(msg)).await?)
    }

    fn answer_routed(&self, msg: &RoutedMessage) -> Result<PeerReply, NodeError> {
        let key = PublicKey::for_address(&msg.origin_key, &msg.origin)?;
        let payload = RoutedMessage::signing_payload(&msg.origin, &msg.dest, &msg.body);
        verify(&payload, &msg.sig, &key)?;

        match &msg.body {
            RoutedBody::SecretRequest { pay_id, hash } => {
                let record = self.pay_record(pay_id)?.ok_or(NodeError::UnknownPay(*pay_id))?;
                if record.pay.src != self.local() || record.pay.dest != msg.origin {
                    return Err(NodeError::InvalidRequest("secret requested by a party other than the payee".into()));
                }
                if !record.pay.hash_locks().any(|h| h == hash) {
                    return Err(NodeError::InvalidRequest("hash is not a lock of the pay".into()));
                }
                if record
                    .outgoing
                    .as_ref()
                    .is_some_and(|l| l.state == PayState::CosignedCanceled)
                {
                    return Err(NodeError::InvalidRequest("pay was canceled".into()));
                }
                let preimage = self
                    .store()
                    .get_secret(hash)?
                    .ok_or_else(|| NodeError::InvalidRequest("we do not hold this secret".into()))?;
                tracing::debug!(pay_id = %pay_id.short(), to = %msg.origin.short(), "revealing pay secret");
                Ok(PeerReply::Secret(Preimage { hash: *hash, preimage }))
            }
        }
    }
}
