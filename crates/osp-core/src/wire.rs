//! Peer-to-peer messages. Every request is a variant of the closed
//! [`PeerMessage`] enum; every response a variant of [`PeerReply`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pay::ConditionalPay;
use crate::records::{CancelReason, SimplexEntry};
use crate::simplex::{SimplexState, StateChange};
use crate::types::{amount_str, hex_bytes, Address, Amount, BlockNumber, ChannelId, Hash32, NetId, PayId, TokenInfo};

/// A message with its claimed sender. State-mutating bodies carry their own
/// signatures, which are what actually authenticate them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Address,
    pub msg: PeerMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerMessage {
    /// Lock or directly transfer a pay on the sender's simplex.
    CondPayRequest(CondPayRequest),
    /// Payee → payer: please settle (with preimages) or cancel this pay.
    PaySettleProof(PaySettleProof),
    /// Payer → payee: proposal unlocking one or more pays.
    PaySettleRequest(StateProposal),
    /// A message addressed to a node that is not our direct peer.
    Routed(RoutedMessage),
    SyncRequest(SyncRequest),
    OpenChannelRequest(OpenChannelRequest),
    WithdrawRequest(WithdrawRequest),
    Ping,
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CondPayRequest(_) => "cond_pay_request",
            Self::PaySettleProof(_) => "pay_settle_proof",
            Self::PaySettleRequest(_) => "pay_settle_request",
            Self::Routed(_) => "routed",
            Self::SyncRequest(_) => "sync_request",
            Self::OpenChannelRequest(_) => "open_channel_request",
            Self::WithdrawRequest(_) => "withdraw_request",
            Self::Ping => "ping",
        }
    }
}

/// A signed proposal of the next state of the proposer's simplex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateProposal {
    pub state: SimplexState,
    pub change: StateChange,
    #[serde(with = "hex_bytes")]
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CondPayRequest {
    pub proposal: StateProposal,
    pub pay: ConditionalPay,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preimage {
    pub hash: Hash32,
    #[serde(with = "hex_bytes")]
    pub preimage: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaySettleProof {
    pub pay_id: PayId,
    /// Set when the payee asks for a cancel instead of payment.
    pub cancel: Option<CancelReason>,
    pub preimages: Vec<Preimage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutedBody {
    /// The pay destination asks the source for hash-lock preimages.
    SecretRequest { pay_id: PayId, hash: Hash32 },
}

/// Hop-by-hop relayed message. The origin signs `(body, dest)` and proves its
/// address with its public key, so relays cannot forge requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub origin: Address,
    #[serde(with = "hex_bytes")]
    pub origin_key: Vec<u8>,
    pub dest: Address,
    pub dest_net: NetId,
    pub body: RoutedBody,
    #[serde(with = "hex_bytes")]
    pub sig: Vec<u8>,
    /// Remaining hops before the message is dropped.
    pub ttl: u8,
}

impl RoutedMessage {
    pub fn signing_payload(origin: &Address, dest: &Address, body: &RoutedBody) -> Vec<u8> {
        let mut payload = Vec::with_capacity(128);
        payload.extend_from_slice(b"osp.routed.v1");
        payload.extend_from_slice(origin.as_bytes());
        payload.extend_from_slice(dest.as_bytes());
        match body {
            // The pay id is left out: a border node rewrites it to the id used
            // on the far side of the relay.
            RoutedBody::SecretRequest { hash, .. } => {
                payload.push(1);
                payload.extend_from_slice(hash.as_bytes());
            }
        }
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub channel_id: ChannelId,
    /// Sender's committed outgoing simplex with its lock table.
    pub outgoing: SimplexEntry,
    /// Sender's committed incoming simplex.
    pub incoming: SimplexEntry,
    /// Seq of the sender's uncommitted proposal, if any.
    pub pending_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReply {
    pub outgoing: SimplexEntry,
    pub incoming: SimplexEntry,
}

/// Terms of a channel open both participants sign before it is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelTerms {
    pub token: TokenInfo,
    pub initiator: Address,
    pub responder: Address,
    #[serde(with = "amount_str")]
    pub initiator_deposit: Amount,
    #[serde(with = "amount_str")]
    pub responder_deposit: Amount,
    pub nonce: u64,
    /// The terms must land on chain before this block.
    pub open_deadline: BlockNumber,
    pub ledger: Address,
}

impl OpenChannelTerms {
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(160);
        payload.extend_from_slice(b"osp.open.v1");
        payload.extend_from_slice(&self.token.canonical_bytes());
        payload.extend_from_slice(self.initiator.as_bytes());
        payload.extend_from_slice(self.responder.as_bytes());
        payload.extend_from_slice(&self.initiator_deposit.to_be_bytes());
        payload.extend_from_slice(&self.responder_deposit.to_be_bytes());
        payload.extend_from_slice(&self.nonce.to_be_bytes());
        payload.extend_from_slice(&self.open_deadline.to_be_bytes());
        payload.extend_from_slice(self.ledger.as_bytes());
        payload
    }

    pub fn channel_id(&self) -> ChannelId {
        ChannelId::derive(&self.initiator, &self.responder, &self.token, self.nonce)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub terms: OpenChannelTerms,
    #[serde(with = "hex_bytes")]
    pub initiator_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub sig: Vec<u8>,
}

/// Terms of a cooperative withdraw both participants sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawTerms {
    pub channel_id: ChannelId,
    pub seq: u64,
    pub receiver: Address,
    #[serde(with = "amount_str")]
    pub amount: Amount,
    pub deadline: BlockNumber,
}

impl WithdrawTerms {
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(112);
        payload.extend_from_slice(b"osp.withdraw.v1");
        payload.extend_from_slice(self.channel_id.as_bytes());
        payload.extend_from_slice(&self.seq.to_be_bytes());
        payload.extend_from_slice(self.receiver.as_bytes());
        payload.extend_from_slice(&self.amount.to_be_bytes());
        payload.extend_from_slice(&self.deadline.to_be_bytes());
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub terms: WithdrawTerms,
    #[serde(with = "hex_bytes")]
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    StaleSeqNum,
    InvalidSignature,
    InvalidState,
    InsufficientBalance,
    UnknownChannel,
    UnknownPay,
    DuplicatePay,
    PolicyViolation,
    NoRoute,
    Unreachable,
    /// A proposal on the channel is still outstanding; retry later.
    Busy,
    Expired,
    Migrating,
    ChannelHalted,
    Internal,
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StaleSeqNum => "stale seq num",
            Self::InvalidSignature => "invalid signature",
            Self::InvalidState => "invalid state",
            Self::InsufficientBalance => "insufficient balance",
            Self::UnknownChannel => "unknown channel",
            Self::UnknownPay => "unknown pay",
            Self::DuplicatePay => "duplicate pay",
            Self::PolicyViolation => "policy violation",
            Self::NoRoute => "no route",
            Self::Unreachable => "unreachable",
            Self::Busy => "busy",
            Self::Expired => "expired",
            Self::Migrating => "migrating",
            Self::ChannelHalted => "channel halted",
            Self::Internal => "internal error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerReply {
    /// Countersignature of the proposed state.
    StateAck {
        #[serde(with = "hex_bytes")]
        sig: Vec<u8>,
    },
    Ack,
    /// Answer to a routed secret request.
    Secret(Preimage),
    SyncReply(SyncReply),
    OpenChannelApproval {
        #[serde(with = "hex_bytes")]
        sig: Vec<u8>,
        #[serde(with = "hex_bytes")]
        responder_key: Vec<u8>,
    },
    WithdrawApproval {
        #[serde(with = "hex_bytes")]
        sig: Vec<u8>,
    },
    Pong,
    Rejected { code: RejectCode, reason: String },
}

impl PeerReply {
    pub fn rejected(code: RejectCode, reason: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simplex::SimplexState;

    #[test]
    fn test_envelope_json_roundtrip() {
        let env = Envelope {
            from: Address([1; 20]),
            msg: PeerMessage::PaySettleRequest(StateProposal {
                state: SimplexState::initial(ChannelId([2; 32]), Address([1; 20])),
                change: StateChange::DirectPay {
                    pay_id: PayId([3; 32]),
                    amount: 5,
                },
                sig: vec![1, 2, 3],
            }),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("pay_settle_request"));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.msg.kind(), "pay_settle_request");
    }

    #[test]
    fn test_routed_signature_payload_ignores_pay_id() {
        let origin = Address([1; 20]);
        let dest = Address([2; 20]);
        let a = RoutedBody::SecretRequest {
            pay_id: PayId([1; 32]),
            hash: Hash32([9; 32]),
        };
        let b = RoutedBody::SecretRequest {
            pay_id: PayId([2; 32]),
            hash: Hash32([9; 32]),
        };
        assert_eq!(
            RoutedMessage::signing_payload(&origin, &dest, &a),
            RoutedMessage::signing_payload(&origin, &dest, &b)
        );
    }

    #[test]
    fn test_open_terms_channel_id_matches_derivation() {
        let terms = OpenChannelTerms {
            token: TokenInfo::native(),
            initiator: Address([1; 20]),
            responder: Address([2; 20]),
            initiator_deposit: 10,
            responder_deposit: 10,
            nonce: 3,
            open_deadline: 100,
            ledger: Address([5; 20]),
        };
        assert_eq!(
            terms.channel_id(),
            ChannelId::derive(&Address([2; 20]), &Address([1; 20]), &TokenInfo::native(), 3)
        );
    }
}
