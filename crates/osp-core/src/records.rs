//! Durable records: channels, pays, cross-net relays, migrations and withdraw jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::pay::ConditionalPay;
use crate::simplex::{PendingPays, SignedSimplexState, SimplexState, StateChange};
use crate::state_machine::PayState;
use crate::types::{amount_str, hex_bytes, Address, Amount, BlockNumber, ChannelId, Hash32, NetId, PayId, TokenInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Opened,
    /// A unilateral settle was intended on chain; no new pays.
    Settling,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened => write!(f, "opened"),
            Self::Settling => write!(f, "settling"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// On-chain funds of one participant, as last observed on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OnChainFunds {
    #[serde(with = "amount_str")]
    pub deposit: Amount,
    #[serde(with = "amount_str")]
    pub withdrawn: Amount,
}

/// Balance set aside for a withdrawal that is not confirmed on chain yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawReservation {
    #[serde(with = "amount_str")]
    pub amount: Amount,
    pub seq: u64,
    /// Reservation lapses after this block if nothing landed on chain.
    pub deadline: BlockNumber,
}

/// A committed simplex together with the lock table behind its pending ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplexEntry {
    pub signed: SignedSimplexState,
    pub pending_pays: PendingPays,
}

impl SimplexEntry {
    pub fn new(channel_id: ChannelId, peer_from: Address) -> Self {
        Self {
            signed: SignedSimplexState::unsigned(SimplexState::initial(channel_id, peer_from)),
            pending_pays: PendingPays::new(),
        }
    }

    pub fn state(&self) -> &SimplexState {
        &self.signed.state
    }

    pub fn seq_num(&self) -> u64 {
        self.signed.state.seq_num
    }
}

/// Our signed proposal on the outgoing simplex awaiting the peer's countersignature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingProposal {
    pub state: SimplexState,
    pub change: StateChange,
    #[serde(with = "hex_bytes")]
    pub sig: Vec<u8>,
    /// The pay being added, so the proposal can be re-sent after a restart.
    pub pay: Option<ConditionalPay>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An incoming leg committed at `seq` whose mutual commit is not proven yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedLeg {
    pub pay_id: PayId,
    pub seq: u64,
    #[serde(default = "Utc::now")]
    pub since: DateTime<Utc>,
}

/// Local view of a two-party channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub token: TokenInfo,
    pub status: ChannelStatus,
    pub local: Address,
    pub peer: Address,
    #[serde(with = "hex_bytes")]
    pub peer_key: Vec<u8>,
    /// Ledger contract currently governing the channel.
    pub ledger: Address,
    pub local_funds: OnChainFunds,
    pub peer_funds: OnChainFunds,
    pub local_withdraw: Option<WithdrawReservation>,
    pub peer_withdraw: Option<WithdrawReservation>,
    /// Sequence of the last cooperative withdraw either side signed.
    pub withdraw_seq: u64,
    /// Simplex from us to the peer.
    pub outgoing: SimplexEntry,
    /// Simplex from the peer to us.
    pub incoming: SimplexEntry,
    pub pending_proposal: Option<PendingProposal>,
    pub unconfirmed: Vec<UnconfirmedLeg>,
    pub settle_finalize_block: Option<BlockNumber>,
    /// Set when an invariant violation stopped the channel.
    pub halted: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(
        channel_id: ChannelId,
        token: TokenInfo,
        local: Address,
        peer: Address,
        peer_key: Vec<u8>,
        ledger: Address,
    ) -> Self {
        Self {
            channel_id,
            token,
            status: ChannelStatus::Opened,
            local,
            peer,
            peer_key,
            ledger,
            local_funds: OnChainFunds::default(),
            peer_funds: OnChainFunds::default(),
            local_withdraw: None,
            peer_withdraw: None,
            withdraw_seq: 0,
            outgoing: SimplexEntry::new(channel_id, local),
            incoming: SimplexEntry::new(channel_id, peer),
            pending_proposal: None,
            unconfirmed: Vec::new(),
            settle_finalize_block: None,
            halted: None,
            opened_at: Utc::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ChannelStatus::Opened && self.halted.is_none()
    }
}

/// Why a pay leg was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Expired,
    Unreachable,
    InsufficientBalance,
    Rejected,
    PeerRefused,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "expired"),
            Self::Unreachable => write!(f, "destination unreachable"),
            Self::InsufficientBalance => write!(f, "insufficient balance"),
            Self::Rejected => write!(f, "rejected by destination"),
            Self::PeerRefused => write!(f, "refused by peer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmDecision {
    Confirmed,
    Rejected,
}

/// One channel's side of a pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayLeg {
    pub channel_id: ChannelId,
    pub peer: Address,
    pub state: PayState,
    /// Seq of the simplex state that added the pay.
    pub commit_seq: u64,
    #[serde(with = "amount_str::option", default)]
    pub settled_amount: Option<Amount>,
}

impl PayLeg {
    pub fn new(channel_id: ChannelId, peer: Address) -> Self {
        Self {
            channel_id,
            peer,
            state: PayState::Null,
            commit_seq: 0,
            settled_amount: None,
        }
    }
}

/// Durable per-pay record on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayRecord {
    pub pay_id: PayId,
    pub pay: ConditionalPay,
    /// Leg on which we receive the pay (we are payee).
    pub incoming: Option<PayLeg>,
    /// Leg on which we send the pay (we are payer).
    pub outgoing: Option<PayLeg>,
    pub direct: bool,
    pub decision: Option<ConfirmDecision>,
    pub cancel_reason: Option<CancelReason>,
    /// Amount we asked our payer to settle, once a settle proof was sent.
    #[serde(with = "amount_str::option", default)]
    pub settle_requested: Option<Amount>,
    #[serde(with = "amount_str::option", default)]
    pub onchain_resolved: Option<Amount>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PayRecord {
    pub fn new(pay: ConditionalPay) -> Self {
        let now = Utc::now();
        Self {
            pay_id: pay.pay_id(),
            pay,
            incoming: None,
            outgoing: None,
            direct: false,
            decision: None,
            cancel_reason: None,
            settle_requested: None,
            onchain_resolved: None,
            note: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// State reported to clients: the outgoing leg for senders and forwarders,
    /// the incoming leg for the destination.
    pub fn state(&self) -> PayState {
        self.outgoing
            .as_ref()
            .or(self.incoming.as_ref())
            .map(|leg| leg.state)
            .unwrap_or(PayState::Null)
    }

    /// True once every leg this node holds is final.
    pub fn is_final(&self) -> bool {
        let legs = [self.incoming.as_ref(), self.outgoing.as_ref()];
        legs.iter().flatten().all(|leg| leg.state.is_final()) && legs.iter().any(|l| l.is_some())
    }

    pub fn leg_on(&self, channel_id: &ChannelId) -> Option<&PayLeg> {
        [self.outgoing.as_ref(), self.incoming.as_ref()]
            .into_iter()
            .flatten()
            .find(|leg| &leg.channel_id == channel_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayDirection {
    /// The pay entered this sub-network here and was re-issued under a local id.
    Ingress,
    /// The pay left this sub-network here toward a bridge peer.
    Egress,
}

/// Correlates a pay across two sub-networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossNetRecord {
    pub original_pay_id: PayId,
    pub derived_pay_id: PayId,
    pub direction: RelayDirection,
    pub src_net: NetId,
    pub dest_net: NetId,
    pub finalized: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Intent seen on chain; waiting for the replay onto the new ledger.
    Pending,
    /// Replay submitted; waiting for the operator update event.
    Replayed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub channel_id: ChannelId,
    pub from_ledger: Address,
    pub to_ledger: Address,
    pub state: MigrationState,
    /// Pays resolving at or after this block are refused on the channel.
    pub deadline: BlockNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawJobStatus {
    Pending,
    Submitted,
    Succeeded,
    Failed,
}

impl WithdrawJobStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A cooperative withdraw running in the background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawJob {
    pub job_id: Uuid,
    pub channel_id: ChannelId,
    #[serde(with = "amount_str")]
    pub amount: Amount,
    pub receiver: Address,
    pub status: WithdrawJobStatus,
    pub tx: Option<Hash32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawJob {
    pub fn new(channel_id: ChannelId, amount: Amount, receiver: Address) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::now_v7(),
            channel_id,
            amount,
            receiver,
            status: WithdrawJobStatus::Pending,
            tx: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
