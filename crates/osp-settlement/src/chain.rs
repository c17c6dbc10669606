//! The on-chain side of a channel as the node sees it.

use async_trait::async_trait;
use osp_core::types::{amount_str, hex_bytes};
use osp_core::wire::{OpenChannelTerms, WithdrawTerms};
use osp_core::{
    Address, Amount, BlockNumber, ChannelId, Condition, ConditionalPay, Hash32, OnChainFunds, PayId,
    SignedSimplexState, TokenInfo,
};
use serde::{Deserialize, Serialize};

use crate::error::ChainError;

pub type TxHash = Hash32;

/// Both signatures over agreed open terms, ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelTx {
    pub terms: OpenChannelTerms,
    #[serde(with = "hex_bytes")]
    pub initiator_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub responder_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub initiator_sig: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub responder_sig: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeWithdrawTx {
    pub terms: WithdrawTerms,
    #[serde(with = "hex_bytes")]
    pub requester_sig: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub approver_sig: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    pub channel_id: ChannelId,
    pub receiver: Address,
    #[serde(with = "amount_str")]
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnChainStatus {
    Operable,
    Settling,
    Closed,
}

/// A unilateral withdrawal waiting out its challenge window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawIntent {
    pub receiver: Address,
    #[serde(with = "amount_str")]
    pub amount: Amount,
    pub requested_at: BlockNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    pub token: TokenInfo,
    pub ledger: Address,
    pub participants: [Address; 2],
    pub funds: [OnChainFunds; 2],
    pub status: OnChainStatus,
    pub settle_finalize_block: Option<BlockNumber>,
    pub withdraw_intent: Option<WithdrawIntent>,
    /// Seq of the last cooperative withdraw.
    pub withdraw_seq: u64,
    /// Seq of the latest intended state per simplex, indexed by `peer_from`.
    pub intended_seqs: [Option<u64>; 2],
}

impl ChannelInfo {
    pub fn index_of(&self, who: &Address) -> Option<usize> {
        self.participants.iter().position(|p| p == who)
    }

    pub fn funds_of(&self, who: &Address) -> Option<OnChainFunds> {
        self.index_of(who).map(|i| self.funds[i])
    }

    pub fn intended_seq_from(&self, who: &Address) -> Option<u64> {
        self.index_of(who).and_then(|i| self.intended_seqs[i])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayInfo {
    #[serde(with = "amount_str")]
    pub amount: Amount,
    pub resolved_at: BlockNumber,
}

/// Final balance paid out to one participant when a channel settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub receiver: Address,
    #[serde(with = "amount_str")]
    pub amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx: TxHash,
    pub block: BlockNumber,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainEvent {
    ChannelOpened {
        channel_id: ChannelId,
        token: TokenInfo,
        ledger: Address,
        participants: [Address; 2],
        #[serde(with = "key_pair_hex")]
        keys: [Vec<u8>; 2],
        funds: [OnChainFunds; 2],
    },
    /// `total` is the participant's cumulative deposit after the tx.
    Deposit {
        channel_id: ChannelId,
        participant: Address,
        #[serde(with = "amount_str")]
        total: Amount,
    },
    IntendSettle {
        channel_id: ChannelId,
        submitter: Address,
        seqs: [Option<u64>; 2],
        finalize_block: BlockNumber,
    },
    ConfirmSettle {
        channel_id: ChannelId,
        payouts: Vec<Payout>,
    },
    IntendWithdraw {
        channel_id: ChannelId,
        receiver: Address,
        #[serde(with = "amount_str")]
        amount: Amount,
    },
    ConfirmWithdraw {
        channel_id: ChannelId,
        receiver: Address,
        #[serde(with = "amount_str")]
        total_withdrawn: Amount,
    },
    VetoWithdraw {
        channel_id: ChannelId,
        vetoer: Address,
    },
    CooperativeWithdraw {
        channel_id: ChannelId,
        receiver: Address,
        #[serde(with = "amount_str")]
        total_withdrawn: Amount,
        seq: u64,
    },
    LedgerMigrationIntent {
        channel_id: ChannelId,
        to_ledger: Address,
        deadline: BlockNumber,
    },
    ChannelMigrated {
        channel_id: ChannelId,
        ledger: Address,
    },
    PayResolved {
        pay_id: PayId,
        #[serde(with = "amount_str")]
        amount: Amount,
    },
}

impl ChainEvent {
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            Self::ChannelOpened { channel_id, .. }
            | Self::Deposit { channel_id, .. }
            | Self::IntendSettle { channel_id, .. }
            | Self::ConfirmSettle { channel_id, .. }
            | Self::IntendWithdraw { channel_id, .. }
            | Self::ConfirmWithdraw { channel_id, .. }
            | Self::VetoWithdraw { channel_id, .. }
            | Self::CooperativeWithdraw { channel_id, .. }
            | Self::LedgerMigrationIntent { channel_id, .. }
            | Self::ChannelMigrated { channel_id, .. } => Some(*channel_id),
            Self::PayResolved { .. } => None,
        }
    }
}

/// An event with its position on chain. `index` increases by one per log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLog {
    pub index: u64,
    pub block: BlockNumber,
    pub tx: TxHash,
    pub event: ChainEvent,
}

/// Contract calls and queries a node needs from the ledger chain.
///
/// Submissions return as soon as the transaction is accepted; confirmation
/// is observed through [`LedgerChain::receipt`].
#[async_trait]
pub trait LedgerChain: Send + Sync {
    async fn block_number(&self) -> Result<BlockNumber, ChainError>;

    async fn open_channel(&self, tx: OpenChannelTx) -> Result<TxHash, ChainError>;

    async fn deposit(&self, request: DepositRequest) -> Result<TxHash, ChainError>;

    async fn deposit_in_batch(&self, requests: Vec<DepositRequest>) -> Result<TxHash, ChainError>;

    async fn cooperative_withdraw(&self, tx: CooperativeWithdrawTx) -> Result<TxHash, ChainError>;

    async fn intend_withdraw(
        &self,
        channel_id: ChannelId,
        receiver: Address,
        amount: Amount,
    ) -> Result<TxHash, ChainError>;

    async fn confirm_withdraw(&self, channel_id: ChannelId) -> Result<TxHash, ChainError>;

    async fn veto_withdraw(&self, channel_id: ChannelId, vetoer: Address) -> Result<TxHash, ChainError>;

    /// Submit cosigned simplex states for a unilateral settle, or newer ones
    /// to dispute a pending settle.
    async fn intend_settle(
        &self,
        submitter: Address,
        channel_id: ChannelId,
        states: Vec<SignedSimplexState>,
    ) -> Result<TxHash, ChainError>;

    async fn confirm_settle(&self, channel_id: ChannelId) -> Result<TxHash, ChainError>;

    async fn resolve_payment_by_conditions(
        &self,
        pay: ConditionalPay,
        preimages: Vec<Vec<u8>>,
    ) -> Result<TxHash, ChainError>;

    async fn pay_info(&self, pay_id: PayId) -> Result<Option<PayInfo>, ChainError>;

    /// Outcome of a contract condition as the chain currently reports it.
    async fn query_condition(&self, condition: &Condition) -> Result<bool, ChainError>;

    /// Replay the latest cosigned states onto `to_ledger`.
    async fn migrate_channel(
        &self,
        channel_id: ChannelId,
        to_ledger: Address,
        states: Vec<SignedSimplexState>,
    ) -> Result<TxHash, ChainError>;

    async fn channel_info(&self, channel_id: ChannelId) -> Result<Option<ChannelInfo>, ChainError>;

    /// `None` while the transaction is not visible yet.
    async fn receipt(&self, tx: TxHash) -> Result<Option<Receipt>, ChainError>;

    /// Logs with `index >= from`, oldest first, and the index to ask for next.
    async fn logs_since(&self, from: u64, limit: usize) -> Result<(Vec<ChainLog>, u64), ChainError>;
}

mod key_pair_hex {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(keys: &[Vec<u8>; 2], serializer: S) -> Result<S::Ok, S::Error> {
        [hex::encode(&keys[0]), hex::encode(&keys[1])].serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[Vec<u8>; 2], D::Error> {
        let [a, b] = <[String; 2]>::deserialize(deserializer)?;
        let decode = |s: String| hex::decode(s).map_err(serde::de::Error::custom);
        Ok([decode(a)?, decode(b)?])
    }
}
