use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{amount_str, hex_bytes, Address, Amount, BlockNumber, Hash32, NetId, PayId, TokenInfo};

/// A condition guarding a conditional pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Satisfied by revealing a preimage whose BLAKE3 hash equals `hash`.
    HashLock { hash: Hash32 },
    /// Outcome queried from a contract already deployed on chain.
    DeployedContract {
        address: Address,
        #[serde(with = "hex_bytes")]
        args: Vec<u8>,
    },
    /// Outcome queried from a contract that is only deployed on dispute.
    VirtualContract {
        virtual_address: Hash32,
        #[serde(with = "hex_bytes")]
        args: Vec<u8>,
    },
}

impl Condition {
    /// Contract conditions need an explicit confirm or reject at the destination.
    pub fn is_contract(&self) -> bool {
        !matches!(self, Self::HashLock { .. })
    }

    fn write_canonical(&self, out: &mut Vec<u8>) {
        match self {
            Self::HashLock { hash } => {
                out.push(1);
                out.extend_from_slice(hash.as_bytes());
            }
            Self::DeployedContract { address, args } => {
                out.push(2);
                out.extend_from_slice(address.as_bytes());
                out.extend_from_slice(&(args.len() as u32).to_be_bytes());
                out.extend_from_slice(args);
            }
            Self::VirtualContract {
                virtual_address,
                args,
            } => {
                out.push(3);
                out.extend_from_slice(virtual_address.as_bytes());
                out.extend_from_slice(&(args.len() as u32).to_be_bytes());
                out.extend_from_slice(args);
            }
        }
    }
}

/// How condition outcomes combine into the transferred amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferLogic {
    #[default]
    BooleanAnd,
    BooleanOr,
}

impl TransferLogic {
    /// Combine per-condition outcomes. No conditions means the pay is unconditional.
    pub fn combine(&self, outcomes: &[bool]) -> bool {
        if outcomes.is_empty() {
            return true;
        }
        match self {
            Self::BooleanAnd => outcomes.iter().all(|o| *o),
            Self::BooleanOr => outcomes.iter().any(|o| *o),
        }
    }
}

/// An immutable payment descriptor. Its id is the hash of its canonical encoding,
/// so every hop refers to the same pay by the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalPay {
    /// Source-chosen nonce that makes otherwise identical pays distinct.
    pub pay_timestamp: u64,
    pub src: Address,
    pub dest: Address,
    pub token: TokenInfo,
    #[serde(with = "amount_str")]
    pub amount: Amount,
    pub conditions: Vec<Condition>,
    pub logic: TransferLogic,
    /// Last block at which the pay may be resolved.
    pub resolve_deadline: BlockNumber,
    /// Contract that arbitrates the pay on chain.
    pub pay_resolver: Address,
    pub src_net: NetId,
    pub dest_net: NetId,
}

impl ConditionalPay {
    /// Canonical big-endian encoding of every field, hashed into the pay id.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(160);
        out.extend_from_slice(&self.pay_timestamp.to_be_bytes());
        out.extend_from_slice(self.src.as_bytes());
        out.extend_from_slice(self.dest.as_bytes());
        out.extend_from_slice(&self.token.canonical_bytes());
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&(self.conditions.len() as u32).to_be_bytes());
        for condition in &self.conditions {
            condition.write_canonical(&mut out);
        }
        out.push(match self.logic {
            TransferLogic::BooleanAnd => 0,
            TransferLogic::BooleanOr => 1,
        });
        out.extend_from_slice(&self.resolve_deadline.to_be_bytes());
        out.extend_from_slice(self.pay_resolver.as_bytes());
        out.extend_from_slice(&self.src_net.to_be_bytes());
        out.extend_from_slice(&self.dest_net.to_be_bytes());
        out
    }

    pub fn pay_id(&self) -> PayId {
        PayId(*blake3::hash(&self.canonical_bytes()).as_bytes())
    }

    pub fn is_unconditional(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether the destination must confirm or reject before the pay resolves.
    pub fn needs_confirmation(&self) -> bool {
        self.conditions.iter().any(Condition::is_contract)
    }

    pub fn hash_locks(&self) -> impl Iterator<Item = &Hash32> {
        self.conditions.iter().filter_map(|c| match c {
            Condition::HashLock { hash } => Some(hash),
            _ => None,
        })
    }

    /// Amount owed given per-condition outcomes, aligned with `conditions`.
    pub fn resolved_amount(&self, outcomes: &[bool]) -> Amount {
        if self.logic.combine(outcomes) {
            self.amount
        } else {
            0
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.amount == 0 {
            return Err(CoreError::InvalidAmount("pay amount must be positive".into()));
        }
        if self.src == self.dest && self.src_net == self.dest_net {
            return Err(CoreError::ValidationError("pay source equals destination".into()));
        }
        if self.resolve_deadline == 0 {
            return Err(CoreError::ValidationError("resolve deadline must be set".into()));
        }
        Ok(())
    }
}

/// Builder for [`ConditionalPay`].
#[derive(Debug, Clone)]
pub struct PayBuilder {
    pay: ConditionalPay,
}

impl PayBuilder {
    pub fn new(src: Address, dest: Address, token: TokenInfo, amount: Amount) -> Self {
        Self {
            pay: ConditionalPay {
                pay_timestamp: 0,
                src,
                dest,
                token,
                amount,
                conditions: Vec::new(),
                logic: TransferLogic::BooleanAnd,
                resolve_deadline: 0,
                pay_resolver: Address::default(),
                src_net: 0,
                dest_net: 0,
            },
        }
    }

    pub fn timestamp(mut self, ts: u64) -> Self {
        self.pay.pay_timestamp = ts;
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.pay.conditions.push(condition);
        self
    }

    pub fn conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.pay.conditions.extend(conditions);
        self
    }

    pub fn logic(mut self, logic: TransferLogic) -> Self {
        self.pay.logic = logic;
        self
    }

    pub fn resolve_deadline(mut self, block: BlockNumber) -> Self {
        self.pay.resolve_deadline = block;
        self
    }

    pub fn resolver(mut self, resolver: Address) -> Self {
        self.pay.pay_resolver = resolver;
        self
    }

    pub fn nets(mut self, src_net: NetId, dest_net: NetId) -> Self {
        self.pay.src_net = src_net;
        self.pay.dest_net = dest_net;
        self
    }

    pub fn build(self) -> Result<ConditionalPay, CoreError> {
        self.pay.validate()?;
        Ok(self.pay)
    }
}
