//! Durable state of an OSP node.
//!
//! Everything a node must remember across restarts lives behind the [`Store`]
//! trait: channel ledgers, pay records (with a creation-ordered history index
//! and an index of pays that still need work), cross-net relay records,
//! migration records, withdraw jobs, hash-lock secrets and small metadata.

pub mod batch;
pub mod error;
pub mod memory;
pub mod rocks;

use osp_core::{
    Address, Channel, ChannelId, CrossNetRecord, Hash32, MigrationRecord, PayId, PayRecord, TokenInfo, WithdrawJob,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use batch::{StoreBatch, WriteOp};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use rocks::RocksStore;

/// Metadata key holding the index of the next chain log to apply.
pub const META_EVENT_CURSOR: &str = "event_cursor";

pub trait Store: Send + Sync {
    fn get_channel(&self, id: &ChannelId) -> Result<Option<Channel>, StoreError>;

    fn list_channels(&self) -> Result<Vec<Channel>, StoreError>;

    /// The live (not closed) channel with `peer` in `token`, if any.
    fn channel_by_peer(&self, peer: &Address, token: &TokenInfo) -> Result<Option<Channel>, StoreError>;

    fn get_pay(&self, id: &PayId) -> Result<Option<PayRecord>, StoreError>;

    /// Pays with at least one non-final leg.
    fn active_pays(&self) -> Result<Vec<PayRecord>, StoreError>;

    fn pay_history(&self, query: &HistoryQuery) -> Result<HistoryPage, StoreError>;

    fn get_cross_net(&self, derived: &PayId) -> Result<Option<CrossNetRecord>, StoreError>;

    fn cross_net_by_original(&self, original: &PayId) -> Result<Option<CrossNetRecord>, StoreError>;

    fn get_migration(&self, channel_id: &ChannelId) -> Result<Option<MigrationRecord>, StoreError>;

    fn list_migrations(&self) -> Result<Vec<MigrationRecord>, StoreError>;

    fn get_withdraw_job(&self, job_id: &Uuid) -> Result<Option<WithdrawJob>, StoreError>;

    fn get_secret(&self, hash: &Hash32) -> Result<Option<Vec<u8>>, StoreError>;

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply every op in `batch` atomically.
    fn write(&self, batch: StoreBatch) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Position in the pay history; pages start strictly after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PayCursor {
    pub created_at_ms: i64,
    pub pay_id: PayId,
}

impl PayCursor {
    pub fn of(record: &PayRecord) -> Self {
        Self {
            created_at_ms: record.created_at.timestamp_millis(),
            pay_id: record.pay_id,
        }
    }

    /// Big-endian key that sorts like the cursor.
    pub fn to_key(&self) -> [u8; 40] {
        let mut key = [0u8; 40];
        key[..8].copy_from_slice(&(self.created_at_ms.max(0) as u64).to_be_bytes());
        key[8..].copy_from_slice(self.pay_id.as_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Result<Self, StoreError> {
        if key.len() != 40 {
            return Err(StoreError::CorruptKey("pay_history"));
        }
        let mut ms = [0u8; 8];
        ms.copy_from_slice(&key[..8]);
        let pay_id = PayId::from_slice(&key[8..]).map_err(|_| StoreError::CorruptKey("pay_history"))?;
        Ok(Self {
            created_at_ms: u64::from_be_bytes(ms) as i64,
            pay_id,
        })
    }
}

impl fmt::Display for PayCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.created_at_ms, self.pay_id)
    }
}

impl FromStr for PayCursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, id) = s.split_once('-').ok_or_else(|| format!("malformed cursor: {}", s))?;
        Ok(Self {
            created_at_ms: ms.parse().map_err(|e| format!("malformed cursor time: {}", e))?,
            pay_id: id.parse().map_err(|e| format!("malformed cursor pay id: {}", e))?,
        })
    }
}

impl Serialize for PayCursor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PayCursor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub cursor: Option<PayCursor>,
    pub order: HistoryOrder,
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            cursor: None,
            order: HistoryOrder::NewestFirst,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub pays: Vec<PayRecord>,
    /// Cursor for the next page; `None` when this page reached the end.
    pub next_cursor: Option<PayCursor>,
}

/// Key of the (peer, token) channel index.
pub(crate) fn peer_key(peer: &Address, token: &TokenInfo) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.extend_from_slice(peer.as_bytes());
    key.extend_from_slice(&token.canonical_bytes());
    key
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_string_roundtrip() {
        let cursor = PayCursor {
            created_at_ms: 1_700_000_000_123,
            pay_id: PayId([7; 32]),
        };
        let parsed: PayCursor = cursor.to_string().parse().unwrap();
        assert_eq!(parsed, cursor);
        assert_eq!(PayCursor::from_key(&cursor.to_key()).unwrap(), cursor);
    }

    #[test]
    fn test_cursor_key_orders_by_time() {
        let early = PayCursor {
            created_at_ms: 10,
            pay_id: PayId([9; 32]),
        };
        let late = PayCursor {
            created_at_ms: 11,
            pay_id: PayId([1; 32]),
        };
        assert!(early.to_key() < late.to_key());
    }
}
