//! In-memory store for tests and ephemeral devnet nodes.

use osp_core::{
    Address, Channel, ChannelId, ChannelStatus, CrossNetRecord, Hash32, MigrationRecord, PayId, PayRecord, TokenInfo,
    WithdrawJob,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::RwLock;
use uuid::Uuid;

use crate::{HistoryOrder, HistoryPage, HistoryQuery, PayCursor, Store, StoreBatch, StoreError, WriteOp};

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelId, Channel>,
    channel_peers: HashMap<(Address, TokenInfo), ChannelId>,
    pays: HashMap<PayId, PayRecord>,
    history: BTreeSet<PayCursor>,
    active: HashSet<PayId>,
    cross_net: HashMap<PayId, CrossNetRecord>,
    cross_net_orig: HashMap<PayId, PayId>,
    migrations: HashMap<ChannelId, MigrationRecord>,
    jobs: HashMap<Uuid, WithdrawJob>,
    secrets: HashMap<Hash32, Vec<u8>>,
    meta: HashMap<String, Vec<u8>>,
}

/// A [`Store`] kept entirely in memory. A batch is applied under one write lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T, StoreError> {
        let guard = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&guard))
    }
}

impl Store for MemoryStore {
    fn get_channel(&self, id: &ChannelId) -> Result<Option<Channel>, StoreError> {
        self.read(|s| s.channels.get(id).cloned())
    }

    fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        self.read(|s| s.channels.values().cloned().collect())
    }

    fn channel_by_peer(&self, peer: &Address, token: &TokenInfo) -> Result<Option<Channel>, StoreError> {
        self.read(|s| {
            s.channel_peers
                .get(&(*peer, *token))
                .and_then(|id| s.channels.get(id))
                .cloned()
        })
    }

    fn get_pay(&self, id: &PayId) -> Result<Option<PayRecord>, StoreError> {
        self.read(|s| s.pays.get(id).cloned())
    }

    fn active_pays(&self) -> Result<Vec<PayRecord>, StoreError> {
        self.read(|s| s.active.iter().filter_map(|id| s.pays.get(id)).cloned().collect())
    }

    fn pay_history(&self, query: &HistoryQuery) -> Result<HistoryPage, StoreError> {
        self.read(|s| {
            let take = query.limit.saturating_add(1);
            let cursors: Vec<PayCursor> = match (query.order, query.cursor) {
                (HistoryOrder::NewestFirst, Some(c)) => s.history.range(..c).rev().take(take).copied().collect(),
                (HistoryOrder::NewestFirst, None) => s.history.iter().rev().take(take).copied().collect(),
                (HistoryOrder::OldestFirst, Some(c)) => s
                    .history
                    .range((Bound::Excluded(c), Bound::Unbounded))
                    .take(take)
                    .copied()
                    .collect(),
                (HistoryOrder::OldestFirst, None) => s.history.iter().take(take).copied().collect(),
            };
            let has_more = cursors.len() > query.limit;
            let pays: Vec<PayRecord> = cursors
                .iter()
                .take(query.limit)
                .filter_map(|c| s.pays.get(&c.pay_id))
                .cloned()
                .collect();
            let next_cursor = if has_more { pays.last().map(PayCursor::of) } else { None };
            HistoryPage { pays, next_cursor }
        })
    }

    fn get_cross_net(&self, derived: &PayId) -> Result<Option<CrossNetRecord>, StoreError> {
        self.read(|s| s.cross_net.get(derived).cloned())
    }

    fn cross_net_by_original(&self, original: &PayId) -> Result<Option<CrossNetRecord>, StoreError> {
        self.read(|s| {
            s.cross_net_orig
                .get(original)
                .and_then(|derived| s.cross_net.get(derived))
                .cloned()
        })
    }

    fn get_migration(&self, channel_id: &ChannelId) -> Result<Option<MigrationRecord>, StoreError> {
        self.read(|s| s.migrations.get(channel_id).cloned())
    }

    fn list_migrations(&self) -> Result<Vec<MigrationRecord>, StoreError> {
        self.read(|s| s.migrations.values().cloned().collect())
    }

    fn get_withdraw_job(&self, job_id: &Uuid) -> Result<Option<WithdrawJob>, StoreError> {
        self.read(|s| s.jobs.get(job_id).cloned())
    }

    fn get_secret(&self, hash: &Hash32) -> Result<Option<Vec<u8>>, StoreError> {
        self.read(|s| s.secrets.get(hash).cloned())
    }

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.read(|s| s.meta.get(key).cloned())
    }

    fn write(&self, batch: StoreBatch) -> Result<(), StoreError> {
        let mut s = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        for op in batch.into_ops() {
            match op {
                WriteOp::PutChannel(channel) => {
                    let key = (channel.peer, channel.token);
                    if channel.status == ChannelStatus::Closed {
                        if s.channel_peers.get(&key) == Some(&channel.channel_id) {
                            s.channel_peers.remove(&key);
                        }
                    } else {
                        s.channel_peers.insert(key, channel.channel_id);
                    }
                    s.channels.insert(channel.channel_id, *channel);
                }
                WriteOp::PutPay(record) => {
                    s.history.insert(PayCursor::of(&record));
                    if record.is_final() {
                        s.active.remove(&record.pay_id);
                    } else {
                        s.active.insert(record.pay_id);
                    }
                    s.pays.insert(record.pay_id, *record);
                }
                WriteOp::PutCrossNet(record) => {
                    s.cross_net_orig.insert(record.original_pay_id, record.derived_pay_id);
                    s.cross_net.insert(record.derived_pay_id, record);
                }
                WriteOp::PutMigration(record) => {
                    s.migrations.insert(record.channel_id, record);
                }
                WriteOp::DeleteMigration(channel_id) => {
                    s.migrations.remove(&channel_id);
                }
                WriteOp::PutWithdrawJob(job) => {
                    s.jobs.insert(job.job_id, job);
                }
                WriteOp::PutSecret { hash, preimage } => {
                    s.secrets.insert(hash, preimage);
                }
                WriteOp::PutMeta { key, value } => {
                    s.meta.insert(key, value);
                }
            }
        }
        Ok(())
    }
}
