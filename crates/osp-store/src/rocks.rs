//! RocksDB storage backend.

use osp_core::{
    Address, Channel, ChannelId, ChannelStatus, CrossNetRecord, Hash32, MigrationRecord, PayId, PayRecord, TokenInfo,
    WithdrawJob,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

use crate::{peer_key, HistoryOrder, HistoryPage, HistoryQuery, PayCursor, Store, StoreBatch, StoreError, WriteOp};

/// Column family names for different record kinds.
const CF_CHANNELS: &str = "channels";
const CF_CHANNEL_PEERS: &str = "channel_peers";
const CF_PAYS: &str = "pays";
const CF_PAY_HISTORY: &str = "pay_history";
const CF_ACTIVE_PAYS: &str = "active_pays";
const CF_CROSS_NET: &str = "cross_net";
const CF_CROSS_NET_ORIG: &str = "cross_net_orig";
const CF_MIGRATIONS: &str = "migrations";
const CF_WITHDRAW_JOBS: &str = "withdraw_jobs";
const CF_SECRETS: &str = "secrets";
const CF_META: &str = "meta";

const ALL_CFS: [&str; 11] = [
    CF_CHANNELS,
    CF_CHANNEL_PEERS,
    CF_PAYS,
    CF_PAY_HISTORY,
    CF_ACTIVE_PAYS,
    CF_CROSS_NET,
    CF_CROSS_NET_ORIG,
    CF_MIGRATIONS,
    CF_WITHDRAW_JOBS,
    CF_SECRETS,
    CF_META,
];

/// RocksDB-backed [`Store`]. Values are JSON, keys are raw ids.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path with column families.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;
        tracing::debug!(path = %path.display(), "rocksdb store opened");

        Ok(Self { db })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StoreError> {
        self.db.cf_handle(name).ok_or(StoreError::MissingColumnFamily(name))
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &'static str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, cf_name: &'static str) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn put_json<T: Serialize>(
        &self,
        wb: &mut WriteBatch,
        cf_name: &'static str,
        key: &[u8],
        value: &T,
    ) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        wb.put_cf(&cf, key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn history_cursors(&self, query: &HistoryQuery) -> Result<Vec<PayCursor>, StoreError> {
        let cf = self.cf(CF_PAY_HISTORY)?;
        let start_key = query.cursor.map(|c| c.to_key());
        let mode = match (query.order, start_key.as_ref()) {
            (HistoryOrder::NewestFirst, Some(k)) => IteratorMode::From(k.as_slice(), Direction::Reverse),
            (HistoryOrder::NewestFirst, None) => IteratorMode::End,
            (HistoryOrder::OldestFirst, Some(k)) => IteratorMode::From(k.as_slice(), Direction::Forward),
            (HistoryOrder::OldestFirst, None) => IteratorMode::Start,
        };

        let take = query.limit.saturating_add(1);
        let mut cursors = Vec::with_capacity(take);
        for item in self.db.iterator_cf(&cf, mode) {
            let (key, _) = item?;
            // Seeking lands on the cursor itself when it exists; pages start after it.
            if start_key.as_ref().map(|k| k.as_slice() == &key[..]).unwrap_or(false) {
                continue;
            }
            cursors.push(PayCursor::from_key(&key)?);
            if cursors.len() >= take {
                break;
            }
        }
        Ok(cursors)
    }
}

impl Store for RocksStore {
    fn get_channel(&self, id: &ChannelId) -> Result<Option<Channel>, StoreError> {
        self.get_json(CF_CHANNELS, id.as_bytes())
    }

    fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        self.scan_json(CF_CHANNELS)
    }

    fn channel_by_peer(&self, peer: &Address, token: &TokenInfo) -> Result<Option<Channel>, StoreError> {
        let cf = self.cf(CF_CHANNEL_PEERS)?;
        match self.db.get_cf(&cf, peer_key(peer, token))? {
            Some(id) => {
                let id = ChannelId::from_slice(&id).map_err(|_| StoreError::CorruptKey(CF_CHANNEL_PEERS))?;
                self.get_channel(&id)
            }
            None => Ok(None),
        }
    }

    fn get_pay(&self, id: &PayId) -> Result<Option<PayRecord>, StoreError> {
        self.get_json(CF_PAYS, id.as_bytes())
    }

    fn active_pays(&self) -> Result<Vec<PayRecord>, StoreError> {
        let cf = self.cf(CF_ACTIVE_PAYS)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = PayId::from_slice(&key).map_err(|_| StoreError::CorruptKey(CF_ACTIVE_PAYS))?;
            if let Some(record) = self.get_pay(&id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn pay_history(&self, query: &HistoryQuery) -> Result<HistoryPage, StoreError> {
        let cursors = self.history_cursors(query)?;
        let has_more = cursors.len() > query.limit;
        let mut pays = Vec::with_capacity(query.limit.min(cursors.len()));
        for cursor in cursors.iter().take(query.limit) {
            if let Some(record) = self.get_pay(&cursor.pay_id)? {
                pays.push(record);
            }
        }
        let next_cursor = if has_more { pays.last().map(PayCursor::of) } else { None };
        Ok(HistoryPage { pays, next_cursor })
    }

    fn get_cross_net(&self, derived: &PayId) -> Result<Option<CrossNetRecord>, StoreError> {
        self.get_json(CF_CROSS_NET, derived.as_bytes())
    }

    fn cross_net_by_original(&self, original: &PayId) -> Result<Option<CrossNetRecord>, StoreError> {
        let cf = self.cf(CF_CROSS_NET_ORIG)?;
        match self.db.get_cf(&cf, original.as_bytes())? {
            Some(derived) => self.get_json(CF_CROSS_NET, &derived),
            None => Ok(None),
        }
    }

    fn get_migration(&self, channel_id: &ChannelId) -> Result<Option<MigrationRecord>, StoreError> {
        self.get_json(CF_MIGRATIONS, channel_id.as_bytes())
    }

    fn list_migrations(&self) -> Result<Vec<MigrationRecord>, StoreError> {
        self.scan_json(CF_MIGRATIONS)
    }

    fn get_withdraw_job(&self, job_id: &Uuid) -> Result<Option<WithdrawJob>, StoreError> {
        self.get_json(CF_WITHDRAW_JOBS, job_id.as_bytes())
    }

    fn get_secret(&self, hash: &Hash32) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SECRETS)?;
        Ok(self.db.get_cf(&cf, hash.as_bytes())?)
    }

    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?)
    }

    fn write(&self, batch: StoreBatch) -> Result<(), StoreError> {
        let mut wb = WriteBatch::default();
        for op in batch.into_ops() {
            match op {
                WriteOp::PutChannel(channel) => {
                    let index = self.cf(CF_CHANNEL_PEERS)?;
                    let key = peer_key(&channel.peer, &channel.token);
                    if channel.status == ChannelStatus::Closed {
                        let current = self.db.get_cf(&index, &key)?;
                        if current.as_deref() == Some(channel.channel_id.as_bytes().as_slice()) {
                            wb.delete_cf(&index, &key);
                        }
                    } else {
                        wb.put_cf(&index, &key, channel.channel_id.as_bytes());
                    }
                    self.put_json(&mut wb, CF_CHANNELS, channel.channel_id.as_bytes(), &*channel)?;
                }
                WriteOp::PutPay(record) => {
                    let history = self.cf(CF_PAY_HISTORY)?;
                    wb.put_cf(&history, PayCursor::of(&record).to_key(), b"");
                    let active = self.cf(CF_ACTIVE_PAYS)?;
                    if record.is_final() {
                        wb.delete_cf(&active, record.pay_id.as_bytes());
                    } else {
                        wb.put_cf(&active, record.pay_id.as_bytes(), b"");
                    }
                    self.put_json(&mut wb, CF_PAYS, record.pay_id.as_bytes(), &*record)?;
                }
                WriteOp::PutCrossNet(record) => {
                    let orig = self.cf(CF_CROSS_NET_ORIG)?;
                    wb.put_cf(&orig, record.original_pay_id.as_bytes(), record.derived_pay_id.as_bytes());
                    self.put_json(&mut wb, CF_CROSS_NET, record.derived_pay_id.as_bytes(), &record)?;
                }
                WriteOp::PutMigration(record) => {
                    self.put_json(&mut wb, CF_MIGRATIONS, record.channel_id.as_bytes(), &record)?;
                }
                WriteOp::DeleteMigration(channel_id) => {
                    let cf = self.cf(CF_MIGRATIONS)?;
                    wb.delete_cf(&cf, channel_id.as_bytes());
                }
                WriteOp::PutWithdrawJob(job) => {
                    self.put_json(&mut wb, CF_WITHDRAW_JOBS, job.job_id.as_bytes(), &job)?;
                }
                WriteOp::PutSecret { hash, preimage } => {
                    let cf = self.cf(CF_SECRETS)?;
                    wb.put_cf(&cf, hash.as_bytes(), preimage);
                }
                WriteOp::PutMeta { key, value } => {
                    let cf = self.cf(CF_META)?;
                    wb.put_cf(&cf, key.as_bytes(), value);
                }
            }
        }
        self.db.write(wb)?;
        Ok(())
    }
}
