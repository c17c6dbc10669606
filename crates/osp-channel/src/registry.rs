//! All live channels of a node, each behind its own serializer.

use dashmap::DashMap;
use osp_core::{Address, Channel, ChannelId, ChannelStatus, TokenInfo};
use osp_crypto::KeyPair;
use osp_store::{Store, StoreBatch, StoreError};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::LedgerError;
use crate::ledger::{ChannelLedger, ChannelSummary};

/// One channel and the two locks that serialize work on it.
///
/// `ledger` is held only while a state is read or mutated. `send_slot` is held
/// for the whole round trip of an outgoing proposal, which keeps proposals on
/// the channel in FIFO order without blocking incoming work.
pub struct ChannelHandle {
    pub channel_id: ChannelId,
    pub peer: Address,
    pub token: TokenInfo,
    ledger: Mutex<ChannelLedger>,
    send_slot: Mutex<()>,
}

impl ChannelHandle {
    fn new(ledger: ChannelLedger) -> Self {
        Self {
            channel_id: ledger.channel_id(),
            peer: ledger.peer(),
            token: ledger.token(),
            ledger: Mutex::new(ledger),
            send_slot: Mutex::new(()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ChannelLedger> {
        self.ledger.lock().await
    }

    /// Wait for our turn to propose on this channel.
    pub async fn send_slot(&self) -> MutexGuard<'_, ()> {
        self.send_slot.lock().await
    }
}

/// Lock two distinct channels in channel-id order, returning the guards in
/// argument order. Forwarders use this to touch both legs of a pay.
pub async fn lock_pair<'a>(
    a: &'a ChannelHandle,
    b: &'a ChannelHandle,
) -> Result<(MutexGuard<'a, ChannelLedger>, MutexGuard<'a, ChannelLedger>), LedgerError> {
    if a.channel_id == b.channel_id {
        return Err(LedgerError::SameChannel(a.channel_id));
    }
    if a.channel_id < b.channel_id {
        let ga = a.lock().await;
        let gb = b.lock().await;
        Ok((ga, gb))
    } else {
        let gb = b.lock().await;
        let ga = a.lock().await;
        Ok((ga, gb))
    }
}

pub struct ChannelRegistry {
    keypair: Arc<KeyPair>,
    store: Arc<dyn Store>,
    channels: DashMap<ChannelId, Arc<ChannelHandle>>,
    by_peer: DashMap<(Address, TokenInfo), ChannelId>,
    summaries: DashMap<ChannelId, ChannelSummary>,
}

impl ChannelRegistry {
    pub fn new(store: Arc<dyn Store>, keypair: Arc<KeyPair>) -> Self {
        Self {
            keypair,
            store,
            channels: DashMap::new(),
            by_peer: DashMap::new(),
            summaries: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Load every channel that is not closed from the store.
    pub fn load(&self) -> Result<usize, LedgerError> {
        let mut loaded = 0;
        for channel in self.store.list_channels()? {
            if channel.status == ChannelStatus::Closed {
                continue;
            }
            self.register(ChannelLedger::new(channel, self.keypair.clone())?);
            loaded += 1;
        }
        tracing::info!(channels = loaded, "loaded channels");
        Ok(loaded)
    }

    /// Persist and register a newly opened channel. An existing channel with
    /// the same id is returned unchanged.
    pub fn insert(&self, channel: Channel) -> Result<Arc<ChannelHandle>, LedgerError> {
        if let Some(existing) = self.get(&channel.channel_id) {
            return Ok(existing);
        }
        let ledger = ChannelLedger::new(channel, self.keypair.clone())?;
        let mut batch = StoreBatch::new();
        batch.put_channel(ledger.channel().clone());
        self.store.write(batch)?;
        tracing::info!(channel = %ledger.channel_id(), peer = %ledger.peer(), "channel registered");
        Ok(self.register(ledger))
    }

    fn register(&self, ledger: ChannelLedger) -> Arc<ChannelHandle> {
        let summary = ledger.summary();
        let handle = Arc::new(ChannelHandle::new(ledger));
        self.by_peer.insert((handle.peer, handle.token), handle.channel_id);
        self.summaries.insert(handle.channel_id, summary);
        self.channels.insert(handle.channel_id, handle.clone());
        handle
    }

    pub fn get(&self, channel_id: &ChannelId) -> Option<Arc<ChannelHandle>> {
        self.channels.get(channel_id).map(|h| h.value().clone())
    }

    pub fn by_peer(&self, peer: &Address, token: &TokenInfo) -> Option<Arc<ChannelHandle>> {
        let id = *self.by_peer.get(&(*peer, *token))?;
        self.get(&id)
    }

    pub fn all(&self) -> Vec<Arc<ChannelHandle>> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }

    pub fn with_peer(&self, peer: &Address) -> Vec<Arc<ChannelHandle>> {
        self.channels
            .iter()
            .filter(|e| &e.value().peer == peer)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn summary(&self, channel_id: &ChannelId) -> Option<ChannelSummary> {
        self.summaries.get(channel_id).map(|s| s.value().clone())
    }

    pub fn summaries(&self) -> Vec<ChannelSummary> {
        self.summaries.iter().map(|e| e.value().clone()).collect()
    }

    /// Update cached views after `ledger` changed; closed channels drop out.
    pub fn refresh(&self, ledger: &ChannelLedger) {
        let id = ledger.channel_id();
        if ledger.channel().status == ChannelStatus::Closed {
            self.summaries.remove(&id);
            self.by_peer.remove_if(&(ledger.peer(), ledger.token()), |_, v| v == &id);
            self.channels.remove(&id);
            tracing::info!(channel = %id, "channel closed");
        } else {
            self.summaries.insert(id, ledger.summary());
        }
    }

    /// Lock the channel, run `f` as one persisted transaction and refresh the
    /// cached summary.
    pub async fn transact<T, E, F>(&self, handle: &ChannelHandle, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut ChannelLedger, &mut StoreBatch) -> Result<T, E>,
        E: From<LedgerError> + From<StoreError>,
    {
        let mut ledger = handle.lock().await;
        self.transact_locked(&mut ledger, f)
    }

    /// Like [`transact`](Self::transact) for a ledger whose lock is already held.
    pub fn transact_locked<T, E, F>(&self, ledger: &mut ChannelLedger, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut ChannelLedger, &mut StoreBatch) -> Result<T, E>,
        E: From<LedgerError> + From<StoreError>,
    {
        let out = ledger.transact(self.store.as_ref(), f);
        self.refresh(ledger);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::pair;
    use crate::ledger::Side;
    use osp_core::{PayId, StateChange};
    use osp_store::MemoryStore;
    use std::time::Duration;

    fn registry() -> (ChannelRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let keypair = Arc::new(KeyPair::from_seed(&[1; 32]));
        (ChannelRegistry::new(store.clone(), keypair), store)
    }

    #[tokio::test]
    async fn test_insert_and_reload() {
        let (reg, store) = registry();
        let (a, _) = pair();
        let handle = reg.insert(a.channel().clone()).unwrap();
        assert!(reg.by_peer(&handle.peer, &handle.token).is_some());

        let reloaded = ChannelRegistry::new(store, Arc::new(KeyPair::from_seed(&[1; 32])));
        assert_eq!(reloaded.load().unwrap(), 1);
        assert_eq!(
            reloaded.summary(&handle.channel_id).unwrap().free_local,
            crate::ledger::tests::DEPOSIT
        );
    }

    #[tokio::test]
    async fn test_transact_refreshes_summary() {
        let (reg, _) = registry();
        let (a, _) = pair();
        let handle = reg.insert(a.channel().clone()).unwrap();
        reg.transact::<_, LedgerError, _>(&handle, |l, _| {
            l.prepare_proposal(
                StateChange::AddPay {
                    pay_id: PayId([1; 32]),
                    amount: 7,
                    resolve_deadline: 5,
                },
                None,
                None,
            )
        })
        .await
        .unwrap();
        let summary = reg.summary(&handle.channel_id).unwrap();
        assert_eq!(summary.free_local, crate::ledger::tests::DEPOSIT - 7);
        assert_eq!(handle.lock().await.free_balance(Side::Local).unwrap(), summary.free_local);
    }

    #[tokio::test]
    async fn test_closed_channel_leaves_registry() {
        let (reg, _) = registry();
        let (a, _) = pair();
        let handle = reg.insert(a.channel().clone()).unwrap();
        reg.transact::<_, LedgerError, _>(&handle, |l, _| {
            l.set_status(ChannelStatus::Closed);
            Ok(())
        })
        .await
        .unwrap();
        assert!(reg.get(&handle.channel_id).is_none());
        assert!(reg.by_peer(&handle.peer, &handle.token).is_none());
    }

    #[tokio::test]
    async fn test_lock_pair_is_order_independent() {
        let (reg, _) = registry();
        let (a, _) = pair();
        let mut second = a.channel().clone();
        second.channel_id = ChannelId([1; 32]);
        let h1 = reg.insert(a.channel().clone()).unwrap();
        let h2 = reg.insert(second).unwrap();

        let (r1, r2) = (h1.clone(), h2.clone());
        let t1 = tokio::spawn(async move {
            for _ in 0..100 {
                let _g = lock_pair(&r1, &r2).await.unwrap();
            }
        });
        let (r1, r2) = (h1.clone(), h2.clone());
        let t2 = tokio::spawn(async move {
            for _ in 0..100 {
                let _g = lock_pair(&r2, &r1).await.unwrap();
            }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            t1.await.unwrap();
            t2.await.unwrap();
        })
        .await
        .expect("lock_pair deadlocked");

        assert!(matches!(lock_pair(&h1, &h1).await, Err(LedgerError::SameChannel(_))));
    }
}
