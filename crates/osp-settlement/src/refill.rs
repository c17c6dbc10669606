//! Batched top-ups of channels running low on local balance.

use dashmap::DashMap;
use osp_channel::ChannelSummary;
use osp_core::types::amount_str;
use osp_core::{Amount, ChannelId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::chain::DepositRequest;
use crate::error::ReconcileError;
use crate::reconcile::ReconciliationEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefillConfig {
    pub enabled: bool,
    /// Channels whose free local balance drops below this are topped up.
    #[serde(with = "amount_str")]
    pub threshold: Amount,
    #[serde(with = "amount_str")]
    pub amount: Amount,
    /// Longest a queued channel waits for a batch to fill.
    pub max_wait_ms: u64,
    pub min_batch: usize,
    pub max_batch: usize,
}

impl Default for RefillConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0,
            amount: 0,
            max_wait_ms: 60_000,
            min_batch: 4,
            max_batch: 32,
        }
    }
}

pub struct RefillController {
    engine: Arc<ReconciliationEngine>,
    config: RefillConfig,
    queued: DashMap<ChannelId, Instant>,
}

impl RefillController {
    pub fn new(engine: Arc<ReconciliationEngine>, config: RefillConfig) -> Self {
        Self {
            engine,
            config,
            queued: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RefillConfig {
        &self.config
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Queue the channel if it fell below the threshold. Returns whether it is queued.
    pub fn observe(&self, summary: &ChannelSummary) -> bool {
        if !self.config.enabled || summary.halted.is_some() {
            return false;
        }
        if summary.free_local >= self.config.threshold {
            return false;
        }
        self.queued.entry(summary.channel_id).or_insert_with(|| {
            tracing::debug!(channel = %summary.channel_id, free = %summary.free_local, "queued for refill");
            Instant::now()
        });
        true
    }

    /// Deposit for a batch of queued channels once enough are queued or the
    /// oldest has waited long enough. Returns the number of channels funded.
    pub async fn tick(&self) -> Result<usize, ReconcileError> {
        if self.queued.is_empty() {
            return Ok(0);
        }
        let max_wait = Duration::from_millis(self.config.max_wait_ms);
        let mut waiting: Vec<(ChannelId, Instant)> = self.queued.iter().map(|e| (*e.key(), *e.value())).collect();
        waiting.sort_by_key(|(_, at)| *at);
        let overdue = waiting.first().is_some_and(|(_, at)| at.elapsed() >= max_wait);
        if waiting.len() < self.config.min_batch.max(1) && !overdue {
            return Ok(0);
        }

        let batch: Vec<ChannelId> = waiting
            .into_iter()
            .take(self.config.max_batch.max(1))
            .map(|(id, _)| id)
            .collect();
        let requests: Vec<DepositRequest> = batch
            .iter()
            .filter(|id| self.engine.registry().get(id).is_some())
            .map(|id| DepositRequest {
                channel_id: *id,
                receiver: self.engine.local_address(),
                amount: self.config.amount,
            })
            .collect();
        for id in &batch {
            self.queued.remove(id);
        }
        if requests.is_empty() {
            return Ok(0);
        }

        let funded = requests.len();
        tracing::info!(channels = funded, amount = %self.config.amount, "refilling channels");
        if let Err(e) = self.engine.deposit_in_batch(requests.clone()).await {
            // Requeue so the next tick retries.
            for r in &requests {
                self.queued.entry(r.channel_id).or_insert_with(Instant::now);
            }
            return Err(e);
        }
        Ok(funded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::tests::{two_sides, DEPOSIT};
    use crate::simulated::{SimulatedChain, SimulatedChainConfig};
    use osp_core::TokenInfo;

    fn config(min_batch: usize, max_wait_ms: u64) -> RefillConfig {
        RefillConfig {
            enabled: true,
            threshold: DEPOSIT + 1,
            amount: 500,
            max_wait_ms,
            min_batch,
            max_batch: 8,
        }
    }

    #[tokio::test]
    async fn test_batches_after_min_batch() {
        let chain = std::sync::Arc::new(SimulatedChain::new(SimulatedChainConfig::default()));
        let (a, b) = two_sides(&chain);
        let cid = a
            .engine
            .open_channel(b.keypair.address(), TokenInfo::native(), DEPOSIT, DEPOSIT)
            .await
            .unwrap();

        let refill = RefillController::new(a.engine.clone(), config(2, 60_000));
        assert!(refill.observe(&a.engine.registry().summary(&cid).unwrap()));
        // One channel is below the minimum batch and not overdue yet.
        assert_eq!(refill.tick().await.unwrap(), 0);
        assert_eq!(refill.queued(), 1);

        let overdue = RefillController::new(a.engine.clone(), config(2, 0));
        overdue.observe(&a.engine.registry().summary(&cid).unwrap());
        assert_eq!(overdue.tick().await.unwrap(), 1);
        assert_eq!(overdue.queued(), 0);
        assert_eq!(a.engine.registry().summary(&cid).unwrap().free_local, DEPOSIT + 500);
    }

    #[tokio::test]
    async fn test_disabled_or_healthy_channels_are_ignored() {
        let chain = std::sync::Arc::new(SimulatedChain::new(SimulatedChainConfig::default()));
        let (a, b) = two_sides(&chain);
        let cid = a
            .engine
            .open_channel(b.keypair.address(), TokenInfo::native(), DEPOSIT, DEPOSIT)
            .await
            .unwrap();
        let summary = a.engine.registry().summary(&cid).unwrap();

        let disabled = RefillController::new(
            a.engine.clone(),
            RefillConfig {
                enabled: false,
                ..config(1, 0)
            },
        );
        assert!(!disabled.observe(&summary));

        let healthy = RefillController::new(
            a.engine.clone(),
            RefillConfig {
                threshold: 10,
                ..config(1, 0)
            },
        );
        assert!(!healthy.observe(&summary));
        assert_eq!(healthy.tick().await.unwrap(), 0);
    }
}
