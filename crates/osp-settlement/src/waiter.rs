//! Waiting for submitted transactions to land.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::chain::{LedgerChain, Receipt, TxHash};
use crate::error::ChainError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Blocks to wait on top of the receipt block before a tx counts as final.
    pub block_delay: u64,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            block_delay: 2,
            poll_interval_ms: 500,
            timeout_ms: 120_000,
            backoff_initial_ms: 200,
            backoff_max_ms: 5_000,
        }
    }
}

impl WaitConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Polls receipts until a transaction is final or provably failed.
#[derive(Clone)]
pub struct TxWaiter {
    chain: Arc<dyn LedgerChain>,
    config: WaitConfig,
}

impl TxWaiter {
    pub fn new(chain: Arc<dyn LedgerChain>, config: WaitConfig) -> Self {
        Self { chain, config }
    }

    pub fn chain(&self) -> &Arc<dyn LedgerChain> {
        &self.chain
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// Wait until `tx` is mined and buried under `block_delay` blocks.
    ///
    /// "Not found yet" and transient RPC errors are retried with capped
    /// exponential backoff; any other error and a reverted receipt end the
    /// wait immediately.
    pub async fn wait(&self, tx: TxHash) -> Result<Receipt, ChainError> {
        let deadline = Instant::now() + self.config.timeout();
        let mut backoff = Duration::from_millis(self.config.backoff_initial_ms);
        let max_backoff = Duration::from_millis(self.config.backoff_max_ms);

        let receipt = loop {
            let err = match self.chain.receipt(tx).await {
                Ok(Some(receipt)) => break receipt,
                Ok(None) => ChainError::NotFoundYet,
                Err(e) => e,
            };
            if !err.is_retryable() {
                tracing::warn!(tx = %tx.short(), error = %err, "receipt poll failed");
                return Err(err);
            }
            if Instant::now() + backoff > deadline {
                return Err(ChainError::Timeout(format!("receipt of {}", tx.short())));
            }
            tracing::trace!(tx = %tx.short(), backoff_ms = backoff.as_millis() as u64, "receipt not ready");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        };

        if !receipt.success {
            return Err(ChainError::TxFailed(format!("{} reverted", tx.short())));
        }

        let target = receipt.block + self.config.block_delay;
        loop {
            match self.chain.block_number().await {
                Ok(head) if head >= target => break,
                Ok(_) => {}
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(ChainError::Timeout(format!("{} confirmations of {}", self.config.block_delay, tx.short())));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
        tracing::debug!(tx = %tx.short(), block = receipt.block, "tx confirmed");
        Ok(receipt)
    }

    /// Submit through `submit` and wait for the result.
    pub async fn submit_and_wait<F, Fut>(&self, submit: F) -> Result<Receipt, ChainError>
    where
        F: FnOnce(Arc<dyn LedgerChain>) -> Fut,
        Fut: std::future::Future<Output = Result<TxHash, ChainError>>,
    {
        let tx = submit(self.chain.clone()).await?;
        self.wait(tx).await
    }
}
