//! Chain event subscription.
//!
//! A single task polls [`LedgerChain::logs_since`] and pushes logs into a
//! bounded queue. A full queue blocks the poller, so a slow consumer slows the
//! subscription down instead of dropping events. Cancelling (or dropping) the
//! [`EventMonitor`] stops the task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::chain::{ChainLog, LedgerChain};

const PAGE: usize = 256;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            queue_capacity: 1024,
        }
    }
}

pub struct EventMonitor {
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<u64>>,
}

impl EventMonitor {
    /// Start delivering logs with `index >= from`.
    pub fn spawn(
        chain: Arc<dyn LedgerChain>,
        from: u64,
        config: MonitorConfig,
        span: tracing::Span,
    ) -> (Self, mpsc::Receiver<ChainLog>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (cancel, mut cancelled) = watch::channel(false);

        let task = tokio::spawn(
            async move {
                let mut next = from;
                tracing::debug!(from, "event monitor started");
                loop {
                    match chain.logs_since(next, PAGE).await {
                        Ok((logs, after)) => {
                            let full_page = logs.len() == PAGE;
                            for log in logs {
                                tokio::select! {
                                    sent = tx.send(log) => {
                                        if sent.is_err() {
                                            tracing::debug!("event queue closed");
                                            return next;
                                        }
                                    }
                                    _ = cancelled.changed() => return next,
                                }
                            }
                            next = after;
                            if full_page {
                                continue;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "polling chain events failed"),
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_interval) => {}
                        _ = cancelled.changed() => break,
                    }
                }
                tracing::debug!(next, "event monitor stopped");
                next
            }
            .instrument(span),
        );

        (
            Self {
                cancel,
                task: Some(task),
            },
            rx,
        )
    }

    /// Stop polling and return the index the next subscription should start at.
    pub async fn cancel(mut self) -> Option<u64> {
        let _ = self.cancel.send(true);
        match self.task.take() {
            Some(task) => task.await.ok(),
            None => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainEvent;
    use crate::simulated::{SimulatedChain, SimulatedChainConfig};
    use osp_core::Address;

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(5),
            queue_capacity: 2,
        }
    }

    #[tokio::test]
    async fn test_delivers_in_order_from_cursor() {
        let chain = Arc::new(SimulatedChain::new(SimulatedChainConfig::default()));
        for i in 1..=5u64 {
            let pay = osp_core::PayBuilder::new(Address([1; 20]), Address([2; 20]), osp_core::TokenInfo::native(), 1)
                .timestamp(i)
                .resolve_deadline(100)
                .build()
                .unwrap();
            chain.resolve_payment_by_conditions(pay, vec![]).await.unwrap();
        }

        let (monitor, mut rx) = EventMonitor::spawn(chain.clone(), 2, config(), tracing::Span::none());
        let mut seen = Vec::new();
        for _ in 0..3 {
            let log = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert!(matches!(log.event, ChainEvent::PayResolved { .. }));
            seen.push(log.index);
        }
        assert_eq!(seen, vec![2, 3, 4]);
        assert_eq!(monitor.cancel().await, Some(5));
    }

    #[tokio::test]
    async fn test_drop_stops_task() {
        let chain = Arc::new(SimulatedChain::new(SimulatedChainConfig::default()));
        let (monitor, mut rx) = EventMonitor::spawn(chain, 0, config(), tracing::Span::none());
        assert!(monitor.is_running());
        drop(monitor);
        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }
}
