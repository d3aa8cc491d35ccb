//! Queue runners
//!
//! A runner is bound to one switchboard and processes one item at a time:
//! dequeue, process, then finish, retry or shunt. Stopping is checked only
//! between items.

use super::switchboard::{QueueItem, Switchboard};
use async_trait::async_trait;
use listrust_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work done for each dequeued item
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    async fn process(&self, item: &QueueItem) -> Result<()>;
}

pub struct Runner {
    name: String,
    switchboard: Arc<Switchboard>,
    processor: Arc<dyn ItemProcessor>,
    poll_interval: Duration,
}

impl Runner {
    pub fn new(
        name: impl Into<String>,
        switchboard: Arc<Switchboard>,
        processor: Arc<dyn ItemProcessor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            switchboard,
            processor,
            poll_interval,
        }
    }

    /// Process items until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(runner = %self.name, queue = %self.switchboard.name(), "Runner started");

        while !cancel.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(runner = %self.name, queue = %self.switchboard.name(), error = %e, "Queue error");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!(runner = %self.name, "Runner stopped");
    }

    /// Process at most one item; returns whether an item was found
    pub async fn run_once(&self) -> Result<bool> {
        let Some(item) = self.switchboard.dequeue().await? else {
            return Ok(false);
        };
        let id = item.id;

        debug!(runner = %self.name, item_id = %id, attempts = item.attempts, "Processing item");

        // A panicking processor must not take the runner down with it
        let processor = self.processor.clone();
        let outcome = tokio::spawn(async move { processor.process(&item).await }).await;

        match outcome {
            Ok(Ok(())) => self.switchboard.finish(id).await?,
            Ok(Err(e)) if e.is_transient() => {
                warn!(runner = %self.name, item_id = %id, error = %e, "Transient failure");
                self.switchboard.retry(id, &e.to_string()).await?;
            }
            Ok(Err(e)) => {
                if let Error::FatalConfiguration(_) = e {
                    error!(
                        runner = %self.name,
                        item_id = %id,
                        code = e.code(),
                        error = %e,
                        "Invariant violation: unrecognized configuration value"
                    );
                }
                self.switchboard
                    .shunt(id, &format!("[{}] {}", e.code(), e))
                    .await?;
            }
            Err(join_error) => {
                error!(runner = %self.name, item_id = %id, error = %join_error, "Processor panicked");
                self.switchboard
                    .shunt(id, &format!("Processor panicked: {}", join_error))
                    .await?;
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::metadata::MessageData;
    use crate::queue::switchboard::RetryPolicy;
    use listrust_storage::{FileStorage, LocalStorage};
    use pretty_assertions::assert_eq;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Outcome(fn() -> Result<()>, AtomicUsize);

    #[async_trait]
    impl ItemProcessor for Outcome {
        async fn process(&self, _item: &QueueItem) -> Result<()> {
            self.1.fetch_add(1, Ordering::SeqCst);
            (self.0)()
        }
    }

    async fn setup(dir: &TempDir, outcome: fn() -> Result<()>) -> (Runner, Arc<Switchboard>, Arc<Outcome>) {
        let storage = Arc::new(LocalStorage::from_path(dir.path()).unwrap());
        let switchboard = Arc::new(Switchboard::new("in", storage, RetryPolicy::default()));
        let message = Message::from_bytes("From: anne@example.com\n\nhi\n").unwrap();
        switchboard
            .enqueue(&message, MessageData::new(), Map::new())
            .await
            .unwrap();

        let processor = Arc::new(Outcome(outcome, AtomicUsize::new(0)));
        let runner = Runner::new("in-0", switchboard.clone(), processor.clone(), Duration::from_millis(10));
        (runner, switchboard, processor)
    }

    #[tokio::test]
    async fn test_success_finishes_item() {
        let dir = TempDir::new().unwrap();
        let (runner, switchboard, processor) = setup(&dir, || Ok(())).await;

        assert!(runner.run_once().await.unwrap());
        assert!(!runner.run_once().await.unwrap());
        assert_eq!(processor.1.load(Ordering::SeqCst), 1);
        assert_eq!(switchboard.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_transient_error_requeues() {
        let dir = TempDir::new().unwrap();
        let (runner, switchboard, _) =
            setup(&dir, || Err(Error::Storage("disk full".into()))).await;

        assert!(runner.run_once().await.unwrap());
        let stats = switchboard.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.shunted, 0);
    }

    #[tokio::test]
    async fn test_permanent_error_shunts() {
        let dir = TempDir::new().unwrap();
        let (runner, switchboard, _) =
            setup(&dir, || Err(Error::FatalConfiguration("Bad DigestFrequency: x".into()))).await;

        assert!(runner.run_once().await.unwrap());
        let stats = switchboard.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.shunted, 1);

        let storage = LocalStorage::from_path(dir.path()).unwrap();
        let bad = storage.list("queue/bad").await.unwrap();
        assert_eq!(bad.len(), 1);
        let record: serde_json::Value =
            serde_json::from_slice(&storage.read(&format!("queue/bad/{}", bad[0])).await.unwrap()).unwrap();
        assert_eq!(
            record["last_error"],
            "[FATAL_CONFIG_ERROR] Fatal configuration error: Bad DigestFrequency: x"
        );
    }

    #[tokio::test]
    async fn test_panic_shunts() {
        let dir = TempDir::new().unwrap();
        let (runner, switchboard, _) = setup(&dir, || panic!("boom")).await;

        assert!(runner.run_once().await.unwrap());
        assert_eq!(switchboard.stats().await.unwrap().shunted, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let (runner, switchboard, processor) = setup(&dir, || Ok(())).await;
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(processor.1.load(Ordering::SeqCst), 1);
        assert_eq!(switchboard.stats().await.unwrap().pending, 0);
    }
}
