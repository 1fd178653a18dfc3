use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Batch request errors.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no result for key: {0}")]
    NoResult(String),

    #[error("batch processing failed: {0}")]
    Upstream(String),

    #[error("batch dropped before completion")]
    Dropped,
}

type Waiter<T> = oneshot::Sender<Result<T, BatchError>>;

/// The function invoked once per flush with every distinct pending key.
pub type BatchFn<T> =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, anyhow::Result<HashMap<String, T>>> + Send + Sync>;

/// Coalesces concurrent requests for distinct keys arriving within a short
/// window into one batch call, fanning results back out to each waiter.
///
/// This is a fan-out/fan-in join, not a cache: repeated calls after a flush
/// always re-batch. The flush timer is debounced, set once per idle period.
pub struct RequestBatcher<T> {
    pending: Mutex<HashMap<String, Vec<Waiter<T>>>>,
    flush_scheduled: AtomicBool,
    batch_delay: Duration,
    process: BatchFn<T>,
}

impl<T: Clone + Send + 'static> RequestBatcher<T> {
    pub fn new(batch_delay: Duration, process: BatchFn<T>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            flush_scheduled: AtomicBool::new(false),
            batch_delay,
            process,
        })
    }

    /// Enqueue a request for `key` and wait for the batch result. Multiple
    /// callers for the same key within one window share a single upstream
    /// fetch but resolve independently.
    pub async fn request(self: &Arc<Self>, key: &str) -> Result<T, BatchError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.entry(key.to_string()).or_default().push(tx);
        }

        if !self.flush_scheduled.swap(true, Ordering::AcqRel) {
            let batcher = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(batcher.batch_delay).await;
                batcher.flush().await;
            });
        }

        rx.await.map_err(|_| BatchError::Dropped)?
    }

    /// Number of keys currently queued for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn flush(&self) {
        // Reset the debounce flag under the same lock as the drain so a
        // request landing between the two always gets a new flush scheduled.
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            self.flush_scheduled.store(false, Ordering::Release);
            std::mem::take(&mut *pending)
        };

        if batch.is_empty() {
            return;
        }

        let keys: Vec<String> = batch.keys().cloned().collect();
        debug!("flushing batch of {} keys", keys.len());

        match (self.process)(keys).await {
            Ok(results) => {
                for (key, waiters) in batch {
                    match results.get(&key) {
                        Some(value) => {
                            for tx in waiters {
                                let _ = tx.send(Ok(value.clone()));
                            }
                        }
                        None => {
                            for tx in waiters {
                                let _ = tx.send(Err(BatchError::NoResult(key.clone())));
                            }
                        }
                    }
                }
            }
            Err(e) => {
                let msg = e.to_string();
                for (_, waiters) in batch {
                    for tx in waiters {
                        let _ = tx.send(Err(BatchError::Upstream(msg.clone())));
                    }
                }
            }
        }
    }
}
