use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::{AppError, AppResult};

/// Runs submitted operations one at a time, in submission order.
///
/// Every operation waits for the one submitted before it. A caller that
/// gives up after `timeout` gets `QUEUE/TIMEOUT`, but its operation still
/// runs to completion and the chain carries on behind it.
#[derive(Debug)]
pub struct OperationQueue {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
    pending: Arc<AtomicUsize>,
    timeout: Duration,
}

/// Decrements the pending count when an operation ends, panics included.
struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl OperationQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tail: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Operations submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn run<F, Fut, R>(&self, label: &'static str, op: F) -> AppResult<R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let previous = {
            let mut tail = self.tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tail.replace(done_rx)
        };
        let pending = Arc::clone(&self.pending);
        let depth = pending.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "keepsake", event = "queue_submit", op = label, depth);

        let handle = tokio::spawn(async move {
            let guard = PendingGuard(pending);
            if let Some(previous) = previous {
                // A dropped sender means the previous operation panicked; the
                // chain continues either way.
                let _ = previous.await;
            }
            let result = op().await;
            drop(guard);
            let _ = done_tx.send(());
            result
        });

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                error!(target: "keepsake", event = "queue_op_panicked", op = label, error = %join_err);
                Err(AppError::new("QUEUE/TASK", "Queued operation did not complete")
                    .with_context("op", label)
                    .with_context("error", join_err.to_string()))
            }
            Err(_) => {
                warn!(
                    target: "keepsake",
                    event = "queue_timeout",
                    op = label,
                    timeout_ms = self.timeout.as_millis() as u64
                );
                Err(AppError::new(
                    "QUEUE/TIMEOUT",
                    "Storage operation timed out waiting for completion",
                )
                .with_context("op", label)
                .with_context("timeout_ms", self.timeout.as_millis().to_string()))
            }
        }
    }
}
