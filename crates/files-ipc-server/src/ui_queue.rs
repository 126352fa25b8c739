//! Serialization of adapter calls onto the host's UI thread.
//!
//! The engine may not touch UI-bound shell state from arbitrary worker
//! threads. [`UiQueue::submit`] hands a deferred operation to a single
//! worker that executes submissions strictly in order and reports each
//! outcome back through a oneshot.
//!
//! Each operation runs in its own spawned task that the worker awaits, so a
//! panicking operation fails only its own submission — the worker and every
//! queued operation behind it keep going.
//!
//! In the embedded host the worker task is driven by the UI dispatcher; the
//! standalone server and the tests run it on the tokio runtime, where
//! "serial" is the only guarantee anyone observes.

use std::future::Future;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// A deferred operation: built on the caller's thread, executed on the
/// queue's worker.
type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Failures observable by a submitter.
#[derive(Debug, Error)]
pub enum UiQueueError {
    /// The queue's worker is gone (host shutting down).
    #[error("UI queue is closed")]
    Closed,

    /// The operation died (panicked or was dropped) before completing.
    #[error("UI operation failed to complete")]
    Failed,
}

/// Handle to the serial execution queue.
#[derive(Clone)]
pub struct UiQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl UiQueue {
    /// Creates the queue and spawns its worker on the current runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                // One task per operation isolates panics; awaiting the
                // handle keeps execution strictly serial.
                let handle = tokio::spawn(job());
                if let Err(err) = handle.await {
                    warn!(error = %err, "UI operation aborted");
                }
            }
        });
        Self { tx }
    }

    /// Submits an operation; the returned future resolves with its
    /// outcome.
    ///
    /// The operation is enqueued before this returns, so execution order
    /// is call order regardless of when (or whether) the completion is
    /// awaited.
    ///
    /// # Errors
    ///
    /// [`UiQueueError::Closed`] if the worker is gone,
    /// [`UiQueueError::Failed`] if the operation panicked.
    pub fn submit<F, Fut, T>(&self, op: F) -> impl Future<Output = Result<T, UiQueueError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<T>();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = done_tx.send(op().await);
            })
        });
        let enqueued = self.tx.send(job).map_err(|_| UiQueueError::Closed);
        async move {
            enqueued?;
            done_rx.await.map_err(|_| UiQueueError::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn submissions_complete_in_order() {
        let queue = UiQueue::spawn();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut outcomes = Vec::new();
        for i in 0..5u64 {
            let log = Arc::clone(&log);
            outcomes.push(queue.submit(move || async move {
                // Later submissions sleep less; order must still hold.
                tokio::time::sleep(std::time::Duration::from_millis(5 * (5 - i))).await;
                log.lock().unwrap().push(i);
                i
            }));
        }
        for (i, outcome) in outcomes.into_iter().enumerate() {
            assert_eq!(outcome.await.unwrap(), i as u64);
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failure_does_not_wedge_the_queue() {
        let queue = UiQueue::spawn();

        let panicked = queue
            .submit(|| async {
                panic!("operation exploded");
            })
            .await;
        assert!(matches!(panicked, Err(UiQueueError::Failed)));

        let after = queue.submit(|| async { 41 + 1 }).await.unwrap();
        assert_eq!(after, 42);
    }

    #[tokio::test]
    async fn results_propagate() {
        let queue = UiQueue::spawn();
        let counter = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&counter);
        let result = queue
            .submit(move || async move {
                captured.fetch_add(1, Ordering::SeqCst);
                "done"
            })
            .await
            .unwrap();
        assert_eq!(result, "done");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
