//! Serial operation queue.
//!
//! All mutation of local-store/sync-engine/remote-store state is funneled
//! through one FIFO queue of async operations, so shared maps are never
//! mutated concurrently: ordering replaces locking. Stream callbacks enqueue
//! work here instead of touching engine state directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;

use crate::error::{cancelled, SyncResult};
use crate::util::runtime;

type QueueOp = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Identifies delayed operations so logs can tell timers apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerId {
    ListenStreamConnectionBackoff,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
}

/// FIFO executor for engine operations.
///
/// Operations run strictly in enqueue order, one at a time. After
/// [`AsyncQueue::enter_restricted_mode`] no new work is accepted, but
/// operations already enqueued still run to completion.
pub struct AsyncQueue {
    sender: async_channel::Sender<QueueOp>,
    restricted: AtomicBool,
}

impl AsyncQueue {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = async_channel::unbounded::<QueueOp>();
        runtime::spawn_detached(async move {
            while let Ok(op) = receiver.recv().await {
                op.await;
            }
        });
        Arc::new(Self {
            sender,
            restricted: AtomicBool::new(false),
        })
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted.load(Ordering::SeqCst)
    }

    /// Enqueues an operation without waiting for its completion.
    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_restricted() {
            log::debug!("async queue restricted; dropping operation");
            return;
        }
        let _ = self.sender.try_send(Box::pin(op));
    }

    /// Enqueues an operation and resolves with its result once it has run.
    pub async fn enqueue<F, T>(&self, op: F) -> SyncResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_restricted() {
            return Err(cancelled("async queue is shutting down"));
        }
        let (tx, rx) = oneshot::channel();
        let wrapped: QueueOp = Box::pin(async move {
            let value = op.await;
            let _ = tx.send(value);
        });
        self.sender
            .try_send(wrapped)
            .map_err(|_| cancelled("async queue is shutting down"))?;
        rx.await.map_err(|_| cancelled("operation cancelled"))
    }

    /// Schedules an operation to be enqueued after `delay`. The returned
    /// handle cancels the timer; a cancelled operation never runs.
    pub fn enqueue_after_delay<F>(
        self: &Arc<Self>,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancelled_flag = Arc::new(AtomicBool::new(false));
        let handle = DelayedOperation {
            cancelled: Arc::clone(&cancelled_flag),
        };
        let queue = Arc::clone(self);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if cancelled_flag.load(Ordering::SeqCst) {
                log::debug!("delayed operation {timer_id:?} cancelled before firing");
                return;
            }
            queue.enqueue_and_forget(op);
        });
        handle
    }

    /// Stops accepting new operations. Work already in the queue still runs.
    pub fn enter_restricted_mode(&self) {
        self.restricted.store(true, Ordering::SeqCst);
        self.sender.close();
    }
}

/// Cancellation handle for a timer scheduled with
/// [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation {
    cancelled: Arc<AtomicBool>,
}

impl DelayedOperation {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn runs_operations_in_fifo_order() {
        let queue = AsyncQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..8 {
            let order = Arc::clone(&order);
            queue.enqueue_and_forget(async move {
                order.lock().unwrap().push(index);
            });
        }

        let order_clone = Arc::clone(&order);
        queue
            .enqueue(async move {
                order_clone.lock().unwrap().push(99);
            })
            .await
            .unwrap();

        let recorded = order.lock().unwrap().clone();
        assert_eq!(recorded, vec![0, 1, 2, 3, 4, 5, 6, 7, 99]);
    }

    #[tokio::test]
    async fn restricted_mode_rejects_new_work() {
        let queue = AsyncQueue::new();
        queue.enter_restricted_mode();
        let result = queue.enqueue(async { 1 }).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code_str(), "cancelled");
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_never_runs() {
        let queue = AsyncQueue::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        let handle = queue.enqueue_after_delay(
            TimerId::ListenStreamConnectionBackoff,
            Duration::from_millis(10),
            async move {
                fired_clone.store(true, Ordering::SeqCst);
            },
        );
        handle.cancel();
        runtime::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
