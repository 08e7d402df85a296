//! One-at-a-time upstream request queue.
//!
//! Every upstream fetch, user-triggered or background, goes through the
//! `RequestCoordinator`. A single worker task runs one queued task at a time
//! and waits a fixed delay before starting the next, so the upstream API
//! never sees two concurrent requests from this client.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default pause between two upstream requests.
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 2000;

/// Queue priority. User actions are `High`, background pre-fetch is `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

struct QueuedTask {
    priority: Priority,
    seq: u64,
    label: String,
    task: BoxFuture<'static, anyhow::Result<()>>,
}

// Max-heap order: higher priority first, then lower sequence number (FIFO)
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    in_flight: Option<String>,
}

struct Inner {
    queue: Mutex<Queue>,
    wake: Notify,
    delay: Duration,
}

pub struct RequestCoordinator {
    inner: Arc<Inner>,
    worker: JoinHandle<()>,
}

impl RequestCoordinator {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(delay: Duration) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            delay,
        });
        let worker = tokio::spawn(Self::run_worker(Arc::clone(&inner)));
        Self { inner, worker }
    }

    async fn run_worker(inner: Arc<Inner>) {
        loop {
            let next = {
                let mut queue = inner.queue.lock().await;
                let next = queue.heap.pop();
                queue.in_flight = next.as_ref().map(|t| t.label.clone());
                next
            };

            let Some(queued) = next else {
                inner.wake.notified().await;
                continue;
            };

            debug!(task = %queued.label, priority = ?queued.priority, "Running queued request");
            match AssertUnwindSafe(queued.task).catch_unwind().await {
                Ok(Ok(())) => debug!(task = %queued.label, "Queued request finished"),
                Ok(Err(e)) => warn!(task = %queued.label, error = %e, "Queued request failed"),
                Err(_) => error!(task = %queued.label, "Queued request panicked"),
            }

            inner.queue.lock().await.in_flight = None;
            tokio::time::sleep(inner.delay).await;
        }
    }

    /// Queue a task. It runs once every higher-priority or earlier task has run.
    pub async fn enqueue<F>(&self, priority: Priority, label: impl Into<String>, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        {
            let mut queue = self.inner.queue.lock().await;
            let seq = queue.next_seq;
            queue.next_seq += 1;
            debug!(task = %label, ?priority, queued = queue.heap.len(), "Request queued");
            queue.heap.push(QueuedTask {
                priority,
                seq,
                label,
                task: task.boxed(),
            });
        }
        self.inner.wake.notify_one();
    }

    /// Queue a task and get its output back once it has run.
    ///
    /// The receiver errors if the coordinator shuts down before the task runs.
    pub async fn submit<F, T>(&self, priority: Priority, label: impl Into<String>, task: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(priority, label, async move {
            let output = task.await;
            // Caller may have stopped waiting; that is fine
            let _ = tx.send(output);
            Ok(())
        })
        .await;
        rx
    }

    /// Number of tasks waiting (not counting the one running).
    pub async fn pending(&self) -> usize {
        self.inner.queue.lock().await.heap.len()
    }

    /// Label of the task currently running, if any.
    pub async fn in_flight(&self) -> Option<String> {
        self.inner.queue.lock().await.in_flight.clone()
    }

    /// Priority and label of every waiting task, in run order.
    #[cfg(test)]
    pub(crate) async fn queued(&self) -> Vec<(Priority, String)> {
        let queue = self.inner.queue.lock().await;
        let mut tasks: Vec<&QueuedTask> = queue.heap.iter().collect();
        tasks.sort_by(|a, b| b.cmp(a));
        tasks.into_iter().map(|t| (t.priority, t.label.clone())).collect()
    }

    /// Stop the worker. Queued tasks are dropped without running.
    pub async fn shutdown(&self) {
        self.worker.abort();
        let dropped = {
            let mut queue = self.inner.queue.lock().await;
            let n = queue.heap.len();
            queue.heap.clear();
            n
        };
        if dropped > 0 {
            debug!(dropped, "Coordinator stopped with requests still queued");
        }
    }
}

impl Drop for RequestCoordinator {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    #[tokio::test(start_paused = true)]
    async fn test_priority_then_fifo_order() {
        let coordinator = RequestCoordinator::spawn(Duration::from_millis(DEFAULT_REQUEST_DELAY_MS));
        let order = Arc::new(StdMutex::new(Vec::new()));

        // Hold the worker busy so everything else queues up behind it
        let gate = Arc::new(Notify::new());
        let g = Arc::clone(&gate);
        coordinator
            .enqueue(Priority::Low, "gate", async move {
                g.notified().await;
                Ok(())
            })
            .await;
        tokio::task::yield_now().await;

        let mut receivers = Vec::new();
        for (label, priority) in [
            ("low-1", Priority::Low),
            ("normal-1", Priority::Normal),
            ("high-1", Priority::High),
            ("low-2", Priority::Low),
            ("high-2", Priority::High),
        ] {
            let order = Arc::clone(&order);
            receivers.push(
                coordinator
                    .submit(priority, label, async move {
                        order.lock().unwrap().push(label);
                    })
                    .await,
            );
        }
        assert_eq!(coordinator.pending().await, 5);

        gate.notify_one();
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec!["high-1", "high-2", "normal-1", "low-1", "low-2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_task_in_flight() {
        let coordinator = RequestCoordinator::spawn(Duration::from_millis(DEFAULT_REQUEST_DELAY_MS));
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for i in 0..10 {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            let priority = if i % 3 == 0 { Priority::High } else { Priority::Low };
            receivers.push(
                coordinator
                    .submit(priority, format!("task-{}", i), async move {
                        let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        active.fetch_sub(1, AtomicOrdering::SeqCst);
                    })
                    .await,
            );
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(max_seen.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_requests() {
        let coordinator = RequestCoordinator::spawn(Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        let first = coordinator.submit(Priority::Normal, "a", async { tokio::time::Instant::now() }).await;
        let second = coordinator.submit(Priority::Normal, "b", async { tokio::time::Instant::now() }).await;

        let a = first.await.unwrap();
        let b = second.await.unwrap();
        assert!(a - start < Duration::from_secs(1));
        assert!(b - a >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_panics_do_not_stop_the_worker() {
        let coordinator = RequestCoordinator::spawn(Duration::from_millis(10));
        coordinator
            .enqueue(Priority::High, "fails", async { Err(anyhow::anyhow!("upstream down")) })
            .await;
        coordinator
            .enqueue(Priority::High, "panics", async { panic!("boom") })
            .await;
        let rx = coordinator.submit(Priority::Low, "after", async { 42 }).await;
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_queued_tasks() {
        let coordinator = RequestCoordinator::spawn(Duration::from_secs(60));
        let first = coordinator.submit(Priority::Normal, "first", async { 1 }).await;
        assert_eq!(first.await.unwrap(), 1);

        // Worker is now sleeping out the inter-request delay
        let second = coordinator.submit(Priority::Normal, "second", async { 2 }).await;
        coordinator.shutdown().await;
        assert!(second.await.is_err());
    }
}
