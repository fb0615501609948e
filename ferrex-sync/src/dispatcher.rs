//! Priority-ordered, concurrency-capped executor for remote operations.
//!
//! Tasks wait in a binary heap keyed by priority then enqueue sequence, so
//! `High` work (playback start/stop reporting) always starts ahead of
//! queued `Low` work (flag toggles, progress heartbeats) and ties run in
//! arrival order. Each [`ServerKey`] has its own in-flight cap so one slow
//! backend cannot starve another, and a global ceiling bounds the total.
//!
//! Started tasks run on their own tokio task: a failing or panicking task
//! only affects its own [`DispatchHandle`], and dropping the handle does not
//! cancel the work.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::DispatcherConfig;
use crate::error::SyncError;
use crate::result::ApiResult;

/// Scheduling class of a remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low = 0,
    High = 1,
}

/// Identifies the backend a task talks to; in-flight caps apply per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey(Arc<str>);

impl ServerKey {
    pub const PRIMARY: &'static str = "primary";

    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// The media server itself.
    pub fn primary() -> Self {
        Self::new(Self::PRIMARY)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueuedTask {
    priority: Priority,
    seq: u64,
    server_key: ServerKey,
    job: Job,
}

impl Eq for QueuedTask {}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO)
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

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<QueuedTask>,
    in_flight: HashMap<ServerKey, usize>,
    total_in_flight: usize,
    shutdown: bool,
}

struct Inner {
    state: Mutex<SchedulerState>,
    seq: AtomicU64,
    config: DispatcherConfig,
}

/// Snapshot of dispatcher load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub queued_high: usize,
    pub queued_low: usize,
    pub in_flight: usize,
}

/// Priority-aware executor for remote operations.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RequestDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::default()),
                seq: AtomicU64::new(0),
                config,
            }),
        }
    }

    /// Queue `work` and return a handle resolving to its result.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<T, F, Fut>(
        &self,
        priority: Priority,
        server_key: ServerKey,
        work: F,
    ) -> DispatchHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let result = work().await;
                // Receiver may be gone: the caller stopped waiting
                let _ = tx.send(result);
            })
        });

        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                log::warn!(
                    "[Dispatcher] Rejecting {:?} task for {}: dispatcher is shut down",
                    priority,
                    server_key
                );
                return DispatchHandle { rx };
            }
            log::debug!(
                "[Dispatcher] Queued {:?} task #{} for {} (queue size: {})",
                priority,
                seq,
                server_key,
                state.queue.len() + 1
            );
            state.queue.push(QueuedTask {
                priority,
                seq,
                server_key,
                job,
            });
        }

        Inner::pump(&self.inner);
        DispatchHandle { rx }
    }

    pub fn stats(&self) -> DispatcherStats {
        let state = self.inner.state.lock();
        let queued_high = state
            .queue
            .iter()
            .filter(|t| t.priority == Priority::High)
            .count();
        DispatcherStats {
            queued_high,
            queued_low: state.queue.len() - queued_high,
            in_flight: state.total_in_flight,
        }
    }

    /// Stop scheduling. Queued tasks resolve with an error; running tasks
    /// finish normally. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.queue)
        };
        if !dropped.is_empty() {
            log::info!(
                "[Dispatcher] Shut down with {} queued task(s) discarded",
                dropped.len()
            );
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shutdown
    }
}

impl Inner {
    fn limit_for(&self, key: &ServerKey) -> usize {
        self.config
            .server_overrides
            .get(key.as_str())
            .copied()
            .unwrap_or(self.config.per_server_in_flight)
            .max(1)
    }

    /// Start every queued task that fits under the caps.
    fn pump(this: &Arc<Self>) {
        let ready = {
            let mut state = this.state.lock();
            let mut ready = Vec::new();
            let mut saturated = Vec::new();

            while state.total_in_flight < this.config.max_in_flight.max(1) {
                let Some(task) = state.queue.pop() else {
                    break;
                };
                let running = state.in_flight.get(&task.server_key).copied().unwrap_or(0);
                if running >= this.limit_for(&task.server_key) {
                    saturated.push(task);
                    continue;
                }
                *state.in_flight.entry(task.server_key.clone()).or_insert(0) += 1;
                state.total_in_flight += 1;
                ready.push(task);
            }

            for task in saturated {
                state.queue.push(task);
            }
            ready
        };

        for task in ready {
            log::debug!(
                "[Dispatcher] Starting {:?} task #{} for {}",
                task.priority,
                task.seq,
                task.server_key
            );
            let guard = InFlightGuard {
                inner: Arc::clone(this),
                server_key: task.server_key,
            };
            let job = task.job;
            tokio::spawn(async move {
                let _guard = guard;
                job().await;
            });
        }
    }

    fn finish(this: &Arc<Self>, server_key: &ServerKey) {
        {
            let mut state = this.state.lock();
            state.total_in_flight = state.total_in_flight.saturating_sub(1);
            if let Some(count) = state.in_flight.get_mut(server_key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.in_flight.remove(server_key);
                }
            }
            if state.shutdown {
                return;
            }
        }
        Self::pump(this);
    }
}

/// Releases the in-flight slot when a task ends, including by panic.
struct InFlightGuard {
    inner: Arc<Inner>,
    server_key: ServerKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        Inner::finish(&self.inner, &self.server_key);
    }
}

/// Awaitable result of a dispatched task.
#[derive(Debug)]
pub struct DispatchHandle<T> {
    rx: oneshot::Receiver<ApiResult<T>>,
}

impl<T> DispatchHandle<T> {
    /// Non-blocking check: `Loading` while the task is queued or running.
    pub fn try_take(&mut self) -> ApiResult<T> {
        match self.rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => ApiResult::Loading,
            Err(oneshot::error::TryRecvError::Closed) => ApiResult::Error(dropped_error()),
        }
    }
}

fn dropped_error() -> SyncError {
    SyncError::Unknown(
        "task was dropped before completing (dispatcher shut down or task panicked)".to_string(),
    )
}

impl<T> Future for DispatchHandle<T> {
    type Output = ApiResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(ApiResult::Error(dropped_error())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn config(max_in_flight: usize, per_server: usize) -> DispatcherConfig {
        DispatcherConfig {
            max_in_flight,
            per_server_in_flight: per_server,
            server_overrides: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn high_priority_starts_before_earlier_low_priority() {
        let dispatcher = RequestDispatcher::new(config(1, 1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = dispatcher.enqueue(Priority::Low, ServerKey::primary(), move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            ApiResult::Success("blocker")
        });
        started_rx.await.unwrap();

        let mut handles = Vec::new();
        for (priority, name) in [
            (Priority::Low, "t1"),
            (Priority::High, "t2"),
            (Priority::Low, "t3"),
        ] {
            let order = Arc::clone(&order);
            handles.push(dispatcher.enqueue(priority, ServerKey::primary(), move || async move {
                order.lock().push(name);
                ApiResult::Success(name)
            }));
        }
        assert_eq!(dispatcher.stats().queued_high, 1);
        assert_eq!(dispatcher.stats().queued_low, 2);

        release_tx.send(()).unwrap();
        assert_eq!(blocker.await, ApiResult::Success("blocker"));
        for handle in handles {
            assert!(handle.await.is_success());
        }
        assert_eq!(*order.lock(), vec!["t2", "t1", "t3"]);
    }

    #[tokio::test]
    async fn saturated_server_does_not_block_other_servers() {
        let dispatcher = RequestDispatcher::new(config(4, 1));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel();

        let slow = dispatcher.enqueue(Priority::Low, ServerKey::primary(), move || async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            ApiResult::Success(1)
        });
        started_rx.await.unwrap();

        let queued_behind = dispatcher.enqueue(Priority::High, ServerKey::primary(), || async {
            ApiResult::Success(2)
        });
        let other = dispatcher.enqueue(Priority::Low, ServerKey::new("recommendations"), || async {
            ApiResult::Success(3)
        });

        let other = tokio::time::timeout(Duration::from_secs(1), other).await.unwrap();
        assert_eq!(other, ApiResult::Success(3));
        assert_eq!(dispatcher.stats().queued_high, 1);

        release_tx.send(()).unwrap();
        assert_eq!(slow.await, ApiResult::Success(1));
        assert_eq!(queued_behind.await, ApiResult::Success(2));
    }

    #[tokio::test]
    async fn failing_and_panicking_tasks_do_not_affect_siblings() {
        let dispatcher = RequestDispatcher::new(config(1, 1));

        let failing = dispatcher.enqueue(Priority::High, ServerKey::primary(), || async {
            ApiResult::<u8>::Error(SyncError::Network("reset".into()))
        });
        let panicking = dispatcher.enqueue(Priority::High, ServerKey::primary(), || async {
            if true {
                panic!("task blew up");
            }
            ApiResult::Success(0u8)
        });
        let fine = dispatcher.enqueue(Priority::Low, ServerKey::primary(), || async {
            ApiResult::Success(7u8)
        });

        assert!(failing.await.error().is_some_and(SyncError::is_network));
        assert!(panicking.await.is_error());
        assert_eq!(fine.await, ApiResult::Success(7));
        assert_eq!(dispatcher.stats(), DispatcherStats::default());
    }

    #[tokio::test]
    async fn dropped_handle_still_runs_the_work() {
        let dispatcher = RequestDispatcher::new(config(2, 2));
        let (done_tx, done_rx) = oneshot::channel();

        drop(dispatcher.enqueue(Priority::Low, ServerKey::primary(), move || async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = done_tx.send(());
            ApiResult::Success(())
        }));

        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_and_new_tasks() {
        let dispatcher = RequestDispatcher::new(config(1, 1));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let running = dispatcher.enqueue(Priority::Low, ServerKey::primary(), move || async move {
            let _ = release_rx.await;
            ApiResult::Success(1)
        });
        let mut queued = dispatcher.enqueue(Priority::Low, ServerKey::primary(), || async {
            ApiResult::Success(2)
        });
        assert!(queued.try_take().is_loading());

        dispatcher.shutdown();
        dispatcher.shutdown();
        assert!(queued.await.is_error());
        assert!(dispatcher
            .enqueue(Priority::High, ServerKey::primary(), || async { ApiResult::Success(3) })
            .await
            .is_error());

        release_tx.send(()).unwrap();
        assert_eq!(running.await, ApiResult::Success(1));
    }
}
