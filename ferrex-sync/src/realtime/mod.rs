//! Session event stream: connection lifecycle, de-duplication and
//! application of realtime events to the caches.
//!
//! Exactly-once delivery across reconnects relies on server-assigned event
//! ids. A frame without an id cannot be recognized when the server replays
//! it and is delivered every time it arrives.

use std::collections::{HashSet, VecDeque};
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use ferrex_sync_model::{CachedMediaItem, RealtimeEvent, StreamFrame, UserId};
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RealtimeConfig;
use crate::credentials::{AccessToken, Credentials};
use crate::snapshot::VolatileSnapshotStore;
use crate::store::LocalCacheStore;

pub mod sse;

pub use sse::SseEventSource;

/// Capacity of the subscriber channel; slow subscribers lag, they never
/// block the stream.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Failure of the event stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Event stream authorization rejected: {0}")]
    Auth(String),

    #[error("Event stream transport failure: {0}")]
    Transport(String),
}

pub type FrameStream = BoxStream<'static, Result<StreamFrame, StreamError>>;

/// Opens authenticated event stream connections.
#[async_trait]
pub trait EventStreamSource: Send + Sync + Debug {
    /// Connect, resuming after `last_event_id` when the server supports it.
    async fn connect(
        &self,
        token: Option<AccessToken>,
        last_event_id: Option<String>,
    ) -> Result<FrameStream, StreamError>;
}

/// Lifecycle of the bridge connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Stopped,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up; `start` begins a fresh attempt.
    Failed { reason: String },
}

/// Bounded memory of recently delivered event ids.
#[derive(Debug)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// False if `id` was already delivered. Frames without an id always
    /// pass.
    fn accept(&mut self, id: Option<&str>) -> bool {
        let Some(id) = id else {
            return true;
        };
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    fn last(&self) -> Option<String> {
        self.order.back().cloned()
    }
}

struct Running {
    user: UserId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct BridgeInner {
    source: Arc<dyn EventStreamSource>,
    credentials: Credentials,
    cache: LocalCacheStore,
    resume: VolatileSnapshotStore<CachedMediaItem>,
    next_up: VolatileSnapshotStore<CachedMediaItem>,
    config: RealtimeConfig,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<RealtimeEvent>,
    /// Survives reconnects and restarts so replays are filtered.
    recent: Mutex<RecentIds>,
    running: Mutex<Option<Running>>,
}

/// Keeps one event stream open per session and pushes its events into the
/// snapshot stores and the cache.
#[derive(Clone)]
pub struct RealtimeEventBridge {
    inner: Arc<BridgeInner>,
}

impl Debug for RealtimeEventBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeEventBridge")
            .field("source", &self.inner.source)
            .field("state", &*self.inner.state_tx.borrow())
            .finish()
    }
}

impl RealtimeEventBridge {
    pub fn new(
        source: Arc<dyn EventStreamSource>,
        credentials: Credentials,
        cache: LocalCacheStore,
        resume: VolatileSnapshotStore<CachedMediaItem>,
        next_up: VolatileSnapshotStore<CachedMediaItem>,
        config: RealtimeConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Stopped);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let recent = Mutex::new(RecentIds::new(config.dedupe_window));
        Self {
            inner: Arc::new(BridgeInner {
                source,
                credentials,
                cache,
                resume,
                next_up,
                config,
                state_tx,
                events_tx,
                recent,
                running: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Receive every accepted event after it has been applied.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Open the stream for `user`. No-op while already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, user: UserId) {
        let mut running = self.inner.running.lock();
        if let Some(current) = running.as_ref()
            && !current.task.is_finished()
        {
            if current.user != user {
                log::warn!(
                    "[RealtimeBridge] Already running for {}, ignoring start for {}",
                    current.user,
                    user
                );
            }
            return;
        }

        log::info!("[RealtimeBridge] Starting event stream for {}", user);
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(run(inner, user.clone(), cancel.clone()));
        *running = Some(Running { user, cancel, task });
    }

    /// Tear the connection down. Safe to call when already stopped.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await
                && e.is_panic()
            {
                log::error!("[RealtimeBridge] Stream task panicked: {}", e);
            }
            log::info!("[RealtimeBridge] Event stream stopped");
        }
        self.inner.publish(ConnectionState::Stopped);
    }
}

impl BridgeInner {
    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn apply(&self, user: &UserId, event: RealtimeEvent) {
        log::debug!("[RealtimeBridge] Applying {} event", event.kind());
        match &event {
            RealtimeEvent::Progress { .. } => {
                self.resume.handle(&event);
            }
            RealtimeEvent::Stop {
                entity_id,
                position_ticks,
            } => {
                self.resume.handle(&event);
                self.next_up.invalidate();
                if let Err(e) = self
                    .cache
                    .update_position(user, entity_id, *position_ticks)
                    .await
                {
                    log::warn!(
                        "[RealtimeBridge] Failed to record stop position for {}: {}",
                        entity_id,
                        e
                    );
                }
            }
            RealtimeEvent::UserDataChanged { .. } | RealtimeEvent::LibraryChanged { .. } => {
                self.resume.invalidate();
                self.next_up.invalidate();
            }
        }
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }
}

/// Why a connection ended.
enum Disconnect {
    Cancelled,
    Failed(StreamError),
}

async fn run(inner: Arc<BridgeInner>, user: UserId, cancel: CancellationToken) {
    let mut transport_failures: u32 = 0;
    // One refresh-then-reconnect per auth failure episode
    let mut auth_refresh_spent = false;
    let mut next_state = ConnectionState::Connecting;

    loop {
        inner.publish(next_state.clone());
        let token = inner.credentials.token().await;
        let last_id = inner.recent.lock().last();

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = inner.source.connect(token.clone(), last_id) => result,
        };

        let failure = match connected {
            Ok(stream) => {
                inner.publish(ConnectionState::Connected);
                log::info!("[RealtimeBridge] Event stream connection opened");
                transport_failures = 0;
                match pump(&inner, &user, stream, &cancel, &mut auth_refresh_spent).await {
                    Disconnect::Cancelled => return,
                    Disconnect::Failed(e) => e,
                }
            }
            Err(e) => e,
        };

        match failure {
            StreamError::Auth(msg) => {
                if auth_refresh_spent {
                    log::error!(
                        "[RealtimeBridge] Authorization rejected again after refresh: {}",
                        msg
                    );
                    inner.publish(ConnectionState::Failed {
                        reason: format!("authorization rejected after token refresh: {msg}"),
                    });
                    return;
                }
                auth_refresh_spent = true;
                log::warn!("[RealtimeBridge] Authorization rejected ({}), refreshing token", msg);
                inner.publish(ConnectionState::Reconnecting { attempt: 1 });

                let refreshed = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = inner.credentials.refresh(token.as_ref()) => result,
                };
                if let Err(e) = refreshed {
                    log::error!("[RealtimeBridge] Token refresh failed: {}", e);
                    inner.publish(ConnectionState::Failed {
                        reason: e.to_string(),
                    });
                    return;
                }
                next_state = ConnectionState::Reconnecting { attempt: 1 };
            }
            StreamError::Transport(msg) => {
                transport_failures += 1;
                if transport_failures > inner.config.max_retries {
                    log::error!("[RealtimeBridge] Max retries exceeded: {}", msg);
                    inner.publish(ConnectionState::Failed {
                        reason: format!(
                            "gave up after {} reconnect attempts: {msg}",
                            inner.config.max_retries
                        ),
                    });
                    return;
                }

                let delay = inner.config.backoff(transport_failures);
                log::info!(
                    "[RealtimeBridge] Connection lost ({}), retrying after {:?} (attempt #{})",
                    msg,
                    delay,
                    transport_failures
                );
                next_state = ConnectionState::Reconnecting {
                    attempt: transport_failures,
                };
                inner.publish(next_state.clone());
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Deliver frames until the stream fails or the bridge is stopped.
async fn pump(
    inner: &BridgeInner,
    user: &UserId,
    mut stream: FrameStream,
    cancel: &CancellationToken,
    auth_refresh_spent: &mut bool,
) -> Disconnect {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Disconnect::Cancelled,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                *auth_refresh_spent = false;
                let fresh = inner.recent.lock().accept(frame.id.as_deref());
                if fresh {
                    inner.apply(user, frame.event).await;
                } else {
                    log::debug!(
                        "[RealtimeBridge] Dropping replayed event {}",
                        frame.id.as_deref().unwrap_or_default()
                    );
                }
            }
            Some(Err(e)) => return Disconnect::Failed(e),
            None => {
                return Disconnect::Failed(StreamError::Transport("stream ended".to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_ids_forget_oldest_beyond_capacity() {
        let mut recent = RecentIds::new(2);
        assert!(recent.accept(Some("1")));
        assert!(!recent.accept(Some("1")));
        assert!(recent.accept(None));
        assert!(recent.accept(None));
        assert!(recent.accept(Some("2")));
        assert!(recent.accept(Some("3")));
        assert_eq!(recent.last().as_deref(), Some("3"));
        // "1" fell out of the window
        assert!(recent.accept(Some("1")));
        assert!(!recent.accept(Some("3")));
    }
}
