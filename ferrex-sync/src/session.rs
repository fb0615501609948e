//! Session-scoped container owning every synchronization service.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ferrex_sync_model::{CachedMediaItem, RealtimeEvent, UserId};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, RemoteApi};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::credentials::Credentials;
use crate::dispatcher::{RequestDispatcher, ServerKey};
use crate::error::SyncError;
use crate::orchestrator::{OrchestratorServices, SynchronizationOrchestrator};
use crate::pending::PendingActionQueue;
use crate::realtime::{EventStreamSource, RealtimeEventBridge, SseEventSource};
use crate::result::ApiResult;
use crate::snapshot::VolatileSnapshotStore;
use crate::store::{DiskStore, LocalCacheStore, LocalStore, MemoryStore};

/// Builds a [`SyncSession`]. Collaborators not supplied are created from
/// the config: an HTTP client for `server_url`, an SSE source on the same
/// server and a disk store under `cache_dir` (in memory without one).
#[derive(Debug)]
pub struct SyncSessionBuilder {
    user: UserId,
    config: SyncConfig,
    api: Option<Arc<dyn RemoteApi>>,
    store: Option<Arc<dyn LocalStore>>,
    events: Option<Arc<dyn EventStreamSource>>,
    credentials: Option<Credentials>,
    connectivity: Option<ConnectivityMonitor>,
}

impl SyncSessionBuilder {
    pub fn new(user: UserId, config: SyncConfig) -> Self {
        Self {
            user,
            config,
            api: None,
            store: None,
            events: None,
            credentials: None,
            connectivity: None,
        }
    }

    pub fn remote_api(mut self, api: Arc<dyn RemoteApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_source(mut self, events: Arc<dyn EventStreamSource>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn build(self) -> Result<SyncSession, SyncError> {
        self.config.validate()?;
        let config = self.config;
        let credentials = self.credentials.unwrap_or_default();
        let connectivity = self.connectivity.unwrap_or_default();

        let api: Arc<dyn RemoteApi> = match self.api {
            Some(api) => api,
            None => Arc::new(
                ApiClient::new(&config.server_url, credentials.clone())
                    .map_err(|e| SyncError::classify(&e))?,
            ),
        };
        let events: Arc<dyn EventStreamSource> = match self.events {
            Some(events) => events,
            None => Arc::new(
                SseEventSource::new(&config.server_url).map_err(|e| SyncError::classify(&e))?,
            ),
        };
        let store: Arc<dyn LocalStore> = match (self.store, &config.cache_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(DiskStore::open(dir)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };

        let dispatcher = RequestDispatcher::new(config.dispatcher.clone());
        let cache = LocalCacheStore::new(Arc::clone(&store));
        let pending = PendingActionQueue::new(store);
        let resume = VolatileSnapshotStore::new("resume");
        let next_up = VolatileSnapshotStore::new("next_up");

        let bridge = RealtimeEventBridge::new(
            events,
            credentials.clone(),
            cache.clone(),
            resume.clone(),
            next_up.clone(),
            config.realtime.clone(),
        );
        let orchestrator = SynchronizationOrchestrator::new(OrchestratorServices {
            api,
            cache,
            pending,
            dispatcher: dispatcher.clone(),
            connectivity: connectivity.clone(),
            resume: resume.clone(),
            next_up: next_up.clone(),
            server_key: ServerKey::new(&config.server_url),
            snapshots: config.snapshots.clone(),
        });

        log::info!("[SyncSession] Session created for {}", self.user);
        Ok(SyncSession {
            user: self.user,
            config,
            credentials,
            connectivity,
            dispatcher,
            resume,
            next_up,
            bridge,
            orchestrator,
            listener: Mutex::new(None),
            signed_out: AtomicBool::new(false),
        })
    }
}

struct Listener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything synchronization needs for one signed-in user.
///
/// Dropping the session without [`SyncSession::sign_out`] leaves spawned
/// tasks running until the runtime shuts down.
pub struct SyncSession {
    user: UserId,
    config: SyncConfig,
    credentials: Credentials,
    connectivity: ConnectivityMonitor,
    dispatcher: RequestDispatcher,
    resume: VolatileSnapshotStore<CachedMediaItem>,
    next_up: VolatileSnapshotStore<CachedMediaItem>,
    bridge: RealtimeEventBridge,
    orchestrator: SynchronizationOrchestrator,
    listener: Mutex<Option<Listener>>,
    signed_out: AtomicBool,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("user", &self.user)
            .field("server_url", &self.config.server_url)
            .field("signed_out", &self.is_signed_out())
            .finish_non_exhaustive()
    }
}

impl SyncSession {
    pub fn builder(user: UserId, config: SyncConfig) -> SyncSessionBuilder {
        SyncSessionBuilder::new(user, config)
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &SynchronizationOrchestrator {
        &self.orchestrator
    }

    pub fn bridge(&self) -> &RealtimeEventBridge {
        &self.bridge
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn is_signed_out(&self) -> bool {
        self.signed_out.load(Ordering::Acquire)
    }

    /// Open the event stream and start the background listener, which
    /// replays queued actions whenever the server becomes reachable and
    /// refreshes items the server reports as changed.
    ///
    /// Idempotent. Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.is_signed_out() {
            log::warn!("[SyncSession] Ignoring start after sign-out");
            return;
        }

        let mut listener = self.listener.lock();
        if listener.as_ref().is_some_and(|l| !l.task.is_finished()) {
            return;
        }

        // Subscribe before the stream opens so no early event is missed
        let events = self.bridge.subscribe();
        self.bridge.start(self.user.clone());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen(
            self.orchestrator.clone(),
            self.user.clone(),
            self.connectivity.subscribe(),
            events,
            cancel.clone(),
        ));
        *listener = Some(Listener { cancel, task });
        log::info!("[SyncSession] Started for {}", self.user);
    }

    /// Tear the session down: stop the stream and listener, refuse further
    /// remote work, drop in-memory snapshots and forget the credentials.
    ///
    /// Safe to call more than once.
    pub async fn sign_out(&self) {
        if self.signed_out.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[SyncSession] Signing out {}", self.user);

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.cancel.cancel();
            if let Err(e) = listener.task.await
                && e.is_panic()
            {
                log::error!("[SyncSession] Listener panicked: {}", e);
            }
        }

        self.bridge.stop().await;
        self.dispatcher.shutdown();
        self.resume.clear();
        self.next_up.clear();
        self.credentials.clear().await;
    }
}

async fn listen(
    orchestrator: SynchronizationOrchestrator,
    user: UserId,
    mut online: watch::Receiver<bool>,
    mut events: broadcast::Receiver<RealtimeEvent>,
    cancel: CancellationToken,
) {
    if *online.borrow_and_update() {
        replay(&orchestrator, &user).await;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                if *online.borrow_and_update() {
                    log::info!("[SyncSession] Server reachable again, replaying pending actions");
                    replay(&orchestrator, &user).await;
                }
            }
            event = events.recv() => match event {
                Ok(RealtimeEvent::UserDataChanged { entity_ids }) => {
                    if let ApiResult::Error(err) =
                        orchestrator.refresh_items(&user, &entity_ids).await
                    {
                        log::warn!("[SyncSession] Refresh after user data change failed: {}", err);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[SyncSession] Listener lagged, skipped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    log::debug!("[SyncSession] Listener stopped");
}

async fn replay(orchestrator: &SynchronizationOrchestrator, user: &UserId) {
    match orchestrator.replay_pending(user).await {
        ApiResult::Success(summary) if summary != Default::default() => {
            log::info!("[SyncSession] Replay finished: {:?}", summary);
        }
        ApiResult::Success(_) => {}
        ApiResult::Error(err) => log::warn!("[SyncSession] Replay failed: {}", err),
        ApiResult::Loading => {}
    }
}
