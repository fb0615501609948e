//! Shared fixtures for the ferrex-sync integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use ferrex_sync::config::SyncConfig;
use ferrex_sync::model::{CachedMediaItem, EntityId, MediaKind, UserId, UserLibrary};
use ferrex_sync::store::{LocalStore, MemoryStore};
use ferrex_sync::testing::{FakeRemoteApi, ScriptedEventSource, StreamScript};
use ferrex_sync::{
    ConnectivityMonitor, Credentials, RealtimeEventBridge, SyncSession,
    SynchronizationOrchestrator,
};
use tokio::sync::watch;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn id(raw: &str) -> EntityId {
    EntityId::new(raw).expect("valid entity id")
}

pub fn user(raw: &str) -> UserId {
    UserId::new(raw).expect("valid user id")
}

pub fn library(raw: &str, name: &str) -> UserLibrary {
    UserLibrary {
        id: id(raw),
        name: name.to_string(),
        collection_type: Some("movies".to_string()),
    }
}

/// A movie under `parent`, added on day `day` of January 2024.
pub fn movie(raw: &str, name: &str, parent: &str, day: u32) -> CachedMediaItem {
    let mut item = CachedMediaItem::new(id(raw), name, MediaKind::Movie);
    item.parent_id = Some(id(parent));
    item.runtime_ticks = Some(90 * 60 * 10_000_000);
    item.date_added = Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).single();
    item
}

pub fn config() -> SyncConfig {
    SyncConfig {
        server_url: "http://media.test:8096".to_string(),
        cache_dir: None,
        ..SyncConfig::default()
    }
}

/// A session wired to in-memory fakes.
pub struct Harness {
    pub user: UserId,
    pub api: Arc<FakeRemoteApi>,
    pub events: Arc<ScriptedEventSource>,
    pub store: Arc<dyn LocalStore>,
    pub credentials: Credentials,
    pub connectivity: ConnectivityMonitor,
    pub session: SyncSession,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), Vec::new())
    }

    pub fn with_scripts(scripts: Vec<StreamScript>) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), scripts)
    }

    pub fn with_store(store: Arc<dyn LocalStore>, scripts: Vec<StreamScript>) -> Self {
        init_logging();
        let user = user("u1");
        let api = Arc::new(FakeRemoteApi::new());
        let events = Arc::new(ScriptedEventSource::new(scripts));
        let credentials = Credentials::default();
        let connectivity = ConnectivityMonitor::new(true);

        let session = SyncSession::builder(user.clone(), config())
            .remote_api(api.clone())
            .local_store(Arc::clone(&store))
            .event_source(events.clone())
            .credentials(credentials.clone())
            .connectivity(connectivity.clone())
            .build()
            .expect("session builds");

        Self {
            user,
            api,
            events,
            store,
            credentials,
            connectivity,
            session,
        }
    }

    pub fn orchestrator(&self) -> &SynchronizationOrchestrator {
        self.session.orchestrator()
    }

    pub fn bridge(&self) -> &RealtimeEventBridge {
        self.session.bridge()
    }
}

/// Wait until `rx` holds a value matching `predicate`.
pub async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, predicate: F) -> T
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("sender dropped")
        .clone()
}

/// Poll `check` until it holds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
