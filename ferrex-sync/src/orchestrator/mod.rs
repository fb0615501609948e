//! Caller-facing synchronization surface.
//!
//! Mutations are applied optimistically under the `(user, entity, action)`
//! lock, queued as [`PendingAction`]s and confirmed by a low-priority remote
//! call that runs on the dispatcher, detached from the caller. Confirmations
//! of one key reach the server one at a time, and only for the latest
//! intent. Reads follow
//! cache-first rules and go to the server through the dispatcher.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use ferrex_sync_model::{
    ActionType, CachedMediaItem, EntityId, PendingAction, PendingKey, RealtimeEvent, UserData,
    UserId, UserLibrary,
};

use crate::api::{PlaybackReport, RemoteApi};
use crate::config::SnapshotConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::dispatcher::{DispatchHandle, Priority, RequestDispatcher, ServerKey};
use crate::error::SyncError;
use crate::pending::PendingActionQueue;
use crate::result::{ApiResult, safe_api_call};
use crate::snapshot::VolatileSnapshotStore;
use crate::store::{LibraryQuery, LocalCacheStore};

mod home;

pub use home::{HomeScreenData, LatestSection};

/// Collaborators the orchestrator is composed from.
#[derive(Debug, Clone)]
pub struct OrchestratorServices {
    /// Media server endpoints.
    pub api: Arc<dyn RemoteApi>,
    /// Durable item and library cache.
    pub cache: LocalCacheStore,
    /// Optimistic mutations awaiting confirmation.
    pub pending: PendingActionQueue,
    /// Runs every remote call by priority.
    pub dispatcher: RequestDispatcher,
    /// Decides between a server call and the offline fallback.
    pub connectivity: ConnectivityMonitor,
    /// Continue-watching list.
    pub resume: VolatileSnapshotStore<CachedMediaItem>,
    /// Next episode of each series in progress.
    pub next_up: VolatileSnapshotStore<CachedMediaItem>,
    /// Dispatcher lane every call of this orchestrator runs on.
    pub server_key: ServerKey,
    /// How many entries a snapshot refresh asks the server for.
    pub snapshots: SnapshotConfig,
}

/// How a queued mutation was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    /// Server accepted; the pending flag is cleared.
    Committed,
    /// A newer intent for the same key took over.
    Superseded,
    /// Server rejected; the row is back to its rollback base.
    RolledBack(SyncError),
    /// Server unreachable; the action stays queued.
    Deferred(SyncError),
}

/// Outcome counts of [`SynchronizationOrchestrator::replay_pending`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Accepted by the server.
    pub committed: usize,
    /// Replaced by a newer intent before or while being sent.
    pub superseded: usize,
    /// Rejected by the server and restored locally.
    pub rolled_back: usize,
    /// Still queued, usually because the server was unreachable.
    pub deferred: usize,
}

/// Offline-first read and write surface over one server.
#[derive(Clone)]
pub struct SynchronizationOrchestrator {
    inner: Arc<OrchestratorServices>,
}

impl fmt::Debug for SynchronizationOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizationOrchestrator")
            .field("server_key", &self.inner.server_key)
            .field("online", &self.inner.connectivity.is_online())
            .finish_non_exhaustive()
    }
}

impl SynchronizationOrchestrator {
    /// Build over the given collaborators.
    pub fn new(services: OrchestratorServices) -> Self {
        Self {
            inner: Arc::new(services),
        }
    }

    /// The collaborators this orchestrator was built from.
    pub fn services(&self) -> &OrchestratorServices {
        &self.inner
    }

    /// Run `call` on the dispatcher. Offline it resolves to `cached`, or
    /// `Error(Network)` when there is nothing cached.
    fn remote<T, F, Fut>(
        &self,
        priority: Priority,
        cached: Option<T>,
        call: F,
    ) -> DispatchHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<OrchestratorServices>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner
            .dispatcher
            .enqueue(priority, self.inner.server_key.clone(), move || async move {
                let connectivity = inner.connectivity.clone();
                safe_api_call(&connectivity, cached, || call(inner)).await
            })
    }

    // ----- Mutations -------------------------------------------------------

    /// Apply a favorite change locally and queue it, without contacting
    /// the server beyond fetching an uncached item.
    pub async fn set_favorite_local(
        &self,
        user: &UserId,
        id: &EntityId,
        favorite: bool,
    ) -> ApiResult<CachedMediaItem> {
        self.apply_local(user, id, ActionType::Favorite, favorite)
            .await
            .map(|(_, item)| item)
            .into()
    }

    /// Local-only counterpart of [`mark_as_played`](Self::mark_as_played).
    pub async fn set_played_local(
        &self,
        user: &UserId,
        id: &EntityId,
        played: bool,
    ) -> ApiResult<CachedMediaItem> {
        self.apply_local(user, id, ActionType::Played, played)
            .await
            .map(|(_, item)| item)
            .into()
    }

    /// Local-only counterpart of [`toggle_watchlist`](Self::toggle_watchlist).
    pub async fn set_watchlist_local(
        &self,
        user: &UserId,
        id: &EntityId,
        watchlist: bool,
    ) -> ApiResult<CachedMediaItem> {
        self.apply_local(user, id, ActionType::Watchlist, watchlist)
            .await
            .map(|(_, item)| item)
            .into()
    }

    /// Set the favorite flag optimistically and wait for the server.
    ///
    /// A rejection, including a network failure, restores the last
    /// confirmed state and is returned as the error.
    pub async fn toggle_favorite(
        &self,
        user: &UserId,
        id: &EntityId,
        favorite: bool,
    ) -> ApiResult<CachedMediaItem> {
        self.mutate(user, id, ActionType::Favorite, favorite).await
    }

    /// Marking played bumps the play count and stamps the date; either way
    /// the resume position is reset.
    pub async fn mark_as_played(
        &self,
        user: &UserId,
        id: &EntityId,
        played: bool,
    ) -> ApiResult<CachedMediaItem> {
        self.mutate(user, id, ActionType::Played, played).await
    }

    /// Set the watchlist flag; same confirmation rules as
    /// [`toggle_favorite`](Self::toggle_favorite).
    pub async fn toggle_watchlist(
        &self,
        user: &UserId,
        id: &EntityId,
        watchlist: bool,
    ) -> ApiResult<CachedMediaItem> {
        self.mutate(user, id, ActionType::Watchlist, watchlist)
            .await
    }

    async fn mutate(
        &self,
        user: &UserId,
        id: &EntityId,
        action_type: ActionType,
        value: bool,
    ) -> ApiResult<CachedMediaItem> {
        let (action, _) = match self.apply_local(user, id, action_type, value).await {
            Ok(applied) => applied,
            Err(err) => return ApiResult::Error(err),
        };

        let entity_id = action.entity_id.clone();
        let outcome = self.confirm(action, false).await;
        match outcome {
            ApiResult::Success(Confirmation::Committed | Confirmation::Superseded) => {
                match self.inner.cache.get(user, &entity_id).await {
                    Ok(Some(item)) => ApiResult::Success(item),
                    Ok(None) => ApiResult::Error(SyncError::Validation(format!(
                        "item {entity_id} is no longer cached"
                    ))),
                    Err(err) => ApiResult::Error(err.into()),
                }
            }
            ApiResult::Success(Confirmation::RolledBack(err) | Confirmation::Deferred(err)) => {
                ApiResult::Error(err)
            }
            ApiResult::Error(err) => ApiResult::Error(err),
            ApiResult::Loading => ApiResult::Loading,
        }
    }

    /// Optimistic step: write the new value with its pending flag and
    /// upsert the queued action, all under the key lock.
    async fn apply_local(
        &self,
        user: &UserId,
        id: &EntityId,
        action_type: ActionType,
        value: bool,
    ) -> Result<(PendingAction, CachedMediaItem), SyncError> {
        let canonical = self.ensure_cached(user, id).await?.id;
        let key = PendingKey::new(user.clone(), canonical.clone(), action_type);
        let _guard = self.inner.pending.lock(&key).await;

        let existing = self.inner.pending.get(&key).await?;
        let mut base: Option<UserData> = None;
        let row = self
            .inner
            .cache
            .update_user_data(user, &canonical, |data| {
                base = Some(match existing {
                    // Keep the last confirmed state across repeated toggles
                    Some(previous) => previous.rollback,
                    None => data.clone(),
                });
                action_type.apply(data, value, Utc::now());
                action_type.set_pending(data, true);
            })
            .await?;

        let (Some(row), Some(base)) = (row, base) else {
            return Err(SyncError::Validation(format!(
                "item {canonical} disappeared from the cache"
            )));
        };

        let action = PendingAction::new(user.clone(), canonical, action_type, value, base);
        self.inner.pending.upsert(&action).await?;
        log::debug!(
            "[Orchestrator] Applied {} = {} to {} locally",
            action_type,
            value,
            action.entity_id
        );
        Ok((action, row.resolved()))
    }

    /// Raw cached row for `id`, fetching and inserting it when missing.
    async fn ensure_cached(
        &self,
        user: &UserId,
        id: &EntityId,
    ) -> Result<CachedMediaItem, SyncError> {
        if let Some(item) = self.inner.cache.get_raw(user, id).await? {
            return Ok(item);
        }

        log::debug!("[Orchestrator] {} not cached, fetching detail", id);
        let user = user.clone();
        let id = id.clone();
        self.remote(Priority::High, None, move |inner| async move {
            let item = inner.api.get_item(&user, &id).await?;
            inner.cache.upsert(&user, vec![item.clone()]).await?;
            let stored = inner.cache.get_raw(&user, &item.id).await?;
            Ok(stored.unwrap_or(item))
        })
        .await
        .into_result()
    }

    /// Dispatch the remote call for `action` and settle it.
    ///
    /// With `defer_on_network` a network failure leaves the action queued
    /// for a later replay instead of rolling it back.
    fn confirm(
        &self,
        action: PendingAction,
        defer_on_network: bool,
    ) -> DispatchHandle<Confirmation> {
        let inner = Arc::clone(&self.inner);
        self.inner.dispatcher.enqueue(
            Priority::Low,
            self.inner.server_key.clone(),
            move || async move { ApiResult::from(settle(&inner, action, defer_on_network).await) },
        )
    }

    /// Re-dispatch every action queued for `user`, oldest first.
    ///
    /// Network failures keep the action for the next replay; any other
    /// failure is final and rolls back.
    pub async fn replay_pending(&self, user: &UserId) -> ApiResult<ReplaySummary> {
        let actions = match self.inner.pending.get_all().await {
            Ok(actions) => actions,
            Err(err) => return ApiResult::Error(err.into()),
        };
        let handles: Vec<_> = actions
            .into_iter()
            .filter(|action| &action.user_id == user)
            .map(|action| self.confirm(action, true))
            .collect();
        if handles.is_empty() {
            return ApiResult::Success(ReplaySummary::default());
        }

        log::info!("[Orchestrator] Replaying {} pending action(s)", handles.len());
        let mut summary = ReplaySummary::default();
        for outcome in futures::future::join_all(handles).await {
            match outcome {
                ApiResult::Success(Confirmation::Committed) => summary.committed += 1,
                ApiResult::Success(Confirmation::Superseded) => summary.superseded += 1,
                ApiResult::Success(Confirmation::RolledBack(_)) => summary.rolled_back += 1,
                ApiResult::Success(Confirmation::Deferred(_)) => summary.deferred += 1,
                ApiResult::Error(err) => {
                    log::warn!("[Orchestrator] Replay task failed: {}", err);
                    summary.deferred += 1;
                }
                ApiResult::Loading => summary.deferred += 1,
            }
        }
        ApiResult::Success(summary)
    }

    // ----- Reads -----------------------------------------------------------

    /// Children of a library or folder.
    ///
    /// The default view is served from cache when present; other views,
    /// forced refreshes and cache misses go to the server, and the fetched
    /// scope replaces exactly what it covers.
    pub async fn get_library_items(
        &self,
        user: &UserId,
        query: &LibraryQuery,
        force_refresh: bool,
    ) -> ApiResult<Vec<CachedMediaItem>> {
        let cached = match self.inner.cache.query(user, query).await {
            Ok(items) => items,
            Err(err) => {
                log::warn!(
                    "[Orchestrator] Cache read failed for {}: {}",
                    query.parent_id,
                    err
                );
                Vec::new()
            }
        };

        if self.inner.connectivity.is_online()
            && !force_refresh
            && !cached.is_empty()
            && query.is_default_view()
        {
            log::debug!(
                "[Orchestrator] Cache hit for {} ({} items)",
                query.parent_id,
                cached.len()
            );
            return ApiResult::Success(cached);
        }

        let user = user.clone();
        let query = query.clone();
        let cached = (!cached.is_empty()).then_some(cached);
        self.remote(Priority::High, cached, move |inner| async move {
            let page = inner.api.get_items(&user, &query).await?;
            log::debug!(
                "[Orchestrator] Fetched {} of {} items under {}",
                page.items.len(),
                page.total_count,
                query.parent_id
            );
            Ok(inner
                .cache
                .replace_scope(&user, &query.scope(), page.items)
                .await?)
        })
        .await
    }

    /// Libraries visible to `user`, cached after every successful fetch.
    pub async fn get_user_libraries(
        &self,
        user: &UserId,
        force_refresh: bool,
    ) -> ApiResult<Vec<UserLibrary>> {
        let cached = match self.inner.cache.libraries(user).await {
            Ok(libraries) => libraries.filter(|l| !l.is_empty()),
            Err(err) => {
                log::warn!("[Orchestrator] Cached libraries unreadable: {}", err);
                None
            }
        };

        if let Some(libraries) = &cached
            && self.inner.connectivity.is_online()
            && !force_refresh
        {
            return ApiResult::Success(libraries.clone());
        }

        let user = user.clone();
        self.remote(Priority::High, cached, move |inner| async move {
            let libraries = inner.api.get_user_libraries(&user).await?;
            inner.cache.put_libraries(&user, &libraries).await?;
            Ok(libraries)
        })
        .await
    }

    /// One item, from cache unless forced or missing.
    pub async fn get_item(
        &self,
        user: &UserId,
        id: &EntityId,
        force_refresh: bool,
    ) -> ApiResult<CachedMediaItem> {
        let cached = self.inner.cache.get(user, id).await.unwrap_or_else(|err| {
            log::warn!("[Orchestrator] Cached item {} unreadable: {}", id, err);
            None
        });

        if let Some(item) = &cached
            && self.inner.connectivity.is_online()
            && !force_refresh
        {
            return ApiResult::Success(item.clone());
        }

        let user = user.clone();
        let id = id.clone();
        self.remote(Priority::High, cached, move |inner| async move {
            let item = inner.api.get_item(&user, &id).await?;
            let mut stored = inner.cache.upsert(&user, vec![item]).await?;
            stored
                .pop()
                .ok_or_else(|| SyncError::Unknown(format!("item {id} was not stored")).into())
        })
        .await
    }

    /// Continue-watching list, served from its snapshot while fresh.
    pub async fn get_resume_items(
        &self,
        user: &UserId,
        limit: usize,
        force_refresh: bool,
    ) -> ApiResult<Vec<CachedMediaItem>> {
        let fetch_limit = limit.max(self.inner.snapshots.resume_limit);
        let user = user.clone();
        self.snapshot_read(&self.inner.resume, limit, fetch_limit, force_refresh, move |this| {
            this.remote(Priority::High, None, move |inner| async move {
                let items = inner.api.get_resume_items(&user, fetch_limit).await?;
                Ok(inner.cache.upsert(&user, items).await?)
            })
        })
        .await
    }

    /// Next-up episodes, served from their snapshot while fresh.
    pub async fn get_next_up_episodes(
        &self,
        user: &UserId,
        limit: usize,
        force_refresh: bool,
    ) -> ApiResult<Vec<CachedMediaItem>> {
        let fetch_limit = limit.max(self.inner.snapshots.next_up_limit);
        let user = user.clone();
        self.snapshot_read(&self.inner.next_up, limit, fetch_limit, force_refresh, move |this| {
            this.remote(Priority::High, None, move |inner| async move {
                let items = inner.api.get_next_up(&user, fetch_limit).await?;
                Ok(inner.cache.upsert(&user, items).await?)
            })
        })
        .await
    }

    async fn snapshot_read<F>(
        &self,
        store: &VolatileSnapshotStore<CachedMediaItem>,
        limit: usize,
        fetch_limit: usize,
        force_refresh: bool,
        fetch: F,
    ) -> ApiResult<Vec<CachedMediaItem>>
    where
        F: FnOnce(&Self) -> DispatchHandle<Vec<CachedMediaItem>>,
    {
        if !force_refresh && store.can_serve(limit) {
            log::debug!("[Orchestrator] Serving {} from snapshot", store.name());
            return ApiResult::Success(store.snapshot(limit));
        }

        if !self.inner.connectivity.is_online() {
            let current = store.snapshot(limit);
            return if current.is_empty() {
                ApiResult::Error(SyncError::offline())
            } else {
                ApiResult::Success(current)
            };
        }

        store
            .request_refresh(limit, fetch_limit, || fetch(self))
            .await
    }

    /// Re-fetch the given items and write them through to the cache.
    ///
    /// Items that fail are skipped; the call only fails when none could be
    /// refreshed.
    pub async fn refresh_items(
        &self,
        user: &UserId,
        ids: &[EntityId],
    ) -> ApiResult<Vec<CachedMediaItem>> {
        if ids.is_empty() {
            return ApiResult::Success(Vec::new());
        }

        let user = user.clone();
        let ids = ids.to_vec();
        self.remote(Priority::Low, None, move |inner| async move {
            let mut refreshed = Vec::with_capacity(ids.len());
            let mut first_error = None;
            for id in &ids {
                match inner.api.get_item(&user, id).await {
                    Ok(item) => refreshed.push(item),
                    Err(err) => {
                        log::warn!("[Orchestrator] Failed to refresh {}: {:#}", id, err);
                        first_error.get_or_insert(err);
                    }
                }
            }
            match first_error {
                Some(err) if refreshed.is_empty() => Err(err),
                _ => Ok(inner.cache.upsert(&user, refreshed).await?),
            }
        })
        .await
    }

    // ----- Playback --------------------------------------------------------

    /// Report that playback began; nothing changes locally.
    pub async fn report_playback_start(
        &self,
        user: &UserId,
        report: PlaybackReport,
    ) -> ApiResult<()> {
        let user = user.clone();
        self.remote(Priority::High, None, move |inner| async move {
            inner.api.report_playback_start(&user, &report).await
        })
        .await
    }

    /// Records the position locally, then reports it at low priority.
    pub async fn report_playback_progress(
        &self,
        user: &UserId,
        report: PlaybackReport,
    ) -> ApiResult<()> {
        self.record_position(
            user,
            RealtimeEvent::Progress {
                entity_id: report.item_id.clone(),
                position_ticks: report.position_ticks,
            },
        )
        .await;

        let user = user.clone();
        self.remote(Priority::Low, None, move |inner| async move {
            inner.api.report_playback_progress(&user, &report).await
        })
        .await
    }

    /// Records the final position and invalidates next-up, then reports.
    pub async fn report_playback_stopped(
        &self,
        user: &UserId,
        report: PlaybackReport,
    ) -> ApiResult<()> {
        self.record_position(
            user,
            RealtimeEvent::Stop {
                entity_id: report.item_id.clone(),
                position_ticks: report.position_ticks,
            },
        )
        .await;
        self.inner.next_up.invalidate();

        let user = user.clone();
        self.remote(Priority::High, None, move |inner| async move {
            inner.api.report_playback_stopped(&user, &report).await
        })
        .await
    }

    async fn record_position(&self, user: &UserId, event: RealtimeEvent) {
        let (RealtimeEvent::Progress {
            entity_id,
            position_ticks,
        }
        | RealtimeEvent::Stop {
            entity_id,
            position_ticks,
        }) = &event
        else {
            return;
        };

        if let Err(err) = self
            .inner
            .cache
            .update_position(user, entity_id, *position_ticks)
            .await
        {
            log::warn!(
                "[Orchestrator] Failed to record position for {}: {}",
                entity_id,
                err
            );
        }
        self.inner.resume.handle(&event);
    }
}

/// Remote call for one queued action.
async fn send_mutation(
    api: &dyn RemoteApi,
    action: &PendingAction,
) -> anyhow::Result<UserData> {
    let (user, id, value) = (&action.user_id, &action.entity_id, action.new_value);
    match action.action_type {
        ActionType::Favorite => api.set_favorite(user, id, value).await,
        ActionType::Played => api.set_played(user, id, value).await,
        ActionType::Watchlist => api.set_watchlist(user, id, value).await,
    }
}

async fn settle(
    inner: &OrchestratorServices,
    action: PendingAction,
    defer_on_network: bool,
) -> Result<Confirmation, SyncError> {
    let key = action.key();
    let _wire = inner.pending.lock_remote(&key).await;

    // A newer intent carries its own value to the server
    let current = inner.pending.get(&key).await?;
    if current.is_none_or(|current| current.intent_id != action.intent_id) {
        log::debug!("[Orchestrator] {} superseded before sending", key);
        return Ok(Confirmation::Superseded);
    }

    let outcome = safe_api_call(&inner.connectivity, None, || {
        send_mutation(inner.api.as_ref(), &action)
    })
    .await;

    match outcome {
        ApiResult::Success(confirmed) => commit(inner, &action, &confirmed).await,
        ApiResult::Error(err) if defer_on_network && err.is_network() => {
            log::info!("[Orchestrator] Server unreachable, keeping {} queued", key);
            Ok(Confirmation::Deferred(err))
        }
        ApiResult::Error(err) => roll_back(inner, &action, err).await,
        ApiResult::Loading => {
            roll_back(
                inner,
                &action,
                SyncError::Unknown("mutation resolved without a result".to_string()),
            )
            .await
        }
    }
}

async fn commit(
    inner: &OrchestratorServices,
    action: &PendingAction,
    confirmed: &UserData,
) -> Result<Confirmation, SyncError> {
    let key = action.key();
    let _guard = inner.pending.lock(&key).await;

    match inner.pending.get(&key).await? {
        Some(current) if current.intent_id == action.intent_id => {
            inner
                .cache
                .update_user_data(&action.user_id, &action.entity_id, |data| {
                    action.action_type.restore(data, confirmed);
                    action.action_type.set_pending(data, false);
                })
                .await?;
            inner.pending.delete(&key).await?;
            if action.action_type == ActionType::Played {
                inner.resume.invalidate();
                inner.next_up.invalidate();
            }
            log::debug!("[Orchestrator] Committed {}", key);
            Ok(Confirmation::Committed)
        }
        Some(mut newer) => {
            // The newer intent now rolls back to what the server confirmed
            newer.action_type.restore(&mut newer.rollback, confirmed);
            inner.pending.upsert(&newer).await?;
            log::debug!("[Orchestrator] {} superseded, folded confirmed state", key);
            Ok(Confirmation::Superseded)
        }
        None => {
            log::debug!("[Orchestrator] {} no longer queued, nothing to commit", key);
            Ok(Confirmation::Superseded)
        }
    }
}

async fn roll_back(
    inner: &OrchestratorServices,
    action: &PendingAction,
    err: SyncError,
) -> Result<Confirmation, SyncError> {
    let key = action.key();
    let _guard = inner.pending.lock(&key).await;

    match inner.pending.get(&key).await? {
        Some(current) if current.intent_id == action.intent_id => {
            log::warn!("[Orchestrator] Rolling back {}: {}", key, err);
            inner
                .cache
                .update_user_data(&action.user_id, &action.entity_id, |data| {
                    action.action_type.restore(data, &action.rollback);
                    action.action_type.set_pending(data, false);
                })
                .await?;
            inner.pending.delete(&key).await?;
            Ok(Confirmation::RolledBack(err))
        }
        _ => {
            log::debug!(
                "[Orchestrator] {} failed but a newer intent is in charge: {}",
                key,
                err
            );
            Ok(Confirmation::Superseded)
        }
    }
}
