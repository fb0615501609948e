//! In-memory snapshots of short, order-sensitive lists (resume items,
//! next-up episodes).
//!
//! A snapshot is refreshed wholesale from the server and otherwise only
//! patched by realtime events. Staleness is explicit: once invalidated, a
//! snapshot is not served again until a refresh that started after the
//! invalidation succeeds.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use ferrex_sync_model::{CachedMediaItem, EntityId, RealtimeEvent};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::error::SyncError;
use crate::result::ApiResult;

/// An entry a [`VolatileSnapshotStore`] can hold.
pub trait SnapshotItem: Clone + Send + Sync + 'static {
    fn entity_id(&self) -> &EntityId;

    /// Whether `id` names this entry in any id space.
    fn is_identified_by(&self, id: &EntityId) -> bool {
        self.entity_id() == id
    }

    fn set_position(&mut self, position_ticks: i64);

    /// The value handed out to readers.
    fn read_view(&self) -> Self {
        self.clone()
    }
}

impl SnapshotItem for CachedMediaItem {
    fn entity_id(&self) -> &EntityId {
        &self.id
    }

    fn is_identified_by(&self, id: &EntityId) -> bool {
        CachedMediaItem::is_identified_by(self, id)
    }

    fn set_position(&mut self, position_ticks: i64) {
        self.user_data.playback_position_ticks = position_ticks.max(0);
    }

    fn read_view(&self) -> Self {
        self.resolved()
    }
}

type RefreshFuture<T> = Shared<BoxFuture<'static, Result<Vec<T>, SyncError>>>;

struct InFlight<T> {
    ticket: u64,
    refresh: RefreshFuture<T>,
}

struct SnapshotState<T> {
    items: Vec<T>,
    capacity: usize,
    initialized: bool,
    stale: bool,
    /// Bumped by every invalidation.
    generation: u64,
    /// Bumped by `clear`; results of refreshes from an older epoch are dropped.
    epoch: u64,
    /// Source of refresh tickets; survives `clear`.
    next_ticket: u64,
    in_flight: Option<InFlight<T>>,
}

impl<T> Default for SnapshotState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            capacity: 0,
            initialized: false,
            stale: false,
            generation: 0,
            epoch: 0,
            next_ticket: 0,
            in_flight: None,
        }
    }
}

impl<T: SnapshotItem> SnapshotState<T> {
    fn replace(&mut self, items: Vec<T>, limit: usize) {
        let mut seen = HashSet::new();
        self.items = items
            .into_iter()
            .filter(|item| seen.insert(item.entity_id().clone()))
            .take(limit)
            .collect();
        self.capacity = limit;
        self.initialized = true;
    }

    fn position_of(&self, id: &EntityId) -> Option<usize> {
        self.items.iter().position(|item| item.is_identified_by(id))
    }

    fn invalidate(&mut self) {
        self.stale = true;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Releases the in-flight slot when a refresh task ends, including by
/// panic. A slot already taken over by a newer refresh is left alone.
struct InFlightSlot<T> {
    state: Arc<Mutex<SnapshotState<T>>>,
    ticket: u64,
}

impl<T> Drop for InFlightSlot<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.ticket == self.ticket)
        {
            state.in_flight = None;
        }
    }
}

/// Capacity-bounded, invalidatable, refresh-coalescing ordered list.
pub struct VolatileSnapshotStore<T> {
    name: &'static str,
    state: Arc<Mutex<SnapshotState<T>>>,
}

impl<T> Clone for VolatileSnapshotStore<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for VolatileSnapshotStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VolatileSnapshotStore")
            .field("name", &self.name)
            .field("len", &state.items.len())
            .field("capacity", &state.capacity)
            .field("stale", &state.stale)
            .field("refreshing", &state.in_flight.is_some())
            .finish()
    }
}

impl<T: SnapshotItem> VolatileSnapshotStore<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(SnapshotState::default())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Seed from a full fetch: first occurrence of an id wins, at most
    /// `limit` entries are kept and the snapshot becomes fresh.
    pub fn set_initial(&self, items: Vec<T>, limit: usize) {
        let mut state = self.state.lock();
        state.replace(items, limit);
        state.stale = false;
        log::debug!(
            "[Snapshot:{}] Seeded with {} item(s), capacity {}",
            self.name,
            state.items.len(),
            limit
        );
    }

    /// Up to `limit` cached entries, in order. Never touches the network.
    pub fn snapshot(&self, limit: usize) -> Vec<T> {
        self.state
            .lock()
            .items
            .iter()
            .take(limit)
            .map(SnapshotItem::read_view)
            .collect()
    }

    pub fn can_serve(&self, limit: usize) -> bool {
        let state = self.state.lock();
        state.initialized && !state.stale && limit <= state.capacity
    }

    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if !state.stale {
            log::debug!("[Snapshot:{}] Invalidated", self.name);
        }
        state.invalidate();
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Refresh through `fetcher`, coalescing with any refresh in flight.
    ///
    /// Only the first caller's `fetcher` runs and the snapshot keeps up to
    /// its `capacity` entries; every waiter gets the shared result cut to
    /// its own `limit`. The fetch runs on its own task, so it completes
    /// even if every caller goes away. On failure the current snapshot is
    /// kept as is. Must be called from within a tokio runtime.
    pub async fn request_refresh<F, Fut>(
        &self,
        limit: usize,
        capacity: usize,
        fetcher: F,
    ) -> ApiResult<Vec<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<Vec<T>>> + Send + 'static,
    {
        let refresh = {
            let mut state = self.state.lock();
            match state.in_flight.as_ref().map(|f| f.refresh.clone()) {
                Some(refresh) => {
                    log::debug!("[Snapshot:{}] Joining in-flight refresh", self.name);
                    refresh
                }
                None => {
                    let ticket = state.next_ticket;
                    state.next_ticket = ticket.wrapping_add(1);
                    let refresh =
                        self.start_refresh(&state, ticket, capacity.max(limit), fetcher());
                    state.in_flight = Some(InFlight {
                        ticket,
                        refresh: refresh.clone(),
                    });
                    refresh
                }
            }
        };

        match refresh.await {
            Ok(items) => ApiResult::Success(items.into_iter().take(limit).collect()),
            Err(err) => ApiResult::Error(err),
        }
    }

    fn start_refresh<Fut>(
        &self,
        state: &SnapshotState<T>,
        ticket: u64,
        capacity: usize,
        fetch: Fut,
    ) -> RefreshFuture<T>
    where
        Fut: Future<Output = ApiResult<Vec<T>>> + Send + 'static,
    {
        let generation = state.generation;
        let epoch = state.epoch;
        let inner = Arc::clone(&self.state);
        let slot = InFlightSlot {
            state: Arc::clone(&self.state),
            ticket,
        };
        let name = self.name;
        log::debug!("[Snapshot:{}] Starting refresh (capacity {})", name, capacity);

        let task = tokio::spawn(async move {
            let _slot = slot;
            let outcome = fetch.await;
            let mut state = inner.lock();
            match outcome {
                ApiResult::Success(items) => {
                    if state.epoch != epoch {
                        log::debug!("[Snapshot:{}] Dropping refresh from a cleared session", name);
                        return Ok(items);
                    }
                    state.replace(items, capacity);
                    // An invalidation during the fetch means the data may
                    // already be outdated.
                    state.stale = state.generation != generation;
                    Ok(state.items.iter().map(SnapshotItem::read_view).collect())
                }
                ApiResult::Error(err) => {
                    log::warn!("[Snapshot:{}] Refresh failed, keeping current data: {}", name, err);
                    Err(err)
                }
                ApiResult::Loading => Err(SyncError::Unknown(
                    "refresh fetcher resolved without a result".to_string(),
                )),
            }
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(SyncError::Unknown(format!("snapshot refresh task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }

    /// Apply one realtime event in place. Returns whether anything changed.
    pub fn handle(&self, event: &RealtimeEvent) -> bool {
        let mut state = self.state.lock();
        match event {
            RealtimeEvent::Progress {
                entity_id,
                position_ticks,
            } => match state.position_of(entity_id) {
                Some(index) => {
                    state.items[index].set_position(*position_ticks);
                    true
                }
                None => false,
            },
            RealtimeEvent::Stop {
                entity_id,
                position_ticks,
            } => match state.position_of(entity_id) {
                Some(index) => {
                    state.items[index].set_position(*position_ticks);
                    true
                }
                None => {
                    // Order may change to include the item
                    state.invalidate();
                    true
                }
            },
            RealtimeEvent::UserDataChanged { entity_ids } => {
                if entity_ids.iter().any(|id| state.position_of(id).is_some()) {
                    state.invalidate();
                    true
                } else {
                    false
                }
            }
            RealtimeEvent::LibraryChanged { .. } => {
                state.invalidate();
                true
            }
        }
    }

    /// Drop everything, including the result of any refresh in flight.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let epoch = state.epoch.wrapping_add(1);
        let next_ticket = state.next_ticket;
        *state = SnapshotState {
            epoch,
            next_ticket,
            ..SnapshotState::default()
        };
        log::debug!("[Snapshot:{}] Cleared", self.name);
    }
}
