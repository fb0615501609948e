use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use ferrex_sync_model::{
    ActionType, CachedMediaItem, EntityId, MediaKind, UserData, UserId, UserLibrary,
};

use super::{ItemFilter, LocalStore};
use crate::error::StoreResult;
use crate::locks::KeyedLocks;

/// Ordering applied to library listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ItemSort {
    #[default]
    Name,
    DateAdded,
    /// Season then episode number, for episode lists.
    Index,
}

/// A request for the children of one library or folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryQuery {
    pub parent_id: EntityId,
    pub kinds: Vec<MediaKind>,
    pub sort: ItemSort,
    pub descending: bool,
    pub start_index: usize,
    pub limit: Option<usize>,
}

impl LibraryQuery {
    pub fn new(parent_id: EntityId) -> Self {
        Self {
            parent_id,
            kinds: Vec::new(),
            sort: ItemSort::default(),
            descending: false,
            start_index: 0,
            limit: None,
        }
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = MediaKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn sorted_by(mut self, sort: ItemSort, descending: bool) -> Self {
        self.sort = sort;
        self.descending = descending;
        self
    }

    pub fn page(mut self, start_index: usize, limit: usize) -> Self {
        self.start_index = start_index;
        self.limit = Some(limit);
        self
    }

    /// No filter or sort override.
    pub fn is_default_view(&self) -> bool {
        self.kinds.is_empty() && self.sort == ItemSort::Name && !self.descending
    }

    /// The scope a remote answer to this query covers.
    ///
    /// Only an unfiltered, unpaged listing is the complete set of the
    /// parent's children.
    pub fn scope(&self) -> CacheScope {
        CacheScope {
            parent_id: Some(self.parent_id.clone()),
            complete: self.is_default_view() && self.start_index == 0 && self.limit.is_none(),
        }
    }

    fn filter(&self) -> ItemFilter {
        ItemFilter {
            parent_id: Some(self.parent_id.clone()),
            kinds: self.kinds.clone(),
        }
    }
}

/// Which cached rows a batch of fetched items replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheScope {
    pub parent_id: Option<EntityId>,
    /// When set, rows of `parent_id` absent from the batch are removed.
    pub complete: bool,
}

impl CacheScope {
    /// Upsert only; nothing is removed.
    pub fn partial() -> Self {
        Self {
            parent_id: None,
            complete: false,
        }
    }
}

/// Adapter over a [`LocalStore`] adding id resolution, per-row atomic
/// updates, scoped replacement and read-time derivation.
///
/// Everything read through the adapter is resolved
/// ([`CachedMediaItem::resolved`]); everything written is raw.
#[derive(Clone)]
pub struct LocalCacheStore {
    store: Arc<dyn LocalStore>,
    rows: KeyedLocks<(UserId, EntityId)>,
}

impl fmt::Debug for LocalCacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCacheStore")
            .field("store", &self.store)
            .field("locked_rows", &self.rows.len())
            .finish()
    }
}

impl LocalCacheStore {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            rows: KeyedLocks::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Raw row for `id` in either id space.
    pub async fn get_raw(
        &self,
        user: &UserId,
        id: &EntityId,
    ) -> StoreResult<Option<CachedMediaItem>> {
        if let Some(item) = self.store.get_item(user, id).await? {
            return Ok(Some(item));
        }
        self.store.find_by_source_id(user, id).await
    }

    pub async fn get(&self, user: &UserId, id: &EntityId) -> StoreResult<Option<CachedMediaItem>> {
        Ok(self.get_raw(user, id).await?.map(|item| item.resolved()))
    }

    pub async fn get_many(
        &self,
        user: &UserId,
        ids: &[EntityId],
    ) -> StoreResult<Vec<CachedMediaItem>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = self.get(user, id).await? {
                out.push(item);
            }
        }
        Ok(out)
    }

    /// Filtered, sorted and paged view of a parent's cached children.
    pub async fn query(
        &self,
        user: &UserId,
        query: &LibraryQuery,
    ) -> StoreResult<Vec<CachedMediaItem>> {
        let mut rows = self.store.query_items(user, &query.filter()).await?;
        rows.sort_by(|a, b| compare(query.sort, a, b));
        if query.descending {
            rows.reverse();
        }
        Ok(rows
            .into_iter()
            .skip(query.start_index)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|item| item.resolved())
            .collect())
    }

    /// Write fetched items, keeping any optimistic state still pending on
    /// existing rows. Returns the resolved rows as stored.
    pub async fn upsert(
        &self,
        user: &UserId,
        items: Vec<CachedMediaItem>,
    ) -> StoreResult<Vec<CachedMediaItem>> {
        let mut out = Vec::with_capacity(items.len());
        for mut item in items {
            let _row = self.rows.lock(&(user.clone(), item.id.clone())).await;
            if let Some(existing) = self.store.get_item(user, &item.id).await? {
                preserve_pending(&mut item.user_data, &existing.user_data);
            }
            self.store
                .upsert_items(user, std::slice::from_ref(&item))
                .await?;
            out.push(item.resolved());
        }
        Ok(out)
    }

    /// Replace exactly `scope` with `items`.
    ///
    /// A complete scope also removes cached children of the parent that the
    /// server no longer lists, unless they carry pending optimistic state.
    /// Rows outside the scope are never touched.
    pub async fn replace_scope(
        &self,
        user: &UserId,
        scope: &CacheScope,
        items: Vec<CachedMediaItem>,
    ) -> StoreResult<Vec<CachedMediaItem>> {
        let fetched: HashSet<EntityId> = items.iter().map(|i| i.id.clone()).collect();
        let stored = self.upsert(user, items).await?;

        if scope.complete
            && let Some(parent) = &scope.parent_id
        {
            let vanished: Vec<EntityId> = self
                .store
                .query_items(user, &ItemFilter::children_of(parent.clone()))
                .await?
                .into_iter()
                .filter(|row| !fetched.contains(&row.id) && !row.user_data.has_pending())
                .map(|row| row.id)
                .collect();
            if !vanished.is_empty() {
                log::debug!(
                    "[LocalCache] Removing {} vanished row(s) under {}",
                    vanished.len(),
                    parent
                );
                self.store.delete_items(user, &vanished).await?;
            }
        }

        Ok(stored)
    }

    /// Atomically read, modify and write one row's [`UserData`].
    ///
    /// Returns the raw row after the update, or `None` when nothing is
    /// cached for `id`.
    pub async fn update_user_data<F>(
        &self,
        user: &UserId,
        id: &EntityId,
        update: F,
    ) -> StoreResult<Option<CachedMediaItem>>
    where
        F: FnOnce(&mut UserData),
    {
        let Some(canonical) = self.get_raw(user, id).await?.map(|item| item.id) else {
            return Ok(None);
        };

        let _row = self.rows.lock(&(user.clone(), canonical.clone())).await;
        let Some(mut item) = self.store.get_item(user, &canonical).await? else {
            return Ok(None);
        };
        update(&mut item.user_data);
        self.store
            .upsert_items(user, std::slice::from_ref(&item))
            .await?;
        Ok(Some(item))
    }

    pub async fn update_position(
        &self,
        user: &UserId,
        id: &EntityId,
        position_ticks: i64,
    ) -> StoreResult<Option<CachedMediaItem>> {
        self.update_user_data(user, id, |data| {
            data.playback_position_ticks = position_ticks.max(0);
        })
        .await
    }

    pub async fn libraries(&self, user: &UserId) -> StoreResult<Option<Vec<UserLibrary>>> {
        self.store.get_libraries(user).await
    }

    pub async fn put_libraries(&self, user: &UserId, libraries: &[UserLibrary]) -> StoreResult<()> {
        self.store.put_libraries(user, libraries).await
    }
}

/// Carry pending optimistic fields of `existing` over into `incoming`.
fn preserve_pending(incoming: &mut UserData, existing: &UserData) {
    for action in ActionType::ALL {
        if action.is_pending(existing) {
            action.restore(incoming, existing);
            action.set_pending(incoming, true);
        }
    }
}

fn compare(sort: ItemSort, a: &CachedMediaItem, b: &CachedMediaItem) -> Ordering {
    let primary = match sort {
        ItemSort::Name => Ordering::Equal,
        ItemSort::DateAdded => a.date_added.cmp(&b.date_added),
        ItemSort::Index => (a.parent_index_number, a.index_number)
            .cmp(&(b.parent_index_number, b.index_number)),
    };
    primary
        .then_with(|| a.sort_key().cmp(&b.sort_key()))
        .then_with(|| a.id.cmp(&b.id))
}
