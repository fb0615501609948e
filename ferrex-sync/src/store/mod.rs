//! Local persistence: the [`LocalStore`] collaborator trait, its two
//! implementations and the [`LocalCacheStore`] adapter the rest of the
//! crate talks to.

use std::fmt::Debug;

use async_trait::async_trait;
use ferrex_sync_model::{
    CachedMediaItem, EntityId, MediaKind, PendingAction, PendingKey, UserId, UserLibrary,
};

use crate::error::StoreResult;

pub mod cache;
pub mod disk;
pub mod memory;

pub use cache::{CacheScope, ItemSort, LibraryQuery, LocalCacheStore};
pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Row filter understood by every [`LocalStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    pub parent_id: Option<EntityId>,
    /// Empty means every kind.
    pub kinds: Vec<MediaKind>,
}

impl ItemFilter {
    pub fn children_of(parent_id: EntityId) -> Self {
        Self {
            parent_id: Some(parent_id),
            kinds: Vec::new(),
        }
    }

    pub fn matches(&self, item: &CachedMediaItem) -> bool {
        if let Some(parent) = &self.parent_id
            && item.parent_id.as_ref() != Some(parent)
        {
            return false;
        }
        self.kinds.is_empty() || self.kinds.contains(&item.kind)
    }
}

/// Keyed tables backing the cache: media rows per user, library views per
/// user and the pending-action table.
///
/// Rows are stored raw; no derivation is applied on the way in or out.
#[async_trait]
pub trait LocalStore: Send + Sync + Debug {
    async fn get_item(&self, user: &UserId, id: &EntityId)
    -> StoreResult<Option<CachedMediaItem>>;

    /// Look an item up by its alternate id.
    async fn find_by_source_id(
        &self,
        user: &UserId,
        source_id: &EntityId,
    ) -> StoreResult<Option<CachedMediaItem>>;

    async fn upsert_items(&self, user: &UserId, items: &[CachedMediaItem]) -> StoreResult<()>;

    async fn delete_items(&self, user: &UserId, ids: &[EntityId]) -> StoreResult<()>;

    /// Matching rows in no particular order.
    async fn query_items(
        &self,
        user: &UserId,
        filter: &ItemFilter,
    ) -> StoreResult<Vec<CachedMediaItem>>;

    /// `None` when the user's libraries were never stored.
    async fn get_libraries(&self, user: &UserId) -> StoreResult<Option<Vec<UserLibrary>>>;

    async fn put_libraries(&self, user: &UserId, libraries: &[UserLibrary]) -> StoreResult<()>;

    async fn upsert_pending(&self, action: &PendingAction) -> StoreResult<()>;

    async fn get_pending(&self, key: &PendingKey) -> StoreResult<Option<PendingAction>>;

    async fn delete_pending(&self, key: &PendingKey) -> StoreResult<()>;

    async fn list_pending(&self) -> StoreResult<Vec<PendingAction>>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every `LocalStore` implementation must share.

    use super::*;
    use ferrex_sync_model::{ActionType, UserData};

    pub(crate) fn id(raw: &str) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    pub(crate) fn user(raw: &str) -> UserId {
        UserId::new(raw).unwrap()
    }

    pub(crate) fn child(raw: &str, parent: &str, kind: MediaKind) -> CachedMediaItem {
        let mut item = CachedMediaItem::new(id(raw), raw.to_uppercase(), kind);
        item.parent_id = Some(id(parent));
        item
    }

    pub(crate) async fn items_are_scoped_per_user(store: &dyn LocalStore) {
        let alice = user("alice");
        let bob = user("bob");
        let mut movie = child("m1", "lib", MediaKind::Movie);
        movie.source_id = Some(id("tmdb-603"));
        store.upsert_items(&alice, &[movie.clone()]).await.unwrap();

        assert_eq!(store.get_item(&alice, &id("m1")).await.unwrap(), Some(movie.clone()));
        assert_eq!(store.get_item(&bob, &id("m1")).await.unwrap(), None);
        assert_eq!(
            store
                .find_by_source_id(&alice, &id("TMDB603"))
                .await
                .unwrap()
                .map(|i| i.id),
            Some(id("m1"))
        );

        store.delete_items(&alice, &[id("m1"), id("missing")]).await.unwrap();
        assert_eq!(store.get_item(&alice, &id("m1")).await.unwrap(), None);
        assert_eq!(store.find_by_source_id(&alice, &id("tmdb603")).await.unwrap(), None);
    }

    pub(crate) async fn query_filters_by_parent_and_kind(store: &dyn LocalStore) {
        let u = user("u1");
        store
            .upsert_items(
                &u,
                &[
                    child("a", "lib1", MediaKind::Movie),
                    child("b", "lib1", MediaKind::Folder),
                    child("c", "lib2", MediaKind::Movie),
                ],
            )
            .await
            .unwrap();

        let mut in_lib1: Vec<_> = store
            .query_items(&u, &ItemFilter::children_of(id("lib1")))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        in_lib1.sort();
        assert_eq!(in_lib1, vec![id("a"), id("b")]);

        let movies = store
            .query_items(
                &u,
                &ItemFilter {
                    parent_id: Some(id("lib1")),
                    kinds: vec![MediaKind::Movie],
                },
            )
            .await
            .unwrap();
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].id, id("a"));
    }

    pub(crate) async fn libraries_and_pending_round_trip(store: &dyn LocalStore) {
        let u = user("u1");
        assert_eq!(store.get_libraries(&u).await.unwrap(), None);
        let libraries = vec![UserLibrary {
            id: id("lib1"),
            name: "Movies".into(),
            collection_type: Some("movies".into()),
        }];
        store.put_libraries(&u, &libraries).await.unwrap();
        assert_eq!(store.get_libraries(&u).await.unwrap(), Some(libraries));

        let action = |u: &UserId, kind: ActionType, value: bool| {
            PendingAction::new(u.clone(), id("m1"), kind, value, UserData::default())
        };
        let first = action(&u, ActionType::Favorite, true);
        let second = action(&u, ActionType::Favorite, false);
        let other = action(&u, ActionType::Played, true);
        let other_user = action(&user("u2"), ActionType::Favorite, true);
        store.upsert_pending(&first).await.unwrap();
        store.upsert_pending(&second).await.unwrap();
        store.upsert_pending(&other).await.unwrap();
        store.upsert_pending(&other_user).await.unwrap();

        assert_eq!(store.get_pending(&first.key()).await.unwrap(), Some(second.clone()));
        assert_eq!(
            store.get_pending(&other_user.key()).await.unwrap(),
            Some(other_user.clone())
        );
        assert_eq!(store.list_pending().await.unwrap().len(), 3);

        store.delete_pending(&first.key()).await.unwrap();
        store.delete_pending(&first.key()).await.unwrap();
        store.delete_pending(&other_user.key()).await.unwrap();
        assert_eq!(store.get_pending(&first.key()).await.unwrap(), None);
        assert_eq!(store.list_pending().await.unwrap(), vec![other]);
    }
}
