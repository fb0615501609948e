use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use ferrex_sync_model::{CachedMediaItem, EntityId, PendingAction, PendingKey, UserId, UserLibrary};
use parking_lot::RwLock;

use super::{ItemFilter, LocalStore};
use crate::error::StoreResult;

#[derive(Debug, Default)]
struct Tables {
    items: HashMap<UserId, HashMap<EntityId, CachedMediaItem>>,
    libraries: HashMap<UserId, Vec<UserLibrary>>,
    pending: BTreeMap<PendingKey, PendingAction>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get_item(
        &self,
        user: &UserId,
        id: &EntityId,
    ) -> StoreResult<Option<CachedMediaItem>> {
        Ok(self
            .tables
            .read()
            .items
            .get(user)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    async fn find_by_source_id(
        &self,
        user: &UserId,
        source_id: &EntityId,
    ) -> StoreResult<Option<CachedMediaItem>> {
        Ok(self.tables.read().items.get(user).and_then(|rows| {
            rows.values()
                .find(|item| item.source_id.as_ref() == Some(source_id))
                .cloned()
        }))
    }

    async fn upsert_items(&self, user: &UserId, items: &[CachedMediaItem]) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let rows = tables.items.entry(user.clone()).or_default();
        for item in items {
            rows.insert(item.id.clone(), item.clone());
        }
        Ok(())
    }

    async fn delete_items(&self, user: &UserId, ids: &[EntityId]) -> StoreResult<()> {
        if let Some(rows) = self.tables.write().items.get_mut(user) {
            for id in ids {
                rows.remove(id);
            }
        }
        Ok(())
    }

    async fn query_items(
        &self,
        user: &UserId,
        filter: &ItemFilter,
    ) -> StoreResult<Vec<CachedMediaItem>> {
        Ok(self
            .tables
            .read()
            .items
            .get(user)
            .map(|rows| rows.values().filter(|i| filter.matches(i)).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_libraries(&self, user: &UserId) -> StoreResult<Option<Vec<UserLibrary>>> {
        Ok(self.tables.read().libraries.get(user).cloned())
    }

    async fn put_libraries(&self, user: &UserId, libraries: &[UserLibrary]) -> StoreResult<()> {
        self.tables
            .write()
            .libraries
            .insert(user.clone(), libraries.to_vec());
        Ok(())
    }

    async fn upsert_pending(&self, action: &PendingAction) -> StoreResult<()> {
        self.tables
            .write()
            .pending
            .insert(action.key(), action.clone());
        Ok(())
    }

    async fn get_pending(&self, key: &PendingKey) -> StoreResult<Option<PendingAction>> {
        Ok(self.tables.read().pending.get(key).cloned())
    }

    async fn delete_pending(&self, key: &PendingKey) -> StoreResult<()> {
        self.tables.write().pending.remove(key);
        Ok(())
    }

    async fn list_pending(&self) -> StoreResult<Vec<PendingAction>> {
        Ok(self.tables.read().pending.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn items_are_scoped_per_user() {
        contract::items_are_scoped_per_user(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn query_filters_by_parent_and_kind() {
        contract::query_filters_by_parent_and_kind(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn libraries_and_pending_round_trip() {
        contract::libraries_and_pending_round_trip(&MemoryStore::new()).await;
    }
}
