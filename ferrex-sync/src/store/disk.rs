use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ferrex_sync_model::{CachedMediaItem, EntityId, PendingAction, PendingKey, UserId, UserLibrary};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ItemFilter, LocalStore};
use crate::error::{StoreError, StoreResult};

/// Durable store over a `cacache` directory.
///
/// Every row is one JSON document under a human-readable, versioned key:
///
/// - `items/v1/{user}/{entity}`
/// - `source/v1/{user}/{source}` holding the canonical entity id
/// - `libraries/v1/{user}`
/// - `pending/v1/{user}/{entity}:{action}`
#[derive(Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DiskStore").field(&self.root).finish()
    }
}

fn item_key(user: &UserId, id: &EntityId) -> String {
    format!("items/v1/{user}/{id}")
}

fn item_prefix(user: &UserId) -> String {
    format!("items/v1/{user}/")
}

fn source_key(user: &UserId, source_id: &EntityId) -> String {
    format!("source/v1/{user}/{source_id}")
}

fn libraries_key(user: &UserId) -> String {
    format!("libraries/v1/{user}")
}

const PENDING_PREFIX: &str = "pending/v1/";

fn pending_key(key: &PendingKey) -> String {
    format!("{PENDING_PREFIX}{key}")
}

fn map_read_error(key: &str, err: cacache::Error) -> StoreError {
    match err {
        cacache::Error::EntryNotFound(_, _) => StoreError::NotFound {
            entity_type: "cache entry".to_string(),
            id: key.to_string(),
        },
        cacache::Error::IntegrityError(err) => {
            StoreError::StorageError(format!("cache entry {key} failed integrity check ({err})"))
        }
        cacache::Error::SizeMismatch(wanted, actual) => StoreError::StorageError(format!(
            "cache entry size mismatch: key={key}, wanted={wanted}, actual={actual}"
        )),
        cacache::Error::IoError(_, msg) => {
            StoreError::StorageError(format!("cacache read I/O error: {msg}"))
        }
        cacache::Error::SerdeError(_, msg) => {
            StoreError::SerializationError(format!("cacache index serde error: {msg}"))
        }
    }
}

impl DiskStore {
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            StoreError::StorageError(format!(
                "failed to create store directory {}: {e}",
                root.display()
            ))
        })?;
        log::info!("[DiskStore] Opened store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match cacache::read(&self.root, key).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                StoreError::SerializationError(format!("failed to decode {key}: {e}"))
            }),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(None),
            Err(e) => Err(map_read_error(key, e)),
        }
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            StoreError::SerializationError(format!("failed to encode {key}: {e}"))
        })?;
        cacache::write(&self.root, key, bytes)
            .await
            .map_err(|e| StoreError::StorageError(format!("cacache write failed: {e}")))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let present = cacache::metadata(&self.root, key)
            .await
            .map_err(|e| map_read_error(key, e))?
            .is_some();
        if !present {
            return Ok(());
        }
        // Index entry only: identical documents share content across keys
        cacache::index::RemoveOpts::new()
            .remove_fully(false)
            .remove(&self.root, key)
            .await
            .map_err(|e| StoreError::StorageError(format!("cacache remove failed: {e}")))
    }

    /// Keys currently indexed under `prefix`.
    async fn keys_with_prefix(&self, prefix: String) -> StoreResult<BTreeSet<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut keys = BTreeSet::new();
            for entry in cacache::index::ls(&root) {
                match entry {
                    Ok(meta) if meta.key.starts_with(&prefix) => {
                        keys.insert(meta.key);
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("[DiskStore] Index entry error during scan: {e}"),
                }
            }
            keys
        })
        .await
        .map_err(|e| StoreError::StorageError(format!("index scan task failed: {e}")))
    }

    async fn read_all<T: DeserializeOwned>(&self, prefix: String) -> StoreResult<Vec<T>> {
        let keys = self.keys_with_prefix(prefix).await?;
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            // Entries removed since the scan read as absent
            if let Some(row) = self.read_json(&key).await? {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl LocalStore for DiskStore {
    async fn get_item(
        &self,
        user: &UserId,
        id: &EntityId,
    ) -> StoreResult<Option<CachedMediaItem>> {
        self.read_json(&item_key(user, id)).await
    }

    async fn find_by_source_id(
        &self,
        user: &UserId,
        source_id: &EntityId,
    ) -> StoreResult<Option<CachedMediaItem>> {
        let Some(id) = self
            .read_json::<EntityId>(&source_key(user, source_id))
            .await?
        else {
            return Ok(None);
        };
        // The index can outlive a row written without a source id
        Ok(self
            .get_item(user, &id)
            .await?
            .filter(|item| item.source_id.as_ref() == Some(source_id)))
    }

    async fn upsert_items(&self, user: &UserId, items: &[CachedMediaItem]) -> StoreResult<()> {
        for item in items {
            let key = item_key(user, &item.id);
            if let Some(previous) = self.read_json::<CachedMediaItem>(&key).await?
                && let Some(old_source) = previous.source_id
                && item.source_id.as_ref() != Some(&old_source)
            {
                self.remove(&source_key(user, &old_source)).await?;
            }
            self.write_json(&key, item).await?;
            if let Some(source_id) = &item.source_id {
                self.write_json(&source_key(user, source_id), &item.id).await?;
            }
        }
        Ok(())
    }

    async fn delete_items(&self, user: &UserId, ids: &[EntityId]) -> StoreResult<()> {
        for id in ids {
            let key = item_key(user, id);
            if let Some(item) = self.read_json::<CachedMediaItem>(&key).await? {
                if let Some(source_id) = &item.source_id {
                    self.remove(&source_key(user, source_id)).await?;
                }
                self.remove(&key).await?;
            }
        }
        Ok(())
    }

    async fn query_items(
        &self,
        user: &UserId,
        filter: &ItemFilter,
    ) -> StoreResult<Vec<CachedMediaItem>> {
        let rows: Vec<CachedMediaItem> = self.read_all(item_prefix(user)).await?;
        Ok(rows.into_iter().filter(|i| filter.matches(i)).collect())
    }

    async fn get_libraries(&self, user: &UserId) -> StoreResult<Option<Vec<UserLibrary>>> {
        self.read_json(&libraries_key(user)).await
    }

    async fn put_libraries(&self, user: &UserId, libraries: &[UserLibrary]) -> StoreResult<()> {
        self.write_json(&libraries_key(user), &libraries).await
    }

    async fn upsert_pending(&self, action: &PendingAction) -> StoreResult<()> {
        self.write_json(&pending_key(&action.key()), action).await
    }

    async fn get_pending(&self, key: &PendingKey) -> StoreResult<Option<PendingAction>> {
        self.read_json(&pending_key(key)).await
    }

    async fn delete_pending(&self, key: &PendingKey) -> StoreResult<()> {
        self.remove(&pending_key(key)).await
    }

    async fn list_pending(&self) -> StoreResult<Vec<PendingAction>> {
        self.read_all(PENDING_PREFIX.to_string()).await
    }
}
