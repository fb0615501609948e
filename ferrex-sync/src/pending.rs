use std::fmt;
use std::sync::Arc;

use ferrex_sync_model::{PendingAction, PendingKey};

use crate::error::StoreResult;
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::store::LocalStore;

/// Durable queue of optimistic mutations awaiting confirmation.
///
/// Holds at most one action per `(user, entity, action type)`: writes are
/// upserts, so the latest intent always wins. Backed by the store's
/// pending table, so entries survive a restart when the store is durable.
#[derive(Clone)]
pub struct PendingActionQueue {
    store: Arc<dyn LocalStore>,
    locks: KeyedLocks<PendingKey>,
    wire: KeyedLocks<PendingKey>,
}

impl fmt::Debug for PendingActionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingActionQueue")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl PendingActionQueue {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            wire: KeyedLocks::new(),
        }
    }

    /// Serialize every read-modify-write on `key`.
    ///
    /// Callers hold this across the whole optimistic apply or confirmation
    /// sequence; the cache row lock is only ever taken inside it.
    pub async fn lock(&self, key: &PendingKey) -> KeyedGuard<PendingKey> {
        self.locks.lock(key).await
    }

    /// Serialize remote confirmations of `key`.
    ///
    /// Held across the server call and the settle that follows it, so two
    /// intents for one key never race on the wire. Independent of
    /// [`lock`](Self::lock), which is only taken inside it.
    pub async fn lock_remote(&self, key: &PendingKey) -> KeyedGuard<PendingKey> {
        self.wire.lock(key).await
    }

    pub async fn upsert(&self, action: &PendingAction) -> StoreResult<()> {
        log::debug!(
            "[PendingQueue] Upsert {} -> {} (intent {})",
            action.key(),
            action.new_value,
            action.intent_id
        );
        self.store.upsert_pending(action).await
    }

    pub async fn get(&self, key: &PendingKey) -> StoreResult<Option<PendingAction>> {
        self.store.get_pending(key).await
    }

    /// Every queued action, oldest first.
    pub async fn get_all(&self) -> StoreResult<Vec<PendingAction>> {
        let mut actions = self.store.list_pending().await?;
        actions.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.intent_id.cmp(&b.intent_id))
        });
        Ok(actions)
    }

    pub async fn delete(&self, key: &PendingKey) -> StoreResult<()> {
        log::debug!("[PendingQueue] Delete {}", key);
        self.store.delete_pending(key).await
    }

    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.store.list_pending().await?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::store::contract::{id, user};
    use ferrex_sync_model::{ActionType, UserData};

    fn queued(u: &str, raw: &str, action: ActionType, value: bool) -> PendingAction {
        PendingAction::new(user(u), id(raw), action, value, UserData::default())
    }

    #[tokio::test]
    async fn latest_intent_wins_per_key() {
        let queue = PendingActionQueue::new(Arc::new(MemoryStore::new()));
        let first = queued("u1", "m1", ActionType::Favorite, true);
        let second = queued("u1", "m1", ActionType::Favorite, false);

        queue.upsert(&first).await.unwrap();
        queue.upsert(&second).await.unwrap();

        let all = queue.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].intent_id, second.intent_id);
        assert!(!all[0].new_value);

        queue.delete(&first.key()).await.unwrap();
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn users_queue_the_same_entity_independently() {
        let queue = PendingActionQueue::new(Arc::new(MemoryStore::new()));
        let mine = queued("u1", "m1", ActionType::Favorite, true);
        let theirs = queued("u2", "m1", ActionType::Favorite, false);
        queue.upsert(&mine).await.unwrap();
        queue.upsert(&theirs).await.unwrap();

        assert_eq!(queue.get_all().await.unwrap().len(), 2);
        queue.delete(&theirs.key()).await.unwrap();
        assert_eq!(queue.get(&mine.key()).await.unwrap(), Some(mine));
    }

    #[tokio::test]
    async fn get_all_is_oldest_first() {
        let queue = PendingActionQueue::new(Arc::new(MemoryStore::new()));
        let older = queued("u1", "zz", ActionType::Played, true);
        let newer = queued("u1", "aa", ActionType::Watchlist, true);
        queue.upsert(&newer).await.unwrap();
        queue.upsert(&older).await.unwrap();

        let keys: Vec<_> = queue
            .get_all()
            .await
            .unwrap()
            .iter()
            .map(|a| a.entity_id.clone())
            .collect();
        assert_eq!(keys, vec![id("zz"), id("aa")]);
    }
}
