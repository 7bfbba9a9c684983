use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use handsign_types::models::User;

use crate::error::StoreResult;
use crate::ports::Store;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Read-through cache of staff and admin users.
///
/// End users vastly outnumber reviewers, and nearly every inbound event asks
/// "is this sender a reviewer?", so the list is held for `ttl` instead of
/// being read from the store each time.
pub struct AdminDirectory {
    store: Arc<dyn Store>,
    ttl: Duration,
    cache: Mutex<Option<Snapshot>>,
}

struct Snapshot {
    reviewers: Arc<Vec<User>>,
    refreshed_at: Instant,
}

impl AdminDirectory {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// All reviewers. A stale or empty cache is refreshed before returning;
    /// if that refresh fails the error is returned and the old snapshot kept.
    pub async fn list(&self) -> StoreResult<Arc<Vec<User>>> {
        if let Some(reviewers) = self.fresh() {
            return Ok(reviewers);
        }

        // The lock is not held across the store call.
        let reviewers = Arc::new(self.store.list_privileged_users().await?);
        debug!("Admin directory refreshed: {} reviewers", reviewers.len());

        *self.lock() = Some(Snapshot {
            reviewers: reviewers.clone(),
            refreshed_at: Instant::now(),
        });
        Ok(reviewers)
    }

    /// The reviewer with this transport identity, if any.
    pub async fn find(&self, telegram_id: i64) -> StoreResult<Option<User>> {
        let reviewers = self.list().await?;
        Ok(reviewers.iter().find(|u| u.telegram_id == telegram_id).cloned())
    }

    pub async fn is_reviewer(&self, telegram_id: i64) -> StoreResult<bool> {
        Ok(self.find(telegram_id).await?.is_some())
    }

    /// Force the next lookup to hit the store.
    pub fn invalidate(&self) {
        *self.lock() = None;
    }

    fn fresh(&self) -> Option<Arc<Vec<User>>> {
        let cache = self.lock();
        cache
            .as_ref()
            .filter(|s| s.refreshed_at.elapsed() < self.ttl)
            .map(|s| s.reviewers.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Snapshot>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nullables::MemoryStore;
    use handsign_types::models::Role;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn serves_from_cache_within_ttl() {
        let store = Arc::new(MemoryStore::new());
        store.add_user(1, "Root", Role::Admin);
        store.add_user(2, "Helper", Role::Staff);
        store.add_user(3, "Customer", Role::User);
        let directory = AdminDirectory::new(store.clone(), DEFAULT_TTL);

        assert_eq!(directory.list().await.unwrap().len(), 2);
        assert!(directory.is_reviewer(2).await.unwrap());
        assert!(!directory.is_reviewer(3).await.unwrap());
        assert_eq!(store.privileged_queries(), 1);

        advance(Duration::from_secs(299)).await;
        directory.list().await.unwrap();
        assert_eq!(store.privileged_queries(), 1);

        advance(Duration::from_secs(2)).await;
        directory.list().await.unwrap();
        assert_eq!(store.privileged_queries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_stale_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.add_user(1, "Root", Role::Admin);
        let directory = AdminDirectory::new(store.clone(), DEFAULT_TTL);
        directory.list().await.unwrap();
        let first_refresh = directory.lock().as_ref().unwrap().refreshed_at;

        advance(Duration::from_secs(301)).await;
        store.fail_privileged_queries(true);
        assert!(directory.list().await.is_err());

        // The previous snapshot is still cached, untouched by the failure.
        {
            let cache = directory.lock();
            let snapshot = cache.as_ref().unwrap();
            assert_eq!(snapshot.refreshed_at, first_refresh);
            assert_eq!(snapshot.reviewers.len(), 1);
            assert_eq!(snapshot.reviewers[0].telegram_id, 1);
        }

        // Newly added staff shows up once the store recovers.
        store.fail_privileged_queries(false);
        store.add_user(2, "Helper", Role::Staff);
        assert_eq!(directory.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let store = Arc::new(MemoryStore::new());
        let directory = AdminDirectory::new(store.clone(), DEFAULT_TTL);
        assert!(directory.list().await.unwrap().is_empty());

        store.add_user(9, "Late admin", Role::Admin);
        assert!(!directory.is_reviewer(9).await.unwrap());

        directory.invalidate();
        assert!(directory.is_reviewer(9).await.unwrap());
    }
}
