//! Folder semaphore: an exclusive, named owner token on a store

use super::{OfflineResult, OfflineStore, OfflineStoreError};
use chrono::{DateTime, Utc};
use std::sync::{Arc, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Current holder of a folder semaphore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreHolder {
    pub owner: String,
    pub reason: String,
    pub acquired_at: DateTime<Utc>,
}

impl OfflineStore {
    fn semaphore_lock(&self) -> MutexGuard<'_, Option<SemaphoreHolder>> {
        self.semaphore.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the folder semaphore. Fails immediately if anyone holds it.
    ///
    /// The returned guard releases the semaphore when dropped, so early
    /// returns and cancelled tasks never leave a folder locked.
    pub fn acquire_semaphore(self: &Arc<Self>, owner: &str, reason: &str) -> OfflineResult<SemaphoreGuard> {
        let mut holder = self.semaphore_lock();
        if let Some(current) = holder.as_ref() {
            return Err(OfflineStoreError::Locked {
                folder: self.folder,
                owner: current.owner.clone(),
                reason: current.reason.clone(),
            });
        }

        *holder = Some(SemaphoreHolder {
            owner: owner.to_string(),
            reason: reason.to_string(),
            acquired_at: Utc::now(),
        });
        debug!("Folder {} semaphore acquired by '{}' for {}", self.folder, owner, reason);

        Ok(SemaphoreGuard {
            store: Arc::clone(self),
            owner: owner.to_string(),
            released: false,
        })
    }

    /// Release the semaphore on behalf of `owner`
    pub fn release_semaphore(&self, owner: &str) -> OfflineResult<()> {
        let mut holder = self.semaphore_lock();
        match holder.as_ref() {
            Some(current) if current.owner == owner => {
                *holder = None;
                debug!("Folder {} semaphore released by '{}'", self.folder, owner);
                Ok(())
            }
            _ => Err(OfflineStoreError::NotHolder {
                folder: self.folder,
                owner: owner.to_string(),
            }),
        }
    }

    pub fn semaphore_holder(&self) -> Option<SemaphoreHolder> {
        self.semaphore_lock().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.semaphore_lock().is_some()
    }
}

/// Scoped ownership of a folder semaphore
#[derive(Debug)]
pub struct SemaphoreGuard {
    store: Arc<OfflineStore>,
    owner: String,
    released: bool,
}

impl SemaphoreGuard {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &Arc<OfflineStore> {
        &self.store
    }

    pub fn release(mut self) -> OfflineResult<()> {
        self.released = true;
        self.store.release_semaphore(&self.owner)
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.store.release_semaphore(&self.owner) {
                warn!("Semaphore guard dropped without holding it: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::FolderId;
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> Arc<OfflineStore> {
        Arc::new(OfflineStore::open(FolderId(4), dir.path().join("4.store")).await.unwrap())
    }

    #[tokio::test]
    async fn test_semaphore_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let guard = store.acquire_semaphore("move-1", "offline move").unwrap();
        let holder = store.semaphore_holder().unwrap();
        assert_eq!(holder.owner, "move-1");
        assert_eq!(holder.reason, "offline move");

        match store.acquire_semaphore("move-2", "another move") {
            Err(OfflineStoreError::Locked { owner, .. }) => assert_eq!(owner, "move-1"),
            other => panic!("expected Locked, got {:?}", other.map(|g| g.owner().to_string())),
        }
        assert!(matches!(
            store.release_semaphore("move-2"),
            Err(OfflineStoreError::NotHolder { .. })
        ));

        guard.release().unwrap();
        assert!(!store.is_locked());
    }

    #[tokio::test]
    async fn test_held_semaphore_skips_appends() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        {
            let _guard = store.acquire_semaphore("copy", "copy messages").unwrap();
            assert_eq!(store.try_append(b"body\n").await.unwrap(), None);
            assert_eq!(store.size(), 0);
        }

        assert!(!store.is_locked());
        assert!(store.try_append(b"body\n").await.unwrap().is_some());
    }
}
