use super::{SessionOutcome, SyncSessionCoordinator};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Coordinators of all configured accounts. Accounts sync independently.
#[derive(Default)]
pub struct SyncManager {
    accounts: RwLock<HashMap<String, Arc<SyncSessionCoordinator>>>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_account(&self, coordinator: SyncSessionCoordinator) -> Arc<SyncSessionCoordinator> {
        let coordinator = Arc::new(coordinator);
        let account_id = coordinator.account_id().to_string();
        info!("Registered account {} for sync", account_id);
        self.accounts
            .write()
            .await
            .insert(account_id, Arc::clone(&coordinator));
        coordinator
    }

    pub async fn remove_account(&self, account_id: &str) -> Option<Arc<SyncSessionCoordinator>> {
        let removed = self.accounts.write().await.remove(account_id);
        if let Some(coordinator) = &removed {
            coordinator.cancel();
        }
        removed
    }

    pub async fn get(&self, account_id: &str) -> Option<Arc<SyncSessionCoordinator>> {
        self.accounts.read().await.get(account_id).cloned()
    }

    pub async fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Run "get new messages" from the root of every account concurrently
    pub async fn sync_all(&self) -> Vec<(String, SessionOutcome)> {
        let coordinators: Vec<Arc<SyncSessionCoordinator>> =
            self.accounts.read().await.values().cloned().collect();

        let mut results = join_all(coordinators.into_iter().map(|coordinator| async move {
            let root = coordinator.tree().await.root();
            let outcome = coordinator.get_new_messages(root).await;
            (coordinator.account_id().to_string(), outcome)
        }))
        .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}
