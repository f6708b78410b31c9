//! Sync sessions
//!
//! A "get new messages" request runs one session per account:
//!
//! ```text
//! Idle -> FetchingDirectory -> ReconcilingFolders -> SyncingMessages -> Idle
//!                 \________________________\_____________> Failed -> Idle
//! ```
//!
//! Requests arriving while a session runs join it instead of starting another.
//! Structural changes are applied as one batch before any message is synced,
//! and a failing folder never stops its siblings. Callers only ever see the
//! single [`SessionOutcome`]; per-folder progress goes to the [`EventBus`].

pub mod manager;

pub use manager::SyncManager;

use crate::config::SyncConfig;
use crate::database::{SessionRecord, SyncDatabase};
use crate::eviction::IdleEvictor;
use crate::events::{EventBus, SyncEvent};
use crate::folder::{FolderId, FolderTree, FolderTreeReconciler, ReconcileOutcome};
use crate::message::{
    CompactionReport, EngineOptions, FolderSyncReport, MessageSyncEngine, SyncError, SyncResult,
};
use crate::offline::OfflineStores;
use crate::remote::{FolderDirectory, MessageSource, RemoteError, RemoteFolder, RemoteServer};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Where a session currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    FetchingDirectory,
    ReconcilingFolders,
    SyncingMessages,
    Failed,
}

/// A folder whose message sync failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderFailure {
    pub folder: FolderId,
    pub path: String,
    pub error: String,
}

/// Aggregated result of one completed session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub account_id: String,
    pub trigger: FolderId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub structure: ReconcileOutcome,
    pub folders: Vec<FolderSyncReport>,
    pub failures: Vec<FolderFailure>,
}

impl SessionReport {
    /// True when every targeted folder synced
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn messages_added(&self) -> usize {
        self.folders.iter().map(|f| f.added).sum()
    }

    pub fn bodies_fetched(&self) -> usize {
        self.folders.iter().map(|f| f.bodies_fetched).sum()
    }
}

/// The one completion signal of a "get new messages" request
pub type SessionOutcome = Result<Arc<SessionReport>, Arc<SyncError>>;

type InFlight = Option<(Uuid, Shared<BoxFuture<'static, SessionOutcome>>)>;

struct CoordinatorInner {
    account_id: String,
    directory: Arc<dyn FolderDirectory>,
    engine: Arc<MessageSyncEngine>,
    database: SyncDatabase,
    tree: RwLock<FolderTree>,
    reconciler: FolderTreeReconciler,
    events: EventBus,
    max_concurrent: usize,
    state: watch::Sender<SessionState>,
    cancel: watch::Sender<bool>,
    in_flight: std::sync::Mutex<InFlight>,
}

/// Clears the coalescing slot when a session ends, however it ends
struct SessionSlot {
    inner: Arc<CoordinatorInner>,
    session_id: Uuid,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight_lock();
        if matches!(in_flight.as_ref(), Some((id, _)) if *id == self.session_id) {
            *in_flight = None;
        }
    }
}

/// Drives sync sessions for one account
#[derive(Clone)]
pub struct SyncSessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncSessionCoordinator {
    /// Load the account's persisted tree and offline index and prepare a
    /// coordinator for it
    pub async fn open<S>(
        account_id: &str,
        server: Arc<S>,
        database: SyncDatabase,
        config: &SyncConfig,
        events: EventBus,
    ) -> SyncResult<Self>
    where
        S: RemoteServer + 'static,
    {
        let tree = match database.load_folder_tree(account_id).await? {
            Some(tree) => tree,
            None => FolderTree::new(account_id),
        };

        let stores = Arc::new(OfflineStores::new(config.store_dir(account_id)));
        let source: Arc<dyn MessageSource> = server.clone();
        let engine = Arc::new(MessageSyncEngine::new(
            account_id,
            source,
            database.clone(),
            stores,
            EngineOptions::from(config),
        ));
        for folder in tree.iter() {
            if let Some(remote_id) = folder.remote_id() {
                engine.register_folder(folder.id(), remote_id);
            }
        }
        engine.load_offline_index().await?;

        let directory: Arc<dyn FolderDirectory> = server;
        info!("Opened account {} with {} folders", account_id, tree.len());
        Ok(Self::with_parts(
            directory,
            engine,
            database,
            tree,
            events,
            config.max_concurrent_folder_syncs,
        ))
    }

    pub fn with_parts(
        directory: Arc<dyn FolderDirectory>,
        engine: Arc<MessageSyncEngine>,
        database: SyncDatabase,
        tree: FolderTree,
        events: EventBus,
        max_concurrent: usize,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(CoordinatorInner {
                account_id: engine.account_id().to_string(),
                directory,
                engine,
                database,
                tree: RwLock::new(tree),
                reconciler: FolderTreeReconciler::new(),
                events,
                max_concurrent: max_concurrent.max(1),
                state,
                cancel,
                in_flight: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    pub fn engine(&self) -> &Arc<MessageSyncEngine> {
        &self.inner.engine
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the local folder tree
    pub async fn tree(&self) -> FolderTree {
        self.inner.tree.read().await.clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.in_flight_lock().is_some()
    }

    /// Run a "get new messages" session triggered from `folder`.
    ///
    /// The folder directory is always synced from the account root. Messages
    /// are synced for every folder when `folder` is the root, otherwise for
    /// `folder` plus any folder this session created, renamed or moved. A call
    /// made while a session is running waits for that session's outcome.
    pub async fn get_new_messages(&self, folder: FolderId) -> SessionOutcome {
        let session = {
            let mut in_flight = self.inner.in_flight_lock();
            match in_flight.as_ref() {
                Some((id, running)) => {
                    debug!("Joining running session {} of account {}", id, self.inner.account_id);
                    running.clone()
                }
                None => {
                    let session_id = Uuid::new_v4();
                    let running = self.spawn_session(session_id, folder);
                    *in_flight = Some((session_id, running.clone()));
                    running
                }
            }
        };
        session.await
    }

    fn spawn_session(&self, session_id: Uuid, trigger: FolderId) -> Shared<BoxFuture<'static, SessionOutcome>> {
        let inner = Arc::clone(&self.inner);
        inner.cancel.send_replace(false);

        let span = info_span!("sync_session", account = %inner.account_id, session = %session_id);
        let handle = tokio::spawn(
            async move {
                let _slot = SessionSlot {
                    inner: Arc::clone(&inner),
                    session_id,
                };
                inner.run_session(session_id, trigger).await
            }
            .instrument(span),
        );

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Sync session task failed: {}", e);
                    Err(Arc::new(SyncError::Task(e.to_string())))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Abort the running session. In-flight fetches resolve as cancelled and
    /// no partial folder-tree change is applied.
    pub fn cancel(&self) {
        if self.is_syncing() {
            info!("Cancelling sync session of account {}", self.inner.account_id);
            self.inner.cancel.send_replace(true);
        }
    }

    /// Compact the offline store of every folder
    pub async fn compact_all(&self) -> SyncResult<Vec<CompactionReport>> {
        let folders: Vec<FolderId> = {
            let tree = self.inner.tree.read().await;
            tree.iter()
                .filter(|f| !f.is_root() && f.remote_id().is_some())
                .map(|f| f.id())
                .collect()
        };

        let mut reports = Vec::with_capacity(folders.len());
        for folder in folders {
            reports.push(self.inner.engine.compact_folder(folder).await?);
        }
        Ok(reports)
    }

    /// Start closing idle message databases of this account in the background
    pub fn spawn_evictor(&self, config: &SyncConfig) -> JoinHandle<()> {
        IdleEvictor::new(Arc::clone(&self.inner.engine), config.eviction.clone()).spawn()
    }
}

impl CoordinatorInner {
    fn in_flight_lock(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        debug!("Session state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Run `work` unless the session is cancelled first
    async fn unless_cancelled<T, F>(&self, work: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            result = work => result,
            _ = cancel.wait_for(|cancelled| *cancelled) => Err(SyncError::Remote(RemoteError::Cancelled)),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn run_session(&self, session_id: Uuid, trigger: FolderId) -> SessionOutcome {
        let started_at = Utc::now();
        info!("Starting sync session for account {}", self.account_id);
        self.events.publish(SyncEvent::SessionStarted {
            account_id: self.account_id.clone(),
            session_id,
        });

        let result = self.run_stages(session_id, trigger, started_at).await;
        let finished_at = Utc::now();

        let record = match &result {
            Ok(report) => SessionRecord {
                id: session_id,
                account_id: self.account_id.clone(),
                started_at,
                finished_at,
                succeeded: report.is_complete(),
                folders_synced: report.folders.len() as u32,
                folders_failed: report.failures.len() as u32,
                error: None,
            },
            Err(e) => SessionRecord {
                id: session_id,
                account_id: self.account_id.clone(),
                started_at,
                finished_at,
                succeeded: false,
                folders_synced: 0,
                folders_failed: 0,
                error: Some(e.to_string()),
            },
        };
        if let Err(e) = self.database.record_session(&record).await {
            warn!("Failed to record sync session {}: {}", session_id, e);
        }

        if let Err(e) = &result {
            error!("Sync session for account {} failed: {}", self.account_id, e);
            self.set_state(SessionState::Failed);
        }
        self.set_state(SessionState::Idle);

        self.events.publish(SyncEvent::SessionFinished {
            account_id: self.account_id.clone(),
            session_id,
            succeeded: record.succeeded,
        });

        result.map(Arc::new).map_err(Arc::new)
    }

    async fn run_stages(
        &self,
        session_id: Uuid,
        trigger: FolderId,
        started_at: DateTime<Utc>,
    ) -> SyncResult<SessionReport> {
        self.set_state(SessionState::FetchingDirectory);
        let directory = self
            .unless_cancelled(self.directory.fetch_directory().map(|r| r.map_err(SyncError::from)))
            .await?;
        debug!("Fetched {} remote folders", directory.len());

        self.set_state(SessionState::ReconcilingFolders);
        let structure = self.reconcile(&directory).await?;

        let targets = self.message_targets(trigger, &structure).await;
        self.set_state(SessionState::SyncingMessages);

        let results: Vec<(FolderId, String, SyncResult<FolderSyncReport>)> =
            futures::stream::iter(targets)
                .map(|(folder, path, remote_id)| async move {
                    let result = self
                        .unless_cancelled(self.engine.sync_folder(folder, &remote_id))
                        .await;
                    (folder, path, result)
                })
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;

        let mut report = SessionReport {
            session_id,
            account_id: self.account_id.clone(),
            trigger,
            started_at,
            finished_at: started_at,
            structure,
            folders: Vec::new(),
            failures: Vec::new(),
        };

        for (folder, path, result) in results {
            match result {
                Ok(synced) => {
                    self.events.publish(SyncEvent::FolderSynced {
                        folder,
                        added: synced.added,
                        expunged: synced.expunged,
                    });
                    report.folders.push(synced);
                }
                Err(e) => {
                    warn!("Message sync of folder '{}' failed: {}", path, e);
                    self.events.publish(SyncEvent::FolderFailed {
                        folder,
                        error: e.to_string(),
                    });
                    report.failures.push(FolderFailure {
                        folder,
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }

        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        report.folders.sort_by_key(|f| f.folder);
        report.failures.sort_by_key(|f| f.folder);
        report.finished_at = Utc::now();
        info!(
            "Sync session finished: {} folders synced, {} failed, {} new messages",
            report.folders.len(),
            report.failures.len(),
            report.messages_added()
        );
        Ok(report)
    }

    /// Apply a directory snapshot to the tree as one batch
    async fn reconcile(&self, directory: &[RemoteFolder]) -> SyncResult<ReconcileOutcome> {
        let mut tree = self.tree.write().await;
        let (next, outcome) = self.reconciler.reconcile(&tree, directory)?;

        if !outcome.is_empty() || *tree != next {
            self.database.save_folder_tree(&next).await?;
        }
        *tree = next;

        for folder in tree.iter() {
            if let Some(remote_id) = folder.remote_id() {
                self.engine.register_folder(folder.id(), remote_id);
            }
        }

        for id in &outcome.created {
            self.events.publish(SyncEvent::FolderCreated {
                folder: *id,
                path: tree.path(*id).unwrap_or_default(),
            });
        }
        for id in &outcome.renamed {
            if let Some(folder) = tree.get(*id) {
                self.events.publish(SyncEvent::FolderRenamed {
                    folder: *id,
                    name: folder.name().to_string(),
                });
            }
        }
        for id in &outcome.moved {
            self.events.publish(SyncEvent::FolderMoved {
                folder: *id,
                path: tree.path(*id).unwrap_or_default(),
            });
        }
        drop(tree);

        for folder in &outcome.deleted {
            if let Err(e) = self.engine.forget_folder(folder.id()).await {
                warn!("Failed to clean up deleted folder '{}': {}", folder.name(), e);
            }
            self.events.publish(SyncEvent::FolderDeleted {
                folder: folder.id(),
                name: folder.name().to_string(),
            });
        }

        Ok(outcome)
    }

    /// Folders whose messages this session syncs, with their path and remote id
    async fn message_targets(
        &self,
        trigger: FolderId,
        structure: &ReconcileOutcome,
    ) -> Vec<(FolderId, String, String)> {
        let tree = self.tree.read().await;
        let candidates: Vec<FolderId> = if trigger == tree.root() || !tree.contains(trigger) {
            tree.iter().map(|f| f.id()).collect()
        } else {
            std::iter::once(trigger).chain(structure.touched()).collect()
        };

        let mut targets = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(folder) = tree.get(id) else {
                continue;
            };
            if folder.is_root() || targets.iter().any(|(seen, _, _)| *seen == id) {
                continue;
            }
            if let Some(remote_id) = folder.remote_id() {
                targets.push((id, tree.path(id).unwrap_or_default(), remote_id.to_string()));
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryServer, RemoteMessage, DEFAULT_ROOT_ID};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn coordinator(server: Arc<MemoryServer>, dir: &TempDir) -> SyncSessionCoordinator {
        let config = SyncConfig {
            data_dir: dir.path().to_path_buf(),
            ..SyncConfig::default()
        };
        let database = SyncDatabase::new_in_memory().await.unwrap();
        SyncSessionCoordinator::open("acct", server, database, &config, EventBus::new())
            .await
            .unwrap()
    }

    fn server() -> Arc<MemoryServer> {
        let server = MemoryServer::new();
        server.add_folder("inbox", DEFAULT_ROOT_ID, "Inbox").unwrap();
        server.add_folder("work", DEFAULT_ROOT_ID, "Work").unwrap();
        let mut message = RemoteMessage::new(0);
        message.message_id = Some("<hello@example.com>".to_string());
        server.add_message("inbox", message, b"Subject: hi\r\n\r\nhi\r\n").unwrap();
        Arc::new(server)
    }

    #[tokio::test]
    async fn test_session_syncs_structure_then_messages() {
        let dir = TempDir::new().unwrap();
        let coordinator = coordinator(server(), &dir).await;
        let mut events = coordinator.events().subscribe();

        let root = coordinator.tree().await.root();
        let report = coordinator.get_new_messages(root).await.unwrap();
        assert_eq!(report.structure.created.len(), 2);
        assert_eq!(report.folders.len(), 2);
        assert_eq!(report.messages_added(), 1);
        assert!(report.is_complete());
        assert_eq!(coordinator.state(), SessionState::Idle);

        let events = events.drain();
        assert!(matches!(events.first(), Some(SyncEvent::SessionStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(SyncEvent::SessionFinished { succeeded: true, .. })
        ));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SyncEvent::FolderCreated { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_session() {
        let dir = TempDir::new().unwrap();
        let server = server();
        server.set_directory_delay(Some(Duration::from_millis(100)));
        let coordinator = coordinator(server.clone(), &dir).await;
        let root = coordinator.tree().await.root();

        let (first, second) = tokio::join!(
            coordinator.get_new_messages(root),
            coordinator.get_new_messages(root)
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(server.directory_fetches(), 1);
        assert!(!coordinator.is_syncing());

        let third = coordinator.get_new_messages(root).await.unwrap();
        assert_ne!(third.session_id, first.session_id);
        assert_eq!(server.directory_fetches(), 2);
    }

    #[tokio::test]
    async fn test_cancel_leaves_tree_untouched() {
        let dir = TempDir::new().unwrap();
        let server = server();
        server.set_directory_delay(Some(Duration::from_millis(500)));
        let coordinator = coordinator(server, &dir).await;
        let root = coordinator.tree().await.root();

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.get_new_messages(root).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.cancel();

        let outcome = running.await.unwrap();
        let error = outcome.unwrap_err();
        assert!(matches!(*error, SyncError::Remote(RemoteError::Cancelled)));
        assert_eq!(coordinator.tree().await.len(), 1);
        assert_eq!(coordinator.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_folder_trigger_syncs_only_that_folder() {
        let dir = TempDir::new().unwrap();
        let server = server();
        let coordinator = coordinator(server.clone(), &dir).await;
        let root = coordinator.tree().await.root();
        coordinator.get_new_messages(root).await.unwrap();
        let fetches = server.summary_fetches();

        let inbox = coordinator.tree().await.find_by_remote_id("inbox").unwrap();
        let report = coordinator.get_new_messages(inbox).await.unwrap();
        assert_eq!(report.folders.len(), 1);
        assert_eq!(report.folders[0].folder, Some(inbox));
        assert_eq!(server.summary_fetches(), fetches + 1);
    }

    #[tokio::test]
    async fn test_sessions_are_recorded() {
        let dir = TempDir::new().unwrap();
        let server = server();
        let coordinator = coordinator(server.clone(), &dir).await;
        let root = coordinator.tree().await.root();

        server.set_directory_failure(Some("connection reset"));
        assert!(coordinator.get_new_messages(root).await.is_err());
        server.set_directory_failure(None);
        coordinator.get_new_messages(root).await.unwrap();

        let sessions = coordinator
            .inner
            .database
            .recent_sessions("acct", 10)
            .await
            .unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions.iter().filter(|s| s.succeeded).count(), 1);
        assert!(sessions.iter().any(|s| s.error.as_deref().map_or(false, |e| e.contains("connection reset"))));
    }
}
