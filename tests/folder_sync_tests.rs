use mailsync::folder::FolderFlags;
use mailsync::remote::{DeleteBehavior, DistinguishedRole, DEFAULT_ROOT_ID};
use mailsync::{EventBus, FolderId, MemoryServer, SyncConfig, SyncDatabase, SyncError, SyncSessionCoordinator};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

async fn open(server: &Arc<MemoryServer>, database: &SyncDatabase, data_dir: &Path) -> SyncSessionCoordinator {
    let config = SyncConfig {
        data_dir: data_dir.to_path_buf(),
        ..SyncConfig::default()
    };
    SyncSessionCoordinator::open("test_account", server.clone(), database.clone(), &config, EventBus::new())
        .await
        .unwrap()
}

async fn sync_root(coordinator: &SyncSessionCoordinator) -> Arc<mailsync::SessionReport> {
    let root = coordinator.tree().await.root();
    coordinator.get_new_messages(root).await.unwrap()
}

fn nested_server() -> Arc<MemoryServer> {
    let server = MemoryServer::new();
    server.add_folder("parent1", DEFAULT_ROOT_ID, "parent1").unwrap();
    server.add_folder("parent2", DEFAULT_ROOT_ID, "parent2").unwrap();
    server.add_folder("child1", "parent1", "child1").unwrap();
    server.add_folder("child2", "child1", "child2").unwrap();
    server.add_folder("child3", "child2", "child3").unwrap();
    Arc::new(server)
}

/// A multi-level hierarchy listed children-first is created in one session
#[tokio::test]
async fn test_topological_creation() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new_in_memory().await.unwrap();
    let server = nested_server();
    server.set_reverse_listing(true);

    let coordinator = open(&server, &database, dir.path()).await;
    let report = sync_root(&coordinator).await;
    assert_eq!(report.structure.created.len(), 5);
    assert!(report.is_complete());

    let tree = coordinator.tree().await;
    let child3 = tree.find_by_path("parent1/child1/child2/child3").unwrap();
    assert_eq!(tree.get(child3).unwrap().remote_id(), Some("child3"));
    let child1 = tree.find_by_remote_id("child1").unwrap();
    assert_eq!(tree.get(child1).unwrap().parent(), tree.find_by_remote_id("parent1"));
}

/// Applying the same snapshot twice changes nothing the second time
#[tokio::test]
async fn test_idempotent_resync() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new_in_memory().await.unwrap();
    let server = nested_server();
    let coordinator = open(&server, &database, dir.path()).await;

    sync_root(&coordinator).await;
    let before = coordinator.tree().await;

    let second = sync_root(&coordinator).await;
    assert!(second.structure.is_empty());
    assert_eq!(coordinator.tree().await, before);
    assert_eq!(before.len(), 6);
}

/// Moving a subtree keeps every id and leaves nothing behind
#[tokio::test]
async fn test_full_subtree_reparent() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new_in_memory().await.unwrap();
    let server = nested_server();
    let coordinator = open(&server, &database, dir.path()).await;
    sync_root(&coordinator).await;

    let before = coordinator.tree().await;
    let ids: Vec<FolderId> = ["child1", "child2", "child3"]
        .iter()
        .map(|remote| before.find_by_remote_id(remote).unwrap())
        .collect();

    server.move_folder("child1", "parent2").unwrap();
    let report = sync_root(&coordinator).await;
    assert_eq!(report.structure.moved, vec![ids[0]]);
    assert!(report.structure.created.is_empty());
    assert!(report.structure.deleted.is_empty());

    let after = coordinator.tree().await;
    let parent1 = after.find_by_remote_id("parent1").unwrap();
    assert!(after.get(parent1).unwrap().children().is_empty());
    assert_eq!(after.find_by_path("parent2/child1/child2/child3"), Some(ids[2]));
    assert_eq!(after.find_by_path("parent2/child1/child2"), Some(ids[1]));
    for (id, remote) in ids.iter().zip(["child1", "child2", "child3"]) {
        assert_eq!(after.get(*id).unwrap().remote_id(), Some(remote));
    }
}

/// Remote ids survive renames and reparenting, also across restarts
#[tokio::test]
async fn test_identity_continuity() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new(&dir.path().join("mailsync.db")).await.unwrap();
    let server = nested_server();

    let original = {
        let coordinator = open(&server, &database, dir.path()).await;
        sync_root(&coordinator).await;
        coordinator.tree().await
    };

    server.rename_folder("child2", "renamed").unwrap();
    server.move_folder("child2", "parent2").unwrap();
    server.rename_folder("parent1", "first").unwrap();

    let coordinator = open(&server, &database, dir.path()).await;
    let report = sync_root(&coordinator).await;
    assert_eq!(report.structure.renamed.len(), 2);
    assert_eq!(report.structure.moved.len(), 1);

    let tree = coordinator.tree().await;
    for remote in ["parent1", "parent2", "child1", "child2", "child3"] {
        assert_eq!(
            tree.find_by_remote_id(remote),
            original.find_by_remote_id(remote),
            "local folder of {} changed",
            remote
        );
    }
    assert_eq!(
        tree.find_by_path("parent2/renamed/child3"),
        original.find_by_remote_id("child3")
    );
    assert!(tree.find_by_path("first/child1").is_some());
}

/// A failed directory fetch applies nothing and is reported once
#[tokio::test]
async fn test_directory_failure_changes_nothing() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new_in_memory().await.unwrap();
    let server = nested_server();
    let coordinator = open(&server, &database, dir.path()).await;
    sync_root(&coordinator).await;
    let before = coordinator.tree().await;

    server.add_folder("new", DEFAULT_ROOT_ID, "new").unwrap();
    server.set_directory_failure(Some("network unreachable"));
    let root = before.root();
    let error = coordinator.get_new_messages(root).await.unwrap_err();
    assert!(matches!(*error, SyncError::Remote(_)));
    assert!(error.is_recoverable());

    assert_eq!(coordinator.tree().await, before);
    assert_eq!(database.load_folder_tree("test_account").await.unwrap(), Some(before));
}

/// An authentication failure is not worth retrying automatically
#[tokio::test]
async fn test_auth_failure_is_not_recoverable() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new_in_memory().await.unwrap();
    let server = nested_server();
    server.set_auth_failure(Some("invalid credentials"));
    let coordinator = open(&server, &database, dir.path()).await;

    let root = coordinator.tree().await.root();
    let error = coordinator.get_new_messages(root).await.unwrap_err();
    assert!(!error.is_recoverable());
    assert_eq!(coordinator.tree().await.len(), 1);
}

/// One failing folder does not stop its siblings
#[tokio::test]
async fn test_folder_failure_is_isolated() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new_in_memory().await.unwrap();
    let server = nested_server();
    server.set_folder_failure("child2", true);
    let coordinator = open(&server, &database, dir.path()).await;

    let report = sync_root(&coordinator).await;
    assert_eq!(report.folders.len(), 4);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, "parent1/child1/child2");
    assert!(!report.is_complete());
}

/// Deleting a folder removes its subtree locally
#[tokio::test]
async fn test_remote_delete_removes_subtree() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new_in_memory().await.unwrap();
    let server = nested_server();
    let coordinator = open(&server, &database, dir.path()).await;
    sync_root(&coordinator).await;

    server.delete_folder("child1").unwrap();
    let report = sync_root(&coordinator).await;
    assert_eq!(report.structure.deleted.len(), 3);

    let tree = coordinator.tree().await;
    assert!(tree.find_by_remote_id("child3").is_none());
    assert_eq!(tree.len(), 3);
}

/// Some servers keep "deleted" folders under Trash; the next snapshot wins
#[tokio::test]
async fn test_delete_kept_in_trash_is_tolerated() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new_in_memory().await.unwrap();
    let server = nested_server();
    server
        .add_folder_with_role("trash", DEFAULT_ROOT_ID, "Deleted Items", DistinguishedRole::Trash)
        .unwrap();
    server.set_delete_behavior(DeleteBehavior::KeepInTrash);
    let coordinator = open(&server, &database, dir.path()).await;
    sync_root(&coordinator).await;
    let child1 = coordinator.tree().await.find_by_remote_id("child1").unwrap();

    server.delete_folder("child1").unwrap();
    let report = sync_root(&coordinator).await;
    assert!(report.structure.deleted.is_empty());
    assert_eq!(report.structure.moved, vec![child1]);

    let tree = coordinator.tree().await;
    assert!(tree.find_by_path("Deleted Items/child1/child2/child3").is_some());
    let trash = tree.find_by_remote_id("trash").unwrap();
    assert!(tree.get(trash).unwrap().flags().contains(FolderFlags::TRASH));

    assert!(sync_root(&coordinator).await.structure.is_empty());
}

/// Distinguished folders get their well-known flags when created
#[tokio::test]
async fn test_role_flags_on_creation() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new_in_memory().await.unwrap();
    let server = MemoryServer::new();
    server
        .add_folder_with_role("in", DEFAULT_ROOT_ID, "Inbox", DistinguishedRole::Inbox)
        .unwrap();
    server
        .add_folder_with_role("sent", DEFAULT_ROOT_ID, "Sent Items", DistinguishedRole::Sent)
        .unwrap();
    server.add_folder("plain", DEFAULT_ROOT_ID, "Projects").unwrap();
    let server = Arc::new(server);
    let coordinator = open(&server, &database, dir.path()).await;
    sync_root(&coordinator).await;

    let tree = coordinator.tree().await;
    let flags = |remote: &str| tree.get(tree.find_by_remote_id(remote).unwrap()).unwrap().flags();
    assert!(flags("in").contains(FolderFlags::INBOX));
    assert!(flags("sent").contains(FolderFlags::SENT));
    assert_eq!(flags("plain"), FolderFlags::empty());

    let root = tree.get(tree.root()).unwrap();
    assert_eq!(root.children()[0], tree.find_by_remote_id("in").unwrap());
}

/// Concurrent requests share one directory fetch
#[tokio::test]
async fn test_requests_are_coalesced() {
    let dir = tempdir().unwrap();
    let database = SyncDatabase::new_in_memory().await.unwrap();
    let server = nested_server();
    server.set_directory_delay(Some(Duration::from_millis(100)));
    let coordinator = open(&server, &database, dir.path()).await;
    let root = coordinator.tree().await.root();

    let (a, b, c) = tokio::join!(
        coordinator.get_new_messages(root),
        coordinator.get_new_messages(root),
        coordinator.get_new_messages(root)
    );
    let ids = [a.unwrap().session_id, b.unwrap().session_id, c.unwrap().session_id];
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(server.directory_fetches(), 1);
    assert_eq!(coordinator.tree().await.len(), 6);
}
