//! In-process mail server
//!
//! `MemoryServer` keeps a folder directory and per-folder mailboxes in memory
//! and serves them through [`FolderDirectory`] and [`MessageSource`]. It can be
//! loaded from a JSON snapshot (used by the `mailsync` binary) and scripted
//! with the quirks real servers exhibit: failing listings, slow directory
//! fetches, and deletes that leave the folder behind in Trash.

use super::{
    DistinguishedRole, FolderDirectory, FolderListing, MessageSource, RemoteBody, RemoteError,
    RemoteFolder, RemoteMessage, RemoteResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Id of the root folder of a fresh server
pub const DEFAULT_ROOT_ID: &str = "msgfolderroot";

/// What the server does when asked to delete a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteBehavior {
    /// The folder and its descendants disappear from the directory
    #[default]
    Remove,
    /// The folder is silently moved under the Trash folder instead
    KeepInTrash,
}

/// Serializable picture of a server's content
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    pub folders: Vec<RemoteFolder>,
    #[serde(default)]
    pub messages: Vec<SnapshotMessage>,
    #[serde(default)]
    pub uid_validity: BTreeMap<String, u32>,
    #[serde(default)]
    pub delete_behavior: DeleteBehavior,
}

/// A message placed in one folder of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMessage {
    pub folder: String,
    #[serde(flatten)]
    pub summary: RemoteMessage,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    summary: RemoteMessage,
    body: Option<Vec<u8>>,
    declared_length: Option<String>,
}

#[derive(Debug, Clone)]
struct Mailbox {
    uid_validity: u32,
    next_uid: u32,
    messages: BTreeMap<u32, StoredMessage>,
}

impl Mailbox {
    fn new(uid_validity: u32) -> Self {
        Self {
            uid_validity,
            next_uid: 1,
            messages: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ServerState {
    folders: Vec<RemoteFolder>,
    mailboxes: HashMap<String, Mailbox>,
    delete_behavior: DeleteBehavior,
    directory_failure: Option<String>,
    auth_failure: Option<String>,
    failing_folders: HashSet<String>,
    directory_delay: Option<Duration>,
    reverse_listing: bool,
    directory_fetches: usize,
    summary_fetches: usize,
    body_fetches: usize,
}

impl ServerState {
    fn folder_index(&self, id: &str) -> Option<usize> {
        self.folders.iter().position(|f| f.id == id)
    }

    fn contains(&self, id: &str) -> bool {
        self.folder_index(id).is_some()
    }

    /// Ids of `id` and everything below it, parents first
    fn subtree(&self, id: &str) -> Vec<String> {
        let mut result = vec![id.to_string()];
        let mut cursor = 0;
        while cursor < result.len() {
            let current = result[cursor].clone();
            for folder in &self.folders {
                if folder.parent_id == current && !result.contains(&folder.id) {
                    result.push(folder.id.clone());
                }
            }
            cursor += 1;
        }
        result
    }

    fn trash_id(&self) -> Option<String> {
        self.folders
            .iter()
            .find(|f| f.distinguished_role == Some(DistinguishedRole::Trash))
            .map(|f| f.id.clone())
    }

    fn next_uid_validity(&self) -> u32 {
        self.mailboxes.len() as u32 + 1
    }
}

/// In-memory implementation of the remote collaborators
#[derive(Debug, Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
}

impl MemoryServer {
    /// Create a server holding only its root folder
    pub fn new() -> Self {
        let server = Self::default();
        server.state().folders.push(
            RemoteFolder::new(DEFAULT_ROOT_ID, "", "Root").with_role(DistinguishedRole::Root),
        );
        server
    }

    /// Build a server from a snapshot
    pub fn from_snapshot(snapshot: ServerSnapshot) -> RemoteResult<Self> {
        let server = Self::default();
        {
            let mut state = server.state();
            state.delete_behavior = snapshot.delete_behavior;
            for folder in snapshot.folders {
                let validity = snapshot
                    .uid_validity
                    .get(&folder.id)
                    .copied()
                    .unwrap_or_else(|| state.next_uid_validity());
                state.mailboxes.insert(folder.id.clone(), Mailbox::new(validity));
                state.folders.push(folder);
            }
            if !state.folders.iter().any(|f| f.is_root()) {
                return Err(RemoteError::protocol("snapshot has no root folder"));
            }
        }

        for message in snapshot.messages {
            let body = message.body.map(String::into_bytes);
            server.insert_message(&message.folder, message.summary, body)?;
        }
        Ok(server)
    }

    /// Parse a JSON snapshot
    pub fn from_json(json: &str) -> RemoteResult<Self> {
        let snapshot: ServerSnapshot = serde_json::from_str(json)
            .map_err(|e| RemoteError::protocol(format!("invalid snapshot: {}", e)))?;
        Self::from_snapshot(snapshot)
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Id of the root folder
    pub fn root_id(&self) -> Option<String> {
        self.state()
            .folders
            .iter()
            .find(|f| f.is_root())
            .map(|f| f.id.clone())
    }

    pub fn add_folder(&self, id: &str, parent_id: &str, name: &str) -> RemoteResult<()> {
        self.insert_folder(RemoteFolder::new(id, parent_id, name))
    }

    pub fn add_folder_with_role(
        &self,
        id: &str,
        parent_id: &str,
        name: &str,
        role: DistinguishedRole,
    ) -> RemoteResult<()> {
        self.insert_folder(RemoteFolder::new(id, parent_id, name).with_role(role))
    }

    fn insert_folder(&self, folder: RemoteFolder) -> RemoteResult<()> {
        let mut state = self.state();
        if state.contains(&folder.id) {
            return Err(RemoteError::server(format!("folder {} already exists", folder.id)));
        }
        if !state.contains(&folder.parent_id) {
            return Err(RemoteError::folder_not_found(folder.parent_id));
        }
        let validity = state.next_uid_validity();
        state.mailboxes.insert(folder.id.clone(), Mailbox::new(validity));
        state.folders.push(folder);
        Ok(())
    }

    pub fn rename_folder(&self, id: &str, new_name: &str) -> RemoteResult<()> {
        let mut state = self.state();
        let index = state
            .folder_index(id)
            .ok_or_else(|| RemoteError::folder_not_found(id))?;
        state.folders[index].display_name = new_name.to_string();
        Ok(())
    }

    pub fn move_folder(&self, id: &str, new_parent_id: &str) -> RemoteResult<()> {
        let mut state = self.state();
        if !state.contains(new_parent_id) {
            return Err(RemoteError::folder_not_found(new_parent_id));
        }
        if state.subtree(id).iter().any(|f| f == new_parent_id) {
            return Err(RemoteError::server("cannot move a folder below itself"));
        }
        let index = state
            .folder_index(id)
            .ok_or_else(|| RemoteError::folder_not_found(id))?;
        state.folders[index].parent_id = new_parent_id.to_string();
        Ok(())
    }

    /// Delete a folder, honouring the configured [`DeleteBehavior`]
    pub fn delete_folder(&self, id: &str) -> RemoteResult<()> {
        let mut state = self.state();
        if !state.contains(id) {
            return Err(RemoteError::folder_not_found(id));
        }

        if state.delete_behavior == DeleteBehavior::KeepInTrash {
            if let Some(trash) = state.trash_id() {
                if trash != id {
                    debug!("Keeping deleted folder {} under Trash", id);
                    if let Some(index) = state.folder_index(id) {
                        state.folders[index].parent_id = trash;
                    }
                    return Ok(());
                }
            }
        }

        let removed: HashSet<String> = state.subtree(id).into_iter().collect();
        state.folders.retain(|f| !removed.contains(&f.id));
        state.mailboxes.retain(|k, _| !removed.contains(k));
        Ok(())
    }

    pub fn set_delete_behavior(&self, behavior: DeleteBehavior) {
        self.state().delete_behavior = behavior;
    }

    /// Add a message, assigning the next UID of the folder when `uid` is 0
    pub fn add_message(
        &self,
        folder_id: &str,
        message: RemoteMessage,
        body: &[u8],
    ) -> RemoteResult<u32> {
        self.insert_message(folder_id, message, Some(body.to_vec()))
    }

    fn insert_message(
        &self,
        folder_id: &str,
        mut message: RemoteMessage,
        body: Option<Vec<u8>>,
    ) -> RemoteResult<u32> {
        let mut state = self.state();
        let mailbox = state
            .mailboxes
            .get_mut(folder_id)
            .ok_or_else(|| RemoteError::folder_not_found(folder_id))?;

        if message.uid == 0 {
            message.uid = mailbox.next_uid;
        }
        mailbox.next_uid = mailbox.next_uid.max(message.uid.saturating_add(1));
        if message.size.is_none() {
            message.size = body.as_ref().map(|b| b.len() as u64);
        }

        let uid = message.uid;
        mailbox.messages.insert(
            uid,
            StoredMessage {
                summary: message,
                body,
                declared_length: None,
            },
        );
        Ok(uid)
    }

    fn with_message<R>(
        &self,
        folder_id: &str,
        uid: u32,
        f: impl FnOnce(&mut StoredMessage) -> R,
    ) -> RemoteResult<R> {
        let mut state = self.state();
        let message = state
            .mailboxes
            .get_mut(folder_id)
            .ok_or_else(|| RemoteError::folder_not_found(folder_id))?
            .messages
            .get_mut(&uid)
            .ok_or_else(|| RemoteError::server(format!("no message with UID {}", uid)))?;
        Ok(f(message))
    }

    /// Replace the flags of a message
    pub fn set_flags(&self, folder_id: &str, uid: u32, flags: &[&str]) -> RemoteResult<()> {
        self.with_message(folder_id, uid, |m| {
            m.summary.flags = flags.iter().map(|f| f.to_string()).collect();
        })
    }

    /// Set a provider extension attribute on a message
    pub fn set_extension(&self, folder_id: &str, uid: u32, key: &str, value: &str) -> RemoteResult<()> {
        self.with_message(folder_id, uid, |m| {
            m.summary.extensions.insert(key.to_string(), value.to_string());
        })
    }

    /// Make the server announce a different literal length than the body has
    pub fn set_declared_length(&self, folder_id: &str, uid: u32, length: &str) -> RemoteResult<()> {
        self.with_message(folder_id, uid, |m| {
            m.declared_length = Some(length.to_string());
        })
    }

    /// Drop the body section of a message so fetches return nothing
    pub fn drop_body(&self, folder_id: &str, uid: u32) -> RemoteResult<()> {
        self.with_message(folder_id, uid, |m| {
            m.body = None;
        })
    }

    pub fn expunge(&self, folder_id: &str, uid: u32) -> RemoteResult<()> {
        let mut state = self.state();
        let mailbox = state
            .mailboxes
            .get_mut(folder_id)
            .ok_or_else(|| RemoteError::folder_not_found(folder_id))?;
        mailbox.messages.remove(&uid);
        Ok(())
    }

    pub fn set_uid_validity(&self, folder_id: &str, uid_validity: u32) -> RemoteResult<()> {
        let mut state = self.state();
        let mailbox = state
            .mailboxes
            .get_mut(folder_id)
            .ok_or_else(|| RemoteError::folder_not_found(folder_id))?;
        mailbox.uid_validity = uid_validity;
        Ok(())
    }

    /// Make directory fetches fail with a connection error
    pub fn set_directory_failure(&self, message: Option<&str>) {
        self.state().directory_failure = message.map(str::to_string);
    }

    /// Make every fetch fail with an authentication error
    pub fn set_auth_failure(&self, message: Option<&str>) {
        self.state().auth_failure = message.map(str::to_string);
    }

    /// Make summary and body fetches for one folder fail
    pub fn set_folder_failure(&self, folder_id: &str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_folders.insert(folder_id.to_string());
        } else {
            state.failing_folders.remove(folder_id);
        }
    }

    pub fn set_directory_delay(&self, delay: Option<Duration>) {
        self.state().directory_delay = delay;
    }

    /// List children before their parents
    pub fn set_reverse_listing(&self, reverse: bool) {
        self.state().reverse_listing = reverse;
    }

    pub fn directory_fetches(&self) -> usize {
        self.state().directory_fetches
    }

    pub fn summary_fetches(&self) -> usize {
        self.state().summary_fetches
    }

    pub fn body_fetches(&self) -> usize {
        self.state().body_fetches
    }

    /// Current directory, as a client would see it
    pub fn folders(&self) -> Vec<RemoteFolder> {
        self.state().folders.clone()
    }

    fn check_folder(state: &ServerState, folder_id: &str) -> RemoteResult<()> {
        if let Some(message) = &state.auth_failure {
            return Err(RemoteError::authentication(message.clone()));
        }
        if state.failing_folders.contains(folder_id) {
            return Err(RemoteError::server(format!("folder {} is unavailable", folder_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl FolderDirectory for MemoryServer {
    async fn fetch_directory(&self) -> RemoteResult<Vec<RemoteFolder>> {
        let delay = {
            let mut state = self.state();
            state.directory_fetches += 1;
            state.directory_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state();
        if let Some(message) = &state.auth_failure {
            return Err(RemoteError::authentication(message.clone()));
        }
        if let Some(message) = &state.directory_failure {
            return Err(RemoteError::connection(message.clone()));
        }

        let mut folders = state.folders.clone();
        if state.reverse_listing {
            folders.reverse();
        }
        Ok(folders)
    }
}

#[async_trait]
impl MessageSource for MemoryServer {
    async fn fetch_summaries(&self, folder_id: &str) -> RemoteResult<FolderListing> {
        let mut state = self.state();
        state.summary_fetches += 1;
        Self::check_folder(&state, folder_id)?;

        let mailbox = state
            .mailboxes
            .get(folder_id)
            .ok_or_else(|| RemoteError::folder_not_found(folder_id))?;

        Ok(FolderListing {
            uid_validity: mailbox.uid_validity,
            messages: mailbox.messages.values().map(|m| m.summary.clone()).collect(),
        })
    }

    async fn fetch_body(&self, folder_id: &str, uid: u32) -> RemoteResult<Option<RemoteBody>> {
        let mut state = self.state();
        state.body_fetches += 1;
        Self::check_folder(&state, folder_id)?;

        let mailbox = state
            .mailboxes
            .get(folder_id)
            .ok_or_else(|| RemoteError::folder_not_found(folder_id))?;

        let message = match mailbox.messages.get(&uid) {
            Some(message) => message,
            None => return Ok(None),
        };

        Ok(message.body.as_ref().map(|data| RemoteBody {
            uid,
            declared_length: message
                .declared_length
                .clone()
                .unwrap_or_else(|| data.len().to_string()),
            data: data.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_listing() {
        let server = MemoryServer::new();
        server.add_folder("inbox", DEFAULT_ROOT_ID, "Inbox").unwrap();
        server.add_folder("work", "inbox", "Work").unwrap();

        let folders = server.fetch_directory().await.unwrap();
        assert_eq!(folders.len(), 3);
        assert_eq!(server.directory_fetches(), 1);

        server.set_reverse_listing(true);
        let folders = server.fetch_directory().await.unwrap();
        assert_eq!(folders[0].id, "work");
    }

    #[tokio::test]
    async fn test_highest_possible_uid() {
        let server = MemoryServer::new();
        server.add_folder("inbox", DEFAULT_ROOT_ID, "Inbox").unwrap();
        let uid = server.add_message("inbox", RemoteMessage::new(u32::MAX), b"last\n").unwrap();
        assert_eq!(uid, u32::MAX);

        let listing = server.fetch_summaries("inbox").await.unwrap();
        assert_eq!(listing.messages.len(), 1);
        assert_eq!(listing.messages[0].uid, u32::MAX);
    }

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let server = MemoryServer::new();
        server.add_folder("a", DEFAULT_ROOT_ID, "A").unwrap();
        server.add_folder("b", "a", "B").unwrap();
        server.delete_folder("a").unwrap();

        let folders = server.fetch_directory().await.unwrap();
        assert_eq!(folders.len(), 1);
        assert!(server.fetch_summaries("b").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_kept_in_trash() {
        let server = MemoryServer::new();
        server
            .add_folder_with_role("trash", DEFAULT_ROOT_ID, "Trash", DistinguishedRole::Trash)
            .unwrap();
        server.add_folder("a", DEFAULT_ROOT_ID, "A").unwrap();
        server.set_delete_behavior(DeleteBehavior::KeepInTrash);
        server.delete_folder("a").unwrap();

        let folders = server.fetch_directory().await.unwrap();
        let a = folders.iter().find(|f| f.id == "a").unwrap();
        assert_eq!(a.parent_id, "trash");
    }

    #[tokio::test]
    async fn test_messages_and_failures() {
        let server = MemoryServer::new();
        server.add_folder("inbox", DEFAULT_ROOT_ID, "Inbox").unwrap();
        let uid = server
            .add_message("inbox", RemoteMessage::new(0), b"Subject: hi\r\n\r\nbody\r\n")
            .unwrap();
        assert_eq!(uid, 1);

        let listing = server.fetch_summaries("inbox").await.unwrap();
        assert_eq!(listing.messages.len(), 1);
        assert_eq!(listing.messages[0].size, Some(21));

        let body = server.fetch_body("inbox", uid).await.unwrap().unwrap();
        assert_eq!(body.declared_length, "21");

        server.set_folder_failure("inbox", true);
        assert!(server.fetch_summaries("inbox").await.is_err());

        server.set_directory_failure(Some("connection reset"));
        let err = server.fetch_directory().await.unwrap_err();
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_snapshot_json() {
        let server = MemoryServer::from_json(
            r#"{
                "folders": [
                    {"id": "root", "displayName": "Root", "distinguishedRole": "root"},
                    {"id": "inbox", "parentId": "root", "displayName": "INBOX", "distinguishedRole": "inbox"}
                ],
                "messages": [
                    {"folder": "inbox", "uid": 7, "flags": ["\\Seen"], "messageId": "<a@b>", "body": "hello"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(server.root_id().as_deref(), Some("root"));
        assert_eq!(server.folders().len(), 2);
    }

    #[test]
    fn test_snapshot_requires_root() {
        let result = MemoryServer::from_json(
            r#"{"folders": [{"id": "inbox", "parentId": "root", "displayName": "INBOX"}]}"#,
        );
        assert!(result.is_err());
    }
}
