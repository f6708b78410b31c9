//! Remote server collaborators
//!
//! The engine talks to a server through two traits: [`FolderDirectory`] lists
//! the authoritative folder hierarchy as a full snapshot, and
//! [`MessageSource`] lists message summaries and fetches bodies for one
//! folder. Transports (IMAP, EWS, ...) implement both; [`MemoryServer`] is an
//! in-process implementation used by the CLI and the tests.

pub mod error;
pub mod memory;

pub use error::{RemoteError, RemoteResult};
pub use memory::{DeleteBehavior, MemoryServer, ServerSnapshot, SnapshotMessage, DEFAULT_ROOT_ID};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known folder purpose, independent of the display name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistinguishedRole {
    Root,
    Inbox,
    Drafts,
    Sent,
    Outbox,
    Archive,
    Junk,
    Trash,
}

impl DistinguishedRole {
    /// Parse an EWS distinguished folder id or IMAP special-use attribute
    pub fn from_str(role: &str) -> Option<Self> {
        match role.trim_start_matches('\\').to_lowercase().as_str() {
            "root" | "msgfolderroot" => Some(DistinguishedRole::Root),
            "inbox" => Some(DistinguishedRole::Inbox),
            "drafts" => Some(DistinguishedRole::Drafts),
            "sent" | "sentitems" => Some(DistinguishedRole::Sent),
            "outbox" => Some(DistinguishedRole::Outbox),
            "archive" => Some(DistinguishedRole::Archive),
            "junk" | "junkemail" => Some(DistinguishedRole::Junk),
            "trash" | "deleteditems" => Some(DistinguishedRole::Trash),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistinguishedRole::Root => "root",
            DistinguishedRole::Inbox => "inbox",
            DistinguishedRole::Drafts => "drafts",
            DistinguishedRole::Sent => "sent",
            DistinguishedRole::Outbox => "outbox",
            DistinguishedRole::Archive => "archive",
            DistinguishedRole::Junk => "junk",
            DistinguishedRole::Trash => "trash",
        }
    }
}

impl fmt::Display for DistinguishedRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the server's folder directory
///
/// Identity is the `id`, which stays the same across renames and reparenting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFolder {
    pub id: String,
    #[serde(default)]
    pub parent_id: String,
    pub display_name: String,
    #[serde(default)]
    pub distinguished_role: Option<DistinguishedRole>,
}

impl RemoteFolder {
    pub fn new(id: &str, parent_id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            parent_id: parent_id.to_string(),
            display_name: display_name.to_string(),
            distinguished_role: None,
        }
    }

    pub fn with_role(mut self, role: DistinguishedRole) -> Self {
        self.distinguished_role = Some(role);
        self
    }

    pub fn is_root(&self) -> bool {
        self.distinguished_role == Some(DistinguishedRole::Root)
    }
}

/// Per-UID summary line of a folder listing
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub uid: u32,
    /// Raw flag atoms as the server sent them (`\Seen`, `$Forwarded`, labels)
    #[serde(default)]
    pub flags: Vec<String>,
    /// `Message-ID` header value
    #[serde(default)]
    pub message_id: Option<String>,
    /// Server-wide id shared by every folder showing the same message
    #[serde(default)]
    pub global_id: Option<String>,
    /// Provider-specific attributes (label lists, thread ids), kept opaque
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl RemoteMessage {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            ..Default::default()
        }
    }
}

/// Result of listing the messages of one folder
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FolderListing {
    pub uid_validity: u32,
    pub messages: Vec<RemoteMessage>,
}

/// A body as returned by the server, with its declared literal length still
/// in protocol form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBody {
    pub uid: u32,
    pub declared_length: String,
    pub data: Vec<u8>,
}

impl RemoteBody {
    /// Build a well-formed body whose declared length matches the data
    pub fn new(uid: u32, data: Vec<u8>) -> Self {
        Self {
            uid,
            declared_length: data.len().to_string(),
            data,
        }
    }
}

/// Source of the authoritative folder hierarchy
#[async_trait]
pub trait FolderDirectory: Send + Sync {
    /// Fetch the complete folder list. No incremental sync token is assumed.
    async fn fetch_directory(&self) -> RemoteResult<Vec<RemoteFolder>>;
}

/// Source of message summaries and bodies
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// List every message of a folder with its current flags
    async fn fetch_summaries(&self, folder_id: &str) -> RemoteResult<FolderListing>;

    /// Fetch one body. `None` means the server returned no body section.
    async fn fetch_body(&self, folder_id: &str, uid: u32) -> RemoteResult<Option<RemoteBody>>;
}

/// A full remote server: directory plus message access
pub trait RemoteServer: FolderDirectory + MessageSource {}

impl<T: FolderDirectory + MessageSource> RemoteServer for T {}
