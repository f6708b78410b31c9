//! Local message model
//!
//! A [`MessageSet`] holds the summaries of one folder keyed by UID, together
//! with the folder's UIDVALIDITY and highest UID. Server flag lists are parsed
//! into [`MessageFlags`] plus free-form keywords; the `OFFLINE` bit is private
//! to this crate and survives every flag update from the server.

pub mod sync;

pub use sync::{
    BodySource, CompactionReport, CopyOutcome, EngineOptions, FolderSyncReport, MessageDatabaseInfo,
    MessageSyncEngine, StreamMode, StreamedMessage, SyncError, SyncResult,
};

use crate::offline::StoreLocation;
use crate::remote::RemoteMessage;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;

/// Message-level data errors. These skip a single message, never a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Malformed flag '{0}'")]
    MalformedFlag(String),

    #[error("Invalid literal length '{0}'")]
    InvalidLiteralLength(String),

    #[error("Literal of {size} bytes exceeds the {max} byte limit")]
    LiteralTooLarge { size: u64, max: u64 },

    #[error("Literal declares {declared} bytes but {actual} were received")]
    LiteralLengthMismatch { declared: u64, actual: u64 },
}

pub type MessageResult<T> = Result<T, MessageError>;

bitflags! {
    /// Tracked message flags
    #[derive(Default, Serialize, Deserialize)]
    pub struct MessageFlags: u32 {
        const SEEN      = 0x0001;
        const ANSWERED  = 0x0002;
        const FLAGGED   = 0x0004;
        const DELETED   = 0x0008;
        const DRAFT     = 0x0010;
        const FORWARDED = 0x0020;
        /// Body is present in the folder's offline store. Never sent by servers.
        const OFFLINE   = 0x0100;

        /// Flags a server is allowed to control
        const SERVER_MANAGED = Self::SEEN.bits
            | Self::ANSWERED.bits
            | Self::FLAGGED.bits
            | Self::DELETED.bits
            | Self::DRAFT.bits
            | Self::FORWARDED.bits;
    }
}

fn is_atom_char(c: char) -> bool {
    !c.is_control() && !c.is_whitespace() && !matches!(c, '(' | ')' | '{' | '"' | '%' | '*' | ']')
}

/// Split a server flag list into known flags and keywords.
///
/// `\Recent`, unknown system flags and the `\*` marker are ignored. Any
/// atom that would not survive an IMAP round trip is rejected.
pub fn parse_flags(atoms: &[String]) -> MessageResult<(MessageFlags, BTreeSet<String>)> {
    let mut flags = MessageFlags::empty();
    let mut keywords = BTreeSet::new();

    for atom in atoms {
        let name = atom.strip_prefix('\\').unwrap_or(atom);
        if name.is_empty() || !name.chars().all(is_atom_char) {
            if atom == "\\*" {
                continue;
            }
            return Err(MessageError::MalformedFlag(atom.clone()));
        }

        match name.to_ascii_lowercase().as_str() {
            "seen" if atom.starts_with('\\') => flags |= MessageFlags::SEEN,
            "answered" if atom.starts_with('\\') => flags |= MessageFlags::ANSWERED,
            "flagged" if atom.starts_with('\\') => flags |= MessageFlags::FLAGGED,
            "deleted" if atom.starts_with('\\') => flags |= MessageFlags::DELETED,
            "draft" if atom.starts_with('\\') => flags |= MessageFlags::DRAFT,
            "recent" if atom.starts_with('\\') => {}
            "$forwarded" | "forwarded" => flags |= MessageFlags::FORWARDED,
            _ if atom.starts_with('\\') => {}
            _ => {
                keywords.insert(atom.clone());
            }
        }
    }

    Ok((flags, keywords))
}

/// Parse a literal length such as `1234` or `{1234}` as an unsigned integer
pub fn parse_literal_length(raw: &str) -> MessageResult<u64> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .map(|inner| inner.strip_suffix('+').unwrap_or(inner))
        .unwrap_or(trimmed);

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MessageError::InvalidLiteralLength(raw.to_string()));
    }
    digits
        .parse::<u64>()
        .map_err(|_| MessageError::InvalidLiteralLength(raw.to_string()))
}

/// Cross-folder identity of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKey {
    /// Server-wide id shared by all folders showing the message
    Global(String),
    /// Normalised `Message-ID` header
    MessageId(String),
}

impl MessageKey {
    pub fn message_id(raw: &str) -> Option<Self> {
        let normalised = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
        if normalised.is_empty() {
            None
        } else {
            Some(MessageKey::MessageId(normalised.to_string()))
        }
    }
}

/// Summary of one message as tracked locally
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalMessage {
    pub uid: u32,
    pub flags: MessageFlags,
    pub keywords: BTreeSet<String>,
    pub message_id: Option<String>,
    pub global_id: Option<String>,
    /// Provider attributes such as `X-GM-LABELS`, re-attached on every sync
    pub extensions: BTreeMap<String, String>,
    pub size: Option<u64>,
    /// Byte offset of the body in the folder's offline store
    pub store_token: Option<u64>,
    pub stored_length: Option<u64>,
}

impl LocalMessage {
    pub fn from_remote(remote: &RemoteMessage) -> MessageResult<Self> {
        let mut message = LocalMessage {
            uid: remote.uid,
            ..Default::default()
        };
        message.apply_remote(remote)?;
        Ok(message)
    }

    /// Replace server-managed state with the server's view.
    ///
    /// Returns whether anything changed. The message is untouched on error.
    pub fn apply_remote(&mut self, remote: &RemoteMessage) -> MessageResult<bool> {
        let (flags, keywords) = parse_flags(&remote.flags)?;
        let flags = (flags & MessageFlags::SERVER_MANAGED) | (self.flags & MessageFlags::OFFLINE);

        let mut changed = false;
        if self.flags != flags {
            self.flags = flags;
            changed = true;
        }
        if self.keywords != keywords {
            self.keywords = keywords;
            changed = true;
        }
        if self.extensions != remote.extensions {
            self.extensions = remote.extensions.clone();
            changed = true;
        }
        if remote.message_id.is_some() && self.message_id != remote.message_id {
            self.message_id = remote.message_id.clone();
            changed = true;
        }
        if remote.global_id.is_some() && self.global_id != remote.global_id {
            self.global_id = remote.global_id.clone();
            changed = true;
        }
        if remote.size.is_some() && self.size != remote.size {
            self.size = remote.size;
            changed = true;
        }
        Ok(changed)
    }

    /// Every key this message can be matched by in other folders
    pub fn keys(&self) -> Vec<MessageKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(global) = self.global_id.as_deref().filter(|g| !g.is_empty()) {
            keys.push(MessageKey::Global(global.to_string()));
        }
        if let Some(key) = self.message_id.as_deref().and_then(MessageKey::message_id) {
            keys.push(key);
        }
        keys
    }

    pub fn is_offline(&self) -> bool {
        self.flags.contains(MessageFlags::OFFLINE)
    }

    pub fn location(&self) -> Option<StoreLocation> {
        match (self.store_token, self.stored_length) {
            (Some(token), Some(length)) if self.is_offline() => Some(StoreLocation { token, length }),
            _ => None,
        }
    }

    pub fn mark_offline(&mut self, location: StoreLocation) {
        self.flags |= MessageFlags::OFFLINE;
        self.store_token = Some(location.token);
        self.stored_length = Some(location.length);
    }

    pub fn clear_offline(&mut self) {
        self.flags.remove(MessageFlags::OFFLINE);
        self.store_token = None;
        self.stored_length = None;
    }
}

/// Result of applying one summary to a [`MessageSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Updated,
    Unchanged,
}

/// Messages of one folder keyed by UID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSet {
    pub uid_validity: u32,
    pub highest_uid: u32,
    messages: BTreeMap<u32, LocalMessage>,
}

impl MessageSet {
    pub fn new(uid_validity: u32) -> Self {
        Self {
            uid_validity,
            ..Default::default()
        }
    }

    pub fn from_messages(uid_validity: u32, highest_uid: u32, messages: Vec<LocalMessage>) -> Self {
        let messages: BTreeMap<u32, LocalMessage> = messages.into_iter().map(|m| (m.uid, m)).collect();
        let highest_uid = messages.keys().next_back().copied().unwrap_or(0).max(highest_uid);
        Self {
            uid_validity,
            highest_uid,
            messages,
        }
    }

    pub fn get(&self, uid: u32) -> Option<&LocalMessage> {
        self.messages.get(&uid)
    }

    pub fn get_mut(&mut self, uid: u32) -> Option<&mut LocalMessage> {
        self.messages.get_mut(&uid)
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.messages.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalMessage> {
        self.messages.values()
    }

    pub fn insert(&mut self, message: LocalMessage) {
        self.highest_uid = self.highest_uid.max(message.uid);
        self.messages.insert(message.uid, message);
    }

    pub fn remove(&mut self, uid: u32) -> Option<LocalMessage> {
        self.messages.remove(&uid)
    }

    /// Apply a server summary by UID. Re-applying the same summary is a no-op.
    pub fn upsert(&mut self, remote: &RemoteMessage) -> MessageResult<UpsertOutcome> {
        if let Some(existing) = self.messages.get_mut(&remote.uid) {
            return Ok(if existing.apply_remote(remote)? {
                UpsertOutcome::Updated
            } else {
                UpsertOutcome::Unchanged
            });
        }

        self.insert(LocalMessage::from_remote(remote)?);
        Ok(UpsertOutcome::Added)
    }

    /// Remove every message whose UID the server no longer lists
    pub fn expunge_missing(&mut self, present: &HashSet<u32>) -> Vec<LocalMessage> {
        let gone: Vec<u32> = self
            .messages
            .keys()
            .copied()
            .filter(|uid| !present.contains(uid))
            .collect();
        gone.into_iter().filter_map(|uid| self.messages.remove(&uid)).collect()
    }

    /// Drop everything after a UIDVALIDITY change
    pub fn reset(&mut self, uid_validity: u32) {
        self.uid_validity = uid_validity;
        self.highest_uid = 0;
        self.messages.clear();
    }

    /// Offline locations of every cached body, by UID
    pub fn offline_locations(&self) -> BTreeMap<u32, StoreLocation> {
        self.messages
            .values()
            .filter_map(|m| m.location().map(|loc| (m.uid, loc)))
            .collect()
    }
}
