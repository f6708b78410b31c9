//! Typed folder properties and flags
//!
//! Folder properties that the engine relies on are struct fields, so a
//! misspelt key is a compile error instead of a silently missing value.
//! Provider-specific values go through the `extensions` map.

use crate::remote::DistinguishedRole;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

bitflags! {
    /// Folder flags persisted with each local folder
    #[derive(Default)]
    pub struct FolderFlags: u32 {
        /// The account root, standing for the server itself
        const SERVER  = 0x0001;
        const INBOX   = 0x0002;
        const DRAFTS  = 0x0004;
        const SENT    = 0x0008;
        const OUTBOX  = 0x0010;
        const ARCHIVE = 0x0020;
        const JUNK    = 0x0040;
        const TRASH   = 0x0080;
        /// Bodies of this folder are kept in its offline store
        const OFFLINE = 0x0100;

        const SPECIAL_USE = Self::INBOX.bits
            | Self::DRAFTS.bits
            | Self::SENT.bits
            | Self::OUTBOX.bits
            | Self::ARCHIVE.bits
            | Self::JUNK.bits
            | Self::TRASH.bits;
    }
}

impl FolderFlags {
    /// Flags a folder gets for its distinguished role
    pub fn for_role(role: DistinguishedRole) -> Self {
        match role {
            DistinguishedRole::Root => FolderFlags::SERVER,
            DistinguishedRole::Inbox => FolderFlags::INBOX,
            DistinguishedRole::Drafts => FolderFlags::DRAFTS,
            DistinguishedRole::Sent => FolderFlags::SENT,
            DistinguishedRole::Outbox => FolderFlags::OUTBOX,
            DistinguishedRole::Archive => FolderFlags::ARCHIVE,
            DistinguishedRole::Junk => FolderFlags::JUNK,
            DistinguishedRole::Trash => FolderFlags::TRASH,
        }
    }

    /// Position among siblings: special folders first, in a fixed order
    pub(crate) fn sort_rank(&self) -> u8 {
        if self.contains(FolderFlags::INBOX) {
            0
        } else if self.contains(FolderFlags::DRAFTS) {
            1
        } else if self.contains(FolderFlags::SENT) {
            2
        } else if self.contains(FolderFlags::OUTBOX) {
            3
        } else if self.contains(FolderFlags::ARCHIVE) {
            4
        } else if self.contains(FolderFlags::JUNK) {
            5
        } else if self.contains(FolderFlags::TRASH) {
            6
        } else {
            7
        }
    }
}

/// Value stored under a provider-specific extension key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

/// Persisted properties of a local folder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderProperties {
    /// Server id used to re-match the folder across sessions and restarts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<DistinguishedRole>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extensions: BTreeMap<String, PropertyValue>,
}

impl FolderProperties {
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn set_remote_id(&mut self, remote_id: impl Into<String>) {
        self.remote_id = Some(remote_id.into());
    }

    pub fn role(&self) -> Option<DistinguishedRole> {
        self.role
    }

    pub fn set_role(&mut self, role: Option<DistinguishedRole>) {
        self.role = role;
    }

    pub fn extension(&self, key: &str) -> Option<&PropertyValue> {
        self.extensions.get(key)
    }

    pub fn extension_text(&self, key: &str) -> Option<&str> {
        match self.extensions.get(key) {
            Some(PropertyValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn extension_integer(&self, key: &str) -> Option<i64> {
        match self.extensions.get(key) {
            Some(PropertyValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn set_extension(&mut self, key: &str, value: impl Into<PropertyValue>) {
        self.extensions.insert(key.to_string(), value.into());
    }

    pub fn remove_extension(&mut self, key: &str) -> Option<PropertyValue> {
        self.extensions.remove(key)
    }

    pub fn extensions(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.extensions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_flags() {
        assert_eq!(FolderFlags::for_role(DistinguishedRole::Trash), FolderFlags::TRASH);
        assert!(FolderFlags::SPECIAL_USE.contains(FolderFlags::INBOX));
        assert!(!FolderFlags::SPECIAL_USE.contains(FolderFlags::SERVER));
        assert!(FolderFlags::INBOX.sort_rank() < FolderFlags::TRASH.sort_rank());
        assert!(FolderFlags::TRASH.sort_rank() < FolderFlags::empty().sort_rank());
    }

    #[test]
    fn test_typed_extensions() {
        let mut props = FolderProperties::default();
        props.set_remote_id("AAMkAD");
        props.set_extension("color", "blue");
        props.set_extension("unreadBadge", 3i64);
        props.set_extension("pinned", true);

        assert_eq!(props.remote_id(), Some("AAMkAD"));
        assert_eq!(props.extension_text("color"), Some("blue"));
        assert_eq!(props.extension_integer("unreadBadge"), Some(3));
        assert_eq!(props.extension("pinned"), Some(&PropertyValue::Bool(true)));
        assert_eq!(props.extension_text("unreadBadge"), None);
        assert_eq!(props.extensions().count(), 3);

        assert_eq!(props.remove_extension("color"), Some(PropertyValue::from("blue")));
        assert_eq!(props.extension("color"), None);
    }

    #[test]
    fn test_json_persistence() {
        let mut props = FolderProperties::default();
        props.set_remote_id("f-42");
        props.set_role(Some(DistinguishedRole::Inbox));
        props.set_extension("sortKey", 7i64);

        let json = props.to_json().unwrap();
        assert!(json.contains("\"remoteId\":\"f-42\""));
        let restored = FolderProperties::from_json(&json).unwrap();
        assert_eq!(restored, props);

        let empty = FolderProperties::from_json("{}").unwrap();
        assert_eq!(empty.remote_id(), None);
    }
}
