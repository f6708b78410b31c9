//! Local folder tree
//!
//! Folders live in an id-keyed arena owned by [`FolderTree`]. Parents and
//! children refer to each other by [`FolderId`], so subtree walks and deletes
//! are plain loops with no recursion and no reference cycles. Ids are stable
//! for the life of a folder, including across renames and moves, and are the
//! key of the folder's offline store and message database.

pub mod properties;
pub mod reconcile;

pub use properties::{FolderFlags, FolderProperties, PropertyValue};
pub use reconcile::{FolderOperation, FolderTreeReconciler, ReconcileOutcome, ReconcilePlan};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Folder tree errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FolderError {
    #[error("Folder not found: {0}")]
    NotFound(FolderId),

    #[error("Cannot {0} the account root")]
    RootOperation(&'static str),

    #[error("Folder {0} cannot be moved into itself")]
    MoveIntoSelf(FolderId),

    #[error("Folder {child} cannot be moved below its own descendant {target}")]
    MoveIntoDescendant { child: FolderId, target: FolderId },

    #[error("Folder {child} is not a child of {parent}")]
    NotAChild { parent: FolderId, child: FolderId },

    #[error("Invalid folder records: {0}")]
    InvalidRecords(String),

    #[error("Remote directory has no root folder")]
    MissingRemoteRoot,

    #[error("Remote directory has more than one root folder")]
    AmbiguousRemoteRoot,
}

pub type FolderResult<T> = Result<T, FolderError>;

/// Stable local identifier of a folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderId(pub u64);

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A folder of the local tree
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFolder {
    id: FolderId,
    name: String,
    parent: Option<FolderId>,
    children: Vec<FolderId>,
    ordinal: Option<u64>,
    flags: FolderFlags,
    properties: FolderProperties,
}

impl LocalFolder {
    fn new(id: FolderId, name: &str, parent: Option<FolderId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent,
            children: Vec::new(),
            ordinal: None,
            flags: FolderFlags::empty(),
            properties: FolderProperties::default(),
        }
    }

    pub fn id(&self) -> FolderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<FolderId> {
        self.parent
    }

    pub fn children(&self) -> &[FolderId] {
        &self.children
    }

    pub fn ordinal(&self) -> Option<u64> {
        self.ordinal
    }

    pub fn flags(&self) -> FolderFlags {
        self.flags
    }

    pub fn properties(&self) -> &FolderProperties {
        &self.properties
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.properties.remote_id()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Flat, persistable form of a folder
#[derive(Debug, Clone, PartialEq)]
pub struct FolderRecord {
    pub id: FolderId,
    pub parent: Option<FolderId>,
    pub name: String,
    pub ordinal: Option<u64>,
    pub flags: FolderFlags,
    pub properties: FolderProperties,
}

/// Outcome of reconciling a parent's children against a list of names
#[derive(Debug, Default)]
pub struct ChildrenDiff {
    pub created: Vec<FolderId>,
    pub deleted: Vec<LocalFolder>,
}

/// Sibling order: explicit ordinals first, then special folders, then by name
fn compare_folders(a: &LocalFolder, b: &LocalFolder) -> Ordering {
    match (a.ordinal, b.ordinal) {
        (Some(x), Some(y)) if x != y => return x.cmp(&y),
        (Some(_), None) => return Ordering::Less,
        (None, Some(_)) => return Ordering::Greater,
        _ => {}
    }

    a.flags
        .sort_rank()
        .cmp(&b.flags.sort_rank())
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.id.cmp(&b.id))
}

/// The folder hierarchy of one account
#[derive(Debug, Clone, PartialEq)]
pub struct FolderTree {
    account_id: String,
    root: FolderId,
    folders: BTreeMap<FolderId, LocalFolder>,
    next_id: u64,
}

impl FolderTree {
    /// Create a tree holding only the account root
    pub fn new(account_id: &str) -> Self {
        let root_id = FolderId(1);
        let mut root = LocalFolder::new(root_id, account_id, None);
        root.flags = FolderFlags::SERVER;

        let mut folders = BTreeMap::new();
        folders.insert(root_id, root);

        Self {
            account_id: account_id.to_string(),
            root: root_id,
            folders,
            next_id: 2,
        }
    }

    /// Rebuild a tree from persisted records. Ids below `next_id` are never
    /// handed out again, even if their folders were deleted.
    pub fn from_records(account_id: &str, records: Vec<FolderRecord>, next_id: u64) -> FolderResult<Self> {
        let mut roots = records.iter().filter(|r| r.parent.is_none());
        let root = match (roots.next(), roots.next()) {
            (Some(root), None) => root.id,
            (None, _) => return Err(FolderError::InvalidRecords("no root folder".to_string())),
            (Some(_), Some(_)) => {
                return Err(FolderError::InvalidRecords("more than one root folder".to_string()))
            }
        };

        let mut folders = BTreeMap::new();
        for record in &records {
            let mut folder = LocalFolder::new(record.id, &record.name, record.parent);
            folder.ordinal = record.ordinal;
            folder.flags = record.flags;
            folder.properties = record.properties.clone();
            if folders.insert(record.id, folder).is_some() {
                return Err(FolderError::InvalidRecords(format!("duplicate folder {}", record.id)));
            }
        }

        for record in &records {
            if let Some(parent) = record.parent {
                let parent = folders.get_mut(&parent).ok_or_else(|| {
                    FolderError::InvalidRecords(format!("folder {} has a missing parent", record.id))
                })?;
                parent.children.push(record.id);
            }
        }

        let next_id = (folders.keys().map(|id| id.0).max().unwrap_or(0) + 1).max(next_id);
        let mut tree = Self {
            account_id: account_id.to_string(),
            root,
            folders,
            next_id,
        };

        let reachable = tree.descendants(root).len() + 1;
        if reachable != tree.folders.len() {
            return Err(FolderError::InvalidRecords(format!(
                "{} folders are not reachable from the root",
                tree.folders.len() - reachable
            )));
        }

        let parents: Vec<FolderId> = tree.folders.keys().copied().collect();
        for parent in parents {
            tree.sort_children(parent);
        }

        debug!("Loaded {} folders for account {}", tree.folders.len(), account_id);
        Ok(tree)
    }

    /// Flatten the tree, parents before children
    pub fn records(&self) -> Vec<FolderRecord> {
        std::iter::once(self.root)
            .chain(self.descendants(self.root))
            .filter_map(|id| self.folders.get(&id))
            .map(|f| FolderRecord {
                id: f.id,
                parent: f.parent,
                name: f.name.clone(),
                ordinal: f.ordinal,
                flags: f.flags,
                properties: f.properties.clone(),
            })
            .collect()
    }

    /// Id the next created folder will get
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn root(&self) -> FolderId {
        self.root
    }

    pub fn get(&self, id: FolderId) -> Option<&LocalFolder> {
        self.folders.get(&id)
    }

    pub fn contains(&self, id: FolderId) -> bool {
        self.folders.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalFolder> {
        self.folders.values()
    }

    fn folder(&self, id: FolderId) -> FolderResult<&LocalFolder> {
        self.folders.get(&id).ok_or(FolderError::NotFound(id))
    }

    fn folder_mut(&mut self, id: FolderId) -> FolderResult<&mut LocalFolder> {
        self.folders.get_mut(&id).ok_or(FolderError::NotFound(id))
    }

    fn sort_children(&mut self, parent: FolderId) {
        let mut children = match self.folders.get_mut(&parent) {
            Some(folder) => std::mem::take(&mut folder.children),
            None => return,
        };

        let folders = &self.folders;
        children.sort_by(|a, b| match (folders.get(a), folders.get(b)) {
            (Some(a), Some(b)) => compare_folders(a, b),
            _ => a.cmp(b),
        });

        if let Some(folder) = self.folders.get_mut(&parent) {
            folder.children = children;
        }
    }

    /// Create a folder under `parent`
    pub fn insert_folder(&mut self, parent: FolderId, name: &str) -> FolderResult<FolderId> {
        self.folder(parent)?;

        let id = FolderId(self.next_id);
        self.next_id += 1;
        self.folders.insert(id, LocalFolder::new(id, name, Some(parent)));
        self.folder_mut(parent)?.children.push(id);
        self.sort_children(parent);

        debug!("Inserted folder '{}' ({}) under {}", name, id, parent);
        Ok(id)
    }

    /// Delete a folder and everything below it, returning the removed folders
    /// parents first
    pub fn delete_folder(&mut self, id: FolderId) -> FolderResult<Vec<LocalFolder>> {
        let parent = self
            .folder(id)?
            .parent
            .ok_or(FolderError::RootOperation("delete"))?;

        let doomed: Vec<FolderId> = std::iter::once(id).chain(self.descendants(id)).collect();

        if let Some(parent) = self.folders.get_mut(&parent) {
            parent.children.retain(|child| *child != id);
        }

        let removed: Vec<LocalFolder> = doomed
            .into_iter()
            .filter_map(|folder| self.folders.remove(&folder))
            .collect();

        info!("Deleted folder {} with {} descendants", id, removed.len().saturating_sub(1));
        Ok(removed)
    }

    pub fn rename_folder(&mut self, id: FolderId, name: &str) -> FolderResult<()> {
        let folder = self.folder_mut(id)?;
        folder.name = name.to_string();
        if let Some(parent) = folder.parent {
            self.sort_children(parent);
        }
        Ok(())
    }

    /// Reparent a folder, carrying its whole subtree along.
    ///
    /// Returns `false` when the folder already lives under `new_parent`.
    pub fn move_folder_to(&mut self, id: FolderId, new_parent: FolderId) -> FolderResult<bool> {
        let old_parent = self
            .folder(id)?
            .parent
            .ok_or(FolderError::RootOperation("move"))?;
        self.folder(new_parent)?;

        if old_parent == new_parent {
            return Ok(false);
        }
        if id == new_parent {
            return Err(FolderError::MoveIntoSelf(id));
        }
        if self.is_descendant_of(new_parent, id) {
            return Err(FolderError::MoveIntoDescendant {
                child: id,
                target: new_parent,
            });
        }

        self.folder_mut(old_parent)?.children.retain(|child| *child != id);
        {
            let folder = self.folder_mut(id)?;
            folder.parent = Some(new_parent);
            folder.ordinal = None;
        }
        self.folder_mut(new_parent)?.children.push(id);
        self.sort_children(new_parent);

        Ok(true)
    }

    /// Reorder `child` among its siblings, placing it before `before` or last.
    /// Every sibling gets an explicit ordinal afterwards.
    pub fn move_folder_within(
        &mut self,
        parent: FolderId,
        child: FolderId,
        before: Option<FolderId>,
    ) -> FolderResult<()> {
        let siblings = &self.folder(parent)?.children;
        if !siblings.contains(&child) {
            return Err(FolderError::NotAChild { parent, child });
        }
        if let Some(before) = before {
            if before == child {
                return Err(FolderError::MoveIntoSelf(child));
            }
            if !siblings.contains(&before) {
                return Err(FolderError::NotAChild { parent, child: before });
            }
        }

        let mut order: Vec<FolderId> = siblings.iter().copied().filter(|c| *c != child).collect();
        match before.and_then(|before| order.iter().position(|c| *c == before)) {
            Some(index) => order.insert(index, child),
            None => order.push(child),
        }

        for (index, id) in order.iter().enumerate() {
            self.folder_mut(*id)?.ordinal = Some(index as u64 + 1);
        }
        self.folder_mut(parent)?.children = order;
        Ok(())
    }

    /// Make the children of `parent` match `names`: missing names are created,
    /// children not named are deleted. Used for servers without folder ids.
    pub fn reconcile_children_by_name(
        &mut self,
        parent: FolderId,
        names: &[&str],
    ) -> FolderResult<ChildrenDiff> {
        let mut diff = ChildrenDiff::default();
        let mut wanted: Vec<&str> = names.to_vec();

        for child in self.folder(parent)?.children.clone() {
            let name = self.folder(child)?.name.clone();
            match wanted.iter().position(|n| *n == name) {
                Some(index) => {
                    wanted.remove(index);
                }
                None => diff.deleted.extend(self.delete_folder(child)?),
            }
        }

        for name in wanted {
            diff.created.push(self.insert_folder(parent, name)?);
        }
        Ok(diff)
    }

    pub fn set_flags(&mut self, id: FolderId, flags: FolderFlags) -> FolderResult<()> {
        let folder = self.folder_mut(id)?;
        folder.flags = flags;
        if let Some(parent) = folder.parent {
            self.sort_children(parent);
        }
        Ok(())
    }

    pub fn properties_mut(&mut self, id: FolderId) -> FolderResult<&mut FolderProperties> {
        Ok(&mut self.folder_mut(id)?.properties)
    }

    /// Whether `ancestor` appears on the parent chain of `id`
    pub fn is_descendant_of(&self, id: FolderId, ancestor: FolderId) -> bool {
        let mut current = self.folders.get(&id).and_then(|f| f.parent);
        let mut steps = 0;
        while let Some(folder) = current {
            if folder == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.folders.len() {
                return false;
            }
            current = self.folders.get(&folder).and_then(|f| f.parent);
        }
        false
    }

    /// Every folder below `id`, parents before children
    pub fn descendants(&self, id: FolderId) -> Vec<FolderId> {
        let mut result = Vec::new();
        let mut stack: Vec<FolderId> = match self.folders.get(&id) {
            Some(folder) => folder.children.iter().rev().copied().collect(),
            None => return result,
        };

        while let Some(current) = stack.pop() {
            result.push(current);
            if let Some(folder) = self.folders.get(&current) {
                stack.extend(folder.children.iter().rev().copied());
            }
        }
        result
    }

    /// Slash-separated path below the account root; the root itself is ""
    pub fn path(&self, id: FolderId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = self.folders.get(&id)?;
        while let Some(parent) = current.parent {
            names.push(current.name.as_str());
            current = self.folders.get(&parent)?;
        }
        names.reverse();
        Some(names.join("/"))
    }

    pub fn find_by_path(&self, path: &str) -> Option<FolderId> {
        let mut current = self.root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = *self
                .folders
                .get(&current)?
                .children
                .iter()
                .find(|child| self.folders.get(child).map(|f| f.name.as_str()) == Some(component))?;
        }
        Some(current)
    }

    pub fn find_by_remote_id(&self, remote_id: &str) -> Option<FolderId> {
        self.folders
            .values()
            .find(|f| f.remote_id() == Some(remote_id))
            .map(|f| f.id)
    }

    /// Map of remote id to local folder for every folder that has one
    pub fn remote_id_index(&self) -> HashMap<String, FolderId> {
        self.folders
            .values()
            .filter_map(|f| f.remote_id().map(|remote| (remote.to_string(), f.id)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> (FolderTree, FolderId, FolderId, FolderId) {
        let mut tree = FolderTree::new("account");
        let root = tree.root();
        let work = tree.insert_folder(root, "Work").unwrap();
        let project = tree.insert_folder(work, "Project").unwrap();
        let notes = tree.insert_folder(project, "Notes").unwrap();
        (tree, work, project, notes)
    }

    #[test]
    fn test_new_tree_has_root() {
        let tree = FolderTree::new("account");
        let root = tree.get(tree.root()).unwrap();
        assert!(root.is_root());
        assert!(root.flags().contains(FolderFlags::SERVER));
        assert_eq!(tree.path(tree.root()).as_deref(), Some(""));
    }

    #[test]
    fn test_paths_and_lookup() {
        let (tree, work, _, notes) = sample_tree();
        assert_eq!(tree.path(notes).as_deref(), Some("Work/Project/Notes"));
        assert_eq!(tree.find_by_path("Work/Project/Notes"), Some(notes));
        assert_eq!(tree.find_by_path("Work"), Some(work));
        assert_eq!(tree.find_by_path("Nope"), None);
        assert!(tree.is_descendant_of(notes, work));
        assert!(!tree.is_descendant_of(work, notes));
    }

    #[test]
    fn test_delete_removes_subtree() {
        let (mut tree, work, project, notes) = sample_tree();
        let removed = tree.delete_folder(project).unwrap();

        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].id(), project);
        assert!(!tree.contains(notes));
        assert!(tree.get(work).unwrap().children().is_empty());
    }

    #[test]
    fn test_root_cannot_be_deleted_or_moved() {
        let (mut tree, work, _, _) = sample_tree();
        let root = tree.root();
        assert_eq!(tree.delete_folder(root), Err(FolderError::RootOperation("delete")));
        assert_eq!(tree.move_folder_to(root, work), Err(FolderError::RootOperation("move")));
    }

    #[test]
    fn test_move_carries_subtree() {
        let (mut tree, work, project, notes) = sample_tree();
        let root = tree.root();
        let archive = tree.insert_folder(root, "Archive").unwrap();

        assert!(tree.move_folder_to(project, archive).unwrap());
        assert_eq!(tree.path(notes).as_deref(), Some("Archive/Project/Notes"));
        assert!(tree.get(work).unwrap().children().is_empty());
        assert!(!tree.move_folder_to(project, archive).unwrap());
    }

    #[test]
    fn test_move_into_descendant_rejected() {
        let (mut tree, work, _, notes) = sample_tree();
        assert_eq!(
            tree.move_folder_to(work, notes),
            Err(FolderError::MoveIntoDescendant { child: work, target: notes })
        );
        assert_eq!(tree.move_folder_to(work, work), Err(FolderError::MoveIntoSelf(work)));
    }

    #[test]
    fn test_sibling_order() {
        let mut tree = FolderTree::new("account");
        let root = tree.root();
        let zebra = tree.insert_folder(root, "zebra").unwrap();
        let alpha = tree.insert_folder(root, "Alpha").unwrap();
        let trash = tree.insert_folder(root, "Trash").unwrap();
        tree.set_flags(trash, FolderFlags::TRASH).unwrap();
        let inbox = tree.insert_folder(root, "INBOX").unwrap();
        tree.set_flags(inbox, FolderFlags::INBOX).unwrap();

        assert_eq!(tree.get(root).unwrap().children(), &[inbox, trash, alpha, zebra]);

        tree.move_folder_within(root, zebra, Some(inbox)).unwrap();
        assert_eq!(tree.get(root).unwrap().children(), &[zebra, inbox, trash, alpha]);
        assert_eq!(tree.get(zebra).unwrap().ordinal(), Some(1));

        tree.move_folder_within(root, zebra, None).unwrap();
        assert_eq!(tree.get(root).unwrap().children(), &[inbox, trash, alpha, zebra]);
        assert_eq!(
            tree.move_folder_within(root, zebra, Some(zebra)),
            Err(FolderError::MoveIntoSelf(zebra))
        );
    }

    #[test]
    fn test_reconcile_children_by_name() {
        let mut tree = FolderTree::new("account");
        let root = tree.root();
        tree.insert_folder(root, "keep").unwrap();
        let gone = tree.insert_folder(root, "gone").unwrap();

        let diff = tree.reconcile_children_by_name(root, &["keep", "new"]).unwrap();
        assert_eq!(diff.created.len(), 1);
        assert_eq!(diff.deleted.len(), 1);
        assert!(!tree.contains(gone));
        assert!(tree.find_by_path("new").is_some());
        assert!(tree.find_by_path("keep").is_some());
    }

    #[test]
    fn test_records_round_trip() {
        let (mut tree, work, _, notes) = sample_tree();
        tree.properties_mut(notes).unwrap().set_remote_id("remote-notes");
        tree.move_folder_within(tree.root(), work, None).unwrap();

        let records = tree.records();
        assert_eq!(records[0].id, tree.root());

        let restored = FolderTree::from_records("account", records, tree.next_id()).unwrap();
        assert_eq!(restored, tree);
        assert_eq!(restored.find_by_remote_id("remote-notes"), Some(notes));

        let mut next = restored;
        let fresh = next.insert_folder(next.root(), "Fresh").unwrap();
        assert!(fresh.0 > notes.0);
    }

    #[test]
    fn test_from_records_rejects_orphans() {
        let records = vec![
            FolderRecord {
                id: FolderId(1),
                parent: None,
                name: "account".to_string(),
                ordinal: None,
                flags: FolderFlags::SERVER,
                properties: FolderProperties::default(),
            },
            FolderRecord {
                id: FolderId(5),
                parent: Some(FolderId(9)),
                name: "lost".to_string(),
                ordinal: None,
                flags: FolderFlags::empty(),
                properties: FolderProperties::default(),
            },
        ];
        assert!(matches!(
            FolderTree::from_records("account", records, 0),
            Err(FolderError::InvalidRecords(_))
        ));
    }
}
