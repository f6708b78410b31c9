//! Folder tree reconciliation
//!
//! [`FolderTreeReconciler::plan`] diffs a full remote directory snapshot
//! against the local tree and yields an ordered list of operations.
//! [`FolderTreeReconciler::apply`] replays that list onto a copy of the tree,
//! so the caller either swaps in the finished tree or keeps the old one.
//!
//! Ordering of a plan:
//! - creates, renames and moves in breadth-first order from the root, so a
//!   folder's parent is always in place before the folder itself;
//! - deletes last, one per topmost missing folder.

use super::{FolderError, FolderFlags, FolderId, FolderResult, FolderTree, LocalFolder};
use crate::remote::{DistinguishedRole, RemoteFolder};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// One structural change to the local tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderOperation {
    Create {
        remote_id: String,
        parent_remote_id: String,
        name: String,
        role: Option<DistinguishedRole>,
    },
    Rename {
        folder: FolderId,
        name: String,
    },
    Move {
        folder: FolderId,
        parent_remote_id: String,
    },
    Delete {
        folder: FolderId,
    },
}

/// Ordered operations bringing a local tree in line with one snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Remote id of the directory's root, mapped onto the account root
    pub root_remote_id: String,
    pub operations: Vec<FolderOperation>,
    /// Records skipped because their parent chain never reaches the root
    pub unreachable: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// What applying a plan changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub created: Vec<FolderId>,
    pub renamed: Vec<FolderId>,
    pub moved: Vec<FolderId>,
    /// Every removed folder, including descendants of a deleted folder
    pub deleted: Vec<LocalFolder>,
}

impl ReconcileOutcome {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.renamed.is_empty()
            && self.moved.is_empty()
            && self.deleted.is_empty()
    }

    /// Surviving folders whose structure changed in this pass
    pub fn touched(&self) -> Vec<FolderId> {
        let mut seen = HashSet::new();
        self.created
            .iter()
            .chain(&self.renamed)
            .chain(&self.moved)
            .copied()
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

/// Diffs remote directory snapshots against the local folder tree
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderTreeReconciler;

impl FolderTreeReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Compute the operations needed to make `tree` match `directory`
    pub fn plan(&self, tree: &FolderTree, directory: &[RemoteFolder]) -> FolderResult<ReconcilePlan> {
        let mut records: Vec<&RemoteFolder> = Vec::with_capacity(directory.len());
        let mut seen_ids = HashSet::new();
        for record in directory {
            if seen_ids.insert(record.id.as_str()) {
                records.push(record);
            } else {
                warn!("Remote directory lists folder '{}' more than once, keeping the first", record.id);
            }
        }

        let root = find_remote_root(&records)?;

        let mut children: HashMap<&str, Vec<&RemoteFolder>> = HashMap::new();
        for record in &records {
            if record.id != root.id {
                children.entry(record.parent_id.as_str()).or_default().push(record);
            }
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|a, b| a.display_name.cmp(&b.display_name).then_with(|| a.id.cmp(&b.id)));
        }

        let mut index = tree.remote_id_index();
        index.insert(root.id.clone(), tree.root());

        let parent_remote_id = |folder: &LocalFolder| -> Option<String> {
            let parent = folder.parent()?;
            if parent == tree.root() {
                Some(root.id.clone())
            } else {
                tree.get(parent)?.remote_id().map(str::to_string)
            }
        };

        let mut plan = ReconcilePlan {
            root_remote_id: root.id.clone(),
            ..Default::default()
        };

        let mut reached: HashSet<&str> = HashSet::new();
        reached.insert(root.id.as_str());
        let mut queue: VecDeque<&str> = VecDeque::from([root.id.as_str()]);

        while let Some(parent) = queue.pop_front() {
            let Some(siblings) = children.get(parent) else {
                continue;
            };
            for record in siblings {
                if !reached.insert(record.id.as_str()) {
                    continue;
                }
                queue.push_back(record.id.as_str());

                let Some(local) = index.get(&record.id).and_then(|id| tree.get(*id)) else {
                    plan.operations.push(FolderOperation::Create {
                        remote_id: record.id.clone(),
                        parent_remote_id: record.parent_id.clone(),
                        name: record.display_name.clone(),
                        role: record.distinguished_role,
                    });
                    continue;
                };

                if parent_remote_id(local).as_deref() != Some(record.parent_id.as_str()) {
                    plan.operations.push(FolderOperation::Move {
                        folder: local.id(),
                        parent_remote_id: record.parent_id.clone(),
                    });
                }
                if local.name() != record.display_name {
                    plan.operations.push(FolderOperation::Rename {
                        folder: local.id(),
                        name: record.display_name.clone(),
                    });
                }
            }
        }

        for record in &records {
            if !reached.contains(record.id.as_str()) {
                warn!(
                    "Remote folder '{}' ({}) does not lead back to the root, leaving it untouched",
                    record.display_name, record.id
                );
                plan.unreachable.push(record.id.clone());
            }
        }

        let missing: HashSet<FolderId> = tree
            .iter()
            .filter(|f| !f.is_root())
            .filter(|f| matches!(f.remote_id(), Some(remote) if !seen_ids.contains(remote)))
            .map(|f| f.id())
            .collect();

        for id in std::iter::once(tree.root()).chain(tree.descendants(tree.root())) {
            let topmost = tree
                .get(id)
                .and_then(|f| f.parent())
                .map_or(false, |parent| !missing.contains(&parent));
            if missing.contains(&id) && topmost {
                plan.operations.push(FolderOperation::Delete { folder: id });
            }
        }

        debug!(
            "Planned {} folder operations for account {}",
            plan.operations.len(),
            tree.account_id()
        );
        Ok(plan)
    }

    /// Replay a plan onto a copy of `tree`.
    ///
    /// The input tree is never modified; on error the copy is dropped.
    pub fn apply(
        &self,
        tree: &FolderTree,
        plan: &ReconcilePlan,
    ) -> FolderResult<(FolderTree, ReconcileOutcome)> {
        let mut next = tree.clone();
        let mut outcome = ReconcileOutcome::default();

        let root = next.root();
        if next.get(root).and_then(|f| f.remote_id()) != Some(plan.root_remote_id.as_str()) {
            let properties = next.properties_mut(root)?;
            properties.set_remote_id(plan.root_remote_id.as_str());
            properties.set_role(Some(DistinguishedRole::Root));
        }

        let mut index = next.remote_id_index();
        index.insert(plan.root_remote_id.clone(), root);

        let resolve = |index: &HashMap<String, FolderId>, remote: &str| {
            index
                .get(remote)
                .copied()
                .ok_or_else(|| FolderError::InvalidRecords(format!("unknown parent folder '{}'", remote)))
        };

        for operation in &plan.operations {
            match operation {
                FolderOperation::Create {
                    remote_id,
                    parent_remote_id,
                    name,
                    role,
                } => {
                    let parent = resolve(&index, parent_remote_id)?;
                    let id = next.insert_folder(parent, name)?;
                    let properties = next.properties_mut(id)?;
                    properties.set_remote_id(remote_id.as_str());
                    properties.set_role(*role);
                    if let Some(role) = role {
                        next.set_flags(id, FolderFlags::for_role(*role))?;
                    }
                    index.insert(remote_id.clone(), id);
                    outcome.created.push(id);
                }
                FolderOperation::Rename { folder, name } => {
                    next.rename_folder(*folder, name)?;
                    outcome.renamed.push(*folder);
                }
                FolderOperation::Move {
                    folder,
                    parent_remote_id,
                } => {
                    let parent = resolve(&index, parent_remote_id)?;
                    if next.move_folder_to(*folder, parent)? {
                        outcome.moved.push(*folder);
                    }
                }
                FolderOperation::Delete { folder } => {
                    if next.contains(*folder) {
                        outcome.deleted.extend(next.delete_folder(*folder)?);
                    }
                }
            }
        }

        Ok((next, outcome))
    }

    /// Plan and apply in one step, returning the new tree
    pub fn reconcile(
        &self,
        tree: &FolderTree,
        directory: &[RemoteFolder],
    ) -> FolderResult<(FolderTree, ReconcileOutcome)> {
        let plan = self.plan(tree, directory)?;
        let result = self.apply(tree, &plan)?;
        info!(
            "Reconciled account {}: {} created, {} renamed, {} moved, {} deleted",
            tree.account_id(),
            result.1.created.len(),
            result.1.renamed.len(),
            result.1.moved.len(),
            result.1.deleted.len()
        );
        Ok(result)
    }
}

fn find_remote_root<'a>(records: &[&'a RemoteFolder]) -> FolderResult<&'a RemoteFolder> {
    let mut roots: Vec<&RemoteFolder> = records.iter().copied().filter(|r| r.is_root()).collect();
    if roots.is_empty() {
        roots = records
            .iter()
            .copied()
            .filter(|r| r.parent_id.is_empty())
            .collect();
    }

    match roots.len() {
        0 => Err(FolderError::MissingRemoteRoot),
        1 => Ok(roots[0]),
        _ => Err(FolderError::AmbiguousRemoteRoot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> RemoteFolder {
        RemoteFolder::new("root", "", "Root").with_role(DistinguishedRole::Root)
    }

    fn reconcile(tree: &FolderTree, directory: &[RemoteFolder]) -> (FolderTree, ReconcileOutcome) {
        FolderTreeReconciler::new().reconcile(tree, directory).unwrap()
    }

    #[test]
    fn test_creates_parents_before_children() {
        let tree = FolderTree::new("account");
        let directory = vec![
            RemoteFolder::new("c3", "c2", "child3"),
            RemoteFolder::new("c2", "c1", "child2"),
            RemoteFolder::new("c1", "p", "child1"),
            RemoteFolder::new("p", "root", "parent"),
            root(),
        ];

        let (tree, outcome) = reconcile(&tree, &directory);
        assert_eq!(outcome.created.len(), 4);
        let child3 = tree.find_by_remote_id("c3").unwrap();
        assert_eq!(tree.path(child3).as_deref(), Some("parent/child1/child2/child3"));
        assert_eq!(tree.get(tree.root()).unwrap().remote_id(), Some("root"));
    }

    #[test]
    fn test_second_pass_is_empty() {
        let directory = vec![
            root(),
            RemoteFolder::new("inbox", "root", "Inbox").with_role(DistinguishedRole::Inbox),
            RemoteFolder::new("a", "root", "A"),
            RemoteFolder::new("b", "a", "B"),
        ];
        let (tree, _) = reconcile(&FolderTree::new("account"), &directory);

        let plan = FolderTreeReconciler::new().plan(&tree, &directory).unwrap();
        assert!(plan.is_empty());
        let (again, outcome) = reconcile(&tree, &directory);
        assert!(outcome.is_empty());
        assert_eq!(again, tree);
    }

    #[test]
    fn test_role_sets_flags_on_create() {
        let directory = vec![
            root(),
            RemoteFolder::new("trash", "root", "Deleted Items").with_role(DistinguishedRole::Trash),
        ];
        let (tree, _) = reconcile(&FolderTree::new("account"), &directory);
        let trash = tree.get(tree.find_by_remote_id("trash").unwrap()).unwrap();
        assert!(trash.flags().contains(FolderFlags::TRASH));
        assert_eq!(trash.properties().role(), Some(DistinguishedRole::Trash));
    }

    #[test]
    fn test_rename_and_move_keep_identity() {
        let before = vec![
            root(),
            RemoteFolder::new("p1", "root", "parent1"),
            RemoteFolder::new("p2", "root", "parent2"),
            RemoteFolder::new("c1", "p1", "child1"),
            RemoteFolder::new("c2", "c1", "child2"),
        ];
        let (tree, _) = reconcile(&FolderTree::new("account"), &before);
        let child1 = tree.find_by_remote_id("c1").unwrap();
        let child2 = tree.find_by_remote_id("c2").unwrap();

        let after = vec![
            root(),
            RemoteFolder::new("p1", "root", "parent1"),
            RemoteFolder::new("p2", "root", "parent2"),
            RemoteFolder::new("c1", "p2", "renamed"),
            RemoteFolder::new("c2", "c1", "child2"),
        ];
        let (tree, outcome) = reconcile(&tree, &after);

        assert_eq!(outcome.moved, vec![child1]);
        assert_eq!(outcome.renamed, vec![child1]);
        assert_eq!(tree.find_by_remote_id("c1"), Some(child1));
        assert_eq!(tree.path(child2).as_deref(), Some("parent2/renamed/child2"));
        let parent1 = tree.find_by_remote_id("p1").unwrap();
        assert!(tree.get(parent1).unwrap().children().is_empty());
    }

    #[test]
    fn test_swap_parent_and_child() {
        let before = vec![
            root(),
            RemoteFolder::new("a", "root", "A"),
            RemoteFolder::new("b", "a", "B"),
        ];
        let (tree, _) = reconcile(&FolderTree::new("account"), &before);

        let after = vec![
            root(),
            RemoteFolder::new("b", "root", "B"),
            RemoteFolder::new("a", "b", "A"),
        ];
        let (tree, outcome) = reconcile(&tree, &after);
        assert_eq!(outcome.moved.len(), 2);
        let a = tree.find_by_remote_id("a").unwrap();
        assert_eq!(tree.path(a).as_deref(), Some("B/A"));
    }

    #[test]
    fn test_deletes_topmost_missing_folder() {
        let before = vec![
            root(),
            RemoteFolder::new("a", "root", "A"),
            RemoteFolder::new("b", "a", "B"),
            RemoteFolder::new("keep", "a", "Keep"),
        ];
        let (mut tree, _) = reconcile(&FolderTree::new("account"), &before);
        let local_only = tree.insert_folder(tree.root(), "Local").unwrap();

        let after = vec![root(), RemoteFolder::new("keep", "root", "Keep")];
        let plan = FolderTreeReconciler::new().plan(&tree, &after).unwrap();
        let deletes = plan
            .operations
            .iter()
            .filter(|op| matches!(op, FolderOperation::Delete { .. }))
            .count();
        assert_eq!(deletes, 1);

        let (tree, outcome) = FolderTreeReconciler::new().apply(&tree, &plan).unwrap();
        assert_eq!(outcome.deleted.len(), 2);
        assert!(tree.contains(local_only));
        let keep = tree.find_by_remote_id("keep").unwrap();
        assert_eq!(tree.path(keep).as_deref(), Some("Keep"));
    }

    #[test]
    fn test_orphans_and_duplicates_are_skipped() {
        let directory = vec![
            root(),
            RemoteFolder::new("a", "root", "A"),
            RemoteFolder::new("a", "root", "A duplicate"),
            RemoteFolder::new("orphan", "nowhere", "Orphan"),
            RemoteFolder::new("x", "y", "X"),
            RemoteFolder::new("y", "x", "Y"),
        ];
        let plan = FolderTreeReconciler::new()
            .plan(&FolderTree::new("account"), &directory)
            .unwrap();
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.unreachable.len(), 3);
    }

    #[test]
    fn test_root_is_required() {
        let directory = vec![RemoteFolder::new("a", "root", "A")];
        assert_eq!(
            FolderTreeReconciler::new().plan(&FolderTree::new("account"), &directory),
            Err(FolderError::MissingRemoteRoot)
        );

        let directory = vec![root(), RemoteFolder::new("r2", "", "Other").with_role(DistinguishedRole::Root)];
        assert_eq!(
            FolderTreeReconciler::new().plan(&FolderTree::new("account"), &directory),
            Err(FolderError::AmbiguousRemoteRoot)
        );
    }
}
