//! The result of a write, and the commit/rollback protocol that reconciles
//! it against a block store.

use crate::store::BlockStore;
use crate::types::NodeId;

/// Outcome of [`crate::edit_tree::EditTree::write`].
///
/// `created` and `obsolete` are disjoint from each other by construction:
/// nodes whose serialized bytes are unchanged (and therefore keep their old
/// id) are reported in neither list, since nothing was actually replaced.
#[derive(Debug, Clone)]
pub struct Mutation {
    /// Root of the new tree, or `None` if the tree is now empty.
    pub new_root: Option<NodeId>,
    /// Ids successfully written for this mutation.
    pub created: Vec<NodeId>,
    /// Ids superseded by this mutation; safe to delete once no live snapshot
    /// still needs them.
    pub obsolete: Vec<NodeId>,
    /// Whether every page in `created` was actually persisted.
    pub success: bool,
    /// Present when `success` is false.
    pub failure_reason: Option<String>,
}

impl Mutation {
    /// A no-op mutation: nothing changed, root carried over unchanged.
    pub fn unchanged(root: Option<NodeId>) -> Self {
        Self { new_root: root, created: Vec::new(), obsolete: Vec::new(), success: true, failure_reason: None }
    }
}

/// Reconcile a mutation against the store: on success, delete `obsolete`;
/// on failure or explicit rollback, delete `created` instead.
///
/// Successfully deleted ids are removed from the targeted list in place, so
/// a caller can retry with the (now smaller) remainder if some deletions
/// failed. Returns `true` iff every targeted id was deleted.
pub fn commit(store: &dyn BlockStore, mutation: &mut Mutation, caller_succeeded: bool) -> bool {
    let deleting_obsolete = caller_succeeded && mutation.success;
    let targets = if deleting_obsolete { &mut mutation.obsolete } else { &mut mutation.created };

    if targets.is_empty() {
        return true;
    }

    let results = store.del_all(targets);
    targets.retain(|id| results.get(id).map(|r| r.is_err()).unwrap_or(true));
    let clean = targets.is_empty();
    let remaining = targets.len();

    if deleting_obsolete {
        if clean {
            tracing::info!("commit: cleared all obsolete pages");
        } else {
            tracing::warn!(remaining, "commit: some obsolete pages could not be deleted");
        }
    }
    clean
}
