//! Mutating front-end: buffers inserts/upserts/removes against an
//! in-memory shadow of the touched part of the tree, then materializes a
//! new immutable subtree on [`EditTree::write`].
//!
//! MUTATION STRATEGY
//! ------------------
//! Descending for a key either loads the real child (if not already
//! in-memory) or, when the tree carries a non-zero edit queue budget and the
//! child was never loaded, appends a [`PendingEdit`] to the current internal
//! node instead of paying the fetch. Each touched node is kept as a shadow
//! node until `write()`, which walks the shadow tree bottom-up, assigns a
//! fresh content-addressed id to every node whose bytes actually changed,
//! and reports old ids that were superseded.

use std::sync::Arc;

use crate::codec;
use crate::error::{Error, Result};
use crate::mempool::Mempool;
use crate::mutation::Mutation;
use crate::node::{Branch, EditKind, InternalNode, LeafNode, Node, OverflowNode, OverflowRef, PendingEdit};
use crate::store::BlockStore;
use crate::types::{EngineConfig, NodeId};

struct ShadowOverflow<'p> {
    original_id: Option<NodeId>,
    node: OverflowNode<'p>,
    next: Option<Box<ShadowOverflow<'p>>>,
}

struct ShadowLeaf<'p> {
    leaf: LeafNode<'p>,
    overflow_child: Option<Box<ShadowOverflow<'p>>>,
}

struct ShadowBranch<'p> {
    sep_key: &'p [u8],
    id: NodeId,
    item_count: u32,
    child: Option<Box<ShadowNode<'p>>>,
}

struct ShadowInternal<'p> {
    branches: Vec<ShadowBranch<'p>>,
    edits: Vec<PendingEdit<'p>>,
}

enum ShadowKind<'p> {
    Leaf(ShadowLeaf<'p>),
    Internal(ShadowInternal<'p>),
}

struct ShadowNode<'p> {
    original_id: Option<NodeId>,
    kind: ShadowKind<'p>,
}

/// Result of a mutation that caused a node to outgrow its size budget: the
/// freshly created right sibling plus how many items moved into it.
struct Split<'p> {
    sep_key: &'p [u8],
    node: Box<ShadowNode<'p>>,
    count: u64,
}

/// Buffers insert/upsert/remove operations against a tree rooted at a given
/// [`NodeId`] (or an empty tree), flushing them into a new immutable subtree
/// on [`write`](EditTree::write).
pub struct EditTree<'p> {
    store: Arc<dyn BlockStore>,
    pool: &'p Mempool,
    config: EngineConfig,
    root: Option<ShadowNode<'p>>,
    dropped: Vec<NodeId>,
    frozen: bool,
}

impl<'p> EditTree<'p> {
    /// Open a tree for mutation. `root` is `None` for a brand-new, empty tree.
    pub fn open(store: Arc<dyn BlockStore>, root: Option<NodeId>, pool: &'p Mempool) -> Result<Self> {
        let config = EngineConfig {
            max_block_size: store.max_block_size(),
            edit_queue_size: store.edit_queue_size(),
            ..EngineConfig::default()
        };
        let root = match root {
            Some(id) => Some(Self::load(&store, pool, id)?),
            None => None,
        };
        Ok(Self { store, pool, config, root, dropped: Vec::new(), frozen: false })
    }

    fn check_not_frozen(&self) -> Result<()> {
        if self.frozen {
            return Err(Error::FrozenTree);
        }
        Ok(())
    }

    fn validate_entry_size(&self, key: &[u8], value: &[u8]) -> Result<()> {
        // A single cell must fit inside an otherwise-empty, freshly split leaf.
        let worst_case = 2 + 4 + 20 + crate::types::varint_size(key.len() as u64) + key.len()
            + crate::types::varint_size(value.len() as u64) + value.len();
        if worst_case > self.config.max_block_size as usize {
            return Err(Error::OversizedEntry { size: worst_case, max: self.config.max_block_size as usize });
        }
        Ok(())
    }

    /// Insert `(key, value)`. Duplicates are allowed and appended after any
    /// existing equal keys.
    #[tracing::instrument(level = "trace", skip(self, value), fields(key_len = key.len()))]
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_not_frozen()?;
        self.validate_entry_size(key, value)?;
        let key = self.pool.alloc(key);
        let value = self.pool.alloc(value);
        self.apply_leaf_edit(key, Some(value), EditKind::Insert, true)
    }

    /// Replace the value of the first entry equal to `key`, or insert it if
    /// none exists. `guaranteed` asserts the caller already knows `key`
    /// exists (letting the engine skip a fetch when the edit is queued).
    #[tracing::instrument(level = "trace", skip(self, value), fields(key_len = key.len()))]
    pub fn upsert(&mut self, key: &[u8], value: &[u8], guaranteed: bool) -> Result<()> {
        self.check_not_frozen()?;
        self.validate_entry_size(key, value)?;
        let key = self.pool.alloc(key);
        let value = self.pool.alloc(value);
        self.apply_leaf_edit(key, Some(value), EditKind::Upsert, guaranteed)
    }

    /// Remove every entry equal to `key`.
    #[tracing::instrument(level = "trace", skip(self), fields(key_len = key.len()))]
    pub fn remove(&mut self, key: &[u8], guaranteed: bool) -> Result<()> {
        self.check_not_frozen()?;
        let key = self.pool.alloc(key);
        self.apply_leaf_edit(key, None, EditKind::RemoveKey, guaranteed)
    }

    /// Remove only the first entry equal to `(key, value)`.
    pub fn remove_kv(&mut self, key: &[u8], value: &[u8], guaranteed: bool) -> Result<()> {
        self.check_not_frozen()?;
        let key = self.pool.alloc(key);
        let value = self.pool.alloc(value);
        self.apply_leaf_edit(key, Some(value), EditKind::RemoveKeyValue, guaranteed)
    }

    fn apply_leaf_edit(
        &mut self,
        key: &'p [u8],
        value: Option<&'p [u8]>,
        kind: EditKind,
        guaranteed: bool,
    ) -> Result<()> {
        let store = self.store.clone();
        let pool = self.pool;
        let config = self.config;
        let dropped = &mut self.dropped;

        match self.root.take() {
            None => {
                // Empty tree: every operation except a real insert/upsert is a no-op.
                self.root = match kind {
                    EditKind::Insert | EditKind::Upsert => Some(ShadowNode {
                        original_id: None,
                        kind: ShadowKind::Leaf(ShadowLeaf {
                            leaf: LeafNode { pairs: vec![(key, value.unwrap())], overflow: OverflowRef::NONE },
                            overflow_child: None,
                        }),
                    }),
                    EditKind::RemoveKey | EditKind::RemoveKeyValue => None,
                };
                Ok(())
            }
            Some(mut root) => {
                let split =
                    Self::mutate_node(&store, pool, &config, dropped, &mut root, key, value, kind, guaranteed)?;
                if let Some(split) = split {
                    let left_count = Self::item_count(&root);
                    root = ShadowNode {
                        original_id: None,
                        kind: ShadowKind::Internal(ShadowInternal {
                            branches: vec![
                                ShadowBranch { sep_key: &[], id: NodeId::EMPTY, item_count: left_count as u32, child: Some(Box::new(root)) },
                                ShadowBranch { sep_key: split.sep_key, id: NodeId::EMPTY, item_count: split.count as u32, child: Some(split.node) },
                            ],
                            edits: Vec::new(),
                        }),
                    };
                }
                if Self::item_count(&root) == 0 {
                    self.root = None;
                } else {
                    self.root = Some(root);
                }
                Ok(())
            }
        }
    }

    fn item_count(node: &ShadowNode<'p>) -> u64 {
        match &node.kind {
            ShadowKind::Leaf(l) => l.leaf.pairs.len() as u64 + l.leaf.overflow.count as u64,
            ShadowKind::Internal(i) => i.branches.iter().map(|b| b.item_count as u64).sum(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn mutate_node(
        store: &Arc<dyn BlockStore>,
        pool: &'p Mempool,
        config: &EngineConfig,
        dropped: &mut Vec<NodeId>,
        node: &mut ShadowNode<'p>,
        key: &'p [u8],
        value: Option<&'p [u8]>,
        kind: EditKind,
        guaranteed: bool,
    ) -> Result<Option<Split<'p>>> {
        match &mut node.kind {
            ShadowKind::Leaf(leaf) => Self::mutate_leaf(store, pool, config, dropped, leaf, key, value, kind),
            ShadowKind::Internal(internal) => {
                let idx = internal.branches.iter().enumerate().skip(1).rev().find(|(_, b)| b.sep_key <= key).map(|(i, _)| i).unwrap_or(0);

                if internal.branches[idx].child.is_some() {
                    let child = internal.branches[idx].child.as_mut().unwrap();
                    let split = Self::mutate_node(store, pool, config, dropped, child, key, value, kind, guaranteed)?;
                    if let Some(split) = split {
                        let right_count = split.count;
                        internal.branches.insert(
                            idx + 1,
                            ShadowBranch { sep_key: split.sep_key, id: NodeId::EMPTY, item_count: right_count as u32, child: Some(split.node) },
                        );
                    }
                    internal.branches[idx].item_count = Self::item_count(internal.branches[idx].child.as_ref().unwrap()) as u32;
                } else if config.edit_queue_size > 0 {
                    let delta = Self::speculative_delta(kind, guaranteed);
                    internal.edits.push(PendingEdit { kind, key, value, guaranteed });
                    internal.branches[idx].item_count =
                        (internal.branches[idx].item_count as i64 + delta).max(0) as u32;
                } else {
                    let mut child = Self::load(store, pool, internal.branches[idx].id)?;
                    let split = Self::mutate_node(store, pool, config, dropped, &mut child, key, value, kind, guaranteed)?;
                    internal.branches[idx].item_count = Self::item_count(&child) as u32;
                    internal.branches[idx].child = Some(Box::new(child));
                    if let Some(split) = split {
                        let right_count = split.count;
                        internal.branches.insert(
                            idx + 1,
                            ShadowBranch { sep_key: split.sep_key, id: NodeId::EMPTY, item_count: right_count as u32, child: Some(split.node) },
                        );
                    }
                }

                Self::maybe_split_internal(internal, config.max_block_size)
            }
        }
    }

    fn speculative_delta(kind: EditKind, guaranteed: bool) -> i64 {
        if !guaranteed {
            return 0;
        }
        match kind {
            EditKind::Insert => 1,
            EditKind::Upsert => 0,
            EditKind::RemoveKey | EditKind::RemoveKeyValue => -1,
        }
    }

    fn mutate_leaf(
        store: &Arc<dyn BlockStore>,
        pool: &'p Mempool,
        config: &EngineConfig,
        dropped: &mut Vec<NodeId>,
        shadow: &mut ShadowLeaf<'p>,
        key: &'p [u8],
        value: Option<&'p [u8]>,
        kind: EditKind,
    ) -> Result<Option<Split<'p>>> {
        match kind {
            EditKind::Insert => {
                let idx = shadow.leaf.upper_bound(key);
                Self::insert_at(store, pool, shadow, idx, key, value.unwrap(), config.max_block_size)?;
            }
            EditKind::Upsert => {
                let lb = shadow.leaf.lower_bound(key);
                let ub = shadow.leaf.upper_bound(key);
                if lb < ub {
                    shadow.leaf.pairs[lb].1 = value.unwrap();
                } else {
                    Self::insert_at(store, pool, shadow, ub, key, value.unwrap(), config.max_block_size)?;
                }
            }
            EditKind::RemoveKey => {
                let original_len = shadow.leaf.pairs.len();
                let lb = shadow.leaf.lower_bound(key);
                let ub = shadow.leaf.upper_bound(key);
                let removed_the_max_key = lb < ub && ub == original_len;
                shadow.leaf.pairs.drain(lb..ub);
                if removed_the_max_key && !shadow.leaf.overflow.is_none() {
                    Self::drop_overflow_chain(store, pool, dropped, shadow)?;
                }
            }
            EditKind::RemoveKeyValue => {
                let lb = shadow.leaf.lower_bound(key);
                let ub = shadow.leaf.upper_bound(key);
                if let Some(pos) = (lb..ub).find(|&i| shadow.leaf.pairs[i].1 == value.unwrap()) {
                    shadow.leaf.pairs.remove(pos);
                } else if !shadow.leaf.overflow.is_none() {
                    Self::ensure_overflow_loaded(store, pool, shadow)?;
                    if Self::remove_from_overflow_chain(shadow.overflow_child.as_mut(), value.unwrap()) {
                        shadow.leaf.overflow.count -= 1;
                    }
                }
            }
        }

        Self::maybe_split_leaf(store, pool, shadow, config.max_block_size)
    }

    fn insert_at(
        store: &Arc<dyn BlockStore>,
        pool: &'p Mempool,
        shadow: &mut ShadowLeaf<'p>,
        idx: usize,
        key: &'p [u8],
        value: &'p [u8],
        max_block_size: u32,
    ) -> Result<()> {
        if idx == shadow.leaf.pairs.len() && !shadow.leaf.overflow.is_none() {
            Self::ensure_overflow_loaded(store, pool, shadow)?;
            let chain = shadow.overflow_child.as_mut().unwrap();
            Self::append_to_overflow_chain(chain, value, max_block_size);
            shadow.leaf.overflow.count += 1;
        } else {
            shadow.leaf.pairs.insert(idx, (key, value));
        }
        Ok(())
    }

    fn ensure_overflow_loaded(store: &Arc<dyn BlockStore>, pool: &'p Mempool, shadow: &mut ShadowLeaf<'p>) -> Result<()> {
        if shadow.overflow_child.is_none() && !shadow.leaf.overflow.is_none() {
            shadow.overflow_child = Some(Box::new(Self::load_overflow(store, pool, shadow.leaf.overflow.id)?));
        }
        Ok(())
    }

    /// Total values reachable through this (possibly partially loaded) chain.
    fn overflow_count(node: &ShadowOverflow<'p>) -> u32 {
        node.node.values.len() as u32
            + match &node.next {
                Some(next) => Self::overflow_count(next),
                None => node.node.next.count,
            }
    }

    fn append_to_overflow_chain(node: &mut ShadowOverflow<'p>, value: &'p [u8], max_block_size: u32) {
        match &mut node.next {
            Some(next) => Self::append_to_overflow_chain(next, value, max_block_size),
            None => {
                node.node.values.push(value);
                Self::maybe_split_overflow_node(node, max_block_size);
            }
        }
    }

    /// Spill the tail of an overflow node into a freshly created next node,
    /// recursively, whenever it has grown past `max_block_size` on its own.
    fn maybe_split_overflow_node(node: &mut ShadowOverflow<'p>, max_block_size: u32) {
        let info = codec::overflow_size(&node.node, max_block_size);
        if !info.should_split || info.split_index >= node.node.values.len() {
            return;
        }

        tracing::debug!(split_index = info.split_index, "splitting oversized overflow node");

        let tail_values = node.node.values.split_off(info.split_index);
        let old_next = node.next.take();
        let mut new_next = ShadowOverflow {
            original_id: None,
            node: OverflowNode { values: tail_values, next: OverflowRef::NONE },
            next: old_next,
        };
        Self::maybe_split_overflow_node(&mut new_next, max_block_size);
        node.next = Some(Box::new(new_next));
    }

    fn remove_from_overflow_chain(mut node: Option<&mut Box<ShadowOverflow<'p>>>, value: &[u8]) -> bool {
        while let Some(n) = node {
            if let Some(pos) = n.node.values.iter().position(|v| *v == value) {
                n.node.values.remove(pos);
                return true;
            }
            node = n.next.as_mut();
        }
        false
    }

    fn drop_overflow_chain(store: &Arc<dyn BlockStore>, pool: &'p Mempool, dropped: &mut Vec<NodeId>, shadow: &mut ShadowLeaf<'p>) -> Result<()> {
        Self::ensure_overflow_loaded(store, pool, shadow)?;
        let mut cur = shadow.overflow_child.take();
        while let Some(node) = cur {
            if let Some(id) = node.original_id {
                dropped.push(id);
            }
            cur = node.next;
        }
        shadow.leaf.overflow = OverflowRef::NONE;
        Ok(())
    }

    fn maybe_split_leaf(
        store: &Arc<dyn BlockStore>,
        pool: &'p Mempool,
        shadow: &mut ShadowLeaf<'p>,
        max_block_size: u32,
    ) -> Result<Option<Split<'p>>> {
        let info = codec::leaf_size(&shadow.leaf, max_block_size);
        if !info.should_split {
            return Ok(None);
        }

        tracing::debug!(split_start = info.split_start, overflow_start = info.overflow_start, "splitting leaf");

        // Always slice left/overflow/right once the leaf is oversized, even
        // when the equal-key run at the boundary runs all the way to the end
        // of the leaf (the right slice is then empty and no second leaf gets
        // returned, but the overflow chain still needs to grow).
        let right_pairs = shadow.leaf.pairs.split_off(info.split_start);
        let overflow_items: Vec<(&'p [u8], &'p [u8])> = shadow.leaf.pairs.split_off(info.overflow_start);

        if right_pairs.is_empty() {
            // No real split: the leaf's max key is unchanged, so a fresh
            // overflow slice and whatever chain already existed both belong
            // to that same key and are chained together.
            if !overflow_items.is_empty() {
                Self::ensure_overflow_loaded(store, pool, shadow)?;
                let existing = shadow.overflow_child.take();
                let mut new_head = ShadowOverflow {
                    original_id: None,
                    node: OverflowNode { values: overflow_items.into_iter().map(|(_, v)| v).collect(), next: OverflowRef::NONE },
                    next: existing,
                };
                Self::maybe_split_overflow_node(&mut new_head, max_block_size);
                shadow.leaf.overflow = OverflowRef { count: Self::overflow_count(&new_head), id: NodeId::EMPTY };
                shadow.overflow_child = Some(Box::new(new_head));
            }
            return Ok(None);
        }

        let sep_key = right_pairs[0].0;
        let right_count = right_pairs.len() as u64;

        // The leaf's pre-existing overflow chain is attached to the OLD max
        // key, which now lives in `right`; it moves there wholesale,
        // independent of whatever the new split boundary's own overflow run
        // turns out to be.
        let right_overflow_child = shadow.overflow_child.take();
        let right_overflow_ref = shadow.leaf.overflow;
        shadow.leaf.overflow = OverflowRef::NONE;

        if !overflow_items.is_empty() {
            // These items share the LEFT leaf's new max key: an independent,
            // freshly created chain, never linked to the chain that just
            // moved to `right`.
            let mut head = ShadowOverflow {
                original_id: None,
                node: OverflowNode { values: overflow_items.into_iter().map(|(_, v)| v).collect(), next: OverflowRef::NONE },
                next: None,
            };
            Self::maybe_split_overflow_node(&mut head, max_block_size);
            shadow.leaf.overflow = OverflowRef { count: Self::overflow_count(&head), id: NodeId::EMPTY };
            shadow.overflow_child = Some(Box::new(head));
        }

        let right = ShadowNode {
            original_id: None,
            kind: ShadowKind::Leaf(ShadowLeaf {
                leaf: LeafNode { pairs: right_pairs, overflow: right_overflow_ref },
                overflow_child: right_overflow_child,
            }),
        };

        Ok(Some(Split { sep_key, node: Box::new(right), count: right_count + right_overflow_ref.count as u64 }))
    }

    fn maybe_split_internal(internal: &mut ShadowInternal<'p>, max_block_size: u32) -> Result<Option<Split<'p>>> {
        let as_node = InternalNode {
            branches: internal
                .branches
                .iter()
                .map(|b| Branch { sep_key: b.sep_key, id: b.id, item_count: b.item_count })
                .collect(),
            edits: Vec::new(),
        };
        let info = codec::internal_branches_size(&as_node, max_block_size);
        if !info.should_split || info.split_index == 0 || info.split_index >= internal.branches.len() {
            return Ok(None);
        }

        tracing::debug!(split_index = info.split_index, branch_count = internal.branches.len(), "splitting internal node");

        let right_branches = internal.branches.split_off(info.split_index);
        let right_count = right_branches.iter().map(|b| b.item_count as u64).sum();
        let sep_key = right_branches[0].sep_key;

        // Repartition the queue by key range so each edit stays attached to
        // the branch range it targets.
        let (left_edits, right_edits): (Vec<_>, Vec<_>) =
            std::mem::take(&mut internal.edits).into_iter().partition(|e| e.key < sep_key);
        internal.edits = left_edits;

        let right = ShadowNode {
            original_id: None,
            kind: ShadowKind::Internal(ShadowInternal { branches: right_branches, edits: right_edits }),
        };

        Ok(Some(Split { sep_key, node: Box::new(right), count: right_count }))
    }

    fn load(store: &Arc<dyn BlockStore>, pool: &'p Mempool, id: NodeId) -> Result<ShadowNode<'p>> {
        let bytes = store.get(id)?;
        let node = codec::parse_node(&bytes, pool)?;
        let kind = match node {
            Node::Leaf(leaf) => ShadowKind::Leaf(ShadowLeaf { leaf, overflow_child: None }),
            Node::Internal(internal) => ShadowKind::Internal(ShadowInternal {
                branches: internal
                    .branches
                    .into_iter()
                    .map(|b| ShadowBranch { sep_key: b.sep_key, id: b.id, item_count: b.item_count, child: None })
                    .collect(),
                edits: internal.edits,
            }),
            Node::Overflow(_) => return Err(Error::corrupt_at(id, "expected leaf or internal node, found overflow")),
        };
        Ok(ShadowNode { original_id: Some(id), kind })
    }

    fn load_overflow(store: &Arc<dyn BlockStore>, pool: &'p Mempool, id: NodeId) -> Result<ShadowOverflow<'p>> {
        let bytes = store.get(id)?;
        let node = match codec::parse_node(&bytes, pool)? {
            Node::Overflow(o) => o,
            _ => return Err(Error::corrupt_at(id, "expected overflow node")),
        };
        let next = if node.next.is_none() { None } else { Some(Box::new(Self::load_overflow(store, pool, node.next.id)?)) };
        Ok(ShadowOverflow { original_id: Some(id), node, next })
    }

    /// Push every internal node's edit queue down to the children it
    /// targets wherever the queue does not fit the configured budget, then
    /// serialize the whole shadow tree and assign fresh content-addressed
    /// ids to every node whose bytes changed.
    pub fn write(&mut self) -> Result<Mutation> {
        self.check_not_frozen()?;
        self.frozen = true;

        let Some(mut root) = self.root.take() else {
            tracing::debug!("write: tree is empty, nothing to do");
            return Ok(Mutation::unchanged(None));
        };

        let store = self.store.clone();
        let pool = self.pool;
        let config = self.config;

        let mut pushdown_dropped = Vec::new();
        Self::push_down_edits(&store, pool, &config, &mut pushdown_dropped, &mut root)?;

        let mut created = Vec::new();
        let new_root = Self::collect_and_assign(&store, &mut created, &mut root)?;

        let mut obsolete: Vec<NodeId> = std::mem::take(&mut self.dropped);
        obsolete.extend(pushdown_dropped);
        obsolete.extend(Self::collect_obsolete(&root));

        self.root = Some(root);

        let put_results = store.put_all(created.clone());
        let mut failed = Vec::new();
        for (id, _) in &created {
            if let Some(Err(e)) = put_results.get(id) {
                failed.push(format!("{id}: {e}"));
            }
        }

        let created_ids: Vec<NodeId> = created.into_iter().map(|(id, _)| id).collect();

        if failed.is_empty() {
            tracing::debug!(created = created_ids.len(), obsolete = obsolete.len(), root = ?new_root, "write committed");
            Ok(Mutation { new_root: Some(new_root), created: created_ids, obsolete, success: true, failure_reason: None })
        } else {
            tracing::warn!(failures = failed.len(), "write: some pages failed to persist");
            Ok(Mutation {
                new_root: Some(new_root),
                created: created_ids,
                obsolete: Vec::new(),
                success: false,
                failure_reason: Some(failed.join("; ")),
            })
        }
    }

    fn push_down_edits(
        store: &Arc<dyn BlockStore>,
        pool: &'p Mempool,
        config: &EngineConfig,
        dropped: &mut Vec<NodeId>,
        node: &mut ShadowNode<'p>,
    ) -> Result<()> {
        let ShadowKind::Internal(internal) = &mut node.kind else { return Ok(()) };

        for branch in &mut internal.branches {
            if let Some(child) = branch.child.as_mut() {
                push_down_edits_boxed(store, pool, config, dropped, child)?;
            }
        }

        if codec::edit_queue_fits(
            &InternalNode {
                branches: internal.branches.iter().map(|b| Branch { sep_key: b.sep_key, id: b.id, item_count: b.item_count }).collect(),
                edits: internal.edits.clone(),
            },
            config.edit_queue_size,
        ) {
            return Ok(());
        }

        let edits = std::mem::take(&mut internal.edits);
        for edit in edits {
            let idx = internal
                .branches
                .iter()
                .enumerate()
                .skip(1)
                .rev()
                .find(|(_, b)| b.sep_key <= edit.key)
                .map(|(i, _)| i)
                .unwrap_or(0);

            if internal.branches[idx].child.is_none() {
                internal.branches[idx].child = Some(Box::new(Self::load(store, pool, internal.branches[idx].id)?));
            }
            let child = internal.branches[idx].child.as_mut().unwrap();
            let split = Self::mutate_node(store, pool, config, dropped, child, edit.key, edit.value, edit.kind, edit.guaranteed)?;
            internal.branches[idx].item_count = Self::item_count(child) as u32;
            if let Some(split) = split {
                internal.branches.insert(
                    idx + 1,
                    ShadowBranch { sep_key: split.sep_key, id: NodeId::EMPTY, item_count: split.count as u32, child: Some(split.node) },
                );
            }
        }

        push_down_edits_self(store, pool, config, dropped, internal)
    }

    fn collect_obsolete(node: &ShadowNode<'p>) -> Vec<NodeId> {
        let mut out = Vec::new();
        Self::collect_obsolete_into(node, &mut out);
        out
    }

    fn collect_obsolete_into(node: &ShadowNode<'p>, out: &mut Vec<NodeId>) {
        match &node.kind {
            ShadowKind::Leaf(l) => {
                if let Some(chain) = &l.overflow_child {
                    Self::collect_obsolete_overflow(chain, out);
                }
            }
            ShadowKind::Internal(i) => {
                for b in &i.branches {
                    if let Some(child) = &b.child {
                        Self::collect_obsolete_into(child, out);
                    }
                }
            }
        }
        if let Some(id) = node.original_id {
            out.push(id);
        }
    }

    fn collect_obsolete_overflow(node: &ShadowOverflow<'p>, out: &mut Vec<NodeId>) {
        if let Some(next) = &node.next {
            Self::collect_obsolete_overflow(next, out);
        }
        if let Some(id) = node.original_id {
            out.push(id);
        }
    }

    /// Depth-first: serialize every touched node, hash it, wire the fresh id
    /// into its parent pointer, and record it as created — unless its bytes
    /// are unchanged from what was loaded, in which case the old id is kept
    /// and nothing is (re)written.
    fn collect_and_assign(store: &Arc<dyn BlockStore>, created: &mut Vec<(NodeId, Vec<u8>)>, node: &mut ShadowNode<'p>) -> Result<NodeId> {
        match &mut node.kind {
            ShadowKind::Leaf(leaf) => {
                if let Some(chain) = leaf.overflow_child.as_mut() {
                    let count = Self::overflow_count(chain);
                    let id = Self::collect_and_assign_overflow(store, created, chain)?;
                    leaf.leaf.overflow = OverflowRef { count, id };
                }
                let bytes = codec::serialize_leaf(&leaf.leaf);
                Self::finish(store, created, node.original_id, bytes)
            }
            ShadowKind::Internal(internal) => {
                for branch in &mut internal.branches {
                    if let Some(child) = branch.child.as_mut() {
                        branch.id = Self::collect_and_assign(store, created, child)?;
                    }
                }
                let wire = InternalNode {
                    branches: internal.branches.iter().map(|b| Branch { sep_key: b.sep_key, id: b.id, item_count: b.item_count }).collect(),
                    edits: internal.edits.clone(),
                };
                let bytes = codec::serialize_internal(&wire);
                Self::finish(store, created, node.original_id, bytes)
            }
        }
    }

    fn collect_and_assign_overflow(store: &Arc<dyn BlockStore>, created: &mut Vec<(NodeId, Vec<u8>)>, node: &mut ShadowOverflow<'p>) -> Result<NodeId> {
        if let Some(next) = node.next.as_mut() {
            let count = Self::overflow_count(next);
            let id = Self::collect_and_assign_overflow(store, created, next)?;
            node.node.next = OverflowRef { count, id };
        }
        let bytes = codec::serialize_overflow(&node.node);
        Self::finish(store, created, node.original_id, bytes)
    }

    fn finish(store: &Arc<dyn BlockStore>, created: &mut Vec<(NodeId, Vec<u8>)>, original_id: Option<NodeId>, bytes: Vec<u8>) -> Result<NodeId> {
        let id = store.id(&bytes);
        if original_id != Some(id) {
            created.push((id, bytes));
        }
        Ok(id)
    }
}

// Free functions to dodge borrow-checker issues recursing through `&mut
// ShadowInternal` while also needing `&mut Box<ShadowNode>` children.
fn push_down_edits_boxed<'p>(
    store: &Arc<dyn BlockStore>,
    pool: &'p Mempool,
    config: &EngineConfig,
    dropped: &mut Vec<NodeId>,
    node: &mut ShadowNode<'p>,
) -> Result<()> {
    EditTree::push_down_edits(store, pool, config, dropped, node)
}

fn push_down_edits_self<'p>(
    store: &Arc<dyn BlockStore>,
    pool: &'p Mempool,
    config: &EngineConfig,
    dropped: &mut Vec<NodeId>,
    internal: &mut ShadowInternal<'p>,
) -> Result<()> {
    for branch in &mut internal.branches {
        if let Some(child) = branch.child.as_mut() {
            push_down_edits_boxed(store, pool, config, dropped, child)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryBlockStore;

    fn store(bs: u32, qs: u32) -> Arc<dyn BlockStore> {
        Arc::new(InMemoryBlockStore::new(bs, qs))
    }

    #[test]
    fn insert_two_pairs_into_empty_tree() {
        let pool = Mempool::new();
        let st = store(1024, 0);
        let mut tree = EditTree::open(st.clone(), None, &pool).unwrap();
        tree.insert(b"1", b"1").unwrap();
        tree.insert(b"2", b"2").unwrap();
        let mutation = tree.write().unwrap();
        assert!(mutation.success);
        assert_eq!(mutation.created.len(), 1);

        let bytes = st.get(mutation.new_root.unwrap()).unwrap();
        let parsed = codec::parse_node(&bytes, &pool).unwrap();
        let leaf = parsed.as_leaf().unwrap();
        assert_eq!(leaf.pairs.len(), 2);
    }

    #[test]
    fn oversized_entry_rejected_before_mutating_shadow() {
        let pool = Mempool::new();
        let st = store(32, 0);
        let mut tree = EditTree::open(st, None, &pool).unwrap();
        let big_value = vec![0u8; 1024];
        assert!(matches!(tree.insert(b"k", &big_value), Err(Error::OversizedEntry { .. })));
    }

    #[test]
    fn write_freezes_tree() {
        let pool = Mempool::new();
        let st = store(1024, 0);
        let mut tree = EditTree::open(st, None, &pool).unwrap();
        tree.insert(b"a", b"1").unwrap();
        tree.write().unwrap();
        assert!(matches!(tree.insert(b"b", b"2"), Err(Error::FrozenTree)));
    }

    #[test]
    fn remove_existing_key_empties_tree() {
        let pool = Mempool::new();
        let st = store(1024, 0);
        let mut tree = EditTree::open(st.clone(), None, &pool).unwrap();
        tree.insert(b"a", b"1").unwrap();
        let m1 = tree.write().unwrap();

        let mut tree2 = EditTree::open(st, m1.new_root, &pool).unwrap();
        tree2.remove(b"a", true).unwrap();
        let m2 = tree2.write().unwrap();
        assert_eq!(m2.new_root, None);
    }
}
