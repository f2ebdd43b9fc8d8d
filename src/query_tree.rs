//! Read-only front-end: a cursor over a tree that folds any internal node's
//! pending edit queue into what it reports, without ever materializing a
//! mutated copy of the tree.
//!
//! Speculative edits queued through [`QueryTree::queue_insert`] and friends
//! behave exactly like edits sitting in an on-disk node's queue: they are
//! visible to subsequent reads through this same handle but are never
//! persisted (only [`crate::edit_tree::EditTree::write`] persists anything).

use std::sync::Arc;

use crate::codec;
use crate::error::{Error, Result};
use crate::mempool::Mempool;
use crate::node::{EditKind, InternalNode, LeafNode, Node, OverflowNode, PendingEdit};
use crate::store::BlockStore;
use crate::types::NodeId;

/// One fully-materialized key/value pair as seen by a cursor, with its rank
/// (0-based position) in the tree's overall order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub rank: u64,
}

/// A read-only handle over a tree rooted at a given (possibly absent) id.
///
/// Descending for a key folds in any pending edits an internal node is
/// carrying for the key range being visited, so a query always observes the
/// tree as if every queued edit had already been applied.
pub struct QueryTree<'p> {
    store: Arc<dyn BlockStore>,
    pool: &'p Mempool,
    root: Option<NodeId>,
    speculative_edits: Vec<PendingEdit<'p>>,
}

impl<'p> QueryTree<'p> {
    /// Open a read-only view over `root` (`None` for an empty tree).
    pub fn open(store: Arc<dyn BlockStore>, root: Option<NodeId>, pool: &'p Mempool) -> Self {
        Self { store, pool, root, speculative_edits: Vec::new() }
    }

    /// Queue a speculative insert, visible to subsequent reads through this
    /// handle only.
    pub fn queue_insert(&mut self, key: &'p [u8], value: &'p [u8]) {
        self.speculative_edits.push(PendingEdit { kind: EditKind::Insert, key, value: Some(value), guaranteed: false });
    }

    /// Queue a speculative upsert.
    pub fn queue_upsert(&mut self, key: &'p [u8], value: &'p [u8]) {
        self.speculative_edits.push(PendingEdit { kind: EditKind::Upsert, key, value: Some(value), guaranteed: false });
    }

    /// Queue a speculative removal of every entry equal to `key`.
    pub fn queue_remove(&mut self, key: &'p [u8]) {
        self.speculative_edits.push(PendingEdit { kind: EditKind::RemoveKey, key, value: None, guaranteed: false });
    }

    fn load(&self, id: NodeId) -> Result<Node<'p>> {
        let bytes = self.store.get(id)?;
        codec::parse_node(&bytes, self.pool)
    }

    fn load_leaf(&self, id: NodeId) -> Result<LeafNode<'p>> {
        self.load(id)?.into_leaf().ok_or_else(|| Error::corrupt_at(id, "expected leaf node"))
    }

    fn load_internal(&self, id: NodeId) -> Result<InternalNode<'p>> {
        self.load(id)?.into_internal().ok_or_else(|| Error::corrupt_at(id, "expected internal node"))
    }

    fn load_overflow(&self, id: NodeId) -> Result<OverflowNode<'p>> {
        match self.load(id)? {
            Node::Overflow(o) => Ok(o),
            _ => Err(Error::corrupt_at(id, "expected overflow node")),
        }
    }

    /// All values attached to `key` by descending into `id`'s subtree,
    /// applying every queued edit that targets `key` along the way.
    pub fn get(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut values = match self.root {
            None => Vec::new(),
            Some(root) => self.get_in(root, key)?,
        };
        for edit in &self.speculative_edits {
            self.fold_edit(edit, key, &mut values);
        }
        Ok(values)
    }

    fn get_in(&self, id: NodeId, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        match self.load(id)? {
            Node::Leaf(leaf) => {
                let lb = leaf.lower_bound(key);
                let ub = leaf.upper_bound(key);
                let mut values: Vec<Vec<u8>> = leaf.pairs[lb..ub].iter().map(|(_, v)| v.to_vec()).collect();
                if ub == leaf.pairs.len() && !leaf.overflow.is_none() && leaf.max_key() == Some(key) {
                    self.collect_overflow(leaf.overflow.id, &mut values)?;
                }
                Ok(values)
            }
            Node::Internal(internal) => {
                let idx = internal.branch_for_key(key);
                let mut values = self.get_in(internal.branches[idx].id, key)?;
                for edit in &internal.edits {
                    self.fold_edit(edit, key, &mut values);
                }
                Ok(values)
            }
            Node::Overflow(_) => Err(Error::corrupt_at(id, "expected leaf or internal node, found overflow")),
        }
    }

    fn collect_overflow(&self, id: NodeId, values: &mut Vec<Vec<u8>>) -> Result<()> {
        let node = self.load_overflow(id)?;
        values.extend(node.values.iter().map(|v| v.to_vec()));
        if !node.next.is_none() {
            self.collect_overflow(node.next.id, values)?;
        }
        Ok(())
    }

    fn fold_edit(&self, edit: &PendingEdit<'p>, key: &[u8], values: &mut Vec<Vec<u8>>) {
        if edit.key != key {
            return;
        }
        match edit.kind {
            EditKind::Insert => values.push(edit.value.unwrap().to_vec()),
            EditKind::Upsert => {
                values.clear();
                values.push(edit.value.unwrap().to_vec());
            }
            EditKind::RemoveKey => values.clear(),
            EditKind::RemoveKeyValue => {
                if let Some(pos) = values.iter().position(|v| v.as_slice() == edit.value.unwrap()) {
                    values.remove(pos);
                }
            }
        }
    }

    /// An iterator positioned at the first item whose key is equal to (or, if
    /// no exact match exists, the successor of) `key`.
    pub fn find(&self, key: &[u8]) -> Result<Cursor<'_, 'p>> {
        let mut cursor = self.begin()?;
        while let Some(item) = cursor.current() {
            if item.key.as_slice() >= key {
                break;
            }
            if !cursor.next()? {
                break;
            }
        }
        Ok(cursor)
    }

    /// An iterator positioned at the item with zero-based ordinal rank
    /// `rank` across the whole tree (past the last item if `rank` is too
    /// large).
    pub fn seek(&self, rank: u64) -> Result<Cursor<'_, 'p>> {
        let mut cursor = self.begin()?;
        cursor.skip(rank)?;
        Ok(cursor)
    }

    /// An iterator positioned before the first item.
    pub fn begin(&self) -> Result<Cursor<'_, 'p>> {
        Cursor::at_start(self)
    }

    /// An iterator positioned after the last item.
    pub fn end(&self) -> Result<Cursor<'_, 'p>> {
        Cursor::at_end(self)
    }
}

/// A flattened (key, subtree-rooted-at) frame used while walking down to the
/// leftmost (or rightmost) leaf.
struct Frame<'p> {
    internal: InternalNode<'p>,
    branch_idx: usize,
}

/// A forward iterator over a tree's items in key order, materializing leaves
/// (and any attached overflow chain) on demand.
pub struct Cursor<'q, 'p> {
    tree: &'q QueryTree<'p>,
    stack: Vec<Frame<'p>>,
    leaf_items: Vec<(Vec<u8>, Vec<u8>)>,
    leaf_pos: usize,
    rank: u64,
    exhausted: bool,
}

impl<'q, 'p> Cursor<'q, 'p> {
    fn at_start(tree: &'q QueryTree<'p>) -> Result<Self> {
        let mut cursor = Self { tree, stack: Vec::new(), leaf_items: Vec::new(), leaf_pos: 0, rank: 0, exhausted: tree.root.is_none() };
        if let Some(root) = tree.root {
            cursor.descend_leftmost(root)?;
        }
        Ok(cursor)
    }

    fn at_end(tree: &'q QueryTree<'p>) -> Result<Self> {
        let mut cursor = Self::at_start(tree)?;
        while cursor.next()? {}
        Ok(cursor)
    }

    fn descend_leftmost(&mut self, mut id: NodeId) -> Result<()> {
        loop {
            match self.tree.load(id)? {
                Node::Leaf(leaf) => {
                    self.load_leaf_items(leaf)?;
                    return Ok(());
                }
                Node::Internal(internal) => {
                    let child = internal.branches[0].id;
                    self.stack.push(Frame { internal, branch_idx: 0 });
                    id = child;
                }
                Node::Overflow(_) => return Err(Error::corrupt_at(id, "expected leaf or internal node, found overflow")),
            }
        }
    }

    fn load_leaf_items(&mut self, leaf: LeafNode<'p>) -> Result<()> {
        let mut items: Vec<(Vec<u8>, Vec<u8>)> = leaf.pairs.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
        if !leaf.overflow.is_none() {
            let mut values = Vec::new();
            self.tree.collect_overflow(leaf.overflow.id, &mut values)?;
            let max_key = leaf.max_key().map(|k| k.to_vec()).unwrap_or_default();
            for v in values {
                items.push((max_key.clone(), v));
            }
        }
        self.apply_pending_edits_in_scope(&mut items);
        self.leaf_items = items;
        self.leaf_pos = 0;
        Ok(())
    }

    /// Lower/upper bound on keys the leaf currently being loaded can hold,
    /// taken from the deepest stack frame's branch range. `None` means
    /// unbounded on that side (leftmost/rightmost leaf in the tree).
    fn leaf_key_range(&self) -> (Option<&'p [u8]>, Option<&'p [u8]>) {
        let Some(frame) = self.stack.last() else { return (None, None) };
        let lower = if frame.branch_idx == 0 { None } else { Some(frame.internal.branches[frame.branch_idx].sep_key) };
        let upper = frame.internal.branches.get(frame.branch_idx + 1).map(|b| b.sep_key);
        (lower, upper)
    }

    /// Fold one pending edit into `items`, but only if it targets a key
    /// already materialized there, or a brand-new key that actually falls
    /// within this leaf's range — otherwise applying it to every
    /// materialized leaf would surface duplicate or misplaced items.
    fn apply_edit_in_scope(
        &self,
        edit: &PendingEdit<'p>,
        lower: Option<&'p [u8]>,
        upper: Option<&'p [u8]>,
        items: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) {
        let already_here = items.iter().any(|(k, _)| k.as_slice() == edit.key);
        let in_range = lower.map_or(true, |l| edit.key >= l) && upper.map_or(true, |u| edit.key < u);
        if !already_here && !in_range {
            return;
        }
        let key = edit.key.to_vec();
        let mut values: Vec<Vec<u8>> = items.iter().filter(|(k, _)| *k == key).map(|(_, v)| v.clone()).collect();
        self.tree.fold_edit(edit, &key, &mut values);
        items.retain(|(k, _)| *k != key);
        items.extend(values.into_iter().map(|v| (key.clone(), v)));
    }

    fn apply_pending_edits_in_scope(&self, items: &mut Vec<(Vec<u8>, Vec<u8>)>) {
        let (lower, upper) = self.leaf_key_range();
        for frame in &self.stack {
            for edit in &frame.internal.edits {
                self.apply_edit_in_scope(edit, lower, upper, items);
            }
        }
        for edit in &self.tree.speculative_edits {
            self.apply_edit_in_scope(edit, lower, upper, items);
        }
        items.sort_by(|a, b| a.0.cmp(&b.0));
    }

    /// The item at the cursor's current position, or `None` if positioned
    /// before the first / after the last item.
    pub fn current(&self) -> Option<Item> {
        if self.exhausted || self.leaf_pos >= self.leaf_items.len() {
            return None;
        }
        let (key, value) = &self.leaf_items[self.leaf_pos];
        Some(Item { key: key.clone(), value: value.clone(), rank: self.rank })
    }

    pub fn key(&self) -> Option<Vec<u8>> {
        self.current().map(|i| i.key)
    }

    pub fn value(&self) -> Option<Vec<u8>> {
        self.current().map(|i| i.value)
    }

    pub fn rank(&self) -> u64 {
        self.rank
    }

    /// Advance by one item. Returns `false` once there is nothing left.
    pub fn next(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        self.leaf_pos += 1;
        self.rank += 1;
        if self.leaf_pos < self.leaf_items.len() {
            return Ok(true);
        }
        self.advance_to_next_leaf()
    }

    fn advance_to_next_leaf(&mut self) -> Result<bool> {
        while let Some(frame) = self.stack.last_mut() {
            if frame.branch_idx + 1 < frame.internal.branches.len() {
                frame.branch_idx += 1;
                let child = frame.internal.branches[frame.branch_idx].id;
                self.descend_leftmost(child)?;
                return Ok(true);
            }
            self.stack.pop();
        }
        self.exhausted = true;
        Ok(false)
    }

    /// Advance by `n` items; returns the number of items actually skipped
    /// before running out.
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            if !self.next()? {
                break;
            }
            skipped += 1;
        }
        Ok(skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit_tree::EditTree;
    use crate::store::memory::InMemoryBlockStore;

    fn store(bs: u32, qs: u32) -> Arc<dyn BlockStore> {
        Arc::new(InMemoryBlockStore::new(bs, qs))
    }

    #[test]
    fn get_returns_all_values_for_a_key() {
        let pool = Mempool::new();
        let st = store(1024, 0);
        let mut tree = EditTree::open(st.clone(), None, &pool).unwrap();
        tree.insert(b"a", b"1").unwrap();
        tree.insert(b"a", b"2").unwrap();
        tree.insert(b"b", b"3").unwrap();
        let mutation = tree.write().unwrap();

        let query = QueryTree::open(st, mutation.new_root, &pool);
        let values = query.get(b"a").unwrap();
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(query.get(b"missing").unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn cursor_walks_items_in_order() {
        let pool = Mempool::new();
        let st = store(1024, 0);
        let mut tree = EditTree::open(st.clone(), None, &pool).unwrap();
        for k in [b'c', b'a', b'b'] {
            tree.insert(&[k], b"v").unwrap();
        }
        let mutation = tree.write().unwrap();

        let query = QueryTree::open(st, mutation.new_root, &pool);
        let mut cursor = query.begin().unwrap();
        let mut keys = Vec::new();
        loop {
            if let Some(item) = cursor.current() {
                keys.push(item.key);
            }
            if !cursor.next().unwrap() {
                break;
            }
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn speculative_insert_is_visible_but_not_persisted() {
        let pool = Mempool::new();
        let st = store(1024, 0);
        let mut tree = EditTree::open(st.clone(), None, &pool).unwrap();
        tree.insert(b"a", b"1").unwrap();
        let mutation = tree.write().unwrap();

        let key = pool.alloc(b"z");
        let value = pool.alloc(b"99");
        let mut query = QueryTree::open(st, mutation.new_root, &pool);
        query.queue_insert(key, value);
        assert_eq!(query.get(b"z").unwrap(), vec![b"99".to_vec()]);
    }

    #[test]
    fn empty_tree_has_no_items() {
        let pool = Mempool::new();
        let st = store(1024, 0);
        let query = QueryTree::open(st, None, &pool);
        assert!(query.begin().unwrap().current().is_none());
        assert_eq!(query.get(b"x").unwrap(), Vec::<Vec<u8>>::new());
    }
}
