//! In-memory LRU cache sitting in front of a [`BlockStore`].
//!
//! Structurally this is the same doubly-linked-list-over-`Vec` design the
//! buffer pool uses for page eviction, generalized from fixed-size page ids
//! to 20-byte [`NodeId`] keys and bounded by total cached bytes rather than
//! entry count (a cache of content-addressed pages of wildly different size
//! needs a byte budget, not a slot count).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::types::NodeId;
use super::{BlockStore, Page};

struct LruNode {
    id: NodeId,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct LruList {
    positions: HashMap<NodeId, usize>,
    slots: Vec<LruNode>,
    head: Option<usize>,
    tail: Option<usize>,
    free_slots: Vec<usize>,
}

impl LruList {
    fn touch(&mut self, id: NodeId) {
        if let Some(&pos) = self.positions.get(&id) {
            self.unlink(pos);
            self.link_front(pos);
        } else {
            let pos = if let Some(pos) = self.free_slots.pop() {
                self.slots[pos] = LruNode { id, prev: None, next: None };
                pos
            } else {
                let pos = self.slots.len();
                self.slots.push(LruNode { id, prev: None, next: None });
                pos
            };
            self.positions.insert(id, pos);
            self.link_front(pos);
        }
    }

    fn remove(&mut self, id: NodeId) {
        if let Some(pos) = self.positions.remove(&id) {
            self.unlink(pos);
            self.free_slots.push(pos);
        }
    }

    fn lru(&self) -> Option<NodeId> {
        self.tail.map(|pos| self.slots[pos].id)
    }

    fn link_front(&mut self, pos: usize) {
        self.slots[pos].prev = None;
        self.slots[pos].next = self.head;
        if let Some(head) = self.head {
            self.slots[head].prev = Some(pos);
        }
        self.head = Some(pos);
        if self.tail.is_none() {
            self.tail = Some(pos);
        }
    }

    fn unlink(&mut self, pos: usize) {
        let (prev, next) = (self.slots[pos].prev, self.slots[pos].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
    }
}

struct State {
    entries: HashMap<NodeId, Page>,
    order: LruList,
    bytes_used: usize,
}

/// A [`BlockStore`] decorator that serves recently-seen pages from memory,
/// bounded by a total byte budget, before falling through to the wrapped
/// store.
pub struct BlockCache {
    inner: Arc<dyn BlockStore>,
    capacity_bytes: usize,
    state: Mutex<State>,
}

impl BlockCache {
    /// Wrap `inner`, caching up to `capacity_bytes` worth of pages.
    pub fn new(inner: Arc<dyn BlockStore>, capacity_bytes: usize) -> Self {
        Self {
            inner,
            capacity_bytes,
            state: Mutex::new(State { entries: HashMap::new(), order: LruList::default(), bytes_used: 0 }),
        }
    }

    fn insert(&self, id: NodeId, page: Page) {
        if self.capacity_bytes == 0 || page.len() > self.capacity_bytes {
            return;
        }
        let mut state = self.state.lock();
        if state.entries.contains_key(&id) {
            state.order.touch(id);
            return;
        }
        while state.bytes_used + page.len() > self.capacity_bytes {
            let Some(victim) = state.order.lru() else { break };
            state.order.remove(victim);
            if let Some(evicted) = state.entries.remove(&victim) {
                state.bytes_used -= evicted.len();
                tracing::trace!(id = ?victim, bytes = evicted.len(), "evicted page under cache pressure");
            }
        }
        state.bytes_used += page.len();
        state.order.touch(id);
        state.entries.insert(id, page);
    }

    fn evict(&self, id: NodeId) {
        let mut state = self.state.lock();
        state.order.remove(id);
        if let Some(evicted) = state.entries.remove(&id) {
            state.bytes_used -= evicted.len();
            tracing::trace!(?id, bytes = evicted.len(), "evicted page from block cache");
        }
    }

    /// Number of bytes currently cached (diagnostics/tests only).
    pub fn bytes_used(&self) -> usize {
        self.state.lock().bytes_used
    }
}

impl BlockStore for BlockCache {
    fn get(&self, id: NodeId) -> Result<Page> {
        if let Some(page) = self.state.lock().entries.get(&id).cloned() {
            self.state.lock().order.touch(id);
            return Ok(page);
        }
        let page = self.inner.get(id)?;
        self.insert(id, page.clone());
        Ok(page)
    }

    fn get_all(&self, ids: &[NodeId]) -> HashMap<NodeId, Result<Page>> {
        let mut out = HashMap::with_capacity(ids.len());
        let mut misses = Vec::new();
        {
            let mut state = self.state.lock();
            for &id in ids {
                if let Some(page) = state.entries.get(&id).cloned() {
                    state.order.touch(id);
                    out.insert(id, Ok(page));
                } else {
                    misses.push(id);
                }
            }
        }
        if !misses.is_empty() {
            for (id, result) in self.inner.get_all(&misses) {
                if let Ok(page) = &result {
                    self.insert(id, page.clone());
                }
                out.insert(id, result);
            }
        }
        out
    }

    fn put_all(&self, pages: Vec<(NodeId, Page)>) -> HashMap<NodeId, Result<()>> {
        self.inner.put_all(pages)
    }

    fn del_all(&self, ids: &[NodeId]) -> HashMap<NodeId, Result<()>> {
        let results = self.inner.del_all(ids);
        for &id in ids {
            self.evict(id);
        }
        results
    }

    fn max_block_size(&self) -> u32 {
        self.inner.max_block_size()
    }

    fn edit_queue_size(&self) -> u32 {
        self.inner.edit_queue_size()
    }

    fn id(&self, bytes: &[u8]) -> NodeId {
        self.inner.id(bytes)
    }
}
