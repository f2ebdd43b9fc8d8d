//! An in-memory [`BlockStore`] used only to drive this crate's own tests.
//!
//! This is not a supported backend: no concrete block-store implementation
//! ships as part of the public API. It exists so the engine's codec, split,
//! edit-queue, and commit/rollback logic can be exercised without depending
//! on an external store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::types::{NodeId, NODE_ID_LEN};
use super::{BlockStore, Page};

pub(crate) struct InMemoryBlockStore {
    pages: Mutex<HashMap<NodeId, Page>>,
    max_block_size: u32,
    edit_queue_size: u32,
    puts: AtomicU64,
    gets: AtomicU64,
}

impl InMemoryBlockStore {
    pub fn new(max_block_size: u32, edit_queue_size: u32) -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            max_block_size,
            edit_queue_size,
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: NodeId) -> bool {
        self.pages.lock().contains_key(&id)
    }
}

impl BlockStore for InMemoryBlockStore {
    fn get(&self, id: NodeId) -> Result<Page> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.pages.lock().get(&id).cloned().ok_or(Error::NotFound(id))
    }

    fn put_all(&self, pages: Vec<(NodeId, Page)>) -> HashMap<NodeId, Result<()>> {
        let mut store = self.pages.lock();
        let mut out = HashMap::with_capacity(pages.len());
        for (id, bytes) in pages {
            if bytes.len() > self.max_block_size as usize {
                out.insert(
                    id,
                    Err(Error::OversizedEntry { size: bytes.len(), max: self.max_block_size as usize }),
                );
                continue;
            }
            self.puts.fetch_add(1, Ordering::Relaxed);
            store.insert(id, bytes);
            out.insert(id, Ok(()));
        }
        out
    }

    fn del_all(&self, ids: &[NodeId]) -> HashMap<NodeId, Result<()>> {
        let mut store = self.pages.lock();
        ids.iter().map(|&id| {
            store.remove(&id);
            (id, Ok(()))
        }).collect()
    }

    fn max_block_size(&self) -> u32 {
        self.max_block_size
    }

    fn edit_queue_size(&self) -> u32 {
        self.edit_queue_size
    }

    fn id(&self, bytes: &[u8]) -> NodeId {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(&digest);
        NodeId::new(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_roundtrips() {
        let store = InMemoryBlockStore::new(1024, 256);
        let id = store.id(b"hello");
        store.put_all(vec![(id, b"hello".to_vec())]).into_values().for_each(|r| r.unwrap());
        assert_eq!(store.get(id).unwrap(), b"hello");
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = InMemoryBlockStore::new(1024, 256);
        let id = store.id(b"nope");
        assert!(matches!(store.get(id), Err(Error::NotFound(_))));
    }

    #[test]
    fn oversized_put_is_rejected() {
        let store = InMemoryBlockStore::new(4, 256);
        let id = store.id(b"toolong");
        let results = store.put_all(vec![(id, b"toolong".to_vec())]);
        assert!(matches!(results[&id], Err(Error::OversizedEntry { .. })));
    }

    #[test]
    fn id_is_deterministic() {
        let store = InMemoryBlockStore::new(1024, 256);
        assert_eq!(store.id(b"same"), store.id(b"same"));
        assert_ne!(store.id(b"same"), store.id(b"different"));
    }
}
