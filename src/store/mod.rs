//! The block-store abstraction the tree engine is built against.
//!
//! Concrete backends (in-memory, local files, object-store clients) are
//! explicitly out of scope for this crate; it depends only on `Arc<dyn
//! BlockStore>`. An in-memory test double lives under `#[cfg(test)]` purely
//! to drive this crate's own test suite.

mod cache;
#[cfg(test)]
pub(crate) mod memory;

pub use cache::BlockCache;

use std::collections::HashMap;
use crate::error::Result;
use crate::types::NodeId;

/// A page as stored or fetched: its content-addressed id plus raw bytes.
pub type Page = Vec<u8>;

/// Capability the tree engine consumes to persist and retrieve pages.
///
/// Implementations must be content-addressed: `id(bytes)` must be
/// deterministic and collision-free for any bytes this trait will ever be
/// asked to store, since node identity *is* the digest of its serialized
/// form.
pub trait BlockStore: Send + Sync {
    /// Fetch one page.
    fn get(&self, id: NodeId) -> Result<Page>;

    /// Fetch many pages at once. The default implementation issues them one
    /// at a time; a production backend talking to a remote store should
    /// override this to fan the requests out concurrently and join on all of
    /// them, since that is the whole point of batching in the first place.
    fn get_all(&self, ids: &[NodeId]) -> HashMap<NodeId, Result<Page>> {
        ids.iter().map(|&id| (id, self.get(id))).collect()
    }

    /// Write many pages at once, returning a per-entry result.
    fn put_all(&self, pages: Vec<(NodeId, Page)>) -> HashMap<NodeId, Result<()>>;

    /// Delete many pages at once, returning a per-entry result. Deleting an
    /// id that is not present is not an error.
    fn del_all(&self, ids: &[NodeId]) -> HashMap<NodeId, Result<()>>;

    /// Maximum size in bytes a single serialized page may occupy.
    fn max_block_size(&self) -> u32;

    /// Maximum size in bytes an internal node's serialized edit queue may occupy.
    fn edit_queue_size(&self) -> u32;

    /// The content-addressing digest function: identical bytes always
    /// produce the identical id.
    fn id(&self, bytes: &[u8]) -> NodeId;
}
