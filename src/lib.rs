//! # Immutable content-addressed B+tree storage engine
//!
//! A persistent key-value tree where every write produces a brand-new,
//! immutable subtree rather than mutating pages in place. Node identity is
//! the digest of a node's serialized bytes, so a root id alone is a
//! consistent snapshot: nothing reachable from it is ever overwritten.
//!
//! ## Architecture
//!
//! - **Node model** (`node`): the three page kinds — leaf, overflow, internal
//!   — as borrowed-slice structs, independent of how they reach storage.
//! - **Codec** (`codec`): serialize/parse plus the size calculators that
//!   decide when a node must split.
//! - **Mempool** (`mempool`): the arena backing every borrowed key/value slice
//!   a tree touches.
//! - **EditTree** (`edit_tree`): the mutating front-end. Buffers inserts,
//!   upserts, and removes against an in-memory shadow of the touched subtree;
//!   `write()` serializes it bottom-up and reports what was created and what
//!   became obsolete.
//! - **QueryTree** (`query_tree`): the read-only front-end. A cursor walks
//!   committed pages in key order, folding in any internal node's queued
//!   edits (and this handle's own speculative edits) without ever
//!   materializing a mutated copy.
//! - **Mutation / commit** (`mutation`): the write outcome and the
//!   commit/rollback protocol that reconciles it against a block store.
//! - **BlockStore** (`store`): the storage capability the engine is built
//!   against. No concrete backend ships here; an in-memory test double
//!   drives this crate's own suite.
//! - **Registry** (`registry`): a process-wide scheme → factory table
//!   resolving `scheme://location;bs=...;qs=...;cache=...` spec strings to a
//!   usable, optionally cached, block store.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bruce_tree::{EditTree, Mempool, QueryTree};
//!
//! let pool = Mempool::new();
//! let mut tree = EditTree::open(store.clone(), root, &pool)?;
//! tree.insert(b"hello", b"world")?;
//! let mutation = tree.write()?;
//!
//! let query = QueryTree::open(store, mutation.new_root, &pool);
//! assert_eq!(query.get(b"hello")?, vec![b"world".to_vec()]);
//! ```

pub mod codec;
pub mod edit_tree;
pub mod error;
pub mod mempool;
pub mod mutation;
pub mod node;
pub mod query_tree;
pub mod registry;
#[cfg(test)]
mod scenarios;
pub mod store;
pub mod types;

pub use edit_tree::EditTree;
pub use error::{Error, Result};
pub use mempool::Mempool;
pub use mutation::{commit, Mutation};
pub use query_tree::{Cursor, Item, QueryTree};
pub use store::{BlockCache, BlockStore};
pub use types::{EngineConfig, NodeId};
