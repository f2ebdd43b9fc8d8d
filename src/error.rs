//! Error types for the tree engine.

use thiserror::Error;
use crate::types::NodeId;

/// Result type alias for tree operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating on a tree.
#[derive(Error, Debug)]
pub enum Error {
    /// A referenced page is missing from the block store.
    #[error("page {0} not found")]
    NotFound(NodeId),

    /// The block store reported a transport/protocol failure.
    #[error("block store error: {0}")]
    BeError(String),

    /// A single key+value pair exceeds the configured maximum block size.
    #[error("entry too large: {size} bytes (max block size is {max})")]
    OversizedEntry { size: usize, max: usize },

    /// The codec detected a malformed page: bad size, unknown flag, or trailing bytes.
    #[error("corrupt page {id:?}: {reason}")]
    CorruptPage { id: Option<NodeId>, reason: String },

    /// A mutating operation was attempted after `write()` already froze the tree.
    #[error("tree is frozen: write() has already been called")]
    FrozenTree,

    /// An iterator was advanced or read while not positioned on a valid item.
    #[error("invalid iterator: {0}")]
    InvalidIterator(String),

    /// A block-store spec string was malformed or named an unregistered scheme.
    #[error("factory error: {0}")]
    FactoryError(String),
}

impl Error {
    /// Build a [`Error::CorruptPage`] without a known node id (e.g. while parsing
    /// bytes fetched for a request whose id we no longer have in scope).
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptPage { id: None, reason: reason.into() }
    }

    /// Build a [`Error::CorruptPage`] anchored to the offending id.
    pub fn corrupt_at(id: NodeId, reason: impl Into<String>) -> Self {
        Self::CorruptPage { id: Some(id), reason: reason.into() }
    }

    /// Build a [`Error::FactoryError`] with a formatted message.
    pub fn factory(msg: impl Into<String>) -> Self {
        Self::FactoryError(msg.into())
    }

    /// Build a [`Error::InvalidIterator`] with a formatted message.
    pub fn invalid_iterator(msg: impl Into<String>) -> Self {
        Self::InvalidIterator(msg.into())
    }
}
