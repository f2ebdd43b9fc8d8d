//! Common types used throughout the tree engine.

mod node_id;
mod varint;

pub use node_id::{NodeId, NODE_ID_LEN};
pub use varint::{decode_varint, encode_varint, varint_size};

use serde::{Deserialize, Serialize};

/// Default maximum serialized page size (1 MiB), per the `bs` spec option.
pub const DEFAULT_MAX_BLOCK_SIZE: u32 = 1 << 20;

/// Default maximum serialized size of an internal node's edit queue (256 KiB),
/// per the `qs` spec option.
pub const DEFAULT_EDIT_QUEUE_SIZE: u32 = 256 << 10;

/// Default in-memory block cache budget in bytes (100 MiB), per the `cache`
/// spec option.
pub const DEFAULT_CACHE_BYTES: usize = 100 << 20;

/// Tunables for a tree instance, resolved either from a spec string
/// (`scheme://location;bs=...;qs=...;cache=...`) or built programmatically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum size in bytes of a single serialized page.
    pub max_block_size: u32,
    /// Maximum size in bytes of an internal node's serialized edit queue.
    pub edit_queue_size: u32,
    /// Byte budget for the in-memory block cache in front of the store.
    pub cache_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            edit_queue_size: DEFAULT_EDIT_QUEUE_SIZE,
            cache_bytes: DEFAULT_CACHE_BYTES,
        }
    }
}

impl EngineConfig {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the maximum page size.
    pub fn max_block_size(mut self, bytes: u32) -> Self {
        self.max_block_size = bytes;
        self
    }

    /// Override the maximum edit-queue size.
    pub fn edit_queue_size(mut self, bytes: u32) -> Self {
        self.edit_queue_size = bytes;
        self
    }

    /// Override the cache budget.
    pub fn cache_bytes(mut self, bytes: usize) -> Self {
        self.cache_bytes = bytes;
        self
    }
}

/// Tag byte distinguishing the three serialized node kinds.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Ordered key/value pairs plus an optional overflow chain.
    Leaf = 0,
    /// Branches to child subtrees plus a pending-edit queue.
    Internal = 1,
    /// Spillover values sharing a leaf's maximum key.
    Overflow = 2,
}

impl NodeKind {
    /// Convert from the on-wire flag value.
    pub fn from_flags(flags: u16) -> Option<Self> {
        match flags {
            0 => Some(Self::Leaf),
            1 => Some(Self::Internal),
            2 => Some(Self::Overflow),
            _ => None,
        }
    }

    /// The on-wire flag value for this kind.
    pub fn flags(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_roundtrip() {
        for kind in [NodeKind::Leaf, NodeKind::Internal, NodeKind::Overflow] {
            assert_eq!(NodeKind::from_flags(kind.flags()), Some(kind));
        }
        assert_eq!(NodeKind::from_flags(99), None);
    }

    #[test]
    fn config_defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_block_size, 1 << 20);
        assert_eq!(cfg.edit_queue_size, 256 << 10);
        assert_eq!(cfg.cache_bytes, 100 << 20);
    }
}
