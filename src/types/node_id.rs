//! Content-addressed node identifier.

use std::fmt;

/// Number of bytes in a [`NodeId`] (a SHA-1 digest).
pub const NODE_ID_LEN: usize = 20;

/// Identifies a page by the digest of its serialized bytes.
///
/// Two pages with identical contents always share an id; the all-zero id is
/// a sentinel meaning "no page" and is never assigned to real content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// The sentinel id denoting "no page" (e.g. a leaf's absent overflow pointer).
    pub const EMPTY: NodeId = NodeId([0u8; NODE_ID_LEN]);

    /// Build a `NodeId` from raw bytes.
    pub const fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Whether this is the empty sentinel.
    pub const fn is_empty(self) -> bool {
        let mut i = 0;
        while i < NODE_ID_LEN {
            if self.0[i] != 0 {
                return false;
            }
            i += 1;
        }
        true
    }

    /// Borrow the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Render as 40 lowercase hex characters.
    pub fn to_hex(self) -> String {
        let mut s = String::with_capacity(NODE_ID_LEN * 2);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    /// Parse from 40 hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != NODE_ID_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; NODE_ID_LEN];
        for i in 0..NODE_ID_LEN {
            bytes[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}
