//! Wire format for tree pages: serialization, parsing, and the size
//! calculators the splitter relies on.
//!
//! ```text
//! LEAF NODE
//!   [ u16 ]           flags = 0
//!   [ u32 ]           N of KV-pairs
//!   [ N x entry ]     keys   (varint length prefix + bytes)
//!   [ N x entry ]     values (varint length prefix + bytes)
//!   [ u32 ]           overflow node count
//!   [ 20 bytes ]      overflow node id
//!
//! OVERFLOW NODE
//!   [ u16 ]           flags = 2
//!   [ u32 ]           N of values
//!   [ N x entry ]     values
//!   [ u32 ]           next overflow node count
//!   [ 20 bytes ]      next overflow node id
//!
//! INTERNAL NODE
//!   [ u16 ]           flags = 1
//!   [ u32 ]           N of branches
//!   [ N-1 x entry ]   separator keys (branch 0's is implicit, never stored)
//!   [ N x 20 bytes ]  child ids
//!   [ N x u32 ]       child item counts
//!   [ u32 ]           M of queued edits
//!   [ M x edit ]      kind:u8, key entry, optional value entry, guaranteed:u8
//! ```
//!
//! An "entry" is `varint(len) || len bytes`; this keeps small keys/values
//! cheap without a fixed-width length ceiling.

use crate::mempool::Mempool;
use crate::node::{Branch, EditKind, InternalNode, LeafNode, Node, OverflowNode, OverflowRef, PendingEdit};
use crate::types::{decode_varint, encode_varint, NodeId, NodeKind, NODE_ID_LEN};
use crate::error::{Error, Result};

const FLAGS_SIZE: usize = 2;
const COUNT_SIZE: usize = 4;
const HEADER_SIZE: usize = FLAGS_SIZE + COUNT_SIZE;
const OVERFLOW_FOOTER_SIZE: usize = COUNT_SIZE + NODE_ID_LEN;

fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_entry(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&encode_varint(bytes.len() as u64));
    buf.extend_from_slice(bytes);
}

fn entry_size(bytes: &[u8]) -> usize {
    crate::types::varint_size(bytes.len() as u64) + bytes.len()
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    let end = offset + 2;
    if end > buf.len() {
        return Err(Error::corrupt("end of page while reading u16"));
    }
    Ok(u16::from_le_bytes([buf[offset], buf[offset + 1]]))
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let end = offset + 4;
    if end > buf.len() {
        return Err(Error::corrupt("end of page while reading u32"));
    }
    Ok(u32::from_le_bytes(buf[offset..end].try_into().unwrap()))
}

fn read_node_id(buf: &[u8], offset: usize) -> Result<NodeId> {
    let end = offset + NODE_ID_LEN;
    if end > buf.len() {
        return Err(Error::corrupt("end of page while reading node id"));
    }
    let mut bytes = [0u8; NODE_ID_LEN];
    bytes.copy_from_slice(&buf[offset..end]);
    Ok(NodeId::new(bytes))
}

fn read_entry<'p>(buf: &[u8], offset: usize, pool: &'p Mempool) -> Result<(&'p [u8], usize)> {
    if offset >= buf.len() {
        return Err(Error::corrupt("end of page while reading entry length"));
    }
    let (len, varint_len) = decode_varint(&buf[offset..])
        .ok_or_else(|| Error::corrupt("invalid varint length prefix"))?;
    let start = offset + varint_len;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| Error::corrupt("entry length overflow"))?;
    if end > buf.len() {
        return Err(Error::corrupt("end of page while reading entry bytes"));
    }
    Ok((pool.alloc(&buf[start..end]), end))
}

// ---------------------------------------------------------------------
// Size calculators
// ---------------------------------------------------------------------

/// Sizing result for a leaf: where it should split and which part (if any)
/// of the tail should go to an overflow chain instead of the right leaf.
pub struct LeafSizeInfo {
    pub size: usize,
    pub should_split: bool,
    /// Index (into `pairs`) where the overflow chain begins.
    pub overflow_start: usize,
    /// Index (into `pairs`) where the right-hand leaf begins.
    pub split_start: usize,
}

pub fn leaf_size(leaf: &LeafNode, max_block_size: u32) -> LeafSizeInfo {
    let header = HEADER_SIZE + OVERFLOW_FOOTER_SIZE;
    let size = header + leaf.elements_size_encoded();
    let max = max_block_size as usize;
    let should_split = size > max;

    let mut overflow_start = leaf.pairs.len();
    let mut split_start = leaf.pairs.len();

    if should_split && !leaf.pairs.is_empty() {
        let piece_size = (max_block_size as f64 / 2.0).ceil() as usize;
        let mut running = header;
        let mut start_of_this_key = 0usize;
        let mut here = None;

        for (i, (k, v)) in leaf.pairs.iter().enumerate() {
            if *k != leaf.pairs[start_of_this_key].0 {
                start_of_this_key = i;
            }
            running += entry_size(k) + entry_size(v);
            if running > piece_size {
                here = Some(i);
                break;
            }
        }

        if let Some(here) = here {
            let here_key = leaf.pairs[here].0;
            let mut split = here;
            while split < leaf.pairs.len() && leaf.pairs[split].0 == here_key {
                split += 1;
            }
            overflow_start = start_of_this_key + 1;
            split_start = split;
        }
    }

    LeafSizeInfo { size, should_split, overflow_start, split_start }
}

impl<'p> LeafNode<'p> {
    fn elements_size_encoded(&self) -> usize {
        self.pairs.iter().map(|(k, v)| entry_size(k) + entry_size(v)).sum()
    }
}

/// Sizing result for an overflow node.
pub struct OverflowSizeInfo {
    pub size: usize,
    pub should_split: bool,
    pub split_index: usize,
}

pub fn overflow_size(node: &OverflowNode, max_block_size: u32) -> OverflowSizeInfo {
    let header = HEADER_SIZE + OVERFLOW_FOOTER_SIZE;
    let size = header + node.values.iter().map(|v| entry_size(v)).sum::<usize>();
    let max = max_block_size as usize;
    let should_split = size > max;

    let mut split_index = node.values.len();
    if should_split {
        let mut running = header;
        for (i, v) in node.values.iter().enumerate() {
            running += entry_size(v);
            if running > max {
                split_index = i;
                break;
            }
        }
    }

    OverflowSizeInfo { size, should_split, split_index }
}

/// Sizing result for an internal node's branch list (the edit queue is
/// bounded separately, against `edit_queue_size`, not folded into this size).
pub struct InternalSizeInfo {
    pub size: usize,
    pub should_split: bool,
    pub split_index: usize,
}

pub fn internal_branches_size(internal: &InternalNode, max_block_size: u32) -> InternalSizeInfo {
    let mut size = HEADER_SIZE;
    for (i, b) in internal.branches.iter().enumerate() {
        if i != 0 {
            size += entry_size(b.sep_key);
        }
        size += NODE_ID_LEN + COUNT_SIZE;
    }
    let max = max_block_size as usize;
    let should_split = size > max;

    let mut split_index = internal.branches.len();
    if should_split {
        let piece_size = (size as f64 / 2.0).ceil() as usize;
        let mut running = HEADER_SIZE;
        for i in 1..internal.branches.len() {
            if i != 1 {
                running += entry_size(internal.branches[i - 1].sep_key);
            }
            running += NODE_ID_LEN + COUNT_SIZE;
            if running > piece_size {
                split_index = i;
                break;
            }
        }
    }

    InternalSizeInfo { size, should_split, split_index }
}

/// Whether an internal node's queued edits fit within the configured budget
/// as-is, or must be partitioned and pushed down into children.
pub fn edit_queue_fits(internal: &InternalNode, edit_queue_size: u32) -> bool {
    internal.edits_size() <= edit_queue_size as usize
}

// ---------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------

pub fn serialize_node(node: &Node) -> Vec<u8> {
    match node {
        Node::Leaf(l) => serialize_leaf(l),
        Node::Overflow(o) => serialize_overflow(o),
        Node::Internal(i) => serialize_internal(i),
    }
}

pub fn serialize_leaf(leaf: &LeafNode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(leaf_size(leaf, u32::MAX).size);
    write_u16(&mut buf, NodeKind::Leaf.flags());
    write_u32(&mut buf, leaf.pairs.len() as u32);
    for (k, _) in &leaf.pairs {
        write_entry(&mut buf, k);
    }
    for (_, v) in &leaf.pairs {
        write_entry(&mut buf, v);
    }
    write_u32(&mut buf, leaf.overflow.count);
    buf.extend_from_slice(leaf.overflow.id.as_bytes());
    buf
}

pub fn serialize_overflow(node: &OverflowNode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(overflow_size(node, u32::MAX).size);
    write_u16(&mut buf, NodeKind::Overflow.flags());
    write_u32(&mut buf, node.values.len() as u32);
    for v in &node.values {
        write_entry(&mut buf, v);
    }
    write_u32(&mut buf, node.next.count);
    buf.extend_from_slice(node.next.id.as_bytes());
    buf
}

pub fn serialize_internal(node: &InternalNode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(internal_branches_size(node, u32::MAX).size);
    write_u16(&mut buf, NodeKind::Internal.flags());
    write_u32(&mut buf, node.branches.len() as u32);
    for b in node.branches.iter().skip(1) {
        write_entry(&mut buf, b.sep_key);
    }
    for b in &node.branches {
        buf.extend_from_slice(b.id.as_bytes());
    }
    for b in &node.branches {
        write_u32(&mut buf, b.item_count);
    }
    write_u32(&mut buf, node.edits.len() as u32);
    for e in &node.edits {
        buf.push(edit_kind_byte(e.kind));
        write_entry(&mut buf, e.key);
        if e.kind.carries_value() {
            write_entry(&mut buf, e.value.unwrap_or(&[]));
        }
        buf.push(e.guaranteed as u8);
    }
    buf
}

fn edit_kind_byte(kind: EditKind) -> u8 {
    match kind {
        EditKind::Insert => 0,
        EditKind::Upsert => 1,
        EditKind::RemoveKey => 2,
        EditKind::RemoveKeyValue => 3,
    }
}

fn edit_kind_from_byte(b: u8) -> Result<EditKind> {
    match b {
        0 => Ok(EditKind::Insert),
        1 => Ok(EditKind::Upsert),
        2 => Ok(EditKind::RemoveKey),
        3 => Ok(EditKind::RemoveKeyValue),
        other => Err(Error::corrupt(format!("unknown pending edit kind {other}"))),
    }
}

// ---------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------

pub fn parse_node<'p>(bytes: &[u8], pool: &'p Mempool) -> Result<Node<'p>> {
    let flags = read_u16(bytes, 0)?;
    match NodeKind::from_flags(flags) {
        Some(NodeKind::Leaf) => parse_leaf(bytes, pool).map(Node::Leaf),
        Some(NodeKind::Overflow) => parse_overflow(bytes, pool).map(Node::Overflow),
        Some(NodeKind::Internal) => parse_internal(bytes, pool).map(Node::Internal),
        None => Err(Error::corrupt(format!("unknown node flags {flags}"))),
    }
}

fn parse_leaf<'p>(bytes: &[u8], pool: &'p Mempool) -> Result<LeafNode<'p>> {
    let count = read_u32(bytes, FLAGS_SIZE)? as usize;
    let mut offset = HEADER_SIZE;

    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        let (k, next) = read_entry(bytes, offset, pool)?;
        keys.push(k);
        offset = next;
    }

    let mut pairs = Vec::with_capacity(count);
    for k in keys {
        let (v, next) = read_entry(bytes, offset, pool)?;
        pairs.push((k, v));
        offset = next;
    }

    let overflow_count = read_u32(bytes, offset)?;
    offset += COUNT_SIZE;
    let overflow_id = read_node_id(bytes, offset)?;
    offset += NODE_ID_LEN;

    if offset != bytes.len() {
        return Err(Error::corrupt(format!(
            "trailing bytes after leaf node: {} left",
            bytes.len() - offset
        )));
    }

    Ok(LeafNode { pairs, overflow: OverflowRef { count: overflow_count, id: overflow_id } })
}

fn parse_overflow<'p>(bytes: &[u8], pool: &'p Mempool) -> Result<OverflowNode<'p>> {
    let count = read_u32(bytes, FLAGS_SIZE)? as usize;
    let mut offset = HEADER_SIZE;

    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let (v, next) = read_entry(bytes, offset, pool)?;
        values.push(v);
        offset = next;
    }

    let next_count = read_u32(bytes, offset)?;
    offset += COUNT_SIZE;
    let next_id = read_node_id(bytes, offset)?;
    offset += NODE_ID_LEN;

    if offset != bytes.len() {
        return Err(Error::corrupt(format!(
            "trailing bytes after overflow node: {} left",
            bytes.len() - offset
        )));
    }

    Ok(OverflowNode { values, next: OverflowRef { count: next_count, id: next_id } })
}

fn parse_internal<'p>(bytes: &[u8], pool: &'p Mempool) -> Result<InternalNode<'p>> {
    let count = read_u32(bytes, FLAGS_SIZE)? as usize;
    let mut offset = HEADER_SIZE;

    let mut sep_keys = Vec::with_capacity(count);
    sep_keys.push(&[][..]);
    for _ in 1..count {
        let (k, next) = read_entry(bytes, offset, pool)?;
        sep_keys.push(k);
        offset = next;
    }

    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(read_node_id(bytes, offset)?);
        offset += NODE_ID_LEN;
    }

    let mut counts = Vec::with_capacity(count);
    for _ in 0..count {
        counts.push(read_u32(bytes, offset)?);
        offset += COUNT_SIZE;
    }

    let branches = sep_keys
        .into_iter()
        .zip(ids)
        .zip(counts)
        .map(|((sep_key, id), item_count)| Branch { sep_key, id, item_count })
        .collect();

    let edit_count = read_u32(bytes, offset)?;
    offset += COUNT_SIZE;

    let mut edits = Vec::with_capacity(edit_count as usize);
    for _ in 0..edit_count {
        if offset >= bytes.len() {
            return Err(Error::corrupt("end of page while reading pending edit kind"));
        }
        let kind = edit_kind_from_byte(bytes[offset])?;
        offset += 1;
        let (key, next) = read_entry(bytes, offset, pool)?;
        offset = next;
        let value = if kind.carries_value() {
            let (v, next) = read_entry(bytes, offset, pool)?;
            offset = next;
            Some(v)
        } else {
            None
        };
        if offset >= bytes.len() {
            return Err(Error::corrupt("end of page while reading pending edit guaranteed flag"));
        }
        let guaranteed = bytes[offset] != 0;
        offset += 1;
        edits.push(PendingEdit { kind, key, value, guaranteed });
    }

    if offset != bytes.len() {
        return Err(Error::corrupt(format!(
            "trailing bytes after internal node: {} left",
            bytes.len() - offset
        )));
    }

    Ok(InternalNode { branches, edits })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_roundtrip() {
        let pool = Mempool::new();
        let leaf = LeafNode {
            pairs: vec![(pool.alloc(b"a"), pool.alloc(b"1")), (pool.alloc(b"b"), pool.alloc(b"2"))],
            overflow: OverflowRef::NONE,
        };
        let bytes = serialize_leaf(&leaf);
        let parsed = parse_node(&bytes, &pool).unwrap();
        assert_eq!(parsed, Node::Leaf(leaf));
    }

    #[test]
    fn overflow_roundtrip() {
        let pool = Mempool::new();
        let node = OverflowNode {
            values: vec![pool.alloc(b"x"), pool.alloc(b"y")],
            next: OverflowRef { count: 3, id: NodeId::new([9u8; NODE_ID_LEN]) },
        };
        let bytes = serialize_overflow(&node);
        assert_eq!(parse_node(&bytes, &pool).unwrap(), Node::Overflow(node));
    }

    #[test]
    fn internal_roundtrip_with_edits() {
        let pool = Mempool::new();
        let internal = InternalNode {
            branches: vec![
                Branch { sep_key: &[], id: NodeId::new([1u8; NODE_ID_LEN]), item_count: 10 },
                Branch { sep_key: pool.alloc(b"m"), id: NodeId::new([2u8; NODE_ID_LEN]), item_count: 20 },
            ],
            edits: vec![PendingEdit {
                kind: EditKind::Upsert,
                key: pool.alloc(b"k"),
                value: Some(pool.alloc(b"v")),
                guaranteed: true,
            }],
        };
        let bytes = serialize_internal(&internal);
        assert_eq!(parse_node(&bytes, &pool).unwrap(), Node::Internal(internal));
    }

    #[test]
    fn corrupt_flags_rejected() {
        let pool = Mempool::new();
        let mut bytes = vec![0u8; 8];
        bytes[0] = 0xFF;
        bytes[1] = 0xFF;
        assert!(parse_node(&bytes, &pool).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let pool = Mempool::new();
        let leaf = LeafNode { pairs: vec![], overflow: OverflowRef::NONE };
        let mut bytes = serialize_leaf(&leaf);
        bytes.push(0);
        assert!(parse_node(&bytes, &pool).is_err());
    }

    #[test]
    fn leaf_split_keeps_overflow_run_together() {
        let pool = Mempool::new();
        let leaf = LeafNode {
            pairs: vec![
                (pool.alloc(b"a"), pool.alloc(&[0u8; 20])),
                (pool.alloc(b"b"), pool.alloc(&[0u8; 20])),
                (pool.alloc(b"b"), pool.alloc(&[0u8; 20])),
                (pool.alloc(b"b"), pool.alloc(&[0u8; 20])),
                (pool.alloc(b"b"), pool.alloc(&[0u8; 20])),
                (pool.alloc(b"c"), pool.alloc(&[0u8; 20])),
            ],
            overflow: OverflowRef::NONE,
        };
        // max=150 puts the split boundary inside the four-"b" run, so the
        // overflow slice spans more than one item (unlike a boundary that
        // lands on a singleton key, where overflow_start == split_start).
        let info = leaf_size(&leaf, 150);
        assert!(info.should_split);
        assert!(info.overflow_start + 1 < info.split_start, "expected more than one item in the overflow run");

        let boundary_key = leaf.pairs[info.overflow_start - 1].0;
        for i in info.overflow_start..info.split_start {
            assert_eq!(leaf.pairs[i].0, boundary_key);
        }
    }
}
