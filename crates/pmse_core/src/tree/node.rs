//! Tree nodes and their on-media encoding.
//!
//! ```text
//! | kind u8 | reserved u8 | count u16 | ...
//! leaf:     count x (key_len u16 | key | rid u64)
//! internal: child0 u64, count x (key_len u16 | key | rid u64 | child u64)
//! ```
//!
//! Child `i + 1` of an internal node holds entries that compare greater
//! than or equal to separator `i`; child `i` holds entries below it.

use super::comparator::KeyComparator;
use crate::codec::Decoder;
use crate::error::{CoreError, CoreResult};
use crate::pool::{BlockKind, PoolRead, Transaction};
use crate::types::{PoolOffset, RecordId};
use bytes::BufMut;
use std::cmp::Ordering;

/// Payload bytes of every node block.
pub(crate) const NODE_SIZE: usize = 4080;

/// Nodes encoding to fewer bytes than this are merged with a sibling.
pub(crate) const MERGE_THRESHOLD: usize = NODE_SIZE / 4;

/// Deepest tree a walk will follow before reporting a cycle.
pub(crate) const MAX_DEPTH: usize = 64;

const LEAF: u8 = 1;
const INTERNAL: u8 = 2;
const NODE_HEADER: usize = 4;

/// One `(key, record id)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) key: Vec<u8>,
    pub(crate) rid: RecordId,
}

impl Entry {
    pub(crate) fn new(key: &[u8], rid: RecordId) -> Self {
        Self {
            key: key.to_vec(),
            rid,
        }
    }
}

/// Composite order: comparator on the key, then record id.
pub(crate) fn compare(cmp: &dyn KeyComparator, a: &Entry, b: &Entry) -> Ordering {
    cmp.compare(&a.key, &b.key).then(a.rid.cmp(&b.rid))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(Vec<Entry>),
    Internal {
        children: Vec<PoolOffset>,
        seps: Vec<Entry>,
    },
}

impl Node {
    pub(crate) fn empty_leaf() -> Self {
        Self::Leaf(Vec::new())
    }

    pub(crate) fn encoded_size(&self) -> usize {
        match self {
            Self::Leaf(entries) => {
                NODE_HEADER + entries.iter().map(|e| 10 + e.key.len()).sum::<usize>()
            }
            Self::Internal { seps, .. } => {
                NODE_HEADER + 8 + seps.iter().map(|e| 18 + e.key.len()).sum::<usize>()
            }
        }
    }

    pub(crate) fn fits(&self) -> bool {
        self.encoded_size() <= NODE_SIZE
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        match self {
            Self::Leaf(entries) => {
                buf.put_u8(LEAF);
                buf.put_u8(0);
                buf.put_u16_le(entries.len() as u16);
                for e in entries {
                    put_entry(&mut buf, e);
                }
            }
            Self::Internal { children, seps } => {
                buf.put_u8(INTERNAL);
                buf.put_u8(0);
                buf.put_u16_le(seps.len() as u16);
                buf.put_u64_le(children[0].as_u64());
                for (sep, child) in seps.iter().zip(&children[1..]) {
                    put_entry(&mut buf, sep);
                    buf.put_u64_le(child.as_u64());
                }
            }
        }
        buf
    }

    pub(crate) fn decode(at: PoolOffset, data: &[u8]) -> CoreResult<Self> {
        let mut dec = Decoder::new(data, "tree node");
        let kind = dec.u8()?;
        let _reserved = dec.u8()?;
        let count = dec.u16()? as usize;
        match kind {
            LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(read_entry(&mut dec)?);
                }
                Ok(Self::Leaf(entries))
            }
            INTERNAL => {
                let mut children = Vec::with_capacity(count + 1);
                let mut seps = Vec::with_capacity(count);
                children.push(dec.offset()?);
                for _ in 0..count {
                    seps.push(read_entry(&mut dec)?);
                    children.push(dec.offset()?);
                }
                Ok(Self::Internal { children, seps })
            }
            other => Err(CoreError::structural(format!(
                "tree node at {at} has unknown kind {other}"
            ))),
        }
    }
}

fn put_entry(buf: &mut Vec<u8>, e: &Entry) {
    buf.put_u16_le(e.key.len() as u16);
    buf.put_slice(&e.key);
    buf.put_u64_le(e.rid.as_u64());
}

fn read_entry(dec: &mut Decoder<'_>) -> CoreResult<Entry> {
    let len = dec.u16()? as usize;
    let key = dec.bytes(len)?.to_vec();
    let rid = RecordId::new(dec.u64()?);
    Ok(Entry { key, rid })
}

pub(crate) fn read_node<R: PoolRead + ?Sized>(r: &R, at: PoolOffset) -> CoreResult<Node> {
    let raw = r.object(at, BlockKind::TreeNode)?;
    Node::decode(at, &raw)
}

pub(crate) fn write_node(tx: &mut Transaction<'_>, at: PoolOffset, node: &Node) -> CoreResult<()> {
    tx.write(at, BlockKind::TreeNode, 0, &node.encode())
}

pub(crate) fn alloc_node(tx: &mut Transaction<'_>, node: &Node) -> CoreResult<PoolOffset> {
    let mut buf = node.encode();
    buf.resize(NODE_SIZE, 0);
    tx.alloc(BlockKind::TreeNode, &buf)
}

/// Number of entries that compare less than (or, with `inclusive`, less
/// than or equal to) `probe`.
pub(crate) fn rank(
    cmp: &dyn KeyComparator,
    entries: &[Entry],
    probe: &Entry,
    inclusive: bool,
) -> usize {
    entries.partition_point(|e| match compare(cmp, e, probe) {
        Ordering::Less => true,
        Ordering::Equal => inclusive,
        Ordering::Greater => false,
    })
}

/// Index at which a full node is split so both halves carry about the same
/// number of bytes. Always leaves at least one entry on each side.
pub(crate) fn split_point(entries: &[Entry], per_entry: usize) -> usize {
    let total: usize = entries.iter().map(|e| per_entry + e.key.len()).sum();
    let mut acc = 0;
    for (i, e) in entries.iter().enumerate() {
        acc += per_entry + e.key.len();
        if acc * 2 >= total {
            return (i + 1).clamp(1, entries.len().saturating_sub(1).max(1));
        }
    }
    entries.len() / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::comparator::BytewiseComparator;

    fn entry(key: &str, rid: u64) -> Entry {
        Entry::new(key.as_bytes(), RecordId::new(rid))
    }

    #[test]
    fn leaf_roundtrip() {
        let node = Node::Leaf(vec![entry("a", 1), entry("bb", 2)]);
        let encoded = node.encode();
        assert_eq!(encoded.len(), node.encoded_size());
        assert_eq!(Node::decode(PoolOffset::new(64), &encoded).unwrap(), node);
    }

    #[test]
    fn internal_roundtrip() {
        let node = Node::Internal {
            children: vec![PoolOffset::new(64), PoolOffset::new(4160)],
            seps: vec![entry("m", 0)],
        };
        let encoded = node.encode();
        assert_eq!(encoded.len(), node.encoded_size());
        assert_eq!(Node::decode(PoolOffset::new(64), &encoded).unwrap(), node);
    }

    #[test]
    fn unknown_kind_is_structural() {
        let err = Node::decode(PoolOffset::new(64), &[9, 0, 0, 0]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn rank_orders_by_key_then_rid() {
        let cmp = BytewiseComparator;
        let entries = vec![entry("a", 1), entry("b", 1), entry("b", 5), entry("c", 0)];
        assert_eq!(rank(&cmp, &entries, &entry("b", 1), false), 1);
        assert_eq!(rank(&cmp, &entries, &entry("b", 1), true), 2);
        assert_eq!(rank(&cmp, &entries, &entry("b", 3), true), 2);
        assert_eq!(rank(&cmp, &entries, &entry("z", 0), false), 4);
    }

    #[test]
    fn split_point_balances_bytes() {
        let entries: Vec<Entry> = (0..10).map(|i| entry("k", i)).collect();
        assert_eq!(split_point(&entries, 10), 5);

        let skewed = vec![
            Entry::new(&[1u8; 1000], RecordId::new(1)),
            entry("a", 2),
            entry("b", 3),
        ];
        let at = split_point(&skewed, 10);
        assert!((1..skewed.len()).contains(&at));
    }
}
