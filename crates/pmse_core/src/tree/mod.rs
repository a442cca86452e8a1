//! Persistent transactional B+tree backing an index.
//!
//! Entries are `(key, record id)` pairs kept in comparator order on the key,
//! then record id order, so equal keys of a non-unique index are distinct
//! entries. Every insert or remove, including the splits and merges it
//! causes, is a single pool transaction.

mod comparator;
pub(crate) mod node;
mod scan;

pub use comparator::{builtin_comparator, BytewiseComparator, KeyComparator, ReverseBytewiseComparator};
pub use scan::TreeScan;

use crate::codec::{put_string, Decoder};
use crate::error::{CoreError, CoreResult};
use crate::pool::{BlockKind, Pool, PoolRead, Transaction};
use crate::types::{Direction, PoolOffset, RecordId};
use bytes::BufMut;
use node::{alloc_node, compare, rank, read_node, write_node, Entry, Node, MAX_DEPTH};
use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Longest key an index accepts.
pub const MAX_KEY_LEN: usize = 1024;

const TREE_MAGIC: [u8; 4] = *b"PTRE";
pub(crate) const ROOT_AT: u64 = 8;
pub(crate) const COUNT_AT: u64 = 16;

/// Persistent tree header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TreeHeader {
    pub(crate) unique: bool,
    pub(crate) root: PoolOffset,
    pub(crate) count: u64,
    pub(crate) comparator: String,
}

impl TreeHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(26 + self.comparator.len());
        buf.put_slice(&TREE_MAGIC);
        buf.put_u8(u8::from(self.unique));
        buf.put_slice(&[0u8; 3]);
        buf.put_u64_le(self.root.as_u64());
        buf.put_u64_le(self.count);
        put_string(&mut buf, &self.comparator);
        buf
    }

    pub(crate) fn read<R: PoolRead + ?Sized>(r: &R, at: PoolOffset) -> CoreResult<Self> {
        let raw = r.object(at, BlockKind::TreeHeader)?;
        let mut dec = Decoder::new(&raw, "tree header");
        dec.magic(&TREE_MAGIC)?;
        let unique = dec.u8()? != 0;
        let _reserved = dec.bytes(3)?;
        Ok(Self {
            unique,
            root: dec.offset()?,
            count: dec.u64()?,
            comparator: dec.string()?,
        })
    }
}

pub(crate) fn write_root(tx: &mut Transaction<'_>, header_at: PoolOffset, root: PoolOffset) -> CoreResult<()> {
    tx.write(header_at, BlockKind::TreeHeader, ROOT_AT, &root.as_u64().to_le_bytes())
}

pub(crate) fn write_count(tx: &mut Transaction<'_>, header_at: PoolOffset, count: u64) -> CoreResult<()> {
    tx.write(header_at, BlockKind::TreeHeader, COUNT_AT, &count.to_le_bytes())
}

/// Lists every node reachable from `root`, parents before children.
pub(crate) fn collect_nodes<R: PoolRead + ?Sized>(r: &R, root: PoolOffset) -> CoreResult<Vec<PoolOffset>> {
    let mut out = Vec::new();
    let mut stack = vec![(root, 0usize)];
    while let Some((at, depth)) = stack.pop() {
        if depth >= MAX_DEPTH {
            return Err(CoreError::structural(format!(
                "tree rooted at {root} is deeper than {MAX_DEPTH} levels"
            )));
        }
        if let Node::Internal { children, .. } = read_node(r, at)? {
            stack.extend(children.into_iter().map(|c| (c, depth + 1)));
        }
        out.push(at);
    }
    Ok(out)
}

fn check_key(key: &[u8]) -> CoreResult<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(CoreError::KeyTooLarge {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

/// A persistent ordered index from keys to record ids.
pub struct PersistentTree {
    pool: Arc<Pool>,
    header_at: PoolOffset,
    unique: bool,
    comparator: Arc<dyn KeyComparator>,
    /// Set when the tree is dropped from its collection. Its header block
    /// may be reused afterwards, so every access checks this under the pool
    /// lock.
    dropped: AtomicBool,
}

impl std::fmt::Debug for PersistentTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTree")
            .field("header", &self.header_at)
            .field("unique", &self.unique)
            .field("comparator", &self.comparator.name())
            .finish()
    }
}

impl PersistentTree {
    /// Builds an empty tree inside `tx` and returns its header offset.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError` if the pool is full.
    pub fn create_in(
        tx: &mut Transaction<'_>,
        unique: bool,
        comparator: &dyn KeyComparator,
    ) -> CoreResult<PoolOffset> {
        let root = alloc_node(tx, &Node::empty_leaf())?;
        let header = TreeHeader {
            unique,
            root,
            count: 0,
            comparator: comparator.name().to_string(),
        };
        tx.alloc(BlockKind::TreeHeader, &header.encode())
    }

    /// Frees a tree and all of its nodes inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the tree cannot be walked.
    pub fn destroy_in(tx: &mut Transaction<'_>, header_at: PoolOffset) -> CoreResult<()> {
        let header = TreeHeader::read(tx, header_at)?;
        for node in collect_nodes(tx, header.root)? {
            tx.free(node, BlockKind::TreeNode)?;
        }
        tx.free(header_at, BlockKind::TreeHeader)
    }

    /// Attaches to the tree whose header lives at `header_at`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the tree was built with a different
    /// comparator, or `StructuralCorruption` for a bad header.
    pub fn attach(
        pool: Arc<Pool>,
        header_at: PoolOffset,
        comparator: Arc<dyn KeyComparator>,
    ) -> CoreResult<Self> {
        let header = pool.read(|snap| TreeHeader::read(snap, header_at))?;
        if header.comparator != comparator.name() {
            return Err(CoreError::invalid_operation(format!(
                "tree at {header_at} is ordered by {:?}, not {:?}",
                header.comparator,
                comparator.name()
            )));
        }
        Ok(Self {
            pool,
            header_at,
            unique: header.unique,
            comparator,
            dropped: AtomicBool::new(false),
        })
    }

    /// Marks the tree as dropped. Must be called while the dropping
    /// transaction holds the pool lock.
    pub(crate) fn set_dropped(&self, dropped: bool) {
        self.dropped.store(dropped, AtomicOrdering::Release);
    }

    /// Returns true once the tree was dropped from its collection.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn ensure_live(&self) -> CoreResult<()> {
        if self.is_dropped() {
            return Err(CoreError::not_found(format!("index tree at {}", self.header_at)));
        }
        Ok(())
    }

    /// Adds `(key, rid)` to the tree.
    ///
    /// Re-inserting an existing pair into a non-unique tree is a no-op.
    ///
    /// # Errors
    ///
    /// - `DuplicateKey` if the tree is unique and `key` is present
    /// - `KeyTooLarge` if `key` exceeds [`MAX_KEY_LEN`]
    /// - `AllocationError` if the pool is full
    pub fn insert(&self, key: &[u8], rid: RecordId) -> CoreResult<()> {
        check_key(key)?;
        let entry = Entry::new(key, rid);
        self.pool.transaction(|tx| {
            self.ensure_live()?;
            self.insert_in(tx, entry)
        })
    }

    fn insert_in(&self, tx: &mut Transaction<'_>, entry: Entry) -> CoreResult<()> {
        let cmp = self.comparator.as_ref();
        let header = TreeHeader::read(tx, self.header_at)?;

        if self.unique {
            let probe = Bound::Included(Entry::new(&entry.key, RecordId::MIN));
            if let Some(found) = scan::seek(tx, cmp, header.root, probe, Direction::Forward)? {
                if cmp.compare(&found.key, &entry.key) == Ordering::Equal {
                    return Err(CoreError::duplicate_key(format!(
                        "index key {:?}",
                        String::from_utf8_lossy(&entry.key)
                    )));
                }
            }
        } else {
            let probe = Bound::Included(entry.clone());
            if let Some(found) = scan::seek(tx, cmp, header.root, probe, Direction::Forward)? {
                if compare(cmp, &found, &entry) == Ordering::Equal {
                    return Ok(());
                }
            }
        }

        if let Some((sep, right)) = self.insert_rec(tx, header.root, entry, 0)? {
            let root = alloc_node(
                tx,
                &Node::Internal {
                    children: vec![header.root, right],
                    seps: vec![sep],
                },
            )?;
            write_root(tx, self.header_at, root)?;
        }
        write_count(tx, self.header_at, header.count + 1)
    }

    fn insert_rec(
        &self,
        tx: &mut Transaction<'_>,
        at: PoolOffset,
        entry: Entry,
        depth: usize,
    ) -> CoreResult<Option<(Entry, PoolOffset)>> {
        if depth >= MAX_DEPTH {
            return Err(CoreError::structural("tree is too deep"));
        }
        let cmp = self.comparator.as_ref();
        let mut node = read_node(tx, at)?;

        match &mut node {
            Node::Leaf(entries) => {
                let pos = rank(cmp, entries, &entry, false);
                entries.insert(pos, entry);
            }
            Node::Internal { children, seps } => {
                let idx = rank(cmp, seps, &entry, true);
                match self.insert_rec(tx, children[idx], entry, depth + 1)? {
                    Some((sep, right)) => {
                        seps.insert(idx, sep);
                        children.insert(idx + 1, right);
                    }
                    None => return Ok(None),
                }
            }
        }

        if node.fits() {
            write_node(tx, at, &node)?;
            return Ok(None);
        }

        let (left, sep, right) = split(node);
        write_node(tx, at, &left)?;
        let right_at = alloc_node(tx, &right)?;
        Ok(Some((sep, right_at)))
    }

    /// Removes `(key, rid)` from the tree.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the pair is absent.
    pub fn remove(&self, key: &[u8], rid: RecordId) -> CoreResult<()> {
        let entry = Entry::new(key, rid);
        self.pool.transaction(|tx| {
            self.ensure_live()?;
            let header = TreeHeader::read(tx, self.header_at)?;
            self.remove_rec(tx, header.root, &entry, 0)?;
            self.collapse_root(tx, header.root)?;
            write_count(tx, self.header_at, header.count.saturating_sub(1))
        })
    }

    /// Removes `entry` below `at` and returns the node's new encoded size.
    fn remove_rec(
        &self,
        tx: &mut Transaction<'_>,
        at: PoolOffset,
        entry: &Entry,
        depth: usize,
    ) -> CoreResult<usize> {
        if depth >= MAX_DEPTH {
            return Err(CoreError::structural("tree is too deep"));
        }
        let cmp = self.comparator.as_ref();
        let mut node = read_node(tx, at)?;

        let changed = match &mut node {
            Node::Leaf(entries) => {
                let pos = rank(cmp, entries, entry, false);
                let hit = entries
                    .get(pos)
                    .is_some_and(|e| compare(cmp, e, entry) == Ordering::Equal);
                if !hit {
                    return Err(CoreError::not_found(format!(
                        "index entry {:?} -> {}",
                        String::from_utf8_lossy(&entry.key),
                        entry.rid
                    )));
                }
                entries.remove(pos);
                true
            }
            Node::Internal { children, seps } => {
                let idx = rank(cmp, seps, entry, true);
                let child_size = self.remove_rec(tx, children[idx], entry, depth + 1)?;
                child_size < node::MERGE_THRESHOLD
                    && children.len() > 1
                    && merge_children(tx, children, seps, idx)?
            }
        };

        if changed {
            write_node(tx, at, &node)?;
        }
        Ok(node.encoded_size())
    }

    /// Replaces internal roots with a single child by that child.
    fn collapse_root(&self, tx: &mut Transaction<'_>, root: PoolOffset) -> CoreResult<()> {
        let mut root = root;
        let mut collapsed = false;
        for _ in 0..MAX_DEPTH {
            match read_node(tx, root)? {
                Node::Internal { children, seps } if seps.is_empty() => {
                    tx.free(root, BlockKind::TreeNode)?;
                    root = children[0];
                    collapsed = true;
                }
                _ => break,
            }
        }
        if collapsed {
            write_root(tx, self.header_at, root)?;
        }
        Ok(())
    }

    /// Returns every record id stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the tree is damaged.
    pub fn find(&self, key: &[u8]) -> CoreResult<Vec<RecordId>> {
        self.scan(Bound::Included(key), Bound::Included(key), Direction::Forward)
            .map(|r| r.map(|(_, rid)| rid))
            .collect()
    }

    /// Returns true if `(key, rid)` is present.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the tree is damaged.
    pub fn contains(&self, key: &[u8], rid: RecordId) -> CoreResult<bool> {
        let entry = Entry::new(key, rid);
        let cmp = self.comparator.as_ref();
        self.pool.read(|snap| {
            self.ensure_live()?;
            let root = TreeHeader::read(snap, self.header_at)?.root;
            let found = scan::seek(snap, cmp, root, Bound::Included(entry.clone()), Direction::Forward)?;
            Ok(found.is_some_and(|f| compare(cmp, &f, &entry) == Ordering::Equal))
        })
    }

    /// Scans `[lower, upper]` (per the bounds) in the given direction.
    #[must_use]
    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>, direction: Direction) -> TreeScan<'_> {
        TreeScan::new(self, lower, upper, direction)
    }

    /// Smallest entry, if any.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the tree is damaged.
    pub fn first(&self) -> CoreResult<Option<(Vec<u8>, RecordId)>> {
        self.scan(Bound::Unbounded, Bound::Unbounded, Direction::Forward)
            .next()
            .transpose()
    }

    /// Largest entry, if any.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the tree is damaged.
    pub fn last(&self) -> CoreResult<Option<(Vec<u8>, RecordId)>> {
        self.scan(Bound::Unbounded, Bound::Unbounded, Direction::Backward)
            .next()
            .transpose()
    }

    /// Removes every entry in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn clear(&self) -> CoreResult<()> {
        self.pool.transaction(|tx| {
            self.ensure_live()?;
            let header = TreeHeader::read(tx, self.header_at)?;
            for node in collect_nodes(tx, header.root)? {
                tx.free(node, BlockKind::TreeNode)?;
            }
            let root = alloc_node(tx, &Node::empty_leaf())?;
            write_root(tx, self.header_at, root)?;
            write_count(tx, self.header_at, 0)
        })
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the pool was closed.
    pub fn len(&self) -> CoreResult<u64> {
        self.pool.read(|snap| {
            self.ensure_live()?;
            Ok(TreeHeader::read(snap, self.header_at)?.count)
        })
    }

    /// Returns true if the tree has no entries.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the pool was closed.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns true if the tree rejects duplicate keys.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// The comparator ordering this tree.
    #[must_use]
    pub fn comparator(&self) -> &Arc<dyn KeyComparator> {
        &self.comparator
    }

    /// Offset of the tree header inside its pool.
    #[must_use]
    pub fn header_offset(&self) -> PoolOffset {
        self.header_at
    }

    /// The pool holding this tree.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }
}

/// Splits an overfull node into (left, separator, right).
fn split(node: Node) -> (Node, Entry, Node) {
    match node {
        Node::Leaf(mut entries) => {
            let mid = node::split_point(&entries, 10);
            let right = entries.split_off(mid);
            let sep = right[0].clone();
            (Node::Leaf(entries), sep, Node::Leaf(right))
        }
        Node::Internal {
            mut children,
            mut seps,
        } => {
            let mid = node::split_point(&seps, 18).min(seps.len() - 1);
            let mut right_seps = seps.split_off(mid);
            let promoted = right_seps.remove(0);
            let right_children = children.split_off(mid + 1);
            (
                Node::Internal { children, seps },
                promoted,
                Node::Internal {
                    children: right_children,
                    seps: right_seps,
                },
            )
        }
    }
}

/// Merges child `idx` of an internal node with a neighbour if the result
/// fits in one node. Returns true if the parent changed.
fn merge_children(
    tx: &mut Transaction<'_>,
    children: &mut Vec<PoolOffset>,
    seps: &mut Vec<Entry>,
    idx: usize,
) -> CoreResult<bool> {
    let (l, r) = if idx + 1 < children.len() {
        (idx, idx + 1)
    } else {
        (idx - 1, idx)
    };

    let merged = match (read_node(tx, children[l])?, read_node(tx, children[r])?) {
        (Node::Leaf(mut left), Node::Leaf(right)) => {
            left.extend(right);
            Node::Leaf(left)
        }
        (
            Node::Internal {
                children: mut lc,
                seps: mut ls,
            },
            Node::Internal {
                children: rc,
                seps: rs,
            },
        ) => {
            ls.push(seps[l].clone());
            ls.extend(rs);
            lc.extend(rc);
            Node::Internal {
                children: lc,
                seps: ls,
            }
        }
        _ => {
            return Err(CoreError::structural(format!(
                "siblings {} and {} are on different levels",
                children[l], children[r]
            )))
        }
    };

    if !merged.fits() {
        return Ok(false);
    }

    write_node(tx, children[l], &merged)?;
    tx.free(children[r], BlockKind::TreeNode)?;
    seps.remove(l);
    children.remove(r);
    Ok(true)
}
