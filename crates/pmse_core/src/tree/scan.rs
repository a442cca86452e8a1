//! Lazy range scans over a persistent tree.
//!
//! A scan takes one read lock per leaf: it descends from the root to the
//! leaf holding its current position, takes the rest of that leaf, and
//! remembers the separator bounding the leaf (the fence). The next batch
//! resumes at the fence, so a scan never holds a lock across calls and
//! never yields an entry twice.

use super::comparator::KeyComparator;
use super::node::{compare, rank, read_node, Entry, Node, MAX_DEPTH};
use super::PersistentTree;
use crate::error::{CoreError, CoreResult};
use crate::pool::PoolRead;
use crate::types::{Direction, PoolOffset, RecordId};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::ops::Bound;

/// Entries taken from one leaf, in scan order.
pub(crate) struct Run {
    pub(crate) entries: Vec<Entry>,
    pub(crate) fence: Option<Entry>,
}

/// Descends to the leaf holding `from` and returns its entries on the far
/// side of `from`.
pub(crate) fn next_run<R: PoolRead + ?Sized>(
    r: &R,
    cmp: &dyn KeyComparator,
    root: PoolOffset,
    from: &Bound<Entry>,
    direction: Direction,
) -> CoreResult<Run> {
    let mut at = root;
    let mut fence = None;

    for _ in 0..MAX_DEPTH {
        match read_node(r, at)? {
            Node::Internal { children, seps } => {
                let idx = match (direction, from) {
                    (Direction::Forward, Bound::Unbounded) => 0,
                    (Direction::Backward, Bound::Unbounded) => seps.len(),
                    (Direction::Forward, Bound::Included(e) | Bound::Excluded(e))
                    | (Direction::Backward, Bound::Included(e)) => rank(cmp, &seps, e, true),
                    (Direction::Backward, Bound::Excluded(e)) => rank(cmp, &seps, e, false),
                };
                match direction {
                    Direction::Forward if idx < seps.len() => fence = Some(seps[idx].clone()),
                    Direction::Backward if idx > 0 => fence = Some(seps[idx - 1].clone()),
                    _ => {}
                }
                at = children[idx];
            }
            Node::Leaf(mut entries) => {
                match direction {
                    Direction::Forward => {
                        let start = match from {
                            Bound::Unbounded => 0,
                            Bound::Included(e) => rank(cmp, &entries, e, false),
                            Bound::Excluded(e) => rank(cmp, &entries, e, true),
                        };
                        entries = entries.split_off(start);
                    }
                    Direction::Backward => {
                        let end = match from {
                            Bound::Unbounded => entries.len(),
                            Bound::Included(e) => rank(cmp, &entries, e, true),
                            Bound::Excluded(e) => rank(cmp, &entries, e, false),
                        };
                        entries.truncate(end);
                        entries.reverse();
                    }
                }
                return Ok(Run { entries, fence });
            }
        }
    }

    Err(CoreError::structural(format!(
        "tree rooted at {root} is deeper than {MAX_DEPTH} levels"
    )))
}

/// Position after the fence of a finished leaf.
pub(crate) fn resume_at(
    cmp: &dyn KeyComparator,
    from: &Bound<Entry>,
    fence: Entry,
    direction: Direction,
) -> CoreResult<Bound<Entry>> {
    let moved = match from {
        Bound::Unbounded => true,
        Bound::Included(e) | Bound::Excluded(e) => {
            let order = compare(cmp, &fence, e);
            match direction {
                Direction::Forward => order == Ordering::Greater,
                Direction::Backward => order == Ordering::Less,
            }
        }
    };
    if !moved {
        return Err(CoreError::structural("tree separators are out of order"));
    }
    Ok(match direction {
        Direction::Forward => Bound::Included(fence),
        Direction::Backward => Bound::Excluded(fence),
    })
}

/// Returns true once `entry` lies beyond the far end of a scan.
pub(crate) fn is_past(
    cmp: &dyn KeyComparator,
    to: &Bound<Entry>,
    entry: &Entry,
    direction: Direction,
) -> bool {
    let order = match to {
        Bound::Unbounded => return false,
        Bound::Included(e) | Bound::Excluded(e) => compare(cmp, entry, e),
    };
    match (direction, to) {
        (Direction::Forward, Bound::Included(_)) => order == Ordering::Greater,
        (Direction::Forward, _) => order != Ordering::Less,
        (Direction::Backward, Bound::Included(_)) => order == Ordering::Less,
        (Direction::Backward, _) => order != Ordering::Greater,
    }
}

/// First entry at or beyond `from`, read under one lock.
pub(crate) fn seek<R: PoolRead + ?Sized>(
    r: &R,
    cmp: &dyn KeyComparator,
    root: PoolOffset,
    from: Bound<Entry>,
    direction: Direction,
) -> CoreResult<Option<Entry>> {
    let mut from = from;
    loop {
        let run = next_run(r, cmp, root, &from, direction)?;
        if let Some(first) = run.entries.into_iter().next() {
            return Ok(Some(first));
        }
        match run.fence {
            Some(fence) => from = resume_at(cmp, &from, fence, direction)?,
            None => return Ok(None),
        }
    }
}

/// Key bounds widened to entry bounds covering every record id.
pub(crate) fn lower_entry(bound: Bound<&[u8]>) -> Bound<Entry> {
    match bound {
        Bound::Included(k) => Bound::Included(Entry::new(k, RecordId::MIN)),
        Bound::Excluded(k) => Bound::Excluded(Entry::new(k, RecordId::MAX)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

pub(crate) fn upper_entry(bound: Bound<&[u8]>) -> Bound<Entry> {
    match bound {
        Bound::Included(k) => Bound::Included(Entry::new(k, RecordId::MAX)),
        Bound::Excluded(k) => Bound::Excluded(Entry::new(k, RecordId::MIN)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// A lazy, finite scan over a key range of a [`PersistentTree`].
///
/// Yields `(key, record id)` pairs in comparator order (or its reverse).
/// Entries not mutated while the scan runs are yielded exactly once.
pub struct TreeScan<'a> {
    tree: &'a PersistentTree,
    from: Bound<Entry>,
    to: Bound<Entry>,
    direction: Direction,
    pending: VecDeque<Entry>,
    done: bool,
}

impl<'a> TreeScan<'a> {
    pub(super) fn new(
        tree: &'a PersistentTree,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        direction: Direction,
    ) -> Self {
        let (from, to) = match direction {
            Direction::Forward => (lower_entry(lower), upper_entry(upper)),
            Direction::Backward => (upper_entry(upper), lower_entry(lower)),
        };
        Self {
            tree,
            from,
            to,
            direction,
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn fill(&mut self) -> CoreResult<()> {
        let tree = self.tree;
        let cmp = tree.comparator().as_ref();
        let header_at = tree.header_offset();
        let direction = self.direction;

        let (batch, from, done) = tree.pool().read(|snap| {
            tree.ensure_live()?;
            let root = super::TreeHeader::read(snap, header_at)?.root;
            let mut from = self.from.clone();
            let mut batch = Vec::new();
            loop {
                let run = next_run(snap, cmp, root, &from, direction)?;
                for entry in run.entries {
                    if is_past(cmp, &self.to, &entry, direction) {
                        return Ok((batch, from, true));
                    }
                    batch.push(entry);
                }
                match run.fence {
                    Some(fence) => from = resume_at(cmp, &from, fence, direction)?,
                    None => return Ok((batch, from, true)),
                }
                if !batch.is_empty() {
                    return Ok((batch, from, false));
                }
            }
        })?;

        self.pending.extend(batch);
        self.from = from;
        self.done = done;
        Ok(())
    }
}

impl Iterator for TreeScan<'_> {
    type Item = CoreResult<(Vec<u8>, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok((entry.key, entry.rid)));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.fill() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}
