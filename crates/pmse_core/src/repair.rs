//! Structural repair after an unclean shutdown.
//!
//! The redo log already guarantees that every pool is at a transaction
//! boundary. What it cannot fix are volatile counters that were never
//! stored, blocks leaked by a crash between two transactions, and damage
//! to the media itself. Repair walks every structure from the pool root,
//! marks what is reachable, cuts links that do not lead to a valid object,
//! rebuilds trees whose order is broken from the entries that can still be
//! read, and frees every allocated block nobody points to.
//!
//! Each pool is repaired in one transaction, so a crash during repair
//! leaves the pool as it was and repair can simply run again.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::identlist::{self, IdentList};
use crate::map::layout::{self, MapHeader, COUNTERS_AT};
use crate::pool::{BlockKind, BlockState, Pool, PoolRead, Transaction};
use crate::root::CollectionRoot;
use crate::tree::node::{self, alloc_node, read_node, Entry, Node, MAX_DEPTH, NODE_SIZE};
use crate::tree::{self, KeyComparator, TreeHeader, MAX_KEY_LEN};
use crate::types::PoolOffset;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

/// Rebuilt nodes are filled to this many bytes, leaving room for inserts.
/// One more maximal entry on top must still fit in a node.
const FILL_TARGET: usize = NODE_SIZE * 2 / 3;

/// Outcome of a repair pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Pools walked.
    pub pools: u64,
    /// Record maps walked.
    pub maps: u64,
    /// Index trees walked.
    pub trees: u64,
    /// Records reachable in all maps.
    pub entries: u64,
    /// Entries reachable in all trees.
    pub index_entries: u64,
    /// Allocated blocks freed because nothing referenced them.
    pub reclaimed_blocks: u64,
    /// Structural problems found and fixed or skipped.
    pub findings: Vec<String>,
}

impl RepairReport {
    /// Adds the counts of `other` to this report.
    pub fn merge(&mut self, other: Self) {
        self.pools += other.pools;
        self.maps += other.maps;
        self.trees += other.trees;
        self.entries += other.entries;
        self.index_entries += other.index_entries;
        self.reclaimed_blocks += other.reclaimed_blocks;
        self.findings.extend(other.findings);
    }

    /// Records a problem.
    pub fn finding(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(finding = %message, "repair finding");
        self.findings.push(message);
    }

    /// Returns true if nothing had to be changed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && self.reclaimed_blocks == 0
    }
}

impl fmt::Display for RepairReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pools, {} maps ({} records), {} trees ({} entries), {} blocks reclaimed, {} findings",
            self.pools,
            self.maps,
            self.entries,
            self.trees,
            self.index_entries,
            self.reclaimed_blocks,
            self.findings.len()
        )
    }
}

/// Repairs one collection pool.
///
/// `config` resolves the comparators of the pool's index trees; a tree whose
/// comparator is unknown is kept but its order is not verified.
///
/// # Errors
///
/// Returns `StructuralCorruption` if the collection root, map header or
/// bucket array is unreadable; nothing is changed then.
pub fn repair_pool(pool: &Pool, config: &Config) -> CoreResult<RepairReport> {
    let report = pool.transaction(|tx| {
        let mut pass = Pass::new(tx, config);
        pass.collection()?;
        pass.sweep()?;
        Ok(pass.report)
    })?;
    tracing::info!(path = ?pool.path(), %report, "collection pool repaired");
    Ok(report)
}

/// Repairs the metadata pool and returns the surviving `(ident, namespace)`
/// pairs with the report.
///
/// # Errors
///
/// Returns `StructuralCorruption` if the list root is unreadable.
pub fn repair_identlist(list: &IdentList) -> CoreResult<(Vec<(String, String)>, RepairReport)> {
    let result = list.pool().transaction(|tx| {
        let checked = identlist::repair_in(tx)?;
        let mut report = RepairReport {
            pools: 1,
            ..RepairReport::default()
        };
        if checked.cut > 0 {
            report.finding(format!("ident list: {} links cut", checked.cut));
        }
        let reachable: HashSet<PoolOffset> = checked.reachable.iter().copied().collect();
        report.reclaimed_blocks = sweep(tx, &reachable)?;
        Ok((checked.entries, report))
    })?;
    tracing::info!(report = %result.1, "ident list repaired");
    Ok(result)
}

/// Frees every allocated block not in `reachable`.
fn sweep(tx: &mut Transaction<'_>, reachable: &HashSet<PoolOffset>) -> CoreResult<u64> {
    let mut reclaimed = 0;
    for (payload, header) in tx.walk_blocks()? {
        if header.state == BlockState::Allocated && !reachable.contains(&payload) {
            tracing::debug!(block = %payload, kind = ?header.kind, "reclaiming unreachable block");
            tx.free_block(payload, header);
            reclaimed += 1;
        }
    }
    Ok(reclaimed)
}

/// Where a map chain pointer is stored.
#[derive(Clone, Copy)]
enum Slot {
    Bucket(u32),
    Entry(PoolOffset),
}

struct Pass<'t, 'p> {
    tx: &'t mut Transaction<'p>,
    config: &'t Config,
    reachable: HashSet<PoolOffset>,
    report: RepairReport,
}

/// Nodes and entry count of a tree that passed every check.
struct Checked {
    nodes: Vec<PoolOffset>,
    entries: u64,
}

impl<'t, 'p> Pass<'t, 'p> {
    fn new(tx: &'t mut Transaction<'p>, config: &'t Config) -> Self {
        Self {
            tx,
            config,
            reachable: HashSet::new(),
            report: RepairReport {
                pools: 1,
                ..RepairReport::default()
            },
        }
    }

    fn mark(&mut self, at: PoolOffset) {
        if !at.is_null() {
            self.reachable.insert(at);
        }
    }

    fn collection(&mut self) -> CoreResult<()> {
        let root_at = self.tx.root();
        let mut root = CollectionRoot::read(&*self.tx, root_at)?;
        self.mark(root_at);
        self.map(root.map)?;
        self.indexes(&mut root, root_at)
    }

    fn sweep(&mut self) -> CoreResult<()> {
        self.report.reclaimed_blocks = sweep(self.tx, &self.reachable)?;
        Ok(())
    }

    fn map(&mut self, header_at: PoolOffset) -> CoreResult<()> {
        let header = MapHeader::read(&*self.tx, header_at)?;
        layout::check_buckets(&*self.tx, &header)?;
        self.mark(header_at);
        self.mark(header.buckets);

        let limit = layout::chain_limit(&*self.tx);
        let mut ids = HashSet::new();
        let (mut len, mut data_size, mut max_id) = (0u64, 0u64, 0u64);

        for bucket in 0..header.bucket_count {
            let mut slot = Slot::Bucket(bucket);
            let mut at = layout::read_bucket(&*self.tx, &header, bucket)?;
            let mut steps = 0u64;

            while !at.is_null() {
                steps += 1;
                let head = if steps <= limit && !self.reachable.contains(&at) {
                    layout::read_entry_head(&*self.tx, at).ok()
                } else {
                    None
                };
                let Some(head) = head else {
                    self.report
                        .finding(format!("map bucket {bucket}: link to {at} is dangling, chain cut"));
                    self.set_slot(&header, slot, PoolOffset::NULL)?;
                    break;
                };

                if layout::bucket_of(head.id, header.bucket_count) != bucket || !ids.insert(head.id) {
                    self.report.finding(format!(
                        "map bucket {bucket}: record {} at {at} is misplaced or duplicated, unlinked",
                        head.id
                    ));
                    self.set_slot(&header, slot, head.next)?;
                    at = head.next;
                    continue;
                }

                self.mark(at);
                len += 1;
                data_size += u64::from(head.len);
                max_id = max_id.max(head.id.as_u64());
                slot = Slot::Entry(at);
                at = head.next;
            }
        }

        let next_id = if len == 0 { 1 } else { max_id.saturating_add(1) };
        if (header.next_id, header.len, header.data_size) != (next_id, len, data_size) {
            tracing::debug!(
                map = %header_at,
                stored_len = header.len,
                len,
                next_id,
                "rebuilding map counters"
            );
            let counters = layout::encode_counters(next_id, len, data_size);
            self.tx
                .write(header_at, BlockKind::MapHeader, COUNTERS_AT, &counters)?;
        }

        self.report.maps += 1;
        self.report.entries += len;
        Ok(())
    }

    fn set_slot(&mut self, header: &MapHeader, slot: Slot, target: PoolOffset) -> CoreResult<()> {
        let bytes = target.as_u64().to_le_bytes();
        match slot {
            Slot::Bucket(bucket) => {
                self.tx
                    .write(header.buckets, BlockKind::MapBuckets, u64::from(bucket) * 8, &bytes)
            }
            Slot::Entry(entry) => self.tx.write(entry, BlockKind::MapEntry, 0, &bytes),
        }
    }

    fn indexes(&mut self, root: &mut CollectionRoot, root_at: PoolOffset) -> CoreResult<()> {
        let mut table = match root.indexes(&*self.tx) {
            Ok(table) => table,
            Err(err) => {
                self.report
                    .finding(format!("index table unreadable, all indexes dropped: {err}"));
                return root.detach_indexes(self.tx, root_at);
            }
        };
        self.mark(root.index_table);

        let mut dropped = Vec::new();
        for (name, &header_at) in &table {
            if let Err(err) = self.tree(name, header_at) {
                self.report.finding(format!("index {name} dropped: {err}"));
                dropped.push(name.clone());
            }
        }

        if !dropped.is_empty() {
            for name in &dropped {
                table.remove(name);
            }
            root.store_indexes(self.tx, root_at, &table)?;
            self.mark(root.index_table);
        }
        Ok(())
    }

    fn tree(&mut self, name: &str, header_at: PoolOffset) -> CoreResult<()> {
        let header = TreeHeader::read(&*self.tx, header_at)?;
        let Some(cmp) = self.config.resolve_comparator(&header.comparator) else {
            let nodes = distinct_nodes(&*self.tx, header.root)?;
            self.report.finding(format!(
                "index {name}: comparator {:?} is not registered, order not verified",
                header.comparator
            ));
            self.mark(header_at);
            for at in nodes {
                self.mark(at);
            }
            self.report.trees += 1;
            self.report.index_entries += header.count;
            return Ok(());
        };
        self.mark(header_at);

        let count = match check_tree(&*self.tx, cmp.as_ref(), header.root, header.unique) {
            Ok(checked) => {
                for at in checked.nodes {
                    self.mark(at);
                }
                checked.entries
            }
            Err(err) => {
                let entries = salvage(&*self.tx, cmp.as_ref(), header.root, header.unique);
                self.report.finding(format!(
                    "index {name} rebuilt from {} readable entries: {err}",
                    entries.len()
                ));
                let count = entries.len() as u64;
                let root = self.build(entries)?;
                tree::write_root(self.tx, header_at, root)?;
                count
            }
        };

        if header.count != count {
            self.report.finding(format!(
                "index {name}: entry count {} corrected to {count}",
                header.count
            ));
            tree::write_count(self.tx, header_at, count)?;
        }
        self.report.trees += 1;
        self.report.index_entries += count;
        Ok(())
    }

    /// Bulk-loads sorted entries into fresh nodes and returns the root.
    fn build(&mut self, entries: Vec<Entry>) -> CoreResult<PoolOffset> {
        let mut level: Vec<(Option<Entry>, PoolOffset)> = Vec::new();
        for chunk in pack(entries, |e| 10 + e.key.len()) {
            let first = chunk.first().cloned();
            let at = alloc_node(self.tx, &Node::Leaf(chunk))?;
            self.mark(at);
            level.push((first, at));
        }
        if level.is_empty() {
            let at = alloc_node(self.tx, &Node::empty_leaf())?;
            self.mark(at);
            return Ok(at);
        }

        while level.len() > 1 {
            let mut parents = Vec::new();
            for group in pack(level, |(first, _)| {
                18 + first.as_ref().map_or(0, |e| e.key.len())
            }) {
                let first = group[0].0.clone();
                let mut children = Vec::with_capacity(group.len());
                let mut seps = Vec::with_capacity(group.len().saturating_sub(1));
                for (i, (sep, child)) in group.into_iter().enumerate() {
                    if i > 0 {
                        seps.push(sep.ok_or_else(|| {
                            CoreError::structural("rebuilt tree level has an empty child")
                        })?);
                    }
                    children.push(child);
                }
                let at = alloc_node(self.tx, &Node::Internal { children, seps })?;
                self.mark(at);
                parents.push((first, at));
            }
            level = parents;
        }
        Ok(level[0].1)
    }
}

/// Splits `items` into runs whose summed `size` stays under the fill
/// target. Every run holds at least two items unless there is only one
/// item, so each level of a bulk load is smaller than the one below.
fn pack<T>(items: Vec<T>, size: impl Fn(&T) -> usize) -> Vec<Vec<T>> {
    let mut runs = Vec::new();
    let mut run = Vec::new();
    let mut used = 12;
    for item in items {
        let cost = size(&item);
        if run.len() >= 2 && used + cost > FILL_TARGET {
            runs.push(std::mem::take(&mut run));
            used = 12;
        }
        used += cost;
        run.push(item);
    }
    match runs.last_mut() {
        Some(last) if run.len() == 1 => last.append(&mut run),
        _ if !run.is_empty() => runs.push(run),
        _ => {}
    }
    runs
}

/// Nodes reachable from `root`, each at most once.
fn distinct_nodes<R: PoolRead + ?Sized>(r: &R, root: PoolOffset) -> CoreResult<Vec<PoolOffset>> {
    let nodes = tree::collect_nodes(r, root)?;
    let mut seen = HashSet::new();
    for at in &nodes {
        if !seen.insert(*at) {
            return Err(CoreError::structural(format!("tree node {at} is reachable twice")));
        }
    }
    Ok(nodes)
}

struct Walk<'c> {
    cmp: &'c dyn KeyComparator,
    unique: bool,
    nodes: Vec<PoolOffset>,
    seen: HashSet<PoolOffset>,
    leaf_depth: Option<usize>,
    last: Option<Entry>,
    entries: u64,
}

/// Checks node kinds, fences, global order and balance of a tree.
fn check_tree<R: PoolRead + ?Sized>(
    r: &R,
    cmp: &dyn KeyComparator,
    root: PoolOffset,
    unique: bool,
) -> CoreResult<Checked> {
    let mut walk = Walk {
        cmp,
        unique,
        nodes: Vec::new(),
        seen: HashSet::new(),
        leaf_depth: None,
        last: None,
        entries: 0,
    };
    check_node(r, &mut walk, root, None, None, 0)?;
    Ok(Checked {
        nodes: walk.nodes,
        entries: walk.entries,
    })
}

fn check_node<R: PoolRead + ?Sized>(
    r: &R,
    walk: &mut Walk<'_>,
    at: PoolOffset,
    lower: Option<&Entry>,
    upper: Option<&Entry>,
    depth: usize,
) -> CoreResult<()> {
    if depth >= MAX_DEPTH {
        return Err(CoreError::structural(format!("tree deeper than {MAX_DEPTH} levels at {at}")));
    }
    if !walk.seen.insert(at) {
        return Err(CoreError::structural(format!("tree node {at} is reachable twice")));
    }
    walk.nodes.push(at);

    let within = |e: &Entry| {
        lower.map_or(true, |lo| node::compare(walk.cmp, e, lo) != Ordering::Less)
            && upper.map_or(true, |hi| node::compare(walk.cmp, e, hi) == Ordering::Less)
    };

    match read_node(r, at)? {
        Node::Leaf(entries) => {
            match walk.leaf_depth {
                None => walk.leaf_depth = Some(depth),
                Some(d) if d != depth => {
                    return Err(CoreError::structural(format!(
                        "leaf {at} at depth {depth}, expected {d}"
                    )))
                }
                Some(_) => {}
            }
            for entry in entries {
                if !within(&entry) {
                    return Err(CoreError::structural(format!(
                        "leaf {at} holds an entry outside its separators"
                    )));
                }
                if let Some(last) = &walk.last {
                    if node::compare(walk.cmp, last, &entry) != Ordering::Less {
                        return Err(CoreError::structural(format!("leaf {at} is out of order")));
                    }
                    if walk.unique && walk.cmp.compare(&last.key, &entry.key) == Ordering::Equal {
                        return Err(CoreError::structural(format!(
                            "unique tree holds a duplicate key in leaf {at}"
                        )));
                    }
                }
                walk.last = Some(entry);
                walk.entries += 1;
            }
        }
        Node::Internal { children, seps } => {
            for (i, sep) in seps.iter().enumerate() {
                if !within(sep) || (i > 0 && node::compare(walk.cmp, &seps[i - 1], sep) != Ordering::Less) {
                    return Err(CoreError::structural(format!(
                        "internal node {at} has misordered separators"
                    )));
                }
            }
            for (i, child) in children.iter().enumerate() {
                let lo = if i == 0 { lower } else { Some(&seps[i - 1]) };
                let hi = seps.get(i).or(upper);
                check_node(r, walk, *child, lo, hi, depth + 1)?;
            }
        }
    }
    Ok(())
}

/// Collects every entry of every leaf that can still be read, sorted and
/// deduplicated.
fn salvage<R: PoolRead + ?Sized>(
    r: &R,
    cmp: &dyn KeyComparator,
    root: PoolOffset,
    unique: bool,
) -> Vec<Entry> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![(root, 0usize)];
    while let Some((at, depth)) = stack.pop() {
        if depth >= MAX_DEPTH || !seen.insert(at) {
            continue;
        }
        match read_node(r, at) {
            Ok(Node::Leaf(leaf)) => entries.extend(leaf),
            Ok(Node::Internal { children, .. }) => {
                stack.extend(children.into_iter().map(|c| (c, depth + 1)));
            }
            Err(err) => tracing::warn!(node = %at, error = %err, "skipping unreadable tree node"),
        }
    }

    entries.retain(|e| e.key.len() <= MAX_KEY_LEN);
    entries.sort_by(|a, b| node::compare(cmp, a, b));
    entries.dedup_by(|b, a| node::compare(cmp, a, b) == Ordering::Equal);
    if unique {
        entries.dedup_by(|b, a| cmp.compare(&a.key, &b.key) == Ordering::Equal);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::PersistentMap;
    use crate::pool::MIN_POOL_SIZE;
    use crate::registry::{PoolHandle, COLLECTION_LAYOUT};
    use crate::tree::{BytewiseComparator, PersistentTree};
    use crate::types::{Direction, RecordId};
    use pmse_storage::{InMemoryBackend, StorageBackend};
    use std::ops::Bound;
    use std::sync::Arc;

    fn collection() -> (InMemoryBackend, PoolHandle) {
        let backend = InMemoryBackend::new();
        let handle = PoolHandle::create_in(Box::new(backend.clone()), "coll", MIN_POOL_SIZE, 8).unwrap();
        (backend, handle)
    }

    fn reopen(backend: &InMemoryBackend) -> Pool {
        Pool::open_in(Box::new(backend.clone()), COLLECTION_LAYOUT).unwrap()
    }

    #[test]
    fn clean_pool_needs_nothing() {
        let (_, handle) = collection();
        handle.map().insert(RecordId(1), b"a").unwrap();
        handle.map().store_counters().unwrap();

        let report = repair_pool(handle.pool(), &Config::default()).unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.maps, 1);
        assert_eq!(report.entries, 1);
    }

    #[test]
    fn rebuilds_unstored_counters() {
        let (backend, handle) = collection();
        for i in 1..=5u64 {
            handle.map().insert(RecordId(i * 10), b"payload").unwrap();
        }
        handle.map().remove(RecordId(10)).unwrap();
        handle.pool().close().unwrap();

        let pool = reopen(&backend);
        let report = repair_pool(&pool, &Config::default()).unwrap();
        assert!(report.findings.is_empty());
        assert_eq!(report.entries, 4);

        let map = PersistentMap::attach(Arc::new(pool), handle.map().header_offset()).unwrap();
        assert_eq!(map.len(), 4);
        assert_eq!(map.data_size(), 4 * 7);
        assert_eq!(map.next_id(), RecordId(51));
    }

    #[test]
    fn reclaims_leaked_blocks_once() {
        let (_, handle) = collection();
        handle
            .pool()
            .transaction(|tx| tx.alloc(BlockKind::MapEntry, &[0u8; 64]).map(|_| ()))
            .unwrap();

        let first = repair_pool(handle.pool(), &Config::default()).unwrap();
        assert_eq!(first.reclaimed_blocks, 1);
        let second = repair_pool(handle.pool(), &Config::default()).unwrap();
        assert_eq!(second.reclaimed_blocks, 0);
        assert!(second.is_clean());
        assert_eq!(first.entries, second.entries);
    }

    #[test]
    fn cuts_dangling_chain_links() {
        let (backend, handle) = collection();
        let map = handle.map();
        for i in 1..=40u64 {
            map.insert(RecordId(i), format!("record-{i}").as_bytes()).unwrap();
        }
        let header = map.header();
        // Point the bucket of record 1 at a place that is not a map entry.
        let bucket = layout::bucket_of(RecordId(1), header.bucket_count);
        let mut raw = backend.clone();
        raw.write_at(header.buckets.as_u64() + u64::from(bucket) * 8, &0x10u64.to_le_bytes())
            .unwrap();
        handle.pool().close().unwrap();

        let pool = reopen(&backend);
        let report = repair_pool(&pool, &Config::default()).unwrap();
        assert!(!report.findings.is_empty());
        assert!(report.entries < 40);
        assert!(report.reclaimed_blocks > 0);

        let again = repair_pool(&pool, &Config::default()).unwrap();
        assert!(again.is_clean(), "{again:?}");
        assert_eq!(again.entries, report.entries);

        let map = PersistentMap::attach(Arc::new(pool), header_offset(&handle)).unwrap();
        let mut seen = 0;
        for item in map.iter() {
            let (id, payload) = item.unwrap();
            assert_eq!(payload, format!("record-{}", id.as_u64()).into_bytes());
            seen += 1;
        }
        assert_eq!(seen, report.entries);
    }

    fn header_offset(handle: &PoolHandle) -> PoolOffset {
        handle.map().header_offset()
    }

    #[test]
    fn corrects_tree_count() {
        let (_, handle) = collection();
        let tree = handle.create_tree("idx", false, Arc::new(BytewiseComparator)).unwrap();
        tree.insert(b"a", RecordId(1)).unwrap();
        tree.insert(b"b", RecordId(2)).unwrap();
        handle
            .pool()
            .transaction(|tx| tree::write_count(tx, tree.header_offset(), 99))
            .unwrap();

        let report = repair_pool(handle.pool(), &Config::default()).unwrap();
        assert_eq!(report.findings.len(), 1);
        assert_eq!(tree.len().unwrap(), 2);
        assert!(repair_pool(handle.pool(), &Config::default()).unwrap().is_clean());
    }

    #[test]
    fn rebuilds_misordered_tree() {
        let (_, handle) = collection();
        let tree = handle.create_tree("idx", true, Arc::new(BytewiseComparator)).unwrap();
        for i in 0..2000u64 {
            tree.insert(format!("key-{i:05}").as_bytes(), RecordId(i)).unwrap();
        }
        let root = handle
            .pool()
            .read(|snap| Ok(TreeHeader::read(snap, tree.header_offset())?.root))
            .unwrap();
        // Swap two children of the root so separators no longer bound them.
        handle
            .pool()
            .transaction(|tx| match read_node(tx, root)? {
                Node::Internal { mut children, seps } => {
                    children.swap(0, 1);
                    node::write_node(tx, root, &Node::Internal { children, seps })
                }
                Node::Leaf(_) => panic!("expected an internal root"),
            })
            .unwrap();

        let report = repair_pool(handle.pool(), &Config::default()).unwrap();
        assert_eq!(report.trees, 1);
        assert_eq!(report.index_entries, 2000);
        assert!(report.findings.iter().any(|f| f.contains("rebuilt")));
        assert!(report.reclaimed_blocks > 0);

        let keys: Vec<_> = tree
            .scan(Bound::Unbounded, Bound::Unbounded, Direction::Forward)
            .map(|item| item.unwrap().1)
            .collect();
        assert_eq!(keys, (0..2000).map(RecordId).collect::<Vec<_>>());
        assert_eq!(tree.find(b"key-01234").unwrap(), vec![RecordId(1234)]);
        tree.insert(b"key-99999", RecordId(5000)).unwrap();

        let again = repair_pool(handle.pool(), &Config::default()).unwrap();
        assert!(again.is_clean(), "{again:?}");
        assert_eq!(again.index_entries, 2001);
    }

    #[test]
    fn drops_unreadable_tree() {
        let (_, handle) = collection();
        let tree = handle.create_tree("idx", false, Arc::new(BytewiseComparator)).unwrap();
        let header_at = tree.header_offset();
        drop(tree);
        // Turn the tree header into a block of another kind.
        handle
            .pool()
            .transaction(|tx| {
                let header = tx.object_header(header_at, BlockKind::TreeHeader)?;
                tx.free_block(header_at, header);
                Ok(())
            })
            .unwrap();

        let report = repair_pool(handle.pool(), &Config::default()).unwrap();
        assert!(report.findings.iter().any(|f| f.contains("idx dropped")));
        assert_eq!(report.trees, 0);
        assert!(handle.index_names().unwrap().is_empty());
        assert!(repair_pool(handle.pool(), &Config::default()).unwrap().is_clean());
    }

    #[test]
    fn unknown_comparator_is_reported_not_rebuilt() {
        struct Custom;
        impl KeyComparator for Custom {
            fn name(&self) -> &str {
                "test.custom"
            }
            fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
                b.cmp(a)
            }
        }

        let (_, handle) = collection();
        let tree = handle.create_tree("idx", false, Arc::new(Custom)).unwrap();
        tree.insert(b"k", RecordId(1)).unwrap();

        let report = repair_pool(handle.pool(), &Config::default()).unwrap();
        assert_eq!(report.reclaimed_blocks, 0);
        assert!(report.findings[0].contains("not registered"));

        let config = Config::default().comparator(Arc::new(Custom));
        assert!(repair_pool(handle.pool(), &config).unwrap().is_clean());
    }

    #[test]
    fn bulk_load_builds_valid_levels() {
        let backend = InMemoryBackend::new();
        let pool = Pool::create_in(Box::new(backend), COLLECTION_LAYOUT, MIN_POOL_SIZE, |tx| {
            CollectionRoot::create_in(tx, 4).map(|_| ())
        })
        .unwrap();
        let cmp = BytewiseComparator;
        let entries: Vec<Entry> = (0..5000u64)
            .map(|i| Entry::new(format!("{i:08}").as_bytes(), RecordId(i)))
            .collect();

        let (root, checked) = pool
            .transaction(|tx| {
                let config = Config::default();
                let mut pass = Pass::new(tx, &config);
                let root = pass.build(entries)?;
                let checked = check_tree(&*pass.tx, &cmp, root, true)?;
                Ok((root, checked.entries))
            })
            .unwrap();
        assert_eq!(checked, 5000);
        assert!(!root.is_null());
    }

    #[test]
    fn repaired_tree_attaches() {
        let (_, handle) = collection();
        let tree = handle.create_tree("idx", false, Arc::new(BytewiseComparator)).unwrap();
        tree.insert(b"x", RecordId(3)).unwrap();
        repair_pool(handle.pool(), &Config::default()).unwrap();
        let again =
            PersistentTree::attach(Arc::clone(handle.pool()), tree.header_offset(), Arc::new(BytewiseComparator))
                .unwrap();
        assert_eq!(again.find(b"x").unwrap(), vec![RecordId(3)]);
    }

    #[test]
    fn identlist_repair_sweeps_leaks() {
        let list = IdentList::create_in(Box::new(InMemoryBackend::new()), MIN_POOL_SIZE).unwrap();
        list.insert("a", "db.a").unwrap();
        list.pool()
            .transaction(|tx| tx.alloc(BlockKind::ListEntry, &[1u8; 32]).map(|_| ()))
            .unwrap();

        let (entries, report) = repair_identlist(&list).unwrap();
        assert_eq!(entries, vec![("a".to_string(), "db.a".to_string())]);
        assert_eq!(report.reclaimed_blocks, 1);
        assert!(repair_identlist(&list).unwrap().1.is_clean());
    }

    #[test]
    fn pack_never_leaves_a_single_item_run() {
        let runs = pack((0..7).collect::<Vec<usize>>(), |_| FILL_TARGET / 3);
        assert!(runs.iter().all(|r| r.len() >= 2));
        assert_eq!(runs.iter().map(Vec::len).sum::<usize>(), 7);
        assert_eq!(pack(vec![1usize], |_| 10), vec![vec![1]]);
        assert!(pack(Vec::<usize>::new(), |_| 10).is_empty());
    }

    #[test]
    fn report_merge_adds_counts() {
        let mut a = RepairReport {
            pools: 1,
            entries: 3,
            ..RepairReport::default()
        };
        let mut b = RepairReport {
            pools: 1,
            reclaimed_blocks: 2,
            ..RepairReport::default()
        };
        b.finding("something");
        a.merge(b);
        assert_eq!(a.pools, 2);
        assert_eq!(a.entries, 3);
        assert_eq!(a.reclaimed_blocks, 2);
        assert_eq!(a.findings.len(), 1);
        assert!(!a.is_clean());
    }
}
