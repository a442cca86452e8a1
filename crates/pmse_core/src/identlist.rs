//! Persistent metadata list.
//!
//! Maps every identifier (collection or index) to its namespace and carries
//! the clean-shutdown flag of the whole engine. Entries form a singly linked
//! list headed by the list root; new entries are pushed at the head.

use crate::codec::{put_string, Decoder};
use crate::error::{CoreError, CoreResult};
use crate::pool::{BlockKind, Pool, PoolRead, Transaction, BLOCK_HEADER_SIZE};
use crate::types::PoolOffset;
use bytes::BufMut;
use pmse_storage::StorageBackend;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Layout tag of the metadata pool.
pub const IDENTLIST_LAYOUT: &str = "pmse_identlist";

/// File name of the metadata pool inside the data directory.
pub const IDENTLIST_FILE: &str = "pmse_identlist.pool";

const LIST_MAGIC: [u8; 4] = *b"PLST";
const CLEAN_AT: u64 = 4;
const HEAD_AT: u64 = 8;
const COUNT_AT: u64 = 16;

#[derive(Debug, Clone, Copy)]
struct ListRoot {
    clean: bool,
    head: PoolOffset,
    count: u64,
}

impl ListRoot {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.put_slice(&LIST_MAGIC);
        buf.put_u8(u8::from(self.clean));
        buf.put_slice(&[0u8; 3]);
        buf.put_u64_le(self.head.as_u64());
        buf.put_u64_le(self.count);
        buf
    }

    fn read<R: PoolRead + ?Sized>(r: &R) -> CoreResult<Self> {
        let raw = r.object(r.root(), BlockKind::ListRoot)?;
        let mut dec = Decoder::new(&raw, "ident list root");
        dec.magic(&LIST_MAGIC)?;
        let clean = dec.u8()? != 0;
        let _reserved = dec.bytes(3)?;
        Ok(Self {
            clean,
            head: dec.offset()?,
            count: dec.u64()?,
        })
    }
}

#[derive(Debug, Clone)]
struct ListEntry {
    at: PoolOffset,
    next: PoolOffset,
    ident: String,
    ns: String,
}

fn encode_entry(next: PoolOffset, ident: &str, ns: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + ident.len() + ns.len());
    buf.put_u64_le(next.as_u64());
    put_string(&mut buf, ident);
    put_string(&mut buf, ns);
    buf
}

fn read_entry<R: PoolRead + ?Sized>(r: &R, at: PoolOffset) -> CoreResult<ListEntry> {
    let raw = r.object(at, BlockKind::ListEntry)?;
    let mut dec = Decoder::new(&raw, "ident list entry");
    Ok(ListEntry {
        at,
        next: dec.offset()?,
        ident: dec.string()?,
        ns: dec.string()?,
    })
}

/// Walks the list, stopping early when `visit` returns true.
fn walk<R, F>(r: &R, mut visit: F) -> CoreResult<Option<(PoolOffset, ListEntry)>>
where
    R: PoolRead + ?Sized,
    F: FnMut(&ListEntry) -> bool,
{
    let root_at = r.root();
    let root = ListRoot::read(r)?;
    let limit = r.heap_end().saturating_sub(r.geometry().first_block()) / (BLOCK_HEADER_SIZE + 16) + 1;

    let mut link = root_at;
    let mut at = root.head;
    let mut steps = 0;
    while !at.is_null() {
        steps += 1;
        if steps > limit {
            return Err(CoreError::structural("ident list does not terminate"));
        }
        let entry = read_entry(r, at)?;
        if visit(&entry) {
            return Ok(Some((link, entry)));
        }
        link = at;
        at = entry.next;
    }
    Ok(None)
}

/// Points the link at `link` (the root or a previous entry) to `target`.
fn relink(tx: &mut Transaction<'_>, link: PoolOffset, target: PoolOffset) -> CoreResult<()> {
    let bytes = target.as_u64().to_le_bytes();
    if link == tx.root() {
        tx.write(link, BlockKind::ListRoot, HEAD_AT, &bytes)
    } else {
        tx.write(link, BlockKind::ListEntry, 0, &bytes)
    }
}

/// The persistent identifier list of an engine.
#[derive(Debug)]
pub struct IdentList {
    pool: Arc<Pool>,
}

impl IdentList {
    /// Creates a new metadata pool at `path`.
    ///
    /// # Errors
    ///
    /// Returns `PoolExists` if `path` exists, or `AllocationError` if
    /// `capacity` is too small.
    pub fn create(path: &Path, capacity: u64, mode: u32) -> CoreResult<Self> {
        let pool = Pool::create(path, IDENTLIST_LAYOUT, capacity, mode, Self::init)?;
        Ok(Self::from_pool(pool))
    }

    /// Opens an existing metadata pool.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `CorruptPool` as [`Pool::open`] does.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let pool = Pool::open(path, IDENTLIST_LAYOUT)?;
        Self::from_checked(pool)
    }

    /// Creates a metadata list on an empty backend.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    pub fn create_in(backend: Box<dyn StorageBackend>, capacity: u64) -> CoreResult<Self> {
        let pool = Pool::create_in(backend, IDENTLIST_LAYOUT, capacity, Self::init)?;
        Ok(Self::from_pool(pool))
    }

    /// Opens a metadata list stored in `backend`.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_in(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let pool = Pool::open_in(backend, IDENTLIST_LAYOUT)?;
        Self::from_checked(pool)
    }

    fn init(tx: &mut Transaction<'_>) -> CoreResult<()> {
        let root = ListRoot {
            clean: true,
            head: PoolOffset::NULL,
            count: 0,
        };
        let at = tx.alloc(BlockKind::ListRoot, &root.encode())?;
        tx.set_root(at);
        Ok(())
    }

    fn from_pool(pool: Pool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn from_checked(pool: Pool) -> CoreResult<Self> {
        pool.read(|snap| ListRoot::read(snap).map(|_| ()))?;
        Ok(Self::from_pool(pool))
    }

    /// Adds a new identifier.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if `ident` is already listed.
    pub fn insert(&self, ident: &str, ns: &str) -> CoreResult<()> {
        self.pool.transaction(|tx| {
            if walk(tx, |e| e.ident == ident)?.is_some() {
                return Err(CoreError::duplicate_key(format!("ident {ident}")));
            }
            push_front(tx, ident, ns)
        })?;
        tracing::debug!(ident, ns, "ident listed");
        Ok(())
    }

    /// Sets the namespace of `ident`, adding the identifier if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn update(&self, ident: &str, ns: &str) -> CoreResult<()> {
        self.pool.transaction(|tx| match walk(tx, |e| e.ident == ident)? {
            Some((_, entry)) if entry.ns == ns => Ok(()),
            Some((link, entry)) => {
                let replacement = tx.alloc(BlockKind::ListEntry, &encode_entry(entry.next, ident, ns))?;
                relink(tx, link, replacement)?;
                tx.free(entry.at, BlockKind::ListEntry)
            }
            None => push_front(tx, ident, ns),
        })
    }

    /// Removes `ident`. Removing an unknown identifier is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn delete(&self, ident: &str) -> CoreResult<()> {
        let removed = self.pool.transaction(|tx| {
            let Some((link, entry)) = walk(tx, |e| e.ident == ident)? else {
                return Ok(false);
            };
            relink(tx, link, entry.next)?;
            tx.free(entry.at, BlockKind::ListEntry)?;
            let root = ListRoot::read(tx)?;
            let root_at = tx.root();
            tx.write(
                root_at,
                BlockKind::ListRoot,
                COUNT_AT,
                &root.count.saturating_sub(1).to_le_bytes(),
            )?;
            Ok(true)
        })?;
        if removed {
            tracing::debug!(ident, "ident unlisted");
        }
        Ok(())
    }

    /// Returns the first identifier (from the head) whose namespace is `ns`.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the list is damaged.
    pub fn find_first_value(&self, ns: &str) -> CoreResult<Option<String>> {
        self.pool
            .read(|snap| Ok(walk(snap, |e| e.ns == ns)?.map(|(_, e)| e.ident)))
    }

    /// Returns the namespace of `ident`, if listed.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the list is damaged.
    pub fn get(&self, ident: &str) -> CoreResult<Option<String>> {
        self.pool
            .read(|snap| Ok(walk(snap, |e| e.ident == ident)?.map(|(_, e)| e.ns)))
    }

    /// Returns every `(ident, namespace)` pair, head first.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the list is damaged.
    pub fn entries(&self) -> CoreResult<Vec<(String, String)>> {
        self.pool.read(|snap| {
            let mut out = Vec::new();
            walk(snap, |e| {
                out.push((e.ident.clone(), e.ns.clone()));
                false
            })?;
            Ok(out)
        })
    }

    /// Number of listed identifiers.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the list was closed.
    pub fn len(&self) -> CoreResult<u64> {
        self.pool.read(|snap| Ok(ListRoot::read(snap)?.count))
    }

    /// Returns true if no identifiers are listed.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the list was closed.
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns true if the previous session ended with
    /// [`mark_safe_shutdown`](Self::mark_safe_shutdown).
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the list was closed.
    pub fn is_after_safe_shutdown(&self) -> CoreResult<bool> {
        self.pool.read(|snap| Ok(ListRoot::read(snap)?.clean))
    }

    /// Marks the current session as running (not cleanly shut down).
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn reset_state(&self) -> CoreResult<()> {
        self.set_clean(false)
    }

    /// Records a clean shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn mark_safe_shutdown(&self) -> CoreResult<()> {
        self.set_clean(true)
    }

    fn set_clean(&self, clean: bool) -> CoreResult<()> {
        self.pool.transaction(|tx| {
            let root_at = tx.root();
            tx.write(root_at, BlockKind::ListRoot, CLEAN_AT, &[u8::from(clean)])
        })
    }

    /// Closes the underlying pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(&self) -> CoreResult<()> {
        self.pool.close()
    }

    /// The pool holding the list.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }
}

fn push_front(tx: &mut Transaction<'_>, ident: &str, ns: &str) -> CoreResult<()> {
    let root_at = tx.root();
    let root = ListRoot::read(tx)?;
    let entry = tx.alloc(BlockKind::ListEntry, &encode_entry(root.head, ident, ns))?;
    tx.write(root_at, BlockKind::ListRoot, HEAD_AT, &entry.as_u64().to_le_bytes())?;
    tx.write(root_at, BlockKind::ListRoot, COUNT_AT, &(root.count + 1).to_le_bytes())
}

/// Result of checking the list inside a repair transaction.
#[derive(Debug, Default)]
pub(crate) struct ListRepair {
    /// Surviving `(ident, namespace)` pairs, head first.
    pub(crate) entries: Vec<(String, String)>,
    /// Root and entry blocks still linked.
    pub(crate) reachable: Vec<PoolOffset>,
    /// Links cut because they dangled, looped or duplicated an ident.
    pub(crate) cut: u64,
}

/// Cuts unreadable links and duplicate idents and rebuilds the entry count.
pub(crate) fn repair_in(tx: &mut Transaction<'_>) -> CoreResult<ListRepair> {
    let root_at = tx.root();
    let root = ListRoot::read(tx)?;

    let mut out = ListRepair {
        reachable: vec![root_at],
        ..ListRepair::default()
    };
    let mut seen = HashSet::new();
    let mut idents = HashSet::new();
    let mut link = root_at;
    let mut at = root.head;

    while !at.is_null() {
        let entry = if seen.insert(at) {
            read_entry(tx, at).ok()
        } else {
            None
        };
        let Some(entry) = entry else {
            tracing::warn!(link = %link, target = %at, "cutting dangling ident list link");
            relink(tx, link, PoolOffset::NULL)?;
            out.cut += 1;
            break;
        };
        if !idents.insert(entry.ident.clone()) {
            tracing::warn!(ident = %entry.ident, "dropping duplicate ident list entry");
            relink(tx, link, entry.next)?;
            out.cut += 1;
            at = entry.next;
            continue;
        }
        out.reachable.push(at);
        out.entries.push((entry.ident, entry.ns));
        link = at;
        at = entry.next;
    }

    let count = out.entries.len() as u64;
    if root.count != count {
        tx.write(root_at, BlockKind::ListRoot, COUNT_AT, &count.to_le_bytes())?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MIN_POOL_SIZE;
    use pmse_storage::InMemoryBackend;

    fn new_list() -> (InMemoryBackend, IdentList) {
        let backend = InMemoryBackend::new();
        let list = IdentList::create_in(Box::new(backend.clone()), MIN_POOL_SIZE).unwrap();
        (backend, list)
    }

    #[test]
    fn insert_update_delete() {
        let (_, list) = new_list();
        list.insert("coll-1", "db.users").unwrap();
        list.insert("idx-1", "").unwrap();
        assert!(matches!(
            list.insert("coll-1", "db.other"),
            Err(CoreError::DuplicateKey { .. })
        ));

        assert_eq!(list.get("coll-1").unwrap().as_deref(), Some("db.users"));
        list.update("coll-1", "db.renamed").unwrap();
        assert_eq!(list.get("coll-1").unwrap().as_deref(), Some("db.renamed"));
        list.update("coll-2", "db.fresh").unwrap();
        assert_eq!(list.len().unwrap(), 3);

        list.delete("idx-1").unwrap();
        assert_eq!(list.get("idx-1").unwrap(), None);
        assert_eq!(list.len().unwrap(), 2);
    }

    #[test]
    fn delete_missing_is_noop() {
        let (_, list) = new_list();
        list.insert("a", "db.a").unwrap();
        let before = list.entries().unwrap();
        list.delete("nope").unwrap();
        list.delete("nope").unwrap();
        assert_eq!(list.entries().unwrap(), before);
        assert_eq!(list.len().unwrap(), 1);
    }

    #[test]
    fn find_first_value_is_deterministic() {
        let (_, list) = new_list();
        list.insert("first", "db.shared").unwrap();
        list.insert("second", "db.shared").unwrap();

        let found = list.find_first_value("db.shared").unwrap().unwrap();
        for _ in 0..5 {
            assert_eq!(list.find_first_value("db.shared").unwrap().unwrap(), found);
        }
        assert!(found == "first" || found == "second");
        assert_eq!(list.find_first_value("db.none").unwrap(), None);
    }

    #[test]
    fn shutdown_flag_lifecycle() {
        let (backend, list) = new_list();
        assert!(list.is_after_safe_shutdown().unwrap());
        list.reset_state().unwrap();
        assert!(!list.is_after_safe_shutdown().unwrap());
        list.insert("a", "db.a").unwrap();
        list.close().unwrap();

        // Closed without marking a safe shutdown.
        let list = IdentList::open_in(Box::new(backend.clone())).unwrap();
        assert!(!list.is_after_safe_shutdown().unwrap());
        list.mark_safe_shutdown().unwrap();
        list.close().unwrap();

        let list = IdentList::open_in(Box::new(backend)).unwrap();
        assert!(list.is_after_safe_shutdown().unwrap());
        assert_eq!(list.entries().unwrap(), vec![("a".to_string(), "db.a".to_string())]);
    }

    #[test]
    fn wrong_layout_is_rejected() {
        let backend = InMemoryBackend::new();
        Pool::create_in(Box::new(backend.clone()), "pmse_mapper", MIN_POOL_SIZE, |tx| {
            let at = tx.alloc(BlockKind::Raw, &[0u8; 16])?;
            tx.set_root(at);
            Ok(())
        })
        .unwrap();
        let err = IdentList::open_in(Box::new(backend)).unwrap_err();
        assert!(matches!(err, CoreError::CorruptPool { .. }));
    }
}
