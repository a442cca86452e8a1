//! Root object of a collection pool.
//!
//! The root owns the record map and an index table naming every tree that
//! lives in the same pool. The table is replaced as a whole (copy-on-write)
//! whenever an index is added or dropped.

use crate::codec::{put_string, Decoder};
use crate::error::{CoreError, CoreResult};
use crate::map::PersistentMap;
use crate::pool::{BlockKind, PoolRead, Transaction};
use crate::types::PoolOffset;
use bytes::BufMut;
use std::collections::BTreeMap;

const ROOT_MAGIC: [u8; 4] = *b"PROT";
const TABLE_MAGIC: [u8; 4] = *b"PIDX";
const TABLE_AT: u64 = 16;

/// Index identifier to tree header offset.
pub(crate) type IndexTable = BTreeMap<String, PoolOffset>;

/// Decoded collection root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CollectionRoot {
    pub(crate) map: PoolOffset,
    pub(crate) index_table: PoolOffset,
}

impl CollectionRoot {
    /// Builds a root with an empty map and installs it as the pool root.
    pub(crate) fn create_in(tx: &mut Transaction<'_>, buckets: u32) -> CoreResult<PoolOffset> {
        let map = PersistentMap::create_in(tx, buckets)?;
        let root = Self {
            map,
            index_table: PoolOffset::NULL,
        };
        let at = tx.alloc(BlockKind::CollectionRoot, &root.encode())?;
        tx.set_root(at);
        Ok(at)
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.put_slice(&ROOT_MAGIC);
        buf.put_u32_le(0);
        buf.put_u64_le(self.map.as_u64());
        buf.put_u64_le(self.index_table.as_u64());
        buf
    }

    pub(crate) fn read<R: PoolRead + ?Sized>(r: &R, at: PoolOffset) -> CoreResult<Self> {
        let raw = r.object(at, BlockKind::CollectionRoot)?;
        let mut dec = Decoder::new(&raw, "collection root");
        dec.magic(&ROOT_MAGIC)?;
        let _reserved = dec.u32()?;
        Ok(Self {
            map: dec.offset()?,
            index_table: dec.offset()?,
        })
    }

    /// Reads the index table; a root without one has no indexes.
    pub(crate) fn indexes<R: PoolRead + ?Sized>(&self, r: &R) -> CoreResult<IndexTable> {
        if self.index_table.is_null() {
            return Ok(IndexTable::new());
        }
        let raw = r.object(self.index_table, BlockKind::IndexTable)?;
        let mut dec = Decoder::new(&raw, "index table");
        dec.magic(&TABLE_MAGIC)?;
        let count = dec.u32()?;

        let mut table = IndexTable::new();
        for _ in 0..count {
            let name = dec.string()?;
            let tree = dec.offset()?;
            if table.insert(name.clone(), tree).is_some() {
                return Err(CoreError::structural(format!(
                    "index {name:?} appears twice in table at {}",
                    self.index_table
                )));
            }
        }
        Ok(table)
    }

    /// Replaces the index table of the root at `at` with `table`.
    pub(crate) fn store_indexes(
        &mut self,
        tx: &mut Transaction<'_>,
        at: PoolOffset,
        table: &IndexTable,
    ) -> CoreResult<()> {
        let old = self.index_table;
        self.index_table = if table.is_empty() {
            PoolOffset::NULL
        } else {
            tx.alloc(BlockKind::IndexTable, &encode_table(table)?)?
        };
        tx.write(
            at,
            BlockKind::CollectionRoot,
            TABLE_AT,
            &self.index_table.as_u64().to_le_bytes(),
        )?;
        if !old.is_null() {
            tx.free(old, BlockKind::IndexTable)?;
        }
        Ok(())
    }

    /// Forgets an unreadable index table without freeing it.
    pub(crate) fn detach_indexes(&mut self, tx: &mut Transaction<'_>, at: PoolOffset) -> CoreResult<()> {
        self.index_table = PoolOffset::NULL;
        tx.write(at, BlockKind::CollectionRoot, TABLE_AT, &0u64.to_le_bytes())
    }
}

fn encode_table(table: &IndexTable) -> CoreResult<Vec<u8>> {
    let count = u32::try_from(table.len())
        .map_err(|_| CoreError::invalid_operation("too many indexes in one collection"))?;
    let mut buf = Vec::new();
    buf.put_slice(&TABLE_MAGIC);
    buf.put_u32_le(count);
    for (name, tree) in table {
        put_string(&mut buf, name);
        buf.put_u64_le(tree.as_u64());
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Pool, MIN_POOL_SIZE};
    use pmse_storage::InMemoryBackend;

    #[test]
    fn index_table_is_replaced_as_a_whole() {
        let pool = Pool::create_in(
            Box::new(InMemoryBackend::new()),
            "pmse_mapper",
            MIN_POOL_SIZE,
            |tx| CollectionRoot::create_in(tx, 8).map(|_| ()),
        )
        .unwrap();
        let at = pool.root().unwrap();

        let empty = pool
            .read(|snap| CollectionRoot::read(snap, at)?.indexes(snap))
            .unwrap();
        assert!(empty.is_empty());

        pool.transaction(|tx| {
            let mut root = CollectionRoot::read(tx, at)?;
            let mut table = root.indexes(tx)?;
            table.insert("idx_a".to_string(), PoolOffset::new(0x1000));
            table.insert("idx_b".to_string(), PoolOffset::new(0x2000));
            root.store_indexes(tx, at, &table)
        })
        .unwrap();

        let first = pool.read(|snap| CollectionRoot::read(snap, at)).unwrap();
        let table = pool.read(|snap| first.indexes(snap)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table["idx_b"], PoolOffset::new(0x2000));

        pool.transaction(|tx| {
            let mut root = CollectionRoot::read(tx, at)?;
            root.store_indexes(tx, at, &IndexTable::new())
        })
        .unwrap();
        let root = pool.read(|snap| CollectionRoot::read(snap, at)).unwrap();
        assert!(root.index_table.is_null());
        assert_eq!(pool.stats().unwrap().free_blocks, 1);
    }
}
