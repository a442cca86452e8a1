//! Lazy iteration over a persistent map.

use super::layout;
use super::PersistentMap;
use crate::error::{CoreError, CoreResult};
use crate::types::RecordId;
use std::collections::VecDeque;

/// Iterator over the records of a [`PersistentMap`].
///
/// Reads one bucket at a time, each under its own read lock, so writers are
/// never blocked for a whole pass. A record moved or removed between two
/// buckets may be skipped; records untouched during the pass are yielded
/// exactly once.
pub struct MapIter<'a> {
    map: &'a PersistentMap,
    bucket: u32,
    pending: VecDeque<(RecordId, Vec<u8>)>,
    failed: bool,
}

impl<'a> MapIter<'a> {
    pub(super) fn new(map: &'a PersistentMap) -> Self {
        Self {
            map,
            bucket: 0,
            pending: VecDeque::new(),
            failed: false,
        }
    }

    fn load_bucket(&mut self, bucket: u32) -> CoreResult<()> {
        let header = *self.map.header();
        let records = self.map.pool().read(|snap| {
            let limit = layout::chain_limit(snap);
            let mut records = Vec::new();
            let mut at = layout::read_bucket(snap, &header, bucket)?;
            while !at.is_null() {
                if records.len() as u64 >= limit {
                    return Err(CoreError::structural(format!(
                        "map bucket {bucket} chain does not terminate"
                    )));
                }
                let head = layout::read_entry_head(snap, at)?;
                records.push((head.id, layout::read_payload(snap, at, &head)?));
                at = head.next;
            }
            Ok(records)
        })?;
        self.pending.extend(records);
        Ok(())
    }
}

impl Iterator for MapIter<'_> {
    type Item = CoreResult<(RecordId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(Ok(record));
            }
            if self.bucket >= self.map.bucket_count() {
                return None;
            }
            let bucket = self.bucket;
            self.bucket += 1;
            if let Err(err) = self.load_bucket(bucket) {
                self.failed = true;
                return Some(Err(err));
            }
        }
    }
}
