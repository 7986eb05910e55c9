//! The in-memory delta buffer of one DiskRowSet.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::clock::Timestamp;
use crate::mutation::{Mutation, RowChange};

/// Sort key of a delta entry: `(row_id, timestamp)`, big-endian so byte
/// order matches logical order.
fn delta_key(row_id: u32, ts: Timestamp) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&row_id.to_be_bytes());
    key[4..].copy_from_slice(&ts.as_raw().to_be_bytes());
    key
}

fn decode_delta_key(key: &[u8; 12]) -> (u32, Timestamp) {
    let row_id = u32::from_be_bytes(key[..4].try_into().unwrap());
    let ts = Timestamp::from_raw(u64::from_be_bytes(key[4..].try_into().unwrap()));
    (row_id, ts)
}

/// Concurrent buffer of `(row_id, ts) -> change`, ordered for flushing.
///
/// Inserting the same `(row_id, ts)` twice replaces the entry with an
/// identical change; the swap catch-up path relies on this idempotence.
pub struct DeltaMemStore {
    id: u64,
    map: SkipMap<[u8; 12], RowChange>,
    size: AtomicUsize,
}

impl DeltaMemStore {
    pub fn new(id: u64) -> DeltaMemStore {
        DeltaMemStore {
            id,
            map: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn update(&self, row_id: u32, ts: Timestamp, change: RowChange) {
        let key = delta_key(row_id, ts);
        // The swap mirror and catch-up paths replay the same (row_id, ts)
        // entry; an overwrite must not inflate the size accounting that
        // drives DMS flush decisions.
        if self.map.get(&key).is_none() {
            self.size
                .fetch_add(change.mem_size() + key.len(), Ordering::Relaxed);
        }
        self.map.insert(key, change);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn mem_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// All mutations for one row, ascending by timestamp.
    pub fn mutations_for_row(&self, row_id: u32) -> Vec<Mutation> {
        let lower = delta_key(row_id, Timestamp::MIN);
        let upper = delta_key(row_id, Timestamp::MAX);
        self.map
            .range(lower..=upper)
            .map(|entry| {
                let (_, ts) = decode_delta_key(entry.key());
                Mutation {
                    ts,
                    change: entry.value().clone(),
                }
            })
            .collect()
    }

    /// Every entry, ascending by `(row_id, ts)`.
    pub fn entries(&self) -> Vec<(u32, Timestamp, RowChange)> {
        self.map
            .iter()
            .map(|entry| {
                let (row_id, ts) = decode_delta_key(entry.key());
                (row_id, ts, entry.value().clone())
            })
            .collect()
    }
}
