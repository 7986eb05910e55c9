//! The in-memory mutable rowset.
//!
//! A MemRowSet is a concurrent skip list keyed by encoded primary key. Each
//! entry holds the key's full mutation chain, starting with its insert;
//! chains are appended under the tablet's per-row locks, so timestamps
//! within a chain strictly increase.
//!
//! The skip list owns all entry memory: dropping the last reference frees
//! the whole rowset at once, which is the arena lifecycle the engine relies
//! on. Entries are never freed individually.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;

use crate::clock::Timestamp;
use crate::error::{TabletResult, TracedTabletError};
use crate::iterator::{RowVersionIterator, ScanRange, VersionedRow};
use crate::mutation::{materialize, Mutation, RowChange};
use crate::mvcc::MvccSnapshot;
use crate::rowset::{KeyPresence, RowSet, SnapshotRow};
use crate::schema::{row_mem_size, Projection, Row, Schema};

struct MemRowEntry {
    /// Full mutation chain, ascending by timestamp; the first entry is the
    /// insert that created the key.
    chain: Mutex<Vec<Mutation>>,
}

pub struct MemRowSet {
    id: u64,
    schema: Arc<Schema>,
    map: SkipMap<Vec<u8>, MemRowEntry>,
    size: AtomicUsize,
    frozen: AtomicBool,
    claimed: AtomicBool,
}

impl MemRowSet {
    pub fn new(id: u64, schema: Arc<Schema>) -> Arc<MemRowSet> {
        Arc::new(MemRowSet {
            id,
            schema,
            map: SkipMap::new(),
            size: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.map.len()
    }

    /// Approximate bytes held by entries. A fresh MemRowSet reports zero.
    pub fn mem_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Mark the rowset as flushed. A frozen MemRowSet must never be mutated
    /// again; mutating it is a programming error.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    fn chain_state(chain: &[Mutation], schema: &Schema) -> bool {
        // Live iff the latest mutation sequence leaves the key live.
        materialize(schema, None, chain, None).live
    }

    /// Insert a new row. The caller holds the row lock and has verified no
    /// other rowset owns a live version of the key.
    pub fn insert(&self, key: &[u8], row: Row, ts: Timestamp) -> TabletResult<()> {
        assert!(!self.is_frozen(), "insert into frozen MemRowSet {}", self.id);
        if let Some(entry) = self.map.get(key) {
            let mut chain = entry.value().chain.lock();
            if Self::chain_state(&chain, &self.schema) {
                return Err(TracedTabletError::already_present(format!(
                    "key {:?}",
                    key
                )));
            }
            debug_assert!(chain.last().map_or(true, |m| m.ts < ts));
            self.size
                .fetch_add(row_mem_size(&row), Ordering::Relaxed);
            chain.push(Mutation {
                ts,
                change: RowChange::Insert(row),
            });
            return Ok(());
        }
        self.size.fetch_add(
            key.len() + row_mem_size(&row) + std::mem::size_of::<MemRowEntry>(),
            Ordering::Relaxed,
        );
        self.map.insert(
            key.to_vec(),
            MemRowEntry {
                chain: Mutex::new(vec![Mutation {
                    ts,
                    change: RowChange::Insert(row),
                }]),
            },
        );
        Ok(())
    }

    /// Materialized rows at `snapshot`, in key order, ghosts included: a
    /// row deleted at the snapshot is still written out (with its delete
    /// re-seeded), so later mutations always find a base row to land on.
    /// Used by the flush pipeline, whose snapshot has every entry's insert
    /// visible (it waits out in-flight transactions first).
    pub fn snapshot_rows(&self, snapshot: &MvccSnapshot) -> Vec<SnapshotRow> {
        let mut rows = Vec::with_capacity(self.map.len());
        for entry in self.map.iter() {
            let chain = entry.value().chain.lock().clone();
            let version = materialize(&self.schema, None, &chain, Some(snapshot));
            let Some(values) = version.values else {
                // No visible version; the entry predates the snapshot's
                // creation entirely. The catch-up pass replays it.
                continue;
            };
            rows.push(SnapshotRow {
                key: entry.key().clone(),
                values,
                live: version.live,
                delete_ts: version.delete_ts,
            });
        }
        rows
    }

    /// Mutations not visible in `snapshot`, per key. The flush pipeline
    /// re-applies these to the replacement rowset.
    pub fn missed_mutations(&self, snapshot: &MvccSnapshot) -> Vec<(Vec<u8>, Vec<Mutation>)> {
        let mut missed = Vec::new();
        for entry in self.map.iter() {
            let chain = entry.value().chain.lock();
            let muts: Vec<Mutation> = chain
                .iter()
                .filter(|m| !snapshot.is_visible(m.ts))
                .cloned()
                .collect();
            if !muts.is_empty() {
                missed.push((entry.key().clone(), muts));
            }
        }
        missed
    }

    /// Lines describing every entry and its chain, for debugging small
    /// tablets in tests.
    pub fn debug_dump(&self) -> Vec<String> {
        self.map
            .iter()
            .map(|entry| {
                let chain = entry.value().chain.lock();
                format!("key {:?}: {:?}", entry.key(), &*chain)
            })
            .collect()
    }

    pub fn version_iterator(
        self: Arc<Self>,
        tablet_schema: &Arc<Schema>,
        snapshot: &MvccSnapshot,
        range: &ScanRange,
    ) -> Box<dyn RowVersionIterator> {
        let mapping = Projection::full(tablet_schema).resolve(&self.schema);
        Box::new(MemRowSetIterator {
            mrs: self,
            tablet_schema: tablet_schema.clone(),
            mapping,
            snapshot: snapshot.clone(),
            cursor: None,
            range: range.clone(),
        })
    }
}

#[async_trait]
impl RowSet for MemRowSet {
    fn debug_name(&self) -> String {
        format!("mrs-{}", self.id)
    }

    fn min_key(&self) -> Vec<u8> {
        self.map.front().map(|e| e.key().clone()).unwrap_or_default()
    }

    fn max_key(&self) -> Vec<u8> {
        self.map.back().map(|e| e.key().clone()).unwrap_or_default()
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn check_present(&self, key: &[u8]) -> TabletResult<KeyPresence> {
        match self.map.get(key) {
            None => Ok(KeyPresence::Absent),
            Some(entry) => {
                let chain = entry.value().chain.lock();
                if Self::chain_state(&chain, &self.schema) {
                    Ok(KeyPresence::Live)
                } else {
                    Ok(KeyPresence::Deleted)
                }
            }
        }
    }

    async fn mutate(&self, key: &[u8], ts: Timestamp, change: &RowChange) -> TabletResult<()> {
        let Some(entry) = self.map.get(key) else {
            return Err(TracedTabletError::not_found("key", format!("{:?}", key)));
        };
        let mut chain = entry.value().chain.lock();
        let live = Self::chain_state(&chain, &self.schema);
        match change {
            RowChange::Insert(_) if live => {
                return Err(TracedTabletError::already_present(format!("key {:?}", key)))
            }
            RowChange::Update(_) | RowChange::Delete if !live => {
                return Err(TracedTabletError::not_found("key", format!("{:?}", key)))
            }
            _ => {}
        }
        debug_assert!(chain.last().map_or(true, |m| m.ts < ts));
        self.size.fetch_add(change.mem_size(), Ordering::Relaxed);
        chain.push(Mutation {
            ts,
            change: change.clone(),
        });
        Ok(())
    }

    async fn new_iterator(
        self: Arc<Self>,
        tablet_schema: &Arc<Schema>,
        snapshot: &MvccSnapshot,
        range: &ScanRange,
    ) -> TabletResult<Box<dyn RowVersionIterator>> {
        Ok(self.version_iterator(tablet_schema, snapshot, range))
    }

    fn delta_mem_size(&self) -> usize {
        self.mem_size()
    }

    fn delta_file_count(&self) -> usize {
        0
    }

    fn on_disk_size(&self) -> u64 {
        0
    }

    fn try_claim_compaction(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    fn release_compaction_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    fn as_mem(&self) -> Option<&MemRowSet> {
        Some(self)
    }
}

/// Lazy key-ordered scan over one MemRowSet. Holds its own reference, so the
/// rowset (and every row it yields) outlives concurrent swaps.
struct MemRowSetIterator {
    mrs: Arc<MemRowSet>,
    tablet_schema: Arc<Schema>,
    mapping: Vec<Option<usize>>,
    snapshot: MvccSnapshot,
    /// Last yielded key; the next step resumes strictly after it.
    cursor: Option<Vec<u8>>,
    range: ScanRange,
}

#[async_trait]
impl RowVersionIterator for MemRowSetIterator {
    async fn next_row(&mut self) -> TabletResult<Option<VersionedRow>> {
        loop {
            let lower = match &self.cursor {
                Some(cursor) => Bound::Excluded(cursor.clone()),
                None => match &self.range.lower {
                    Some(lower) => Bound::Included(lower.clone()),
                    None => Bound::Unbounded,
                },
            };
            let Some(entry) = self.mrs.map.range((lower, Bound::Unbounded)).next() else {
                return Ok(None);
            };
            let key = entry.key().clone();
            if !self.range.contains(&key) {
                return Ok(None);
            }
            self.cursor = Some(key.clone());

            let chain = entry.value().chain.lock().clone();
            let version = materialize(&self.mrs.schema, None, &chain, Some(&self.snapshot));
            if let Some(row) = version.live_row() {
                let projection = Projection::full(&self.tablet_schema);
                return Ok(Some(VersionedRow {
                    key,
                    row: projection.project_row(&self.mapping, row),
                    ts: version.last_ts.expect("live row without mutations"),
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDesc, DataType, Datum};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(
                vec![
                    ColumnDesc::new(0, "k", DataType::Int64, false),
                    ColumnDesc::new(1, "v", DataType::Int32, true),
                ],
                1,
            )
            .unwrap(),
        )
    }

    fn key(k: i64) -> Vec<u8> {
        crate::keycode::encode_key(&[Datum::Int64(k)]).unwrap()
    }

    fn row(k: i64, v: i32) -> Row {
        vec![Datum::Int64(k), Datum::Int32(v)]
    }

    fn ts(v: u64) -> Timestamp {
        Timestamp::from_raw(v)
    }

    async fn scan_all(mrs: &Arc<MemRowSet>, snap: &MvccSnapshot) -> Vec<Row> {
        let schema = mrs.schema.clone();
        let mut iter = mrs
            .clone()
            .version_iterator(&schema, snap, &ScanRange::all());
        let mut rows = vec![];
        while let Some(v) = iter.next_row().await.unwrap() {
            rows.push(v.row);
        }
        rows
    }

    #[tokio::test]
    async fn test_insert_and_snapshot_scan() {
        let mrs = MemRowSet::new(0, schema());
        mrs.insert(&key(2), row(2, 20), ts(2)).unwrap();
        mrs.insert(&key(1), row(1, 10), ts(4)).unwrap();

        // A snapshot between the inserts sees only the first row.
        let rows = scan_all(&mrs, &MvccSnapshot::committed_before(ts(3))).await;
        assert_eq!(rows, vec![row(2, 20)]);

        let rows = scan_all(&mrs, &MvccSnapshot::committed_before(ts(5))).await;
        assert_eq!(rows, vec![row(1, 10), row(2, 20)]);
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let mrs = MemRowSet::new(0, schema());
        mrs.insert(&key(1), row(1, 10), ts(1)).unwrap();
        let err = mrs.insert(&key(1), row(1, 11), ts(2)).unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_delete_reinsert() {
        let mrs = MemRowSet::new(0, schema());
        let k = key(1);
        mrs.insert(&k, row(1, 10), ts(1)).unwrap();
        mrs.mutate(&k, ts(2), &RowChange::update([(1, Datum::Int32(20))]))
            .await
            .unwrap();
        mrs.mutate(&k, ts(3), &RowChange::Delete).await.unwrap();

        // Update of a deleted key is NotFound.
        let err = mrs
            .mutate(&k, ts(4), &RowChange::update([(1, Datum::Int32(30))]))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(mrs.check_present(&k).await.unwrap(), KeyPresence::Deleted);

        // Reinsert through the insert path works.
        mrs.insert(&k, row(1, 40), ts(5)).unwrap();
        assert_eq!(mrs.check_present(&k).await.unwrap(), KeyPresence::Live);

        assert_eq!(
            scan_all(&mrs, &MvccSnapshot::committed_before(ts(3))).await,
            vec![row(1, 20)]
        );
        assert_eq!(
            scan_all(&mrs, &MvccSnapshot::committed_before(ts(4))).await,
            Vec::<Row>::new()
        );
        assert_eq!(
            scan_all(&mrs, &MvccSnapshot::committed_before(ts(6))).await,
            vec![row(1, 40)]
        );
    }

    #[tokio::test]
    async fn test_missed_mutations_split_by_snapshot() {
        let mrs = MemRowSet::new(0, schema());
        let k = key(1);
        mrs.insert(&k, row(1, 10), ts(1)).unwrap();
        mrs.mutate(&k, ts(5), &RowChange::update([(1, Datum::Int32(50))]))
            .await
            .unwrap();

        let snap = MvccSnapshot::committed_before(ts(3));
        let missed = mrs.missed_mutations(&snap);
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].1.len(), 1);
        assert_eq!(missed[0].1[0].ts, ts(5));

        let rows = mrs.snapshot_rows(&snap);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].live);
        assert_eq!(rows[0].values, row(1, 10));
    }
}
