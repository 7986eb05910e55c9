//! The immutable on-disk rowset: one column file per column, a key bloom,
//! and a delta tracker for everything that changed since it was written.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::writer::{cfile_name, BLOOM_FILE_NAME};
use super::{KeyPresence, RowSet};
use crate::bloom::KeyBloom;
use crate::cfile::{BlockCache, CFileReader};
use crate::clock::Timestamp;
use crate::delta::DeltaTracker;
use crate::error::{TabletResult, TracedTabletError};
use crate::iterator::{RowVersionIterator, ScanRange, VersionedRow};
use crate::keycode;
use crate::mutation::{materialize, Mutation, RowChange};
use crate::mvcc::MvccSnapshot;
use crate::schema::{Projection, Row, Schema};

/// Liveness after replaying a full mutation sequence over a live base row.
fn live_after(muts: &[Mutation]) -> (bool, Option<Timestamp>) {
    let mut live = true;
    let mut delete_ts = None;
    for m in muts {
        match m.change {
            RowChange::Insert(_) => {
                live = true;
                delete_ts = None;
            }
            RowChange::Delete => {
                live = false;
                delete_ts = Some(m.ts);
            }
            RowChange::Update(_) => {}
        }
    }
    (live, delete_ts)
}

pub struct DiskRowset {
    id: u64,
    dir: PathBuf,
    schema: Arc<Schema>,
    /// One reader per schema column, in schema order.
    columns: Vec<CFileReader>,
    bloom: KeyBloom,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    row_count: u32,
    tracker: DeltaTracker,
    claimed: AtomicBool,
}

impl DiskRowset {
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        id: u64,
        dir: PathBuf,
        schema: Arc<Schema>,
        min_key: Vec<u8>,
        max_key: Vec<u8>,
        block_cache: BlockCache,
        fsync: bool,
    ) -> TabletResult<DiskRowset> {
        let mut columns = Vec::with_capacity(schema.num_columns());
        for col in schema.columns() {
            columns.push(
                CFileReader::open(
                    dir.join(cfile_name(col.id())),
                    col.datatype(),
                    block_cache.clone(),
                    id,
                    col.id(),
                )
                .await?,
            );
        }
        let row_count = columns
            .first()
            .map(|c| c.row_count())
            .ok_or_else(|| TracedTabletError::corruption("rowset with no columns"))?;
        if columns.iter().any(|c| c.row_count() != row_count) {
            return Err(TracedTabletError::corruption(format!(
                "rowset {id} column files disagree on row count"
            )));
        }
        let bloom = KeyBloom::open(dir.join(BLOOM_FILE_NAME)).await?;
        let tracker = DeltaTracker::open(id, dir.clone(), fsync).await?;
        Ok(DiskRowset {
            id,
            dir,
            schema,
            columns,
            bloom,
            min_key,
            max_key,
            row_count,
            tracker,
            claimed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn tracker(&self) -> &DeltaTracker {
        &self.tracker
    }

    /// Encoded primary key of a base row.
    pub async fn encoded_key_at(&self, row_id: u32) -> TabletResult<Vec<u8>> {
        let mut datums = Vec::with_capacity(self.schema.num_key_columns());
        for reader in &self.columns[..self.schema.num_key_columns()] {
            datums.push(reader.datum(row_id).await?);
        }
        keycode::encode_key(&datums)
    }

    /// Base row values in this rowset's schema order.
    pub async fn base_row(&self, row_id: u32) -> TabletResult<Row> {
        let mut row = Vec::with_capacity(self.columns.len());
        for reader in &self.columns {
            row.push(reader.datum(row_id).await?);
        }
        Ok(row)
    }

    /// Resolve a key to its base row id: bloom, then the sparse key index of
    /// the first key column, then a binary search within the block.
    pub async fn key_probe(&self, key: &[u8]) -> TabletResult<Option<u32>> {
        if self.row_count == 0
            || key < self.min_key.as_slice()
            || key > self.max_key.as_slice()
            || !self.bloom.may_contain(key)
        {
            return Ok(None);
        }
        let key_index = self.columns[0].index();
        let Some(block_id) = key_index.block_of_key(key) else {
            return Ok(None);
        };
        let entry = key_index.index(block_id).clone();

        // Materialize the block's keys once; rows are key-sorted.
        let mut keys = Vec::with_capacity(entry.row_count as usize);
        for row_id in entry.first_row_id..entry.first_row_id + entry.row_count {
            keys.push(self.encoded_key_at(row_id).await?);
        }
        match keys.binary_search_by(|probe| probe.as_slice().cmp(key)) {
            Ok(pos) => Ok(Some(entry.first_row_id + pos as u32)),
            Err(_) => Ok(None),
        }
    }

    /// Append a delta for `key` without conflict checks. Returns false when
    /// the key has no base row here (e.g. it was dropped as a clean ghost by
    /// the compaction that wrote this rowset).
    ///
    /// Keyed by `(row_id, ts)` in the DMS, so replaying the same mutation
    /// from both the mirror path and the catch-up path is harmless.
    pub(crate) async fn apply_raw(
        &self,
        key: &[u8],
        ts: Timestamp,
        change: &RowChange,
    ) -> TabletResult<bool> {
        match self.key_probe(key).await? {
            Some(row_id) => {
                self.tracker.update(row_id, ts, change.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl RowSet for DiskRowset {
    fn debug_name(&self) -> String {
        format!("drs-{}", self.id)
    }

    fn min_key(&self) -> Vec<u8> {
        self.min_key.clone()
    }

    fn max_key(&self) -> Vec<u8> {
        self.max_key.clone()
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn check_present(&self, key: &[u8]) -> TabletResult<KeyPresence> {
        let Some(row_id) = self.key_probe(key).await? else {
            return Ok(KeyPresence::Absent);
        };
        let muts = self.tracker.mutations_for_row(row_id);
        let (live, _) = live_after(&muts);
        Ok(if live {
            KeyPresence::Live
        } else {
            KeyPresence::Deleted
        })
    }

    async fn mutate(&self, key: &[u8], ts: Timestamp, change: &RowChange) -> TabletResult<()> {
        let Some(row_id) = self.key_probe(key).await? else {
            return Err(TracedTabletError::not_found("key", format!("{:?}", key)));
        };
        let muts = self.tracker.mutations_for_row(row_id);
        let (live, _) = live_after(&muts);
        match change {
            RowChange::Insert(_) if live => {
                return Err(TracedTabletError::already_present(format!("key {:?}", key)))
            }
            RowChange::Update(_) | RowChange::Delete if !live => {
                return Err(TracedTabletError::not_found("key", format!("{:?}", key)))
            }
            _ => {}
        }
        self.tracker.update(row_id, ts, change.clone());
        Ok(())
    }

    async fn new_iterator(
        self: Arc<Self>,
        tablet_schema: &Arc<Schema>,
        snapshot: &MvccSnapshot,
        range: &ScanRange,
    ) -> TabletResult<Box<dyn RowVersionIterator>> {
        let start_row = match &range.lower {
            Some(lower) if lower.as_slice() > self.min_key.as_slice() => {
                match self.columns[0].index().block_of_key(lower) {
                    Some(block_id) => self.columns[0].index().index(block_id).first_row_id,
                    None => 0,
                }
            }
            _ => 0,
        };
        let mapping = Projection::full(tablet_schema).resolve(&self.schema);
        Ok(Box::new(DiskRowsetIterator {
            rowset: self,
            tablet_schema: tablet_schema.clone(),
            mapping,
            snapshot: snapshot.clone(),
            range: range.clone(),
            next_row_id: start_row,
        }))
    }

    fn delta_mem_size(&self) -> usize {
        self.tracker.delta_mem_size()
    }

    fn delta_file_count(&self) -> usize {
        self.tracker.delta_file_count()
    }

    fn on_disk_size(&self) -> u64 {
        let base: u64 = self.columns.iter().map(|c| c.on_disk_size()).sum();
        base + self.tracker.delta_files_size()
    }

    fn try_claim_compaction(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    fn release_compaction_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    fn as_disk(&self) -> Option<&DiskRowset> {
        Some(self)
    }
}

/// Key-ordered scan over one DiskRowset: base rows merged with visible
/// deltas, dead rows skipped.
struct DiskRowsetIterator {
    rowset: Arc<DiskRowset>,
    tablet_schema: Arc<Schema>,
    mapping: Vec<Option<usize>>,
    snapshot: MvccSnapshot,
    range: ScanRange,
    next_row_id: u32,
}

#[async_trait]
impl RowVersionIterator for DiskRowsetIterator {
    async fn next_row(&mut self) -> TabletResult<Option<VersionedRow>> {
        while self.next_row_id < self.rowset.row_count {
            let row_id = self.next_row_id;
            self.next_row_id += 1;

            let key = self.rowset.encoded_key_at(row_id).await?;
            if let Some(lower) = &self.range.lower {
                if key < *lower {
                    continue;
                }
            }
            if let Some(upper) = &self.range.upper {
                if key >= *upper {
                    return Ok(None);
                }
            }

            let base = self.rowset.base_row(row_id).await?;
            let muts = self.rowset.tracker.mutations_for_row(row_id);
            let version = materialize(
                &self.rowset.schema,
                Some(&base),
                &muts,
                Some(&self.snapshot),
            );
            if let Some(row) = version.live_row() {
                let projection = Projection::full(&self.tablet_schema);
                return Ok(Some(VersionedRow {
                    key,
                    row: projection.project_row(&self.mapping, row),
                    ts: version.last_ts.unwrap_or(Timestamp::MIN),
                }));
            }
        }
        Ok(None)
    }
}
