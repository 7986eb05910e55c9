//! Tracks all deltas of one DiskRowSet: a mutable DeltaMemStore plus an
//! ordered list of immutable delta files.
//!
//! For any row the effective mutation sequence is base row, then deltas
//! strictly by embedded timestamp; readers merge the file list and the DMS
//! by timestamp, so the physical location of a delta never changes its
//! logical position.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::RwLock;
use tracing::debug;

use super::{DeltaFile, DeltaMemStore};
use crate::clock::Timestamp;
use crate::error::TabletResult;
use crate::mutation::{Mutation, RowChange};
use crate::mvcc::MvccSnapshot;

pub fn delta_file_name(id: u64) -> String {
    format!("delta_{id}.deltafile")
}

fn parse_delta_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("delta_")?
        .strip_suffix(".deltafile")?
        .parse()
        .ok()
}

pub struct DeltaTracker {
    rowset_id: u64,
    dir: PathBuf,
    fsync: bool,
    dms: RwLock<Arc<DeltaMemStore>>,
    /// A DMS that has been swapped out but whose delta file is not yet in
    /// `files`. Readers consult it so no delta is ever invisible mid-flush.
    flushing: RwLock<Option<Arc<DeltaMemStore>>>,
    files: RwLock<Arc<Vec<Arc<DeltaFile>>>>,
    next_file_id: AtomicU64,
    next_dms_id: AtomicU64,
    /// At most one DMS flush or minor compaction at a time.
    flush_lock: tokio::sync::Mutex<()>,
}

impl DeltaTracker {
    pub fn new_empty(rowset_id: u64, dir: PathBuf, fsync: bool) -> DeltaTracker {
        DeltaTracker {
            rowset_id,
            dir,
            fsync,
            dms: RwLock::new(Arc::new(DeltaMemStore::new(0))),
            flushing: RwLock::new(None),
            files: RwLock::new(Arc::new(Vec::new())),
            next_file_id: AtomicU64::new(0),
            next_dms_id: AtomicU64::new(1),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the tracker over an existing rowset directory, loading every
    /// `delta_<n>.deltafile` in id order.
    pub async fn open(rowset_id: u64, dir: PathBuf, fsync: bool) -> TabletResult<DeltaTracker> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(parse_delta_file_name) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        let mut files = Vec::with_capacity(ids.len());
        for id in &ids {
            files.push(Arc::new(
                DeltaFile::open(*id, dir.join(delta_file_name(*id))).await?,
            ));
        }
        let next_file_id = ids.last().map(|id| id + 1).unwrap_or(0);
        Ok(DeltaTracker {
            rowset_id,
            dir,
            fsync,
            dms: RwLock::new(Arc::new(DeltaMemStore::new(0))),
            flushing: RwLock::new(None),
            files: RwLock::new(Arc::new(files)),
            next_file_id: AtomicU64::new(next_file_id),
            next_dms_id: AtomicU64::new(1),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn update(&self, row_id: u32, ts: Timestamp, change: RowChange) {
        let dms = self.dms.read().clone();
        dms.update(row_id, ts, change);
    }

    fn sources(
        &self,
    ) -> (
        Arc<Vec<Arc<DeltaFile>>>,
        Option<Arc<DeltaMemStore>>,
        Arc<DeltaMemStore>,
    ) {
        // Snapshot the source list oldest-first. Taking the file list before
        // the DMS pair means a concurrent flush can at worst surface the
        // same delta from two sources, which dedup below absorbs.
        let files = self.files.read().clone();
        let flushing = self.flushing.read().clone();
        let dms = self.dms.read().clone();
        (files, flushing, dms)
    }

    /// All mutations for a row across every delta source, ascending by
    /// timestamp.
    pub fn mutations_for_row(&self, row_id: u32) -> Vec<Mutation> {
        let (files, flushing, dms) = self.sources();
        let mut muts: Vec<Mutation> = Vec::new();
        for file in files.iter() {
            muts.extend(file.mutations_for_row(row_id));
        }
        if let Some(flushing) = flushing {
            muts.extend(flushing.mutations_for_row(row_id));
        }
        muts.extend(dms.mutations_for_row(row_id));
        muts.sort_by_key(|m| m.ts);
        muts.dedup_by_key(|m| m.ts);
        muts
    }

    /// Every delta not visible in `snapshot`, sorted by `(row_id, ts)`. The
    /// compaction catch-up pass replays these onto the output rowset.
    pub fn mutations_not_visible(&self, snapshot: &MvccSnapshot) -> Vec<(u32, Mutation)> {
        let (files, flushing, dms) = self.sources();
        let mut muts: Vec<(u32, Timestamp, RowChange)> = Vec::new();
        for file in files.iter() {
            muts.extend(file.records().iter().cloned());
        }
        if let Some(flushing) = flushing {
            muts.extend(flushing.entries());
        }
        muts.extend(dms.entries());
        muts.retain(|(_, ts, _)| !snapshot.is_visible(*ts));
        muts.sort_by_key(|(row_id, ts, _)| (*row_id, *ts));
        muts.dedup_by_key(|(row_id, ts, _)| (*row_id, *ts));
        muts.into_iter()
            .map(|(row_id, ts, change)| (row_id, Mutation { ts, change }))
            .collect()
    }

    pub fn delta_mem_size(&self) -> usize {
        let flushing = self.flushing.read().as_ref().map_or(0, |d| d.mem_size());
        self.dms.read().mem_size() + flushing
    }

    pub fn delta_file_count(&self) -> usize {
        self.files.read().len()
    }

    pub fn delta_files_size(&self) -> u64 {
        self.files.read().iter().map(|f| f.on_disk_size()).sum()
    }

    /// Write the current DMS to a new delta file at the tail of the list and
    /// swap in a fresh empty DMS. Returns false if there was nothing to
    /// flush.
    pub async fn flush_dms(&self) -> TabletResult<bool> {
        let _guard = self.flush_lock.lock().await;

        let frozen = {
            let mut dms = self.dms.write();
            if dms.is_empty() {
                return Ok(false);
            }
            let fresh = Arc::new(DeltaMemStore::new(
                self.next_dms_id.fetch_add(1, Ordering::SeqCst),
            ));
            let frozen = std::mem::replace(&mut *dms, fresh);
            *self.flushing.write() = Some(frozen.clone());
            frozen
        };

        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let result = self.write_delta_file(file_id, &frozen.entries()).await;
        match result {
            Ok(file) => {
                {
                    let mut files = self.files.write();
                    let mut new_files = files.as_ref().clone();
                    new_files.push(Arc::new(file));
                    *files = Arc::new(new_files);
                }
                *self.flushing.write() = None;
                debug!(
                    rowset = self.rowset_id,
                    file = file_id,
                    "flushed delta mem store"
                );
                Ok(true)
            }
            Err(e) => {
                // Keep the frozen DMS visible; its deltas are not on disk.
                Err(e)
            }
        }
    }

    async fn write_delta_file(
        &self,
        file_id: u64,
        records: &[(u32, Timestamp, RowChange)],
    ) -> TabletResult<DeltaFile> {
        let final_path = self.dir.join(delta_file_name(file_id));
        let tmp_path = self.dir.join(format!("{}.tmp", delta_file_name(file_id)));
        DeltaFile::write_records(&tmp_path, records, self.fsync).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        DeltaFile::open(file_id, final_path).await
    }

    /// Merge the current run of delta files into one. Returns the number of
    /// input files merged (0 or 1 means there was nothing to do).
    pub async fn minor_compact(&self) -> TabletResult<usize> {
        let _guard = self.flush_lock.lock().await;

        let inputs = self.files.read().clone();
        if inputs.len() < 2 {
            return Ok(inputs.len());
        }
        let merged: Vec<(u32, Timestamp, RowChange)> = inputs
            .iter()
            .flat_map(|f| f.records().iter().cloned())
            .sorted_by_key(|(row_id, ts, _)| (*row_id, *ts))
            .dedup_by(|a, b| (a.0, a.1) == (b.0, b.1))
            .collect();

        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let merged_file = Arc::new(self.write_delta_file(file_id, &merged).await?);
        {
            let mut files = self.files.write();
            // Concurrent DMS flushes cannot run (flush_lock), so the list can
            // only have grown at the tail; keep any tail files.
            let tail: Vec<_> = files
                .iter()
                .filter(|f| !inputs.iter().any(|i| i.id() == f.id()))
                .cloned()
                .collect();
            let mut new_files = vec![merged_file];
            new_files.extend(tail);
            *files = Arc::new(new_files);
        }
        for input in inputs.iter() {
            // Readers that pinned the old list keep the decoded records in
            // memory; the unlink only drops the bytes.
            tokio::fs::remove_file(input.path()).await?;
        }
        debug!(
            rowset = self.rowset_id,
            merged = inputs.len(),
            file = file_id,
            "minor delta compaction complete"
        );
        Ok(inputs.len())
    }
}

/// List delta file paths in a rowset dir (recovery-time helper).
pub async fn list_delta_files(dir: &Path) -> TabletResult<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(id) = entry.file_name().to_str().and_then(parse_delta_file_name) {
            found.push((id, entry.path()));
        }
    }
    found.sort_unstable();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Datum;

    fn ts(v: u64) -> Timestamp {
        Timestamp::from_raw(v)
    }

    fn upd(v: i32) -> RowChange {
        RowChange::update([(1, Datum::Int32(v))])
    }

    #[tokio::test]
    async fn test_update_flush_reload() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = DeltaTracker::new_empty(1, dir.path().to_path_buf(), false);
        tracker.update(5, ts(1), upd(10));
        tracker.update(5, ts(3), upd(30));
        tracker.update(9, ts(2), RowChange::Delete);

        assert!(tracker.flush_dms().await.unwrap());
        assert_eq!(tracker.delta_file_count(), 1);
        assert!(!tracker.flush_dms().await.unwrap());

        // New updates land in the fresh DMS; reads merge both sources.
        tracker.update(5, ts(7), upd(70));
        let muts = tracker.mutations_for_row(5);
        assert_eq!(
            muts.iter().map(|m| m.ts).collect::<Vec<_>>(),
            vec![ts(1), ts(3), ts(7)]
        );

        // Reopen from disk: flushed deltas survive, DMS deltas do not.
        let reopened = DeltaTracker::open(1, dir.path().to_path_buf(), false)
            .await
            .unwrap();
        assert_eq!(reopened.delta_file_count(), 1);
        assert_eq!(reopened.mutations_for_row(5).len(), 2);
    }

    #[tokio::test]
    async fn test_minor_compact_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = DeltaTracker::new_empty(1, dir.path().to_path_buf(), false);
        for (round, t) in [(1u64, 1u64), (2, 2), (3, 3)] {
            tracker.update(1, ts(t), upd(round as i32));
            assert!(tracker.flush_dms().await.unwrap());
        }
        assert_eq!(tracker.delta_file_count(), 3);

        assert_eq!(tracker.minor_compact().await.unwrap(), 3);
        assert_eq!(tracker.delta_file_count(), 1);
        let muts = tracker.mutations_for_row(1);
        assert_eq!(
            muts.iter().map(|m| m.ts).collect::<Vec<_>>(),
            vec![ts(1), ts(2), ts(3)]
        );

        // Only the merged file remains on disk.
        let files = list_delta_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_mutations_not_visible() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = DeltaTracker::new_empty(1, dir.path().to_path_buf(), false);
        tracker.update(1, ts(2), upd(2));
        tracker.update(1, ts(8), upd(8));
        tracker.flush_dms().await.unwrap();
        tracker.update(2, ts(9), RowChange::Delete);

        let missed = tracker.mutations_not_visible(&MvccSnapshot::committed_before(ts(5)));
        assert_eq!(
            missed
                .iter()
                .map(|(row_id, m)| (*row_id, m.ts))
                .collect::<Vec<_>>(),
            vec![(1, ts(8)), (2, ts(9))]
        );
    }
}
