//! Compaction selection and the merge of compaction inputs.
//!
//! Selection claims each candidate's compact/flush token, scores candidate
//! groups by key-range overlap, delta density, and write amplification, and
//! returns one claimed set. Execution (in `tablet.rs`) reads every input at
//! an MVCC snapshot, merges them key-ordered into a new DiskRowset, and
//! installs the output through the DuplicatingRowSet protocol.

use std::sync::Arc;

use itertools::Itertools;
use tracing::debug;

use crate::error::TabletResult;
use crate::mvcc::MvccSnapshot;
use crate::rowset::{DiskRowset, RowSet, RowSetWriter, SnapshotRow};
use crate::rowset_tree::RowSetTree;
use crate::schema::{Projection, Schema};

/// Flags to change the behavior of compaction.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactFlags {
    /// Include every eligible rowset regardless of policy scoring. Used by
    /// tests.
    pub force_compact_all: bool,
}

/// What the external maintenance scheduler looks at to decide whether a
/// compaction is worth running.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionStats {
    pub runnable: bool,
    pub score: f64,
}

/// The claimed inputs of one flush or compaction. Claims are released when
/// the record drops, whether or not the operation succeeded.
pub struct RowSetsInCompaction {
    rowsets: Vec<Arc<dyn RowSet>>,
}

impl RowSetsInCompaction {
    /// Claim `rowsets` for compaction. The caller must already hold each
    /// rowset's claim (via `try_claim_compaction`).
    pub(crate) fn from_claimed(rowsets: Vec<Arc<dyn RowSet>>) -> RowSetsInCompaction {
        RowSetsInCompaction { rowsets }
    }

    pub fn rowsets(&self) -> &[Arc<dyn RowSet>] {
        &self.rowsets
    }

    pub fn len(&self) -> usize {
        self.rowsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rowsets.is_empty()
    }
}

impl Drop for RowSetsInCompaction {
    fn drop(&mut self) {
        for rowset in &self.rowsets {
            rowset.release_compaction_claim();
        }
    }
}

fn delta_density(rowset: &dyn RowSet) -> f64 {
    let base = rowset.on_disk_size().max(1) as f64;
    (rowset.delta_mem_size() as f64 + rowset.delta_file_count() as f64 * 1024.0) / base
}

/// Pick one set of disk rowsets to merge, or `None` when no profitable set
/// exists. Claims every returned rowset.
///
/// Serialized by the tablet's `compact_select_lock`; claims keep a rowset
/// from being picked twice even so, because flushes claim too.
pub(crate) fn pick_rowsets(
    tree: &RowSetTree,
    budget_bytes: u64,
    flags: CompactFlags,
) -> Option<RowSetsInCompaction> {
    // Claim candidates up front; unclaimed rowsets are invisible to us.
    let mut claimed: Vec<Arc<dyn RowSet>> = Vec::new();
    for rowset in tree.iter() {
        if rowset.as_disk().is_some() && rowset.try_claim_compaction() {
            claimed.push(rowset.clone());
        }
    }
    if claimed.len() < 2 {
        for rowset in &claimed {
            rowset.release_compaction_claim();
        }
        return None;
    }

    if flags.force_compact_all {
        return Some(RowSetsInCompaction::from_claimed(claimed));
    }

    // Group rowsets whose key ranges chain-overlap.
    claimed.sort_by_key(|r| r.min_key());
    let mut groups: Vec<Vec<Arc<dyn RowSet>>> = Vec::new();
    let mut group_end: Vec<u8> = Vec::new();
    for rowset in &claimed {
        let starts_new = match groups.last() {
            Some(_) => rowset.min_key() > group_end,
            None => true,
        };
        if starts_new {
            groups.push(vec![rowset.clone()]);
            group_end = rowset.max_key();
        } else {
            groups.last_mut().unwrap().push(rowset.clone());
            group_end = group_end.max(rowset.max_key());
        }
    }

    let scored = groups
        .into_iter()
        .filter(|g| g.len() >= 2)
        .map(|mut group| {
            // Respect the I/O budget: drop the largest members first.
            group.sort_by_key(|r| r.on_disk_size());
            let mut total = 0u64;
            group.retain(|r| {
                total += r.on_disk_size();
                total <= budget_bytes
            });
            let density: f64 = group.iter().map(|r| delta_density(r.as_ref())).sum();
            let score = group.len() as f64 + density;
            (score, group)
        })
        .filter(|(_, g)| g.len() >= 2)
        .max_by(|(a, _), (b, _)| a.total_cmp(b));

    match scored {
        Some((score, group)) => {
            for rowset in &claimed {
                if !group.iter().any(|g| Arc::ptr_eq(g, rowset)) {
                    rowset.release_compaction_claim();
                }
            }
            debug!(
                inputs = group.iter().map(|r| r.debug_name()).join(","),
                score, "selected rowsets for compaction"
            );
            Some(RowSetsInCompaction::from_claimed(group))
        }
        None => {
            for rowset in &claimed {
                rowset.release_compaction_claim();
            }
            None
        }
    }
}

/// Score without claiming, for the external scheduler.
pub(crate) fn compaction_stats(tree: &RowSetTree) -> CompactionStats {
    let candidates: Vec<_> = tree.iter().filter(|r| r.as_disk().is_some()).collect();
    if candidates.len() < 2 {
        return CompactionStats::default();
    }
    let density: f64 = candidates.iter().map(|r| delta_density(r.as_ref())).sum();
    CompactionStats {
        runnable: true,
        score: candidates.len() as f64 + density,
    }
}

/// Key-ordered stream of one input's rows at the compaction snapshot.
///
/// Rows deleted at the snapshot surface too: the output keeps a base row
/// (plus a re-seeded delete) for every input key, so mutations that race
/// the compaction always find their row.
pub(crate) enum CompactionInput {
    Mem {
        rows: std::vec::IntoIter<SnapshotRow>,
    },
    Disk {
        rowset: Arc<dyn RowSet>,
        snapshot: MvccSnapshot,
        next_row_id: u32,
        /// Projects rows out of the input's creation schema into the output
        /// schema (inputs may predate column adds/drops).
        projection: Projection,
        mapping: Vec<Option<usize>>,
    },
}

impl CompactionInput {
    /// The MemRowSet always carries the tablet's current schema, so its
    /// snapshot rows need no remapping.
    pub(crate) fn from_mem(rows: Vec<SnapshotRow>) -> CompactionInput {
        CompactionInput::Mem {
            rows: rows.into_iter(),
        }
    }

    /// `rowset` must be a [`DiskRowset`]; its rows are rewritten into
    /// `target_schema`.
    pub(crate) fn from_disk(
        rowset: Arc<dyn RowSet>,
        snapshot: MvccSnapshot,
        target_schema: &Schema,
    ) -> CompactionInput {
        let projection = Projection::full(target_schema);
        let mapping = projection.resolve(rowset.schema());
        assert!(rowset.as_disk().is_some());
        CompactionInput::Disk {
            rowset,
            snapshot,
            next_row_id: 0,
            projection,
            mapping,
        }
    }

    pub(crate) async fn next(&mut self) -> TabletResult<Option<SnapshotRow>> {
        match self {
            CompactionInput::Mem { rows } => Ok(rows.next()),
            CompactionInput::Disk {
                rowset,
                snapshot,
                next_row_id,
                projection,
                mapping,
            } => {
                let drs: &DiskRowset = rowset.as_disk().expect("disk compaction input");
                if *next_row_id >= drs.row_count() {
                    return Ok(None);
                }
                let row_id = *next_row_id;
                *next_row_id += 1;

                let base = drs.base_row(row_id).await?;
                let muts = drs.tracker().mutations_for_row(row_id);
                let version = crate::mutation::materialize(
                    drs.schema(),
                    Some(&base),
                    &muts,
                    Some(snapshot),
                );
                let key = drs.encoded_key_at(row_id).await?;
                let values = version.values.expect("disk row without base values");
                // Ghost rows are carried over (with their delete re-seeded)
                // so every input key keeps a base row for later mutations.
                Ok(Some(SnapshotRow {
                    key,
                    values: projection.project_row(mapping, &values),
                    live: version.live,
                    delete_ts: version.delete_ts,
                }))
            }
        }
    }
}

/// Merge key-ordered inputs into `writer`. At most one instance of a key
/// can be live across inputs; the live instance wins, and among all-dead
/// instances the newest delete wins.
pub(crate) async fn merge_compaction_inputs(
    mut inputs: Vec<CompactionInput>,
    writer: &mut RowSetWriter,
) -> TabletResult<()> {
    let mut heads: Vec<Option<SnapshotRow>> = Vec::with_capacity(inputs.len());
    for input in inputs.iter_mut() {
        heads.push(input.next().await?);
    }

    loop {
        let Some(min_key) = heads
            .iter()
            .flatten()
            .map(|row| row.key.clone())
            .min()
        else {
            return Ok(());
        };

        let mut winner: Option<SnapshotRow> = None;
        for idx in 0..heads.len() {
            if heads[idx].as_ref().map(|r| r.key == min_key) != Some(true) {
                continue;
            }
            let row = heads[idx].take().unwrap();
            heads[idx] = inputs[idx].next().await?;
            winner = Some(match winner.take() {
                None => row,
                Some(best) => {
                    assert!(
                        !(best.live && row.live),
                        "two live versions of one key across compaction inputs"
                    );
                    if row.live || (!best.live && row.delete_ts > best.delete_ts) {
                        row
                    } else {
                        best
                    }
                }
            });
        }
        writer.append(&winner.expect("no head matched the min key")).await?;
    }
}
