//! The tablet: a single-node, column-oriented, mutable key-ordered table
//! under MVCC.
//!
//! Writes traverse the lock manager, then MVCC, then the captured
//! components, landing in the MemRowSet or the DiskRowset owning the key.
//! Reads pin a components bundle and an MVCC
//! snapshot. Flush and compaction build replacement rowsets offline and
//! install them through the DuplicatingRowSet protocol, so neither readers
//! nor writers ever observe a torn tree.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex as PLMutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::clock::{HybridClock, Timestamp};
use crate::compaction::{
    compaction_stats, merge_compaction_inputs, pick_rowsets, CompactFlags, CompactionInput,
    CompactionStats, RowSetsInCompaction,
};
use crate::components::TabletComponents;
use crate::error::{TabletResult, TracedTabletError};
use crate::iterator::TabletIterator;
use crate::lock_manager::{LockManager, RowLock};
use crate::memrowset::MemRowSet;
use crate::metadata::{AddRowSetEntry, Manifest, ManifestOperation};
use crate::mutation::{ColumnUpdate, Mutation, RowChange};
use crate::mvcc::{MvccManager, MvccSnapshot, TxnHandle};
use crate::options::TabletOptions;
use crate::probe;
use crate::rowset::{
    DiskRowset, DuplicatingRowSet, KeyPresence, RowSet, RowSetWriter, SnapshotRow,
};
use crate::rowset_tree::RowSetTree;
use crate::schema::{ColumnId, Datum, Projection, Row, Schema};

const MANIFEST_FILE_NAME: &str = "manifest.json";

fn rowset_dir_name(id: u64) -> String {
    format!("rs_{id}")
}

/// Per-write-transaction state: row locks, the MVCC handle, and the
/// components captured at start. Row locks are always taken before the
/// timestamp (two-phase locking), so per-key mutation timestamps can only
/// move forward.
#[derive(Default)]
pub struct WriteTransaction {
    txn: Option<TxnHandle>,
    components: Option<Arc<TabletComponents>>,
    locks: Vec<RowLock>,
}

impl WriteTransaction {
    pub fn new() -> WriteTransaction {
        WriteTransaction::default()
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.txn.as_ref().map(|t| t.timestamp())
    }
}

enum PreparedOp {
    Insert(Row),
    Mutate(RowChange),
}

/// A row write whose lock is held; produced by `prepare_*`, consumed by
/// `apply_*`.
pub struct PreparedWrite {
    key: Vec<u8>,
    op: PreparedOp,
}

impl PreparedWrite {
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

pub struct Tablet {
    options: Arc<TabletOptions>,
    schema: RwLock<Arc<Schema>>,
    clock: Arc<HybridClock>,
    mvcc: MvccManager,
    lock_manager: LockManager,
    /// The component lock: shared to capture, exclusive to swap.
    components: RwLock<Arc<TabletComponents>>,
    /// At most one MemRowSet flush in flight.
    rowsets_flush_lock: AsyncMutex<()>,
    /// Serializes compaction selection.
    compact_select_lock: AsyncMutex<()>,
    manifest: AsyncMutex<Manifest>,
    block_cache: crate::cfile::BlockCache,
    next_rowset_id: AtomicU64,
    next_mrs_id: AtomicU64,
    /// Rowsets removed from the tree whose files wait for the last reader.
    retired: PLMutex<Vec<Arc<dyn RowSet>>>,
    shutdown: AtomicBool,
}

impl Tablet {
    /// Create a brand-new tablet directory.
    pub async fn create(options: TabletOptions, schema: Schema) -> TabletResult<Tablet> {
        let manifest_path = options.path.join(MANIFEST_FILE_NAME);
        if tokio::fs::try_exists(&manifest_path).await? {
            return Err(TracedTabletError::invalid_argument(format!(
                "tablet already exists at {}",
                options.path.display()
            )));
        }
        tokio::fs::create_dir_all(&options.path).await?;
        let mut manifest = Manifest::open(&manifest_path, options.enable_fsync).await?;
        manifest
            .append(vec![ManifestOperation::Bootstrap {
                schema: schema.clone(),
            }])
            .await?;
        info!(path = %options.path.display(), "created tablet");
        Ok(Self::assemble(options, manifest, schema, Vec::new(), 0, 0).await?)
    }

    /// Open an existing tablet from its manifest.
    pub async fn open(options: TabletOptions) -> TabletResult<Tablet> {
        let manifest_path = options.path.join(MANIFEST_FILE_NAME);
        if !tokio::fs::try_exists(&manifest_path).await? {
            return Err(TracedTabletError::not_found(
                "tablet",
                options.path.display(),
            ));
        }
        let mut manifest = Manifest::open(&manifest_path, options.enable_fsync).await?;
        let state = manifest.load_state().await?;
        let schema = state.schema.ok_or_else(|| {
            TracedTabletError::corruption("manifest has no bootstrap entry")
        })?;
        info!(
            path = %options.path.display(),
            rowsets = state.live_rowsets.len(),
            "opening tablet"
        );
        Self::assemble(
            options,
            manifest,
            schema,
            state.live_rowsets.into_values().collect(),
            state.next_rowset_id,
            state.next_mrs_id,
        )
        .await
    }

    async fn assemble(
        options: TabletOptions,
        manifest: Manifest,
        schema: Schema,
        live: Vec<AddRowSetEntry>,
        next_rowset_id: u64,
        next_mrs_id: u64,
    ) -> TabletResult<Tablet> {
        let options = Arc::new(options);
        let block_cache = crate::cfile::new_block_cache(options.block_cache_capacity);

        let mut rowsets: Vec<Arc<dyn RowSet>> = Vec::with_capacity(live.len());
        for entry in &live {
            let rowset = DiskRowset::open(
                entry.rowset_id,
                options.path.join(rowset_dir_name(entry.rowset_id)),
                Arc::new(entry.schema.clone()),
                entry.min_key.clone(),
                entry.max_key.clone(),
                block_cache.clone(),
                options.enable_fsync,
            )
            .await?;
            rowsets.push(Arc::new(rowset));
        }

        // Directories not in the live set are leftovers of interrupted
        // maintenance; remove them before they can collide with new ids.
        let mut dir_entries = tokio::fs::read_dir(&options.path).await?;
        while let Some(dir_entry) = dir_entries.next_entry().await? {
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_prefix("rs_").and_then(|s| s.parse::<u64>().ok()) {
                if !live.iter().any(|e| e.rowset_id == id) {
                    warn!(rowset = id, "removing orphan rowset directory");
                    tokio::fs::remove_dir_all(dir_entry.path()).await?;
                }
            }
        }

        let clock = Arc::new(HybridClock::new());
        let schema = Arc::new(schema);
        let memrowset = MemRowSet::new(next_mrs_id, schema.clone());
        let components = TabletComponents::new(memrowset, Arc::new(RowSetTree::new(rowsets)));
        Ok(Tablet {
            options,
            schema: RwLock::new(schema),
            mvcc: MvccManager::new(clock.clone()),
            clock,
            lock_manager: LockManager::new(),
            components: RwLock::new(components),
            rowsets_flush_lock: AsyncMutex::new(()),
            compact_select_lock: AsyncMutex::new(()),
            manifest: AsyncMutex::new(manifest),
            block_cache,
            next_rowset_id: AtomicU64::new(next_rowset_id),
            next_mrs_id: AtomicU64::new(next_mrs_id + 1),
            retired: PLMutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> TabletResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(TracedTabletError::aborted());
        }
        Ok(())
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema.read().clone()
    }

    pub fn mvcc(&self) -> &MvccManager {
        &self.mvcc
    }

    fn capture_components(&self) -> Arc<TabletComponents> {
        self.components.read().clone()
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Acquire the row lock for an insert and validate the row. Conflicts
    /// (`AlreadyPresent`) are detected at apply time, not here.
    pub async fn prepare_insert(
        &self,
        state: &mut WriteTransaction,
        row: Row,
    ) -> TabletResult<PreparedWrite> {
        self.check_open()?;
        let schema = self.schema();
        schema.check_row(&row)?;
        let key = schema.encode_key(&row)?;
        state.locks.push(self.lock_manager.acquire(&key).await);
        Ok(PreparedWrite {
            key,
            op: PreparedOp::Insert(row),
        })
    }

    /// Acquire the row lock for an update or delete of `key_datums`.
    pub async fn prepare_mutate(
        &self,
        state: &mut WriteTransaction,
        key_datums: &[Datum],
        change: RowChange,
    ) -> TabletResult<PreparedWrite> {
        self.check_open()?;
        let schema = self.schema();
        if let RowChange::Update(updates) = &change {
            for ColumnUpdate { column_id, value } in updates {
                let (_, col) = schema.column_by_id(*column_id).ok_or_else(|| {
                    TracedTabletError::not_found("column", column_id)
                })?;
                schema.check_value(value, col)?;
            }
        }
        let key = schema.encode_key_datums(key_datums)?;
        state.locks.push(self.lock_manager.acquire(&key).await);
        Ok(PreparedWrite {
            key,
            op: PreparedOp::Mutate(change),
        })
    }

    /// Assign the transaction's timestamp and capture the current
    /// components. Must be called after the relevant row locks are held:
    /// acquiring the row lock before the timestamp is what keeps per-key
    /// timestamps monotonic.
    pub fn start_transaction(&self, state: &mut WriteTransaction) {
        assert!(state.txn.is_none(), "transaction already started");
        let guard = self.components.read();
        state.txn = Some(self.mvcc.begin());
        state.components = Some(guard.clone());
    }

    /// Replay variant of [`start_transaction`] at a fixed timestamp.
    ///
    /// [`start_transaction`]: Tablet::start_transaction
    pub fn start_transaction_at(
        &self,
        state: &mut WriteTransaction,
        ts: Timestamp,
    ) -> TabletResult<()> {
        assert!(state.txn.is_none(), "transaction already started");
        let guard = self.components.read();
        state.txn = Some(self.mvcc.begin_at(ts)?);
        state.components = Some(guard.clone());
        Ok(())
    }

    /// Route a prepared insert to exactly one destination under the captured
    /// components. `AlreadyPresent` if any rowset holds a live version.
    pub async fn apply_insert(
        &self,
        state: &WriteTransaction,
        prepared: &PreparedWrite,
    ) -> TabletResult<()> {
        let PreparedOp::Insert(row) = &prepared.op else {
            return Err(TracedTabletError::invalid_argument(
                "prepared write is not an insert",
            ));
        };
        let comps = state.components.as_ref().expect("transaction not started");
        let ts = state.txn.as_ref().expect("transaction not started").timestamp();

        let memrowset: Arc<dyn RowSet> = comps.memrowset.clone();
        let mut candidates = vec![memrowset];
        candidates.extend(comps.rowsets.probe(&prepared.key));
        // Every candidate is consulted: a ghost in one rowset must not
        // shadow a live version in another.
        let mut mem_ghost = None;
        for candidate in &candidates {
            match candidate.check_present(&prepared.key).await? {
                KeyPresence::Absent => {}
                KeyPresence::Live => {
                    return Err(TracedTabletError::already_present(format!(
                        "key {:?}",
                        prepared.key
                    )))
                }
                KeyPresence::Deleted => {
                    if candidate.as_mem().is_some() && mem_ghost.is_none() {
                        mem_ghost = Some(candidate.clone());
                    }
                }
            }
        }
        if let Some(candidate) = mem_ghost {
            // Reinsert in place: a MemRowSet chain always carries the
            // schema the row was validated against.
            return candidate
                .mutate(&prepared.key, ts, &RowChange::Insert(row.clone()))
                .await;
        }
        // Either the key is new, or its ghost lives in a disk rowset
        // (possibly of an older schema). The new version starts a fresh
        // chain in the MemRowSet; at most one live version of the key
        // exists across the tablet either way, and scans merge past ghosts.
        comps.memrowset.insert(&prepared.key, row.clone(), ts)
    }

    /// Route a prepared update/delete to the rowset owning the key.
    pub async fn apply_mutate(
        &self,
        state: &WriteTransaction,
        prepared: &PreparedWrite,
    ) -> TabletResult<()> {
        let PreparedOp::Mutate(change) = &prepared.op else {
            return Err(TracedTabletError::invalid_argument(
                "prepared write is not a mutation",
            ));
        };
        let comps = state.components.as_ref().expect("transaction not started");
        let ts = state.txn.as_ref().expect("transaction not started").timestamp();

        let memrowset: Arc<dyn RowSet> = comps.memrowset.clone();
        let mut candidates = vec![memrowset];
        candidates.extend(comps.rowsets.probe(&prepared.key));
        // Route to the rowset holding the live version; ghosts elsewhere
        // are skipped.
        for candidate in &candidates {
            if candidate.check_present(&prepared.key).await? == KeyPresence::Live {
                return candidate.mutate(&prepared.key, ts, change).await;
            }
        }
        Err(TracedTabletError::not_found(
            "key",
            format!("{:?}", prepared.key),
        ))
    }

    /// Commit the transaction and release its row locks. Also used to abort
    /// after a failed apply: the timestamp is retired either way, and a
    /// failed apply wrote nothing.
    pub fn commit(&self, state: &mut WriteTransaction) {
        if let Some(txn) = state.txn.take() {
            self.mvcc.commit(txn);
        }
        state.locks.clear();
        state.components = None;
    }

    // Convenience single-row wrappers used heavily by tests.

    pub async fn insert(&self, row: Row) -> TabletResult<()> {
        let mut state = WriteTransaction::new();
        let prepared = self.prepare_insert(&mut state, row).await?;
        self.start_transaction(&mut state);
        let result = self.apply_insert(&state, &prepared).await;
        self.commit(&mut state);
        result
    }

    pub async fn mutate(&self, key_datums: &[Datum], change: RowChange) -> TabletResult<()> {
        let mut state = WriteTransaction::new();
        let prepared = self.prepare_mutate(&mut state, key_datums, change).await?;
        self.start_transaction(&mut state);
        let result = self.apply_mutate(&state, &prepared).await;
        self.commit(&mut state);
        result
    }

    pub async fn update(
        &self,
        key_datums: &[Datum],
        updates: impl IntoIterator<Item = (ColumnId, Datum)>,
    ) -> TabletResult<()> {
        self.mutate(key_datums, RowChange::update(updates)).await
    }

    pub async fn delete(&self, key_datums: &[Datum]) -> TabletResult<()> {
        self.mutate(key_datums, RowChange::Delete).await
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> MvccSnapshot {
        self.mvcc.snapshot()
    }

    /// Historical snapshot; waits until the safe timestamp reaches `ts`.
    pub async fn snapshot_at(&self, ts: Timestamp) -> MvccSnapshot {
        self.mvcc.snapshot_at(ts).await
    }

    /// An uninitialized iterator over `column_ids` at the current MVCC
    /// state; call [`TabletIterator::init`] to fix range and predicates.
    pub fn new_iterator(&self, column_ids: &[ColumnId]) -> TabletResult<TabletIterator> {
        let snapshot = self.mvcc.snapshot();
        self.new_iterator_at(column_ids, snapshot)
    }

    /// Iterator at a caller-supplied snapshot.
    pub fn new_iterator_at(
        &self,
        column_ids: &[ColumnId],
        snapshot: MvccSnapshot,
    ) -> TabletResult<TabletIterator> {
        self.check_open()?;
        let schema = self.schema();
        let projection = Projection::new(&schema, column_ids)?;
        // Components are captured after the snapshot: anything committed
        // before the snapshot is reachable from these (or any later)
        // components, so the iterator sees at least that.
        let components = self.capture_components();
        Ok(TabletIterator::new(components, snapshot, schema, projection))
    }

    /// Total number of live rows, by scanning at the current snapshot.
    pub async fn count_rows(&self) -> TabletResult<u64> {
        let schema = self.schema();
        let key_col = schema.column(0).id();
        let mut iter = self.new_iterator(&[key_col])?;
        iter.init(crate::iterator::ScanSpec::all()).await?;
        let mut count = 0u64;
        while let Some(block) = iter.next_block(1024).await? {
            count += block.len() as u64;
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Bytes held by the current MemRowSet.
    pub fn mem_rowset_size(&self) -> usize {
        self.capture_components().memrowset.mem_size()
    }

    /// Total mutable in-memory state: the MemRowSet plus every
    /// DeltaMemStore.
    pub fn mem_size(&self) -> usize {
        let comps = self.capture_components();
        comps.memrowset.mem_size()
            + comps
                .rowsets
                .iter()
                .map(|r| r.delta_mem_size())
                .sum::<usize>()
    }

    /// Bytes held by every DeltaMemStore.
    pub fn delta_mem_size(&self) -> usize {
        self.capture_components()
            .rowsets
            .iter()
            .map(|r| r.delta_mem_size())
            .sum()
    }

    pub fn on_disk_size(&self) -> u64 {
        self.capture_components()
            .rowsets
            .iter()
            .map(|r| r.on_disk_size())
            .sum()
    }

    pub fn num_rowsets(&self) -> usize {
        self.capture_components().rowsets.len()
    }

    /// Total delta files across all rowsets.
    pub fn num_delta_files(&self) -> usize {
        self.capture_components()
            .rowsets
            .iter()
            .map(|r| r.delta_file_count())
            .sum()
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        compaction_stats(&self.capture_components().rowsets)
    }

    pub fn debug_dump(&self) -> Vec<String> {
        let comps = self.capture_components();
        let mut lines = comps.memrowset.debug_dump();
        for rowset in comps.rowsets.iter() {
            lines.push(rowset.debug_name());
        }
        lines
    }

    pub async fn shutdown(&self) {
        info!("shutting down tablet");
        self.shutdown.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Maintenance: flush
    // ------------------------------------------------------------------

    /// Flush the current MemRowSet into a new DiskRowset. No-op when the
    /// MemRowSet is empty.
    pub async fn flush(&self) -> TabletResult<()> {
        let _flush_guard = self.rowsets_flush_lock.lock().await;
        self.flush_unlocked().await
    }

    async fn flush_unlocked(&self) -> TabletResult<()> {
        self.check_open()?;
        let old_mrs = {
            let mut comps = self.components.write();
            let old = comps.memrowset.clone();
            if old.is_empty() {
                return Ok(());
            }
            assert!(
                old.try_claim_compaction(),
                "current MemRowSet claimed by another operation"
            );
            let fresh = MemRowSet::new(
                self.next_mrs_id.fetch_add(1, Ordering::SeqCst),
                self.schema.read().clone(),
            );
            // The old MemRowSet joins the tree so reads and mutations keep
            // finding its rows while the flush writes them out.
            let old_dyn: Arc<dyn RowSet> = old.clone();
            let tree = comps.rowsets.replace(&[], vec![old_dyn]);
            *comps = TabletComponents::new(fresh, Arc::new(tree));
            old
        };
        probe::fire(probe::POST_SWAP_NEW_MRS);
        info!(mrs = old_mrs.id(), rows = old_mrs.entry_count(), "flush start");

        let old_dyn: Arc<dyn RowSet> = old_mrs.clone();
        let inputs = RowSetsInCompaction::from_claimed(vec![old_dyn]);
        self.do_compaction_or_flush(inputs, Some(old_mrs.id())).await
    }

    // ------------------------------------------------------------------
    // Maintenance: compaction
    // ------------------------------------------------------------------

    /// Run one merge compaction per the policy. No-op when the policy finds
    /// nothing profitable.
    pub async fn compact(&self, flags: CompactFlags) -> TabletResult<()> {
        self.check_open()?;
        let picked = {
            let _select = self.compact_select_lock.lock().await;
            let comps = self.capture_components();
            pick_rowsets(
                &comps.rowsets,
                self.options.compaction_budget_bytes,
                flags,
            )
        };
        let Some(inputs) = picked else {
            return Ok(());
        };
        info!(inputs = inputs.len(), "merge compaction start");
        self.do_compaction_or_flush(inputs, None).await
    }

    /// Shared flush/compaction pipeline: read the claimed inputs at an MVCC
    /// snapshot, write the merged output, and install it via the
    /// DuplicatingRowSet protocol.
    async fn do_compaction_or_flush(
        &self,
        inputs: RowSetsInCompaction,
        mrs_flushed: Option<u64>,
    ) -> TabletResult<()> {
        let snapshot = self.maintenance_snapshot().await;
        probe::fire(probe::POST_TAKE_MVCC_SNAPSHOT);

        let schema = self.schema();
        let mut cis = Vec::with_capacity(inputs.len());
        let mut expected_rows = 0usize;
        for rowset in inputs.rowsets() {
            if let Some(mrs) = rowset.as_mem() {
                let rows = mrs.snapshot_rows(&snapshot);
                expected_rows += rows.len();
                cis.push(CompactionInput::from_mem(rows));
            } else {
                expected_rows += rowset
                    .as_disk()
                    .expect("compaction input neither mem nor disk")
                    .row_count() as usize;
                cis.push(CompactionInput::from_disk(
                    rowset.clone(),
                    snapshot.clone(),
                    &schema,
                ));
            }
        }

        let rowset_id = self.next_rowset_id.fetch_add(1, Ordering::SeqCst);
        let dir = self.options.path.join(rowset_dir_name(rowset_id));
        let mut writer =
            RowSetWriter::create(dir.clone(), schema.as_ref(), &self.options, expected_rows)
                .await?;
        if let Err(e) = merge_compaction_inputs(cis, &mut writer).await {
            // Abandon the output; inputs stay installed and claimed-released.
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        if writer.row_count() == 0 {
            // Everything was deleted: the inputs are replaced by nothing.
            tokio::fs::remove_dir_all(&dir).await?;
            return self.install_output(inputs, None, &snapshot, mrs_flushed).await;
        }

        let written = writer.finish().await?;
        probe::fire(probe::POST_WRITE_SNAPSHOT);

        let output = Arc::new(
            DiskRowset::open(
                rowset_id,
                written.dir,
                schema,
                written.min_key,
                written.max_key,
                self.block_cache.clone(),
                self.options.enable_fsync,
            )
            .await?,
        );
        for (row_id, delete_ts) in &written.seeded_deletes {
            output
                .tracker()
                .update(*row_id, *delete_ts, RowChange::Delete);
        }
        self.install_output(inputs, Some(output), &snapshot, mrs_flushed)
            .await
    }

    /// Steps 4–8 of the swap protocol: duplicating install, MVCC catch-up,
    /// final swap, metadata, retirement.
    async fn install_output(
        &self,
        inputs: RowSetsInCompaction,
        output: Option<Arc<DiskRowset>>,
        snapshot: &MvccSnapshot,
        mrs_flushed: Option<u64>,
    ) -> TabletResult<()> {
        let input_dyn: Vec<Arc<dyn RowSet>> = inputs.rowsets().to_vec();

        if let Some(output) = &output {
            let duplicating: Arc<dyn RowSet> =
                Arc::new(DuplicatingRowSet::new(input_dyn.clone(), output.clone()));
            {
                let mut comps = self.components.write();
                let tree = comps.rowsets.replace(&input_dyn, vec![duplicating.clone()]);
                let memrowset = comps.memrowset.clone();
                *comps = TabletComponents::new(memrowset, Arc::new(tree));
            }
            probe::fire(probe::POST_SWAP_IN_DUPLICATING_ROWSET);

            // Wait out every transaction that might still apply against
            // pre-duplicating components, then replay what the snapshot
            // missed.
            let fence = self.clock.now();
            self.wait_all_committed_below(fence).await;
            for input in &input_dyn {
                self.reupdate_missed_deltas(input, output, snapshot).await?;
            }
            probe::fire(probe::POST_REUPDATE_MISSED_DELTAS);

            {
                let mut comps = self.components.write();
                let output_dyn: Arc<dyn RowSet> = output.clone();
                let tree = comps.rowsets.replace(&[duplicating], vec![output_dyn]);
                let memrowset = comps.memrowset.clone();
                *comps = TabletComponents::new(memrowset, Arc::new(tree));
            }
            probe::fire(probe::POST_SWAP_NEW_ROWSET);
        } else {
            let mut comps = self.components.write();
            let tree = comps.rowsets.replace(&input_dyn, vec![]);
            let memrowset = comps.memrowset.clone();
            *comps = TabletComponents::new(memrowset, Arc::new(tree));
        }

        // Inputs are no longer reachable from fresh components; a frozen
        // MemRowSet may still serve readers that pinned older ones.
        for input in &input_dyn {
            if let Some(mrs) = input.as_mem() {
                mrs.freeze();
            }
        }

        let mut entries = Vec::new();
        if let Some(output) = &output {
            entries.push(ManifestOperation::AddRowSet(AddRowSetEntry {
                rowset_id: output.id(),
                schema: output.schema().clone(),
                min_key: output.min_key(),
                max_key: output.max_key(),
                row_count: output.row_count(),
            }));
        }
        for input in &input_dyn {
            if let Some(drs) = input.as_disk() {
                entries.push(ManifestOperation::DeleteRowSet {
                    rowset_id: drs.id(),
                });
            }
        }
        if let Some(mrs_id) = mrs_flushed {
            entries.push(ManifestOperation::MrsFlushed { mrs_id });
        }
        self.manifest.lock().await.append(entries).await?;

        {
            let mut retired = self.retired.lock();
            for input in input_dyn {
                if input.as_disk().is_some() {
                    retired.push(input);
                }
            }
        }
        drop(inputs);
        self.vacuum().await?;
        info!(
            output = ?output.as_ref().map(|o| o.id()),
            "flush/compaction installed"
        );
        Ok(())
    }

    async fn wait_all_committed_below(&self, bound: Timestamp) {
        if bound > Timestamp::MIN {
            self.mvcc
                .wait_until_safe(Timestamp::from_raw(bound.as_raw() - 1))
                .await;
        }
    }

    /// An exclusion-free snapshot for flush/compaction input scans. Takes a
    /// fresh bound and waits until every transaction below it has
    /// committed, so the scan sees the complete history below the bound and
    /// the catch-up pass only has to replay mutations at or above it.
    async fn maintenance_snapshot(&self) -> MvccSnapshot {
        let bound = self.clock.now();
        self.wait_all_committed_below(bound).await;
        MvccSnapshot::committed_before(bound)
    }

    /// Re-apply every input mutation the maintenance snapshot missed onto
    /// the output. Keyed by `(row_id, ts)`, so mutations that also arrived
    /// through the DuplicatingRowSet mirror are applied once.
    async fn reupdate_missed_deltas(
        &self,
        input: &Arc<dyn RowSet>,
        output: &Arc<DiskRowset>,
        snapshot: &MvccSnapshot,
    ) -> TabletResult<()> {
        let mut missed: Vec<(Vec<u8>, Mutation)> = Vec::new();
        if let Some(mrs) = input.as_mem() {
            for (key, muts) in mrs.missed_mutations(snapshot) {
                for m in muts {
                    missed.push((key.clone(), m));
                }
            }
        } else if let Some(drs) = input.as_disk() {
            for (row_id, m) in drs.tracker().mutations_not_visible(snapshot) {
                let key = drs.encoded_key_at(row_id).await?;
                missed.push((key, m));
            }
        }

        for (key, mutation) in missed {
            // Every input key has a base row in the output (ghosts are
            // carried over), so the probe cannot miss.
            if !output.apply_raw(&key, mutation.ts, &mutation.change).await? {
                warn!("catch-up mutation for key {:?} found no output row", key);
            }
        }
        Ok(())
    }

    /// Delete the storage of retired rowsets nothing references anymore.
    /// Returns the ids vacuumed.
    pub async fn vacuum(&self) -> TabletResult<Vec<u64>> {
        let ready: Vec<Arc<dyn RowSet>> = {
            let mut retired = self.retired.lock();
            let (ready, keep): (Vec<_>, Vec<_>) = retired
                .drain(..)
                .partition(|r| Arc::strong_count(r) == 1);
            *retired = keep;
            ready
        };
        let mut vacuumed = Vec::with_capacity(ready.len());
        for rowset in ready {
            let drs = rowset.as_disk().expect("only disk rowsets are retired");
            info!(rowset = drs.id(), "vacuum");
            tokio::fs::remove_dir_all(drs.dir()).await?;
            vacuumed.push(drs.id());
        }
        Ok(vacuumed)
    }

    // ------------------------------------------------------------------
    // Maintenance: delta housekeeping
    // ------------------------------------------------------------------

    /// Flush the largest DeltaMemStore to a delta file. Returns the rowset
    /// id flushed, if any qualified.
    pub async fn flush_biggest_dms(&self) -> TabletResult<Option<u64>> {
        self.check_open()?;
        let comps = self.capture_components();
        let best = comps
            .rowsets
            .iter()
            .filter(|r| r.as_disk().is_some())
            .max_by_key(|r| r.delta_mem_size())
            .cloned();
        let Some(rowset) = best else { return Ok(None) };
        if rowset.delta_mem_size() == 0 {
            return Ok(None);
        }
        let drs = rowset.as_disk().unwrap();
        drs.tracker().flush_dms().await?;
        Ok(Some(drs.id()))
    }

    /// Minor-compact the rowset with the most delta files. Returns the
    /// rowset id compacted, if any had at least two files.
    pub async fn minor_compact_worst_deltas(&self) -> TabletResult<Option<u64>> {
        self.check_open()?;
        let comps = self.capture_components();
        let worst = comps
            .rowsets
            .iter()
            .filter(|r| r.as_disk().is_some() && r.delta_file_count() >= 2)
            .max_by_key(|r| r.delta_file_count())
            .cloned();
        let Some(rowset) = worst else { return Ok(None) };
        let drs = rowset.as_disk().unwrap();
        drs.tracker().minor_compact().await?;
        Ok(Some(drs.id()))
    }

    /// Fold the deltas of `column_ids` into the base data of one rowset,
    /// rewriting it through the usual swap protocol. Deltas touching other
    /// columns are carried over; deletes and reinserts always are.
    pub async fn major_delta_compact(
        &self,
        rowset_id: u64,
        column_ids: &[ColumnId],
    ) -> TabletResult<()> {
        self.check_open()?;
        let comps = self.capture_components();
        let input = comps
            .rowsets
            .iter()
            .find(|r| r.as_disk().map(|d| d.id()) == Some(rowset_id))
            .cloned()
            .ok_or_else(|| TracedTabletError::not_found("rowset", rowset_id))?;
        if !input.try_claim_compaction() {
            return Err(TracedTabletError::invalid_argument(format!(
                "rowset {rowset_id} is busy with another flush or compaction"
            )));
        }
        let inputs = RowSetsInCompaction::from_claimed(vec![input.clone()]);
        let drs = input.as_disk().unwrap();

        let snapshot = self.maintenance_snapshot().await;
        probe::fire(probe::POST_TAKE_MVCC_SNAPSHOT);

        let schema = self.schema();
        let out_id = self.next_rowset_id.fetch_add(1, Ordering::SeqCst);
        let dir = self.options.path.join(rowset_dir_name(out_id));
        let mut writer =
            RowSetWriter::create(
                dir.clone(),
                schema.as_ref(),
                &self.options,
                drs.row_count() as usize,
            )
            .await?;

        // Retained (unfolded) deltas per output row id.
        let mut retained: Vec<(u32, Mutation)> = Vec::new();
        let out_projection = Projection::full(&schema);
        let out_mapping = out_projection.resolve(drs.schema());
        for row_id in 0..drs.row_count() {
            let base = drs.base_row(row_id).await?;
            let muts = drs.tracker().mutations_for_row(row_id);

            let mut values = base;
            let mut live = true;
            let mut delete_ts = None;
            let mut row_retained: Vec<Mutation> = Vec::new();
            for m in &muts {
                if !snapshot.is_visible(m.ts) {
                    continue;
                }
                match &m.change {
                    RowChange::Insert(row) => {
                        values = row.clone();
                        live = true;
                        delete_ts = None;
                    }
                    RowChange::Delete => {
                        live = false;
                        delete_ts = Some(m.ts);
                    }
                    RowChange::Update(updates) => {
                        let mut unfolded = Vec::new();
                        for update in updates.iter() {
                            if column_ids.contains(&update.column_id) {
                                if let Some(idx) = drs.schema().index_of(update.column_id) {
                                    values[idx] = update.value.clone();
                                }
                            } else {
                                unfolded.push(update.clone());
                            }
                        }
                        if !unfolded.is_empty() {
                            row_retained.push(Mutation {
                                ts: m.ts,
                                change: RowChange::Update(unfolded.into_iter().collect()),
                            });
                        }
                    }
                }
            }
            let key = drs.encoded_key_at(row_id).await?;
            let out_row_id = writer
                .append(&SnapshotRow {
                    key,
                    values: out_projection.project_row(&out_mapping, &values),
                    live,
                    delete_ts,
                })
                .await?;
            for m in row_retained {
                retained.push((out_row_id, m));
            }
        }

        if writer.row_count() == 0 {
            tokio::fs::remove_dir_all(&dir).await?;
            return self.install_output(inputs, None, &snapshot, None).await;
        }
        let written = writer.finish().await?;
        probe::fire(probe::POST_WRITE_SNAPSHOT);

        let output = Arc::new(
            DiskRowset::open(
                out_id,
                written.dir,
                schema,
                written.min_key,
                written.max_key,
                self.block_cache.clone(),
                self.options.enable_fsync,
            )
            .await?,
        );
        for (row_id, delete_ts) in &written.seeded_deletes {
            output
                .tracker()
                .update(*row_id, *delete_ts, RowChange::Delete);
        }
        for (row_id, m) in retained {
            output.tracker().update(row_id, m.ts, m.change);
        }
        info!(
            input = rowset_id,
            output = out_id,
            columns = ?column_ids,
            "major delta compaction built output"
        );
        self.install_output(inputs, Some(output), &snapshot, None)
            .await
    }

    // ------------------------------------------------------------------
    // Schema changes
    // ------------------------------------------------------------------

    /// Swap in a new schema. Drains in-flight writes by flushing the
    /// MemRowSet and every DeltaMemStore first; applying the identical
    /// schema twice is a no-op.
    pub async fn alter_schema(&self, new_schema: Schema) -> TabletResult<()> {
        self.check_open()?;
        {
            let current = self.schema.read();
            if **current == new_schema {
                return Ok(());
            }
            if !current.key_compatible_with(&new_schema) {
                return Err(TracedTabletError::invalid_argument(
                    "alter changes the primary key",
                ));
            }
        }

        let _flush_guard = self.rowsets_flush_lock.lock().await;
        let new_schema = Arc::new(new_schema);
        loop {
            self.flush_unlocked().await?;

            // Flush every DMS so no in-memory delta predates the new schema.
            let comps = self.capture_components();
            for rowset in comps.rowsets.iter() {
                if let Some(drs) = rowset.as_disk() {
                    drs.tracker().flush_dms().await?;
                }
            }

            let mut comps = self.components.write();
            if !comps.memrowset.is_empty() {
                // A writer slipped a row in since the flush; drain again.
                continue;
            }
            let fresh = MemRowSet::new(
                self.next_mrs_id.fetch_add(1, Ordering::SeqCst),
                new_schema.clone(),
            );
            let rowsets = comps.rowsets.clone();
            *comps = TabletComponents::new(fresh, rowsets);
            *self.schema.write() = new_schema.clone();
            break;
        }
        self.manifest
            .lock()
            .await
            .append(vec![ManifestOperation::SchemaChange {
                schema: (*new_schema).clone(),
            }])
            .await?;
        info!("schema change applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::schema::{ColumnDesc, DataType};

    fn test_schema() -> Schema {
        Schema::new(
            vec![
                ColumnDesc::new(0, "k", DataType::Int64, false),
                ColumnDesc::new(1, "v", DataType::Int32, true),
            ],
            1,
        )
        .unwrap()
    }

    fn row(k: i64, v: i32) -> Row {
        vec![Datum::Int64(k), Datum::Int32(v)]
    }

    async fn test_tablet(dir: &tempfile::TempDir) -> Tablet {
        Tablet::create(
            TabletOptions::default_for_test(dir.path().join("t")),
            test_schema(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_prepare_apply_commit_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let tablet = test_tablet(&dir).await;

        let mut state = WriteTransaction::new();
        let ins = tablet.prepare_insert(&mut state, row(1, 10)).await.unwrap();
        tablet.start_transaction(&mut state);
        let ts1 = state.timestamp().unwrap();
        tablet.apply_insert(&state, &ins).await.unwrap();
        tablet.commit(&mut state);

        let mut state = WriteTransaction::new();
        let upd = tablet
            .prepare_mutate(
                &mut state,
                &[Datum::Int64(1)],
                RowChange::update([(1, Datum::Int32(20))]),
            )
            .await
            .unwrap();
        tablet.start_transaction(&mut state);
        assert!(state.timestamp().unwrap() > ts1);
        tablet.apply_mutate(&state, &upd).await.unwrap();
        tablet.commit(&mut state);

        assert_eq!(tablet.count_rows().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_start_transaction_at_replays() {
        let dir = tempfile::tempdir().unwrap();
        let tablet = test_tablet(&dir).await;

        let replay_ts = Timestamp::from_raw(tablet.mvcc().clock().now().as_raw() + 1000);
        let mut state = WriteTransaction::new();
        let ins = tablet.prepare_insert(&mut state, row(5, 1)).await.unwrap();
        tablet.start_transaction_at(&mut state, replay_ts).unwrap();
        tablet.apply_insert(&state, &ins).await.unwrap();
        tablet.commit(&mut state);

        // A stale replay timestamp is rejected.
        let mut state = WriteTransaction::new();
        let _ins = tablet.prepare_insert(&mut state, row(6, 1)).await.unwrap();
        assert!(tablet.start_transaction_at(&mut state, replay_ts).is_err());
    }

    #[tokio::test]
    async fn test_mutate_missing_key_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tablet = test_tablet(&dir).await;
        let err = tablet
            .update(&[Datum::Int64(404)], [(1, Datum::Int32(1))])
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // Validation failures surface as InvalidArgument-family errors
        // before any lock is taken.
        assert!(tablet
            .update(&[Datum::Int32(1)], [(1, Datum::Int32(1))])
            .await
            .is_err());
        assert!(tablet
            .insert(vec![Datum::Int64(1)])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_flush_fires_probes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let tablet = test_tablet(&dir).await;
        for k in 0..8 {
            tablet.insert(row(k, 0)).await.unwrap();
        }

        let fired = Arc::new(AtomicUsize::new(0));
        let names = [
            probe::POST_SWAP_NEW_MRS,
            probe::POST_TAKE_MVCC_SNAPSHOT,
            probe::POST_WRITE_SNAPSHOT,
            probe::POST_SWAP_IN_DUPLICATING_ROWSET,
            probe::POST_REUPDATE_MISSED_DELTAS,
            probe::POST_SWAP_NEW_ROWSET,
        ];
        for (idx, name) in names.iter().enumerate() {
            let fired = fired.clone();
            probe::set(*name, move || {
                // Each hook observes every earlier hook already fired.
                assert_eq!(fired.fetch_add(1, Ordering::SeqCst), idx);
            });
        }
        tablet.flush().await.unwrap();
        for name in names {
            probe::clear(name);
        }
        assert_eq!(fired.load(Ordering::SeqCst), names.len());
        assert_eq!(tablet.num_rowsets(), 1);
    }
}
