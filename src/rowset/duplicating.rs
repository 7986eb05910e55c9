//! The transient rowset installed while a flush or compaction swaps
//! storage.
//!
//! While installed, presence checks and mutation results are decided
//! against the inputs (which are complete); every mutation is additionally
//! mirrored into the output's delta tracker so that, once the inputs are
//! dropped, nothing written during the swap window is lost. Readers iterate
//! the inputs: the output may still be missing catch-up deltas.
//!
//! A DuplicatingRowSet holds its compaction claim permanently, so it can
//! never itself be selected as a compaction input.

use std::sync::Arc;

use async_trait::async_trait;

use super::{DiskRowset, KeyPresence, RowSet};
use crate::clock::Timestamp;
use crate::error::TabletResult;
use crate::iterator::{MergeIterator, RowVersionIterator, ScanRange, VersionedRow};
use crate::mutation::RowChange;
use crate::mvcc::MvccSnapshot;
use crate::schema::Schema;

pub struct DuplicatingRowSet {
    inputs: Vec<Arc<dyn RowSet>>,
    output: Arc<DiskRowset>,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
}

impl DuplicatingRowSet {
    pub fn new(inputs: Vec<Arc<dyn RowSet>>, output: Arc<DiskRowset>) -> DuplicatingRowSet {
        assert!(!inputs.is_empty());
        let min_key = inputs.iter().map(|r| r.min_key()).min().unwrap();
        let max_key = inputs.iter().map(|r| r.max_key()).max().unwrap();
        DuplicatingRowSet {
            inputs,
            output,
            min_key,
            max_key,
        }
    }

    pub fn output(&self) -> &Arc<DiskRowset> {
        &self.output
    }

    pub fn inputs(&self) -> &[Arc<dyn RowSet>] {
        &self.inputs
    }
}

#[async_trait]
impl RowSet for DuplicatingRowSet {
    fn debug_name(&self) -> String {
        format!(
            "duplicating({} -> {})",
            self.inputs
                .iter()
                .map(|r| r.debug_name())
                .collect::<Vec<_>>()
                .join("+"),
            self.output.debug_name()
        )
    }

    fn min_key(&self) -> Vec<u8> {
        self.min_key.clone()
    }

    fn max_key(&self) -> Vec<u8> {
        self.max_key.clone()
    }

    fn schema(&self) -> &Schema {
        self.output.schema()
    }

    async fn check_present(&self, key: &[u8]) -> TabletResult<KeyPresence> {
        // A live version anywhere wins over a ghost elsewhere.
        let mut presence = KeyPresence::Absent;
        for input in &self.inputs {
            match input.check_present(key).await? {
                KeyPresence::Live => return Ok(KeyPresence::Live),
                KeyPresence::Deleted => presence = KeyPresence::Deleted,
                KeyPresence::Absent => {}
            }
        }
        Ok(presence)
    }

    async fn mutate(&self, key: &[u8], ts: Timestamp, change: &RowChange) -> TabletResult<()> {
        let mut result = None;
        for input in &self.inputs {
            // Route to the input holding the live version; a ghost of the
            // key in a sibling input must not swallow the mutation.
            if input.check_present(key).await? == KeyPresence::Live {
                result = Some(input.mutate(key, ts, change).await);
                break;
            }
        }
        let result = result.unwrap_or_else(|| {
            Err(crate::error::TracedTabletError::not_found(
                "key",
                format!("{:?}", key),
            ))
        })?;

        // Mirror to the output unconditionally; the catch-up pass applies
        // the same (row_id, ts) keyed deltas, so double application is
        // harmless. Keys dropped from the output (clean ghosts) are the
        // caller's concern only for reinserts, which route through the
        // tablet's insert path.
        self.output.apply_raw(key, ts, change).await?;
        Ok(result)
    }

    async fn new_iterator(
        self: Arc<Self>,
        tablet_schema: &Arc<Schema>,
        snapshot: &MvccSnapshot,
        range: &ScanRange,
    ) -> TabletResult<Box<dyn RowVersionIterator>> {
        // Read from the inputs: the output may still lack catch-up deltas.
        let mut iters = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            iters.push(
                input
                    .clone()
                    .new_iterator(tablet_schema, snapshot, range)
                    .await?,
            );
        }
        Ok(Box::new(MergeIterator::new(iters)))
    }

    fn delta_mem_size(&self) -> usize {
        self.inputs.iter().map(|r| r.delta_mem_size()).sum()
    }

    fn delta_file_count(&self) -> usize {
        self.inputs.iter().map(|r| r.delta_file_count()).sum()
    }

    fn on_disk_size(&self) -> u64 {
        self.output.on_disk_size()
    }

    fn try_claim_compaction(&self) -> bool {
        // Permanently claimed; never a compaction input.
        false
    }

    fn release_compaction_claim(&self) {}
}
