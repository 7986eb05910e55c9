//! RowSets: the storage units routed to by the tablet.
//!
//! A rowset owns a contiguous set of keys and all their versions. The
//! in-memory [`MemRowSet`](crate::memrowset::MemRowSet) and the on-disk
//! [`DiskRowset`] both implement [`RowSet`]; a [`DuplicatingRowSet`] bridges
//! inputs and output while a flush or compaction swaps storage underneath
//! live readers and writers.

mod disk_rowset;
mod duplicating;
mod writer;

pub use disk_rowset::DiskRowset;
pub use duplicating::DuplicatingRowSet;
pub use writer::{RowSetWriter, SnapshotRow, WrittenRowSet};

use async_trait::async_trait;

use crate::clock::Timestamp;
use crate::error::TabletResult;
use crate::iterator::{RowVersionIterator, ScanRange};
use crate::mutation::RowChange;
use crate::mvcc::MvccSnapshot;
use crate::schema::Schema;

/// Result of a latest-state presence probe for one key.
///
/// Presence is evaluated over every mutation in the rowset regardless of
/// snapshot: row locks serialize writers on a key, so the latest chain state
/// is authoritative for conflict checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPresence {
    Absent,
    Live,
    /// The key has an entry whose latest state is deleted; an insert of the
    /// same key must be routed here as a reinsert.
    Deleted,
}

#[async_trait]
pub trait RowSet: Send + Sync {
    /// Identifier for logs and debugging.
    fn debug_name(&self) -> String;

    /// Smallest encoded key ever stored in this rowset.
    fn min_key(&self) -> Vec<u8>;

    /// Largest encoded key ever stored in this rowset.
    fn max_key(&self) -> Vec<u8>;

    /// The schema the rowset's rows are laid out in (its creation schema).
    fn schema(&self) -> &Schema;

    async fn check_present(&self, key: &[u8]) -> TabletResult<KeyPresence>;

    /// Append a mutation to an existing key. `NotFound` if the key has no
    /// entry here, or if it is deleted and `change` is not a reinsert.
    async fn mutate(&self, key: &[u8], ts: Timestamp, change: &RowChange) -> TabletResult<()>;

    /// Ordered stream of row versions visible in `snapshot`, materialized
    /// into `tablet_schema`. The iterator holds its own reference to the
    /// rowset, keeping its storage alive past component swaps.
    async fn new_iterator(
        self: std::sync::Arc<Self>,
        tablet_schema: &std::sync::Arc<Schema>,
        snapshot: &MvccSnapshot,
        range: &ScanRange,
    ) -> TabletResult<Box<dyn RowVersionIterator>>;

    /// Bytes of mutable in-memory state (MRS entries or DMS deltas).
    fn delta_mem_size(&self) -> usize;

    fn delta_file_count(&self) -> usize;

    fn on_disk_size(&self) -> u64;

    /// Try to claim this rowset for a compaction or flush. At most one
    /// claimant succeeds until [`release_compaction_claim`] is called.
    ///
    /// [`release_compaction_claim`]: RowSet::release_compaction_claim
    fn try_claim_compaction(&self) -> bool;

    fn release_compaction_claim(&self);

    fn as_disk(&self) -> Option<&DiskRowset> {
        None
    }

    fn as_mem(&self) -> Option<&crate::memrowset::MemRowSet> {
        None
    }
}
