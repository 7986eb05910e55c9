use std::path::PathBuf;

/// Options for a [`Tablet`](crate::Tablet).
#[derive(Clone, Debug)]
pub struct TabletOptions {
    /// Root directory of the tablet.
    pub path: PathBuf,

    /// Capacity of the block cache, in number of cached blocks.
    pub block_cache_capacity: u64,

    /// Number of rows per column-file block.
    pub block_rows: usize,

    /// Target false-positive rate for per-rowset key bloom filters.
    pub bloom_fp_rate: f64,

    /// Whether to fsync the manifest after each append.
    pub enable_fsync: bool,

    /// Upper bound on the combined on-disk size of rowsets merged by one
    /// compaction.
    pub compaction_budget_bytes: u64,

    /// A DeltaMemStore at or above this size is a candidate for
    /// `flush_biggest_dms`.
    pub dms_flush_threshold: usize,
}

impl TabletOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_capacity: 4096,
            block_rows: 1024,
            bloom_fp_rate: 0.01,
            enable_fsync: true,
            compaction_budget_bytes: 128 << 20,
            dms_flush_threshold: 8 << 20,
        }
    }

    pub fn default_for_test(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_capacity: 64,
            // Small blocks so that unit tests exercise multi-block files.
            block_rows: 16,
            bloom_fp_rate: 0.01,
            enable_fsync: false,
            compaction_budget_bytes: 4 << 20,
            dms_flush_threshold: 1024,
        }
    }
}
