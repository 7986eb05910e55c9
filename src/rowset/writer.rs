//! Writes a new DiskRowset directory from a key-ordered row stream.

use std::path::PathBuf;

use crate::bloom::BloomFilterBuilder;
use crate::cfile::CFileWriter;
use crate::clock::Timestamp;
use crate::error::{TabletResult, TracedTabletError};
use crate::options::TabletOptions;
use crate::schema::{Row, Schema};

pub const BLOOM_FILE_NAME: &str = "bloom";

pub fn cfile_name(column_id: u32) -> String {
    format!("col_{column_id}.cfile")
}

/// One key's materialized state at a maintenance snapshot.
///
/// Flush and compaction write ghost rows (`live == false`) too when their
/// history is still needed; the delete that killed them is re-seeded into
/// the output's delta tracker at its original timestamp.
#[derive(Clone, Debug)]
pub struct SnapshotRow {
    pub key: Vec<u8>,
    pub values: Row,
    pub live: bool,
    pub delete_ts: Option<Timestamp>,
}

/// Everything the tablet needs to open and register a freshly written
/// rowset.
#[derive(Debug)]
pub struct WrittenRowSet {
    pub dir: PathBuf,
    pub row_count: u32,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub on_disk_size: u64,
    /// `(row_id, delete_ts)` of ghost rows to seed into the new tracker.
    pub seeded_deletes: Vec<(u32, Timestamp)>,
}

pub struct RowSetWriter {
    dir: PathBuf,
    writers: Vec<CFileWriter>,
    bloom: BloomFilterBuilder,
    fsync: bool,
    row_count: u32,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
    seeded_deletes: Vec<(u32, Timestamp)>,
}

impl RowSetWriter {
    pub async fn create(
        dir: PathBuf,
        schema: &Schema,
        options: &TabletOptions,
        expected_rows: usize,
    ) -> TabletResult<RowSetWriter> {
        tokio::fs::create_dir_all(&dir).await?;
        let mut writers = Vec::with_capacity(schema.num_columns());
        for (idx, col) in schema.columns().iter().enumerate() {
            writers.push(
                CFileWriter::create(
                    dir.join(cfile_name(col.id())),
                    col.datatype(),
                    options.block_rows,
                    idx == 0,
                    options.enable_fsync,
                )
                .await?,
            );
        }
        Ok(RowSetWriter {
            dir,
            writers,
            bloom: BloomFilterBuilder::new(expected_rows, options.bloom_fp_rate),
            fsync: options.enable_fsync,
            row_count: 0,
            min_key: Vec::new(),
            max_key: Vec::new(),
            seeded_deletes: Vec::new(),
        })
    }

    /// Append the next row. Rows must arrive in strictly ascending key
    /// order; the assigned row id is returned.
    pub async fn append(&mut self, row: &SnapshotRow) -> TabletResult<u32> {
        if !self.max_key.is_empty() && row.key <= self.max_key {
            return Err(TracedTabletError::corruption(
                "rowset writer fed out-of-order keys",
            ));
        }
        for (writer, datum) in self.writers.iter_mut().zip(&row.values) {
            writer.append(datum.clone(), &row.key).await?;
        }
        self.bloom.insert(&row.key);
        if self.min_key.is_empty() {
            self.min_key = row.key.clone();
        }
        self.max_key = row.key.clone();
        let row_id = self.row_count;
        self.row_count += 1;
        if !row.live {
            let delete_ts = row
                .delete_ts
                .expect("ghost snapshot row without a delete timestamp");
            self.seeded_deletes.push((row_id, delete_ts));
        }
        Ok(row_id)
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub async fn finish(self) -> TabletResult<WrittenRowSet> {
        let mut on_disk_size = 0;
        for writer in self.writers {
            on_disk_size += writer.finish().await?;
        }
        let bloom = self.bloom.finish();
        bloom.write_to(self.dir.join(BLOOM_FILE_NAME)).await?;
        if self.fsync {
            // Make the directory entries durable too.
            let dir = tokio::fs::File::open(&self.dir).await?;
            dir.sync_all().await?;
        }
        Ok(WrittenRowSet {
            dir: self.dir,
            row_count: self.row_count,
            min_key: self.min_key,
            max_key: self.max_key,
            on_disk_size,
            seeded_deletes: self.seeded_deletes,
        })
    }
}
