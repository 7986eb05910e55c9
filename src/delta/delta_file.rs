//! Immutable on-disk delta files.
//!
//! A delta file is a sequence of length-delimited [`DeltaRecord`] messages
//! sorted by `(row_id, timestamp)`, closed by a checksummed footer:
//!
//! ```plain
//! | record | ... | record | magic (4B) | record count (8B) | crc32 (8B) |
//! ```

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut};
use futures::pin_mut;
use prost::Message;
use tokio::io::AsyncWriteExt;

use crate::clock::Timestamp;
use crate::error::{TabletResult, TracedTabletError};
use crate::mutation::{Mutation, RowChange};
use crate::proto::DeltaRecord;

const DELTA_MAGIC: u32 = 0xDE17_AF11;
const FOOTER_SIZE: usize = 4 + 8 + 8;

/// A fully-loaded immutable delta file.
pub struct DeltaFile {
    id: u64,
    path: PathBuf,
    /// Sorted by `(row_id, ts)`.
    records: Vec<(u32, Timestamp, RowChange)>,
    on_disk_size: u64,
}

impl DeltaFile {
    /// Write `records` (already sorted by `(row_id, ts)`) to `path` and
    /// return the file size.
    pub async fn write_records(
        path: impl AsRef<Path>,
        records: &[(u32, Timestamp, RowChange)],
        fsync: bool,
    ) -> TabletResult<u64> {
        debug_assert!(records.windows(2).all(|w| (w[0].0, w[0].1) < (w[1].0, w[1].1)));
        let mut data = Vec::new();
        for (row_id, ts, change) in records {
            let record = DeltaRecord {
                row_id: *row_id,
                timestamp: ts.as_raw(),
                change: change.to_bytes(),
            };
            record.encode_length_delimited(&mut data)?;
        }
        let checksum = crc32fast::hash(&data) as u64;
        data.put_u32(DELTA_MAGIC);
        data.put_u64(records.len() as u64);
        data.put_u64(checksum);

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .await?;
        pin_mut!(file);
        file.write_all(&data).await?;
        if fsync {
            file.sync_all().await?;
        }
        Ok(data.len() as u64)
    }

    pub async fn open(id: u64, path: impl AsRef<Path>) -> TabletResult<DeltaFile> {
        let path = path.as_ref().to_path_buf();
        let data = tokio::fs::read(&path).await?;
        if data.len() < FOOTER_SIZE {
            return Err(TracedTabletError::corruption(format!(
                "delta file {} too short",
                path.display()
            )));
        }
        let (body, mut footer) = data.split_at(data.len() - FOOTER_SIZE);
        if footer.get_u32() != DELTA_MAGIC {
            return Err(TracedTabletError::corruption("bad delta file magic"));
        }
        let count = footer.get_u64() as usize;
        let checksum = footer.get_u64();
        let found = crc32fast::hash(body) as u64;
        if found != checksum {
            return Err(TracedTabletError::checksum(found, checksum));
        }

        let mut buf = body;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let record = DeltaRecord::decode_length_delimited(&mut buf)?;
            records.push((
                record.row_id,
                Timestamp::from_raw(record.timestamp),
                RowChange::from_bytes(&record.change)?,
            ));
        }
        debug_assert!(records.windows(2).all(|w| (w[0].0, w[0].1) < (w[1].0, w[1].1)));
        Ok(DeltaFile {
            id,
            on_disk_size: data.len() as u64,
            path,
            records,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn on_disk_size(&self) -> u64 {
        self.on_disk_size
    }

    pub fn records(&self) -> &[(u32, Timestamp, RowChange)] {
        &self.records
    }

    /// All mutations for one row, ascending by timestamp.
    pub fn mutations_for_row(&self, row_id: u32) -> Vec<Mutation> {
        let start = self.records.partition_point(|(r, _, _)| *r < row_id);
        self.records[start..]
            .iter()
            .take_while(|(r, _, _)| *r == row_id)
            .map(|(_, ts, change)| Mutation {
                ts: *ts,
                change: change.clone(),
            })
            .collect()
    }
}
