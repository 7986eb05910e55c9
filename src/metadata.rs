//! Tablet metadata persistence.
//!
//! The manifest is a line-delimited stream of serde_json records. One line
//! is one committed update: a group of operations that becomes visible
//! atomically, with the trailing newline acting as the commit marker. A
//! crash mid-append leaves a torn final line, which recovery drops, so the
//! previously committed metadata always survives intact.
//!
//! Recovery does not replay raw operations back to the caller: the manifest
//! folds them into a [`ManifestState`] (current schema, live rowsets, id
//! watermarks), which is exactly what the tablet needs to reopen.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::error::TabletResult;
use crate::schema::Schema;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddRowSetEntry {
    pub rowset_id: u64,
    pub schema: Schema,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub row_count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ManifestOperation {
    Bootstrap { schema: Schema },
    SchemaChange { schema: Schema },
    AddRowSet(AddRowSetEntry),
    DeleteRowSet { rowset_id: u64 },
    MrsFlushed { mrs_id: u64 },
}

/// One committed manifest line.
#[derive(Serialize, Deserialize)]
struct ManifestRecord {
    ops: Vec<ManifestOperation>,
}

/// Everything the tablet needs to reopen, folded from the manifest.
#[derive(Debug, Default)]
pub struct ManifestState {
    pub schema: Option<Schema>,
    /// Live rowsets by id, in id order.
    pub live_rowsets: BTreeMap<u64, AddRowSetEntry>,
    /// Strictly above every rowset id ever assigned, deleted ones included,
    /// so a reused id can never collide with a dir awaiting vacuum.
    pub next_rowset_id: u64,
    /// Strictly above every flushed MemRowSet id.
    pub next_mrs_id: u64,
}

impl ManifestState {
    fn apply(&mut self, op: ManifestOperation) {
        match op {
            ManifestOperation::Bootstrap { schema }
            | ManifestOperation::SchemaChange { schema } => self.schema = Some(schema),
            ManifestOperation::AddRowSet(entry) => {
                self.next_rowset_id = self.next_rowset_id.max(entry.rowset_id + 1);
                self.live_rowsets.insert(entry.rowset_id, entry);
            }
            ManifestOperation::DeleteRowSet { rowset_id } => {
                self.live_rowsets.remove(&rowset_id);
            }
            ManifestOperation::MrsFlushed { mrs_id } => {
                self.next_mrs_id = self.next_mrs_id.max(mrs_id + 1);
            }
        }
    }
}

/// Handle on the manifest file; owns all appends for one open tablet.
pub struct Manifest {
    file: tokio::fs::File,
    enable_fsync: bool,
}

impl Manifest {
    pub async fn open(path: impl AsRef<Path>, enable_fsync: bool) -> TabletResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())
            .await?;
        Ok(Self { file, enable_fsync })
    }

    /// Fold every committed update into the tablet's bootstrap state. A
    /// final line without its newline commit marker is a torn append and is
    /// dropped; a malformed line before that is corruption and surfaces as
    /// an error.
    pub async fn load_state(&mut self) -> TabletResult<ManifestState> {
        self.file.seek(SeekFrom::Start(0)).await?;
        let mut data = String::new();
        self.file.read_to_string(&mut data).await?;

        let mut state = ManifestState::default();
        for line in data.split_inclusive('\n') {
            let Some(committed) = line.strip_suffix('\n') else {
                warn!(bytes = line.len(), "manifest: dropping torn tail line");
                break;
            };
            let record: ManifestRecord = serde_json::from_str(committed)?;
            for op in record.ops {
                state.apply(op);
            }
        }
        Ok(state)
    }

    /// Durably append one atomic group of operations.
    pub async fn append(&mut self, ops: Vec<ManifestOperation>) -> TabletResult<()> {
        let mut line = serde_json::to_vec(&ManifestRecord { ops })?;
        line.push(b'\n');
        self.file.seek(SeekFrom::End(0)).await?;
        self.file.write_all(&line).await?;
        if self.enable_fsync {
            self.file.sync_data().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDesc, DataType};

    fn schema() -> Schema {
        Schema::new(vec![ColumnDesc::new(0, "k", DataType::Int64, false)], 1).unwrap()
    }

    fn add_entry(rowset_id: u64) -> AddRowSetEntry {
        AddRowSetEntry {
            rowset_id,
            schema: schema(),
            min_key: vec![1],
            max_key: vec![9],
            row_count: 42,
        }
    }

    #[tokio::test]
    async fn test_state_folds_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        let mut manifest = Manifest::open(&path, false).await.unwrap();
        manifest
            .append(vec![ManifestOperation::Bootstrap { schema: schema() }])
            .await
            .unwrap();
        manifest
            .append(vec![
                ManifestOperation::AddRowSet(add_entry(0)),
                ManifestOperation::MrsFlushed { mrs_id: 0 },
            ])
            .await
            .unwrap();
        manifest
            .append(vec![
                ManifestOperation::AddRowSet(add_entry(1)),
                ManifestOperation::DeleteRowSet { rowset_id: 0 },
            ])
            .await
            .unwrap();
        drop(manifest);

        let mut manifest = Manifest::open(&path, false).await.unwrap();
        let state = manifest.load_state().await.unwrap();
        assert_eq!(state.schema.unwrap(), schema());
        // Rowset 0 was compacted away; only rowset 1 is live, but the id
        // watermark still covers both.
        assert_eq!(
            state.live_rowsets.keys().copied().collect::<Vec<_>>(),
            vec![1]
        );
        assert_eq!(state.next_rowset_id, 2);
        assert_eq!(state.next_mrs_id, 1);
    }

    #[tokio::test]
    async fn test_torn_tail_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        let mut manifest = Manifest::open(&path, false).await.unwrap();
        manifest
            .append(vec![ManifestOperation::Bootstrap { schema: schema() }])
            .await
            .unwrap();
        manifest
            .append(vec![ManifestOperation::AddRowSet(add_entry(0))])
            .await
            .unwrap();
        drop(manifest);

        // Simulate a crash mid-append: a record cut off before its newline
        // commit marker.
        let mut raw = std::fs::read(&path).unwrap();
        let torn = serde_json::to_vec(&ManifestRecord {
            ops: vec![ManifestOperation::DeleteRowSet { rowset_id: 0 }],
        })
        .unwrap();
        raw.extend_from_slice(&torn[..torn.len() / 2]);
        std::fs::write(&path, raw).unwrap();

        let mut manifest = Manifest::open(&path, false).await.unwrap();
        let state = manifest.load_state().await.unwrap();
        // The committed prefix survives; the torn delete does not apply.
        assert!(state.live_rowsets.contains_key(&0));
        assert_eq!(state.next_rowset_id, 1);
    }

    #[tokio::test]
    async fn test_corrupt_committed_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");

        let mut manifest = Manifest::open(&path, false).await.unwrap();
        manifest
            .append(vec![ManifestOperation::Bootstrap { schema: schema() }])
            .await
            .unwrap();
        drop(manifest);

        // A committed (newline-terminated) line that fails to parse is
        // corruption, not a torn append.
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"{\"ops\": garbage}\n");
        std::fs::write(&path, raw).unwrap();

        let mut manifest = Manifest::open(&path, false).await.unwrap();
        assert!(manifest.load_state().await.is_err());
    }
}
