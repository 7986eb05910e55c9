//! Column files: the per-column on-disk base data of a DiskRowSet.
//!
//! A column file is a sequence of encoded blocks followed by an embedded
//! block index (see [`index`]). Blocks are checksummed individually and
//! cached in a shared block cache on read.

mod block;
mod index;

pub use block::{Block, BlockBuilder};
pub use index::{ColumnIndex, IndexBuilder, FOOTER_SIZE};

use std::path::Path;
use std::sync::Arc;

use moka::future::Cache;
use tokio::io::AsyncWriteExt;

use crate::error::{TabletResult, TracedTabletError};
use crate::proto::BlockIndex;
use crate::schema::{DataType, Datum};

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct BlockCacheKey {
    pub rowset_id: u64,
    pub column_id: u32,
    pub block_id: u32,
}

pub type BlockCache = Cache<BlockCacheKey, Block>;

pub fn new_block_cache(capacity: u64) -> BlockCache {
    Cache::new(capacity)
}

/// A read-only file handle usable from concurrent readers.
///
/// On unix, positioned reads go straight to `pread`; elsewhere a mutex
/// serializes seek-then-read.
#[derive(Clone)]
pub enum ReadableFile {
    #[cfg(unix)]
    Positioned(Arc<std::fs::File>),
    Seekable(Arc<parking_lot::Mutex<std::fs::File>>),
}

impl ReadableFile {
    pub async fn open(path: impl AsRef<Path>) -> TabletResult<(ReadableFile, u64)> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .open(path.as_ref())
            .await?;
        let size = file.metadata().await?.len();
        let file = file.into_std().await;
        #[cfg(unix)]
        {
            Ok((ReadableFile::Positioned(Arc::new(file)), size))
        }
        #[cfg(not(unix))]
        {
            Ok((
                ReadableFile::Seekable(Arc::new(parking_lot::Mutex::new(file))),
                size,
            ))
        }
    }

    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            ReadableFile::Positioned(file) => {
                use std::os::unix::fs::FileExt;
                file.read_exact_at(buf, offset)
            }
            ReadableFile::Seekable(file) => {
                use std::io::{Read, Seek, SeekFrom};
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(buf)
            }
        }
    }
}

/// Streams one column of a rowset to disk.
pub struct CFileWriter {
    datatype: DataType,
    file: tokio::fs::File,
    offset: u64,
    block_rows: usize,
    builder: BlockBuilder,
    index: IndexBuilder,
    row_count: u32,
    /// Encoded primary key of the first row of the pending block. Captured
    /// only for the first key column, whose index doubles as the sparse key
    /// index.
    block_first_key: Vec<u8>,
    capture_keys: bool,
    fsync: bool,
}

impl CFileWriter {
    pub async fn create(
        path: impl AsRef<Path>,
        datatype: DataType,
        block_rows: usize,
        capture_keys: bool,
        fsync: bool,
    ) -> TabletResult<CFileWriter> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .await?;
        Ok(CFileWriter {
            datatype,
            file,
            offset: 0,
            block_rows,
            builder: BlockBuilder::new(datatype),
            index: IndexBuilder::new(),
            row_count: 0,
            block_first_key: Vec::new(),
            capture_keys,
            fsync,
        })
    }

    pub async fn append(&mut self, datum: Datum, encoded_key: &[u8]) -> TabletResult<()> {
        if self.capture_keys && self.builder.is_empty() {
            self.block_first_key = encoded_key.to_vec();
        }
        self.builder.append(datum);
        self.row_count += 1;
        if self.builder.len() >= self.block_rows {
            self.flush_block().await?;
        }
        Ok(())
    }

    async fn flush_block(&mut self) -> TabletResult<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        let block_len = self.builder.len() as u32;
        let first_row_id = self.row_count - block_len;
        let data = self.builder.finish();
        let checksum = crc32fast::hash(&data) as u64;
        self.index.append(BlockIndex {
            offset: self.offset,
            size: data.len() as u64,
            first_row_id,
            row_count: block_len,
            first_key: std::mem::take(&mut self.block_first_key),
            checksum,
        })?;
        self.file.write_all(&data).await?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Flush the pending block, append the index and footer, and return the
    /// total file size.
    pub async fn finish(mut self) -> TabletResult<u64> {
        self.flush_block().await?;
        let tail = self.index.finish();
        self.file.write_all(&tail).await?;
        if self.fsync {
            self.file.sync_all().await?;
        }
        Ok(self.offset + tail.len() as u64)
    }
}

/// Read side of a column file.
#[derive(Clone)]
pub struct CFileReader {
    datatype: DataType,
    index: ColumnIndex,
    file: ReadableFile,
    size: u64,
    cache: BlockCache,
    rowset_id: u64,
    column_id: u32,
    row_count: u32,
}

impl CFileReader {
    pub async fn open(
        path: impl AsRef<Path>,
        datatype: DataType,
        cache: BlockCache,
        rowset_id: u64,
        column_id: u32,
    ) -> TabletResult<CFileReader> {
        let (file, size) = ReadableFile::open(path.as_ref()).await?;
        if (size as usize) < FOOTER_SIZE {
            return Err(TracedTabletError::corruption(format!(
                "column file {} too short",
                path.as_ref().display()
            )));
        }
        let mut footer = vec![0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer, size - FOOTER_SIZE as u64)?;
        let region_len = ColumnIndex::region_len(&footer)? as u64;
        if region_len > size {
            return Err(TracedTabletError::corruption("column index out of range"));
        }
        let mut region = vec![0u8; region_len as usize];
        file.read_exact_at(&mut region, size - region_len)?;
        let index = ColumnIndex::parse_tail(&region)?;
        let row_count = index
            .indexes()
            .last()
            .map(|last| last.first_row_id + last.row_count)
            .unwrap_or(0);
        Ok(CFileReader {
            datatype,
            index,
            file,
            size,
            cache,
            rowset_id,
            column_id,
            row_count,
        })
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn num_blocks(&self) -> u32 {
        self.index.len() as u32
    }

    pub fn index(&self) -> &ColumnIndex {
        &self.index
    }

    pub fn on_disk_size(&self) -> u64 {
        self.size
    }

    /// Fetch a block through the cache, verifying its checksum on miss.
    pub async fn block(&self, block_id: u32) -> TabletResult<Block> {
        let key = BlockCacheKey {
            rowset_id: self.rowset_id,
            column_id: self.column_id,
            block_id,
        };
        let entry = self.index.index(block_id).clone();
        let datatype = self.datatype;
        let file = self.file.clone();
        self.cache
            .try_get_with(key, async move {
                let mut data = vec![0u8; entry.size as usize];
                file.read_exact_at(&mut data, entry.offset)
                    .map_err(TracedTabletError::from)?;
                let found = crc32fast::hash(&data) as u64;
                if found != entry.checksum {
                    return Err(TracedTabletError::checksum(found, entry.checksum));
                }
                Block::decode(datatype, data.into())
            })
            .await
            .map_err(|e: Arc<TracedTabletError>| e.into())
    }

    /// Read a single value by row id.
    pub async fn datum(&self, row_id: u32) -> TabletResult<Datum> {
        let block_id = self.index.block_of_row(row_id);
        let block = self.block(block_id).await?;
        let first = self.index.index(block_id).first_row_id;
        Ok(block.datum((row_id - first) as usize))
    }
}
