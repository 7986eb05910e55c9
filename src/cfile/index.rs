//! Embedded block index of a column file.
//!
//! The index is a sequence of length-delimited [`BlockIndex`] messages
//! appended after the last block, closed by a fixed-size footer:
//!
//! ```plain
//! | block | ... | block | index entries | magic (4B) | entry count (8B) | index len (8B) | crc32 (8B) |
//! ```

use std::sync::Arc;

use bytes::{Buf, BufMut};
use prost::Message;

use crate::error::{TabletResult, TracedTabletError};
use crate::proto::BlockIndex;

pub const CFILE_MAGIC: u32 = 0x2333_C0F1;
pub const FOOTER_SIZE: usize = 4 + 8 + 8 + 8;

/// Builds the index region while blocks are appended.
pub struct IndexBuilder {
    data: Vec<u8>,
    count: u64,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            count: 0,
        }
    }

    pub fn append(&mut self, index: BlockIndex) -> TabletResult<()> {
        self.count += 1;
        index.encode_length_delimited(&mut self.data)?;
        Ok(())
    }

    /// Index region plus footer, ready to append to the file.
    pub fn finish(self) -> Vec<u8> {
        let mut data = self.data;
        let index_len = data.len() as u64;
        let checksum = crc32fast::hash(&data) as u64;
        data.put_u32(CFILE_MAGIC);
        data.put_u64(self.count);
        data.put_u64(index_len);
        data.put_u64(checksum);
        data
    }
}

/// Parsed block index of an open column file.
#[derive(Clone)]
pub struct ColumnIndex {
    indexes: Arc<[BlockIndex]>,
}

impl ColumnIndex {
    /// Parse the index from the tail of the file. `tail` must contain at
    /// least the full index region and footer.
    pub fn parse_tail(tail: &[u8]) -> TabletResult<ColumnIndex> {
        if tail.len() < FOOTER_SIZE {
            return Err(TracedTabletError::corruption("column file too short"));
        }
        let mut footer = &tail[tail.len() - FOOTER_SIZE..];
        if footer.get_u32() != CFILE_MAGIC {
            return Err(TracedTabletError::corruption(
                "failed to decode column index: invalid magic",
            ));
        }
        let count = footer.get_u64() as usize;
        let index_len = footer.get_u64() as usize;
        let checksum = footer.get_u64();
        if index_len + FOOTER_SIZE > tail.len() {
            return Err(TracedTabletError::corruption("column index out of range"));
        }
        let mut index_data = &tail[tail.len() - FOOTER_SIZE - index_len..tail.len() - FOOTER_SIZE];
        let found = crc32fast::hash(index_data) as u64;
        if found != checksum {
            return Err(TracedTabletError::checksum(found, checksum));
        }

        let mut indexes = Vec::with_capacity(count);
        for _ in 0..count {
            indexes.push(BlockIndex::decode_length_delimited(&mut index_data)?);
        }
        Ok(ColumnIndex {
            indexes: indexes.into(),
        })
    }

    /// Byte length of the index region including footer, read from the
    /// footer alone.
    pub fn region_len(footer: &[u8]) -> TabletResult<usize> {
        if footer.len() < FOOTER_SIZE {
            return Err(TracedTabletError::corruption("column file too short"));
        }
        let mut buf = &footer[footer.len() - FOOTER_SIZE..];
        if buf.get_u32() != CFILE_MAGIC {
            return Err(TracedTabletError::corruption(
                "failed to decode column index: invalid magic",
            ));
        }
        let _count = buf.get_u64();
        let index_len = buf.get_u64() as usize;
        Ok(index_len + FOOTER_SIZE)
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn index(&self, block_id: u32) -> &BlockIndex {
        &self.indexes[block_id as usize]
    }

    pub fn indexes(&self) -> &[BlockIndex] {
        &self.indexes
    }

    /// Block containing `row_id`. The caller guarantees the row exists.
    pub fn block_of_row(&self, row_id: u32) -> u32 {
        let pp = self
            .indexes
            .partition_point(|index| index.first_row_id <= row_id) as u32;
        assert!(pp > 0, "row {row_id} below first block");
        pp - 1
    }

    /// Block that may contain `key`, by the sparse first-key index. `None`
    /// when `key` sorts before the first block.
    pub fn block_of_key(&self, key: &[u8]) -> Option<u32> {
        let pp = self
            .indexes
            .partition_point(|index| index.first_key.as_slice() <= key) as u32;
        if pp == 0 {
            None
        } else {
            Some(pp - 1)
        }
    }
}
