//! Per-rowset bloom filter over encoded primary keys.
//!
//! Backed by the `bloomfilter` crate; persisted as a prost message with a
//! checksummed footer so corruption is detected at open.

use std::path::Path;

use bloomfilter::Bloom;
use bytes::{Buf, BufMut};
use prost::Message;

use crate::error::{TabletResult, TracedTabletError};
use crate::proto;

const BLOOM_MAGIC: u32 = 0xB100F11E;
const FOOTER_SIZE: usize = 4 + 8 + 8;

/// Accumulates keys while a rowset is written.
pub struct BloomFilterBuilder {
    bloom: Bloom<[u8]>,
}

impl BloomFilterBuilder {
    pub fn new(expected_keys: usize, fp_rate: f64) -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(expected_keys.max(1), fp_rate),
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        self.bloom.set(key);
    }

    pub fn finish(self) -> KeyBloom {
        KeyBloom { bloom: self.bloom }
    }
}

/// An immutable key bloom, either freshly built or loaded from disk.
pub struct KeyBloom {
    bloom: Bloom<[u8]>,
}

impl KeyBloom {
    /// `false` means the key is definitely absent from the rowset.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.bloom.check(key)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let sip_keys = self.bloom.sip_keys();
        let message = proto::BloomFilter {
            num_bits: self.bloom.number_of_bits(),
            num_hashes: self.bloom.number_of_hash_functions(),
            sip_keys: vec![sip_keys[0].0, sip_keys[0].1, sip_keys[1].0, sip_keys[1].1],
            bitmap: self.bloom.bitmap(),
        };
        let mut data = message.encode_to_vec();
        let checksum = crc32fast::hash(&data) as u64;
        let message_len = data.len() as u64;
        data.put_u32(BLOOM_MAGIC);
        data.put_u64(message_len);
        data.put_u64(checksum);
        data
    }

    pub fn from_bytes(data: &[u8]) -> TabletResult<KeyBloom> {
        if data.len() < FOOTER_SIZE {
            return Err(TracedTabletError::corruption("bloom file too short"));
        }
        let mut footer = &data[data.len() - FOOTER_SIZE..];
        if footer.get_u32() != BLOOM_MAGIC {
            return Err(TracedTabletError::corruption("bad bloom magic"));
        }
        let message_len = footer.get_u64() as usize;
        let checksum = footer.get_u64();
        if message_len != data.len() - FOOTER_SIZE {
            return Err(TracedTabletError::corruption("bad bloom length"));
        }
        let message_bytes = &data[..message_len];
        let found = crc32fast::hash(message_bytes) as u64;
        if found != checksum {
            return Err(TracedTabletError::checksum(found, checksum));
        }

        let message = proto::BloomFilter::decode(message_bytes)?;
        if message.sip_keys.len() != 4 {
            return Err(TracedTabletError::corruption("bad bloom sip keys"));
        }
        let bloom = Bloom::from_existing(
            &message.bitmap,
            message.num_bits,
            message.num_hashes,
            [
                (message.sip_keys[0], message.sip_keys[1]),
                (message.sip_keys[2], message.sip_keys[3]),
            ],
        );
        Ok(KeyBloom { bloom })
    }

    pub async fn write_to(&self, path: impl AsRef<Path>) -> TabletResult<()> {
        tokio::fs::write(path, self.to_bytes()).await?;
        Ok(())
    }

    pub async fn open(path: impl AsRef<Path>) -> TabletResult<KeyBloom> {
        let data = tokio::fs::read(path).await?;
        Self::from_bytes(&data)
    }
}
