//! On-disk record messages.
//!
//! These are hand-derived prost messages rather than generated from `.proto`
//! files; the wire format is ordinary protobuf, so external tooling can still
//! decode the files.

/// Per-block entry of a column file's embedded index.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockIndex {
    /// Byte offset of the block within the file.
    #[prost(uint64, tag = "1")]
    pub offset: u64,
    /// Encoded size of the block in bytes.
    #[prost(uint64, tag = "2")]
    pub size: u64,
    /// Row id of the first row in the block.
    #[prost(uint32, tag = "3")]
    pub first_row_id: u32,
    /// Number of rows in the block.
    #[prost(uint32, tag = "4")]
    pub row_count: u32,
    /// Full encoded primary key of the first row. Only populated for the
    /// first key column's file, where the index doubles as the sparse key
    /// index.
    #[prost(bytes = "vec", tag = "5")]
    pub first_key: Vec<u8>,
    /// crc32 of the block bytes.
    #[prost(uint64, tag = "6")]
    pub checksum: u64,
}

/// One mutation in a delta file, sorted by `(row_id, timestamp)`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeltaRecord {
    #[prost(uint32, tag = "1")]
    pub row_id: u32,
    #[prost(uint64, tag = "2")]
    pub timestamp: u64,
    /// Encoded [`RowChange`](crate::mutation::RowChange).
    #[prost(bytes = "vec", tag = "3")]
    pub change: Vec<u8>,
}

/// Serialized bloom filter over the encoded primary keys of a rowset.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BloomFilter {
    #[prost(uint64, tag = "1")]
    pub num_bits: u64,
    #[prost(uint32, tag = "2")]
    pub num_hashes: u32,
    /// SipHash keys, four little-endian u64s.
    #[prost(fixed64, repeated, tag = "3")]
    pub sip_keys: Vec<u64>,
    #[prost(bytes = "vec", tag = "4")]
    pub bitmap: Vec<u8>,
}
