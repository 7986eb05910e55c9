//! Column block encoding.
//!
//! A block holds up to `block_rows` values of one column in a plain layout:
//!
//! ```plain
//! | row count (4B) | validity bitmap (ceil(n/8) B) | payload |
//! ```
//!
//! Fixed-width types store `n` slots (null slots hold a zero placeholder);
//! variable-length types store `n + 1` little-endian u32 offsets followed by
//! the concatenated bytes.

use bitvec::prelude::{BitSlice, BitVec, Lsb0};
use bytes::{Buf, BufMut, Bytes};

use crate::error::{TabletResult, TracedTabletError};
use crate::schema::{DataType, Datum};

fn is_fixed_width(datatype: DataType) -> Option<usize> {
    match datatype {
        DataType::Bool => Some(1),
        DataType::Int32 => Some(4),
        DataType::Int64 | DataType::Float64 => Some(8),
        DataType::String | DataType::Binary => None,
    }
}

/// Accumulates one column's values for a block, then encodes them.
pub struct BlockBuilder {
    datatype: DataType,
    datums: Vec<Datum>,
}

impl BlockBuilder {
    pub fn new(datatype: DataType) -> Self {
        Self {
            datatype,
            datums: Vec::new(),
        }
    }

    pub fn append(&mut self, datum: Datum) {
        self.datums.push(datum);
    }

    pub fn len(&self) -> usize {
        self.datums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datums.is_empty()
    }

    /// Encode and reset the builder for the next block.
    pub fn finish(&mut self) -> Vec<u8> {
        let datums = std::mem::take(&mut self.datums);
        let n = datums.len();
        let mut validity: BitVec<u8, Lsb0> = BitVec::repeat(false, n);
        for (idx, datum) in datums.iter().enumerate() {
            validity.set(idx, !datum.is_null());
        }

        let mut buf = Vec::with_capacity(4 + validity.as_raw_slice().len() + n * 8);
        buf.put_u32_le(n as u32);
        buf.extend_from_slice(validity.as_raw_slice());

        match self.datatype {
            DataType::Bool => {
                for datum in &datums {
                    buf.put_u8(match datum {
                        Datum::Bool(v) => *v as u8,
                        _ => 0,
                    });
                }
            }
            DataType::Int32 => {
                for datum in &datums {
                    buf.put_i32_le(match datum {
                        Datum::Int32(v) => *v,
                        _ => 0,
                    });
                }
            }
            DataType::Int64 => {
                for datum in &datums {
                    buf.put_i64_le(match datum {
                        Datum::Int64(v) => *v,
                        _ => 0,
                    });
                }
            }
            DataType::Float64 => {
                for datum in &datums {
                    buf.put_f64_le(match datum {
                        Datum::Float64(v) => *v,
                        _ => 0.0,
                    });
                }
            }
            DataType::String | DataType::Binary => {
                let mut offset = 0u32;
                buf.put_u32_le(0);
                let mut data = Vec::new();
                for datum in &datums {
                    let bytes: &[u8] = match datum {
                        Datum::String(s) => s.as_bytes(),
                        Datum::Binary(b) => b,
                        _ => &[],
                    };
                    offset += bytes.len() as u32;
                    data.extend_from_slice(bytes);
                    buf.put_u32_le(offset);
                }
                buf.extend_from_slice(&data);
            }
        }
        buf
    }
}

/// A decoded, immutable column block. Cheap to clone; cached by the block
/// cache.
#[derive(Clone)]
pub struct Block {
    datatype: DataType,
    data: Bytes,
    row_count: usize,
    payload_start: usize,
}

impl Block {
    pub fn decode(datatype: DataType, data: Bytes) -> TabletResult<Block> {
        if data.len() < 4 {
            return Err(TracedTabletError::corruption("block too short"));
        }
        let row_count = (&data[..4]).get_u32_le() as usize;
        let bitmap_len = (row_count + 7) / 8;
        let payload_start = 4 + bitmap_len;
        let payload_len = data.len().checked_sub(payload_start).ok_or_else(|| {
            TracedTabletError::corruption("block shorter than validity bitmap")
        })?;

        let expected = match is_fixed_width(datatype) {
            Some(width) => row_count * width,
            None => {
                if payload_len < (row_count + 1) * 4 {
                    return Err(TracedTabletError::corruption("block offset table truncated"));
                }
                let last = Self::offset_at(&data, payload_start, row_count)?;
                (row_count + 1) * 4 + last
            }
        };
        if payload_len != expected {
            return Err(TracedTabletError::corruption(format!(
                "block payload size {payload_len}, expected {expected}"
            )));
        }
        Ok(Block {
            datatype,
            data,
            row_count,
            payload_start,
        })
    }

    fn offset_at(data: &Bytes, payload_start: usize, idx: usize) -> TabletResult<usize> {
        let pos = payload_start + idx * 4;
        let mut slice = data.get(pos..pos + 4).ok_or_else(|| {
            TracedTabletError::corruption("block offset out of range")
        })?;
        Ok(slice.get_u32_le() as usize)
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    fn validity(&self) -> &BitSlice<u8, Lsb0> {
        &BitSlice::from_slice(&self.data[4..self.payload_start])[..self.row_count]
    }

    /// Value of the row at `idx` within this block.
    pub fn datum(&self, idx: usize) -> Datum {
        assert!(idx < self.row_count, "row {idx} out of block bounds");
        if !self.validity()[idx] {
            return Datum::Null;
        }
        let payload = &self.data[self.payload_start..];
        match self.datatype {
            DataType::Bool => Datum::Bool(payload[idx] != 0),
            DataType::Int32 => {
                Datum::Int32((&payload[idx * 4..]).get_i32_le())
            }
            DataType::Int64 => {
                Datum::Int64((&payload[idx * 8..]).get_i64_le())
            }
            DataType::Float64 => {
                Datum::Float64((&payload[idx * 8..]).get_f64_le())
            }
            DataType::String | DataType::Binary => {
                let start = (&payload[idx * 4..]).get_u32_le() as usize;
                let end = (&payload[(idx + 1) * 4..]).get_u32_le() as usize;
                let data_start = (self.row_count + 1) * 4;
                let bytes = &payload[data_start + start..data_start + end];
                if self.datatype == DataType::String {
                    Datum::String(String::from_utf8_lossy(bytes).into_owned())
                } else {
                    Datum::Binary(bytes.to_vec())
                }
            }
        }
    }
}
