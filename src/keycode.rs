//! Order-preserving encoding for primary keys.
//!
//! Each key column is encoded with a one-byte type tag followed by a payload
//! whose byte order matches the value order. Composite keys are the
//! concatenation of their column encodings; variable-length payloads are
//! escaped and terminated so no encoding is a prefix of another.

use crate::error::{TabletResult, TracedTabletError};
use crate::schema::Datum;

const TAG_BOOL: u8 = 0x01;
const TAG_INT32: u8 = 0x02;
const TAG_INT64: u8 = 0x03;
const TAG_FLOAT64: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;

/// Append the order-preserving encoding of `datum` to `buf`.
///
/// Key columns are non-nullable, so `Datum::Null` is rejected here rather
/// than given a sort position.
pub fn encode_datum(buf: &mut Vec<u8>, datum: &Datum) -> TabletResult<()> {
    match datum {
        Datum::Null => {
            return Err(TracedTabletError::invalid_argument(
                "null value in key column",
            ))
        }
        Datum::Bool(v) => {
            buf.push(TAG_BOOL);
            buf.push(*v as u8);
        }
        Datum::Int32(v) => {
            buf.push(TAG_INT32);
            buf.extend_from_slice(&((*v as u32) ^ (1 << 31)).to_be_bytes());
        }
        Datum::Int64(v) => {
            buf.push(TAG_INT64);
            buf.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
        }
        Datum::Float64(v) => {
            let bits = v.to_bits();
            let ordered = if bits & (1 << 63) != 0 { !bits } else { bits | (1 << 63) };
            buf.push(TAG_FLOAT64);
            buf.extend_from_slice(&ordered.to_be_bytes());
        }
        Datum::String(v) => encode_bytes(buf, v.as_bytes()),
        Datum::Binary(v) => encode_bytes(buf, v),
    }
    Ok(())
}

/// Escape 0x00 as 0x00 0xFF and terminate with 0x00 0x00, so embedded zero
/// bytes keep shorter strings sorting before their extensions.
fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.push(TAG_BYTES);
    for &b in bytes {
        buf.push(b);
        if b == 0x00 {
            buf.push(0xFF);
        }
    }
    buf.push(0x00);
    buf.push(0x00);
}

/// Encode a composite key from the key-column datums.
pub fn encode_key(datums: &[Datum]) -> TabletResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(datums.len() * 9);
    for datum in datums {
        encode_datum(&mut buf, datum)?;
    }
    Ok(buf)
}
