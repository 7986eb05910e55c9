//! Mutation records and their wire encoding.
//!
//! A mutation is a `(timestamp, change-list)` pair. Change lists are encoded
//! into a compact self-describing byte form for delta files, so they survive
//! schema changes: updates address columns by id, and datums carry their own
//! type tag.

use bytes::{Buf, BufMut};
use smallvec::SmallVec;

use crate::clock::Timestamp;
use crate::error::{TabletResult, TracedTabletError};
use crate::mvcc::MvccSnapshot;
use crate::schema::{ColumnId, Datum, Row, Schema};

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnUpdate {
    pub column_id: ColumnId,
    pub value: Datum,
}

/// One entry of a mutation chain.
#[derive(Clone, Debug, PartialEq)]
pub enum RowChange {
    /// Sets the full row. In a chain this is only legal as the first entry or
    /// directly after a `Delete` (a reinsert).
    Insert(Row),
    Update(SmallVec<[ColumnUpdate; 4]>),
    Delete,
}

impl RowChange {
    pub fn update(updates: impl IntoIterator<Item = (ColumnId, Datum)>) -> RowChange {
        RowChange::Update(
            updates
                .into_iter()
                .map(|(column_id, value)| ColumnUpdate { column_id, value })
                .collect(),
        )
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<RowChange>()
            + match self {
                RowChange::Insert(row) => crate::schema::row_mem_size(row),
                RowChange::Update(updates) => {
                    updates.iter().map(|u| u.value.mem_size() + 4).sum()
                }
                RowChange::Delete => 0,
            }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub ts: Timestamp,
    pub change: RowChange,
}

const CHANGE_INSERT: u8 = 1;
const CHANGE_UPDATE: u8 = 2;
const CHANGE_DELETE: u8 = 3;

const DATUM_NULL: u8 = 0;
const DATUM_BOOL: u8 = 1;
const DATUM_INT32: u8 = 2;
const DATUM_INT64: u8 = 3;
const DATUM_FLOAT64: u8 = 4;
const DATUM_STRING: u8 = 5;
const DATUM_BINARY: u8 = 6;

pub fn encode_datum(buf: &mut impl BufMut, datum: &Datum) {
    match datum {
        Datum::Null => buf.put_u8(DATUM_NULL),
        Datum::Bool(v) => {
            buf.put_u8(DATUM_BOOL);
            buf.put_u8(*v as u8);
        }
        Datum::Int32(v) => {
            buf.put_u8(DATUM_INT32);
            buf.put_i32_le(*v);
        }
        Datum::Int64(v) => {
            buf.put_u8(DATUM_INT64);
            buf.put_i64_le(*v);
        }
        Datum::Float64(v) => {
            buf.put_u8(DATUM_FLOAT64);
            buf.put_f64_le(*v);
        }
        Datum::String(v) => {
            buf.put_u8(DATUM_STRING);
            buf.put_u32_le(v.len() as u32);
            buf.put_slice(v.as_bytes());
        }
        Datum::Binary(v) => {
            buf.put_u8(DATUM_BINARY);
            buf.put_u32_le(v.len() as u32);
            buf.put_slice(v);
        }
    }
}

fn ensure(buf: &impl Buf, n: usize) -> TabletResult<()> {
    if buf.remaining() < n {
        return Err(TracedTabletError::corruption("truncated change list"));
    }
    Ok(())
}

pub fn decode_datum(buf: &mut impl Buf) -> TabletResult<Datum> {
    ensure(buf, 1)?;
    match buf.get_u8() {
        DATUM_NULL => Ok(Datum::Null),
        DATUM_BOOL => {
            ensure(buf, 1)?;
            Ok(Datum::Bool(buf.get_u8() != 0))
        }
        DATUM_INT32 => {
            ensure(buf, 4)?;
            Ok(Datum::Int32(buf.get_i32_le()))
        }
        DATUM_INT64 => {
            ensure(buf, 8)?;
            Ok(Datum::Int64(buf.get_i64_le()))
        }
        DATUM_FLOAT64 => {
            ensure(buf, 8)?;
            Ok(Datum::Float64(buf.get_f64_le()))
        }
        DATUM_STRING => {
            ensure(buf, 4)?;
            let len = buf.get_u32_le() as usize;
            ensure(buf, len)?;
            let mut bytes = vec![0; len];
            buf.copy_to_slice(&mut bytes);
            String::from_utf8(bytes)
                .map(Datum::String)
                .map_err(|_| TracedTabletError::corruption("non-utf8 string datum"))
        }
        DATUM_BINARY => {
            ensure(buf, 4)?;
            let len = buf.get_u32_le() as usize;
            ensure(buf, len)?;
            let mut bytes = vec![0; len];
            buf.copy_to_slice(&mut bytes);
            Ok(Datum::Binary(bytes))
        }
        tag => Err(TracedTabletError::corruption(format!(
            "unknown datum tag {tag}"
        ))),
    }
}

impl RowChange {
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            RowChange::Insert(row) => {
                buf.put_u8(CHANGE_INSERT);
                buf.put_u32_le(row.len() as u32);
                for datum in row {
                    encode_datum(buf, datum);
                }
            }
            RowChange::Update(updates) => {
                buf.put_u8(CHANGE_UPDATE);
                buf.put_u32_le(updates.len() as u32);
                for update in updates {
                    buf.put_u32_le(update.column_id);
                    encode_datum(buf, &update.value);
                }
            }
            RowChange::Delete => buf.put_u8(CHANGE_DELETE),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    pub fn decode(buf: &mut impl Buf) -> TabletResult<RowChange> {
        ensure(buf, 1)?;
        match buf.get_u8() {
            CHANGE_INSERT => {
                ensure(buf, 4)?;
                let n = buf.get_u32_le() as usize;
                let mut row = Vec::with_capacity(n);
                for _ in 0..n {
                    row.push(decode_datum(buf)?);
                }
                Ok(RowChange::Insert(row))
            }
            CHANGE_UPDATE => {
                ensure(buf, 4)?;
                let n = buf.get_u32_le() as usize;
                let mut updates = SmallVec::with_capacity(n);
                for _ in 0..n {
                    ensure(buf, 4)?;
                    let column_id = buf.get_u32_le();
                    let value = decode_datum(buf)?;
                    updates.push(ColumnUpdate { column_id, value });
                }
                Ok(RowChange::Update(updates))
            }
            CHANGE_DELETE => Ok(RowChange::Delete),
            tag => Err(TracedTabletError::corruption(format!(
                "unknown change tag {tag}"
            ))),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> TabletResult<RowChange> {
        let mut buf = bytes;
        let change = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(TracedTabletError::corruption(
                "trailing bytes after change list",
            ));
        }
        Ok(change)
    }
}

/// One key's state after replaying a mutation sequence.
#[derive(Clone, Debug, Default)]
pub struct RowVersion {
    /// Last known column values, live or not. `None` when no visible version
    /// ever existed.
    pub values: Option<Row>,
    /// Whether the key is live at the replay point.
    pub live: bool,
    /// Timestamp of the last visible mutation applied (the base counts only
    /// if a base timestamp was supplied).
    pub last_ts: Option<Timestamp>,
    /// Timestamp of the delete that killed the row, when `!live`.
    pub delete_ts: Option<Timestamp>,
}

impl RowVersion {
    pub fn live_row(&self) -> Option<&Row> {
        if self.live {
            self.values.as_ref()
        } else {
            None
        }
    }
}

/// Replay `mutations` (ascending timestamp order) over an optional base row,
/// honoring `snapshot` visibility (`None` means everything is visible).
///
/// The base row, when present, is visible unconditionally: a rowset's base
/// data always predates any snapshot that can reach it.
pub fn materialize<'a>(
    schema: &Schema,
    base: Option<&Row>,
    mutations: impl IntoIterator<Item = &'a Mutation>,
    snapshot: Option<&MvccSnapshot>,
) -> RowVersion {
    let mut version = RowVersion {
        values: base.cloned(),
        live: base.is_some(),
        last_ts: None,
        delete_ts: None,
    };
    for mutation in mutations {
        if let Some(snap) = snapshot {
            if !snap.is_visible(mutation.ts) {
                continue;
            }
        }
        version.apply(schema, mutation);
    }
    version
}

impl RowVersion {
    pub fn apply(&mut self, schema: &Schema, mutation: &Mutation) {
        match &mutation.change {
            RowChange::Insert(row) => {
                self.values = Some(row.clone());
                self.live = true;
                self.delete_ts = None;
            }
            RowChange::Update(updates) => {
                if let Some(values) = &mut self.values {
                    for update in updates {
                        // Updates to since-dropped columns are skipped.
                        if let Some(idx) = schema.index_of(update.column_id) {
                            values[idx] = update.value.clone();
                        }
                    }
                }
            }
            RowChange::Delete => {
                self.live = false;
                self.delete_ts = Some(mutation.ts);
            }
        }
        self.last_ts = Some(mutation.ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDesc, DataType};

    fn schema() -> Schema {
        Schema::new(
            vec![
                ColumnDesc::new(0, "k", DataType::Int64, false),
                ColumnDesc::new(1, "v", DataType::Int32, true),
            ],
            1,
        )
        .unwrap()
    }

    fn ts(v: u64) -> Timestamp {
        Timestamp::from_raw(v)
    }

    #[test]
    fn test_change_roundtrip() {
        let changes = vec![
            RowChange::Insert(vec![Datum::Int64(1), Datum::Int32(10)]),
            RowChange::update([(1, Datum::Int32(20)), (1, Datum::Null)]),
            RowChange::Delete,
            RowChange::Insert(vec![
                Datum::String("a\0b".into()),
                Datum::Binary(vec![0, 255]),
            ]),
        ];
        for change in changes {
            let bytes = change.to_bytes();
            assert_eq!(RowChange::from_bytes(&bytes).unwrap(), change);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(RowChange::from_bytes(&[]).is_err());
        assert!(RowChange::from_bytes(&[9]).is_err());
        let mut bytes = RowChange::Insert(vec![Datum::Int64(1)]).to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(RowChange::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_materialize_chain() {
        let schema = schema();
        let muts = vec![
            Mutation {
                ts: ts(2),
                change: RowChange::update([(1, Datum::Int32(20))]),
            },
            Mutation {
                ts: ts(3),
                change: RowChange::Delete,
            },
            Mutation {
                ts: ts(4),
                change: RowChange::Insert(vec![Datum::Int64(1), Datum::Int32(40)]),
            },
        ];
        let base = vec![Datum::Int64(1), Datum::Int32(10)];

        let v = materialize(&schema, Some(&base), &muts, None);
        assert!(v.live);
        assert_eq!(v.values.unwrap()[1], Datum::Int32(40));

        // Visibility cut between the update and the delete.
        let snap = MvccSnapshot::committed_before(ts(3));
        let v = materialize(&schema, Some(&base), &muts, Some(&snap));
        assert!(v.live);
        assert_eq!(v.values.unwrap()[1], Datum::Int32(20));

        // Cut after the delete, before the reinsert.
        let snap = MvccSnapshot::committed_before(ts(4));
        let v = materialize(&schema, Some(&base), &muts, Some(&snap));
        assert!(!v.live);
        assert_eq!(v.delete_ts, Some(ts(3)));
    }
}
