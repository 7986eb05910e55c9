use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{TabletResult, TracedTabletError};
use crate::keycode;

pub type ColumnId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    Float64,
    String,
    Binary,
}

/// A single typed value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Binary(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn datatype(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Bool(_) => Some(DataType::Bool),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::String(_) => Some(DataType::String),
            Datum::Binary(_) => Some(DataType::Binary),
        }
    }

    /// Rough in-memory footprint, used for MRS/DMS size accounting.
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Datum>()
            + match self {
                Datum::String(s) => s.len(),
                Datum::Binary(b) => b.len(),
                _ => 0,
            }
    }
}

/// A row matching some [`Schema`], one datum per column.
pub type Row = Vec<Datum>;

pub fn row_mem_size(row: &Row) -> usize {
    row.iter().map(Datum::mem_size).sum()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDesc {
    id: ColumnId,
    name: String,
    datatype: DataType,
    nullable: bool,
    /// Value for this column in rows written before it was added.
    default: Datum,
}

impl ColumnDesc {
    pub fn new(id: ColumnId, name: impl Into<String>, datatype: DataType, nullable: bool) -> Self {
        Self {
            id,
            name: name.into(),
            datatype,
            nullable,
            default: Datum::Null,
        }
    }

    pub fn with_default(mut self, default: Datum) -> Self {
        self.default = default;
        self
    }

    pub fn id(&self) -> ColumnId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn default(&self) -> &Datum {
        &self.default
    }
}

/// A fixed, ordered set of typed columns. The first `key_columns` columns
/// form the primary key: non-nullable, unique, totally ordered by the keycode
/// encoding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnDesc>,
    key_columns: usize,
    #[serde(skip)]
    id_to_idx: HashMap<ColumnId, usize>,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        // The id lookup table is derived (and absent on schemas read back
        // from the manifest); only the logical shape matters.
        self.columns == other.columns && self.key_columns == other.key_columns
    }
}

impl Schema {
    pub fn new(columns: Vec<ColumnDesc>, key_columns: usize) -> TabletResult<Schema> {
        if key_columns == 0 || key_columns > columns.len() {
            return Err(TracedTabletError::invalid_argument(format!(
                "invalid key column count {} for {} columns",
                key_columns,
                columns.len()
            )));
        }
        for col in &columns[..key_columns] {
            if col.nullable {
                return Err(TracedTabletError::invalid_argument(format!(
                    "key column {} may not be nullable",
                    col.name
                )));
            }
        }
        let mut id_to_idx = HashMap::with_capacity(columns.len());
        for (idx, col) in columns.iter().enumerate() {
            if id_to_idx.insert(col.id, idx).is_some() {
                return Err(TracedTabletError::invalid_argument(format!(
                    "duplicate column id {}",
                    col.id
                )));
            }
            if columns[..idx].iter().any(|c| c.name == col.name) {
                return Err(TracedTabletError::invalid_argument(format!(
                    "duplicate column name {}",
                    col.name
                )));
            }
        }
        Ok(Schema {
            columns,
            key_columns,
            id_to_idx,
        })
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.key_columns
    }

    pub fn column(&self, idx: usize) -> &ColumnDesc {
        &self.columns[idx]
    }

    pub fn column_by_id(&self, id: ColumnId) -> Option<(usize, &ColumnDesc)> {
        self.index_of(id).map(|idx| (idx, &self.columns[idx]))
    }

    pub fn index_of(&self, id: ColumnId) -> Option<usize> {
        // `id_to_idx` is skipped by serde; fall back to a scan for schemas
        // that came off the manifest.
        if self.id_to_idx.is_empty() && !self.columns.is_empty() {
            return self.columns.iter().position(|c| c.id == id);
        }
        self.id_to_idx.get(&id).copied()
    }

    /// Validate a full row against this schema: arity, types, nullability.
    pub fn check_row(&self, row: &Row) -> TabletResult<()> {
        if row.len() != self.columns.len() {
            return Err(TracedTabletError::invalid_argument(format!(
                "row has {} columns, schema has {}",
                row.len(),
                self.columns.len()
            )));
        }
        for (datum, col) in row.iter().zip(&self.columns) {
            self.check_value(datum, col)?;
        }
        Ok(())
    }

    pub fn check_value(&self, datum: &Datum, col: &ColumnDesc) -> TabletResult<()> {
        match datum.datatype() {
            None if !col.nullable => Err(TracedTabletError::invalid_argument(format!(
                "null value for non-nullable column {}",
                col.name
            ))),
            Some(dt) if dt != col.datatype => Err(TracedTabletError::invalid_argument(format!(
                "type mismatch for column {}: expected {:?}, got {:?}",
                col.name, col.datatype, dt
            ))),
            _ => Ok(()),
        }
    }

    /// Encode the primary key of a full row.
    pub fn encode_key(&self, row: &Row) -> TabletResult<Vec<u8>> {
        if row.len() < self.key_columns {
            return Err(TracedTabletError::invalid_argument(
                "row shorter than key prefix",
            ));
        }
        keycode::encode_key(&row[..self.key_columns])
    }

    /// Encode a key given just the key-column datums.
    pub fn encode_key_datums(&self, key: &[Datum]) -> TabletResult<Vec<u8>> {
        if key.len() != self.key_columns {
            return Err(TracedTabletError::invalid_argument(format!(
                "key has {} columns, schema key has {}",
                key.len(),
                self.key_columns
            )));
        }
        for (datum, col) in key.iter().zip(&self.columns[..self.key_columns]) {
            self.check_value(datum, col)?;
        }
        keycode::encode_key(key)
    }

    /// Whether `other` is reachable from `self` by column add/drop/rename:
    /// identical key prefix (ids, types, order).
    pub fn key_compatible_with(&self, other: &Schema) -> bool {
        self.key_columns == other.key_columns
            && self.columns[..self.key_columns]
                .iter()
                .zip(&other.columns[..other.key_columns])
                .all(|(a, b)| a.id == b.id && a.datatype == b.datatype)
    }
}

/// A projection of tablet columns, resolved against a particular source
/// schema at iterator-build time. Columns missing from the source (added
/// after the source rowset was written) read as their default.
#[derive(Clone, Debug)]
pub struct Projection {
    /// The schema of the projected output rows.
    schema: Arc<Schema>,
}

impl Projection {
    /// Project `column_ids` out of `tablet_schema`, in the given order.
    pub fn new(tablet_schema: &Schema, column_ids: &[ColumnId]) -> TabletResult<Projection> {
        let mut columns = Vec::with_capacity(column_ids.len());
        for id in column_ids {
            let (_, col) = tablet_schema
                .column_by_id(*id)
                .ok_or_else(|| TracedTabletError::not_found("column", id))?;
            columns.push(col.clone());
        }
        // Projected output is not keyed; reuse Schema for its column layout
        // with a fabricated single-column "key" only when projecting keys.
        Ok(Projection {
            schema: Arc::new(Schema {
                key_columns: 0,
                id_to_idx: columns
                    .iter()
                    .enumerate()
                    .map(|(idx, c)| (c.id, idx))
                    .collect(),
                columns,
            }),
        })
    }

    pub fn full(tablet_schema: &Schema) -> Projection {
        Projection {
            schema: Arc::new(tablet_schema.clone()),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        self.schema.columns()
    }

    /// Map each projected column to its index in `source`, or `None` if the
    /// source predates the column.
    pub fn resolve(&self, source: &Schema) -> Vec<Option<usize>> {
        self.schema
            .columns()
            .iter()
            .map(|col| source.index_of(col.id()))
            .collect()
    }

    /// Apply this projection to a full row laid out per `source`.
    pub fn project_row(&self, mapping: &[Option<usize>], source_row: &Row) -> Row {
        self.schema
            .columns()
            .iter()
            .zip(mapping)
            .map(|(col, idx)| match idx {
                Some(idx) => source_row[*idx].clone(),
                None => col.default().clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_schema() -> Schema {
        Schema::new(
            vec![
                ColumnDesc::new(0, "key", DataType::Int64, false),
                ColumnDesc::new(1, "name", DataType::String, true),
                ColumnDesc::new(2, "val", DataType::Int32, true),
            ],
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_schema_validation() {
        assert!(Schema::new(vec![], 0).is_err());
        assert!(Schema::new(
            vec![ColumnDesc::new(0, "k", DataType::Int64, true)],
            1
        )
        .is_err());
        assert!(Schema::new(
            vec![
                ColumnDesc::new(0, "k", DataType::Int64, false),
                ColumnDesc::new(0, "v", DataType::Int32, true),
            ],
            1
        )
        .is_err());
    }

    #[test]
    fn test_check_row() {
        let schema = test_schema();
        assert!(schema
            .check_row(&vec![
                Datum::Int64(1),
                Datum::String("a".into()),
                Datum::Int32(10)
            ])
            .is_ok());
        assert!(schema
            .check_row(&vec![Datum::Int64(1), Datum::Null, Datum::Null])
            .is_ok());
        assert!(schema.check_row(&vec![Datum::Int64(1)]).is_err());
        assert!(schema
            .check_row(&vec![Datum::Int32(1), Datum::Null, Datum::Null])
            .is_err());
    }

    #[test]
    fn test_projection_fills_defaults() {
        let schema = test_schema();
        let extended = Schema::new(
            vec![
                ColumnDesc::new(0, "key", DataType::Int64, false),
                ColumnDesc::new(1, "name", DataType::String, true),
                ColumnDesc::new(2, "val", DataType::Int32, true),
                ColumnDesc::new(3, "added", DataType::Int32, true)
                    .with_default(Datum::Int32(7)),
            ],
            1,
        )
        .unwrap();

        let proj = Projection::new(&extended, &[0, 3]).unwrap();
        let mapping = proj.resolve(&schema);
        assert_eq!(mapping, vec![Some(0), None]);
        let row = proj.project_row(
            &mapping,
            &vec![Datum::Int64(9), Datum::Null, Datum::Int32(1)],
        );
        assert_eq!(row, vec![Datum::Int64(9), Datum::Int32(7)]);
    }

    #[test]
    fn test_key_compatibility() {
        let a = test_schema();
        let mut cols = a.columns().to_vec();
        cols[1] = ColumnDesc::new(1, "renamed", DataType::String, true);
        let b = Schema::new(cols, 1).unwrap();
        assert!(a.key_compatible_with(&b));

        let c = Schema::new(
            vec![ColumnDesc::new(5, "other", DataType::Int64, false)],
            1,
        )
        .unwrap();
        assert!(!a.key_compatible_with(&c));
    }
}
