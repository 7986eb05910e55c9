//! The read path: per-rowset row streams unioned under an MVCC snapshot.
//!
//! A scan pins one [`TabletComponents`] bundle and one snapshot, asks the
//! rowset tree for candidates overlapping the range, merges the per-rowset
//! streams by key, filters, projects, and yields finite row blocks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::Timestamp;
use crate::components::TabletComponents;
use crate::error::{TabletResult, TracedTabletError};
use crate::mvcc::MvccSnapshot;
use crate::rowset::RowSet as _;
use crate::schema::{ColumnId, Datum, Projection, Row, Schema};

/// Half-open key range `[lower, upper)` over encoded keys.
#[derive(Clone, Debug, Default)]
pub struct ScanRange {
    pub lower: Option<Vec<u8>>,
    pub upper: Option<Vec<u8>>,
}

impl ScanRange {
    pub fn all() -> ScanRange {
        ScanRange::default()
    }

    pub fn new(lower: Option<Vec<u8>>, upper: Option<Vec<u8>>) -> ScanRange {
        ScanRange { lower, upper }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        if let Some(lower) = &self.lower {
            if key < lower.as_slice() {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if key >= upper.as_slice() {
                return false;
            }
        }
        true
    }

    /// Whether the range intersects the closed key interval `[min, max]`.
    pub fn intersects(&self, min: &[u8], max: &[u8]) -> bool {
        if let Some(lower) = &self.lower {
            if max < lower.as_slice() {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if min >= upper.as_slice() {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredicateOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A simple column-vs-constant predicate, conjunctive with its siblings.
#[derive(Clone, Debug)]
pub struct ColumnPredicate {
    pub column_id: ColumnId,
    pub op: PredicateOp,
    pub value: Datum,
}

fn compare_datums(a: &Datum, b: &Datum) -> Option<Ordering> {
    match (a, b) {
        (Datum::Bool(a), Datum::Bool(b)) => Some(a.cmp(b)),
        (Datum::Int32(a), Datum::Int32(b)) => Some(a.cmp(b)),
        (Datum::Int64(a), Datum::Int64(b)) => Some(a.cmp(b)),
        (Datum::Float64(a), Datum::Float64(b)) => a.partial_cmp(b),
        (Datum::String(a), Datum::String(b)) => Some(a.cmp(b)),
        (Datum::Binary(a), Datum::Binary(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

impl ColumnPredicate {
    /// Evaluate against a row laid out in `schema`. Nulls and type
    /// mismatches fail the predicate.
    pub fn matches(&self, schema: &Schema, row: &Row) -> bool {
        let Some(idx) = schema.index_of(self.column_id) else {
            return false;
        };
        let Some(ord) = compare_datums(&row[idx], &self.value) else {
            return false;
        };
        match self.op {
            PredicateOp::Eq => ord == Ordering::Equal,
            PredicateOp::Lt => ord == Ordering::Less,
            PredicateOp::Le => ord != Ordering::Greater,
            PredicateOp::Gt => ord == Ordering::Greater,
            PredicateOp::Ge => ord != Ordering::Less,
        }
    }
}

/// What to scan: fixed at [`TabletIterator::init`] time.
#[derive(Clone, Debug, Default)]
pub struct ScanSpec {
    pub range: ScanRange,
    pub predicates: Vec<ColumnPredicate>,
}

impl ScanSpec {
    pub fn all() -> ScanSpec {
        ScanSpec::default()
    }

    pub fn with_range(range: ScanRange) -> ScanSpec {
        ScanSpec {
            range,
            predicates: Vec::new(),
        }
    }
}

/// One visible row version surfaced by a rowset iterator.
#[derive(Clone, Debug)]
pub struct VersionedRow {
    pub key: Vec<u8>,
    /// The row materialized into the tablet schema.
    pub row: Row,
    /// Timestamp of the newest visible mutation of this version, used to
    /// break ties when the same key transiently surfaces from two rowsets.
    pub ts: Timestamp,
}

/// A finite, ordered stream of visible row versions.
#[async_trait]
pub trait RowVersionIterator: Send {
    async fn next_row(&mut self) -> TabletResult<Option<VersionedRow>>;
}

struct HeapEntry {
    row: VersionedRow,
    src: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap: invert the key order so the smallest
        // key pops first, and among equal keys the newest version wins.
        other
            .row
            .key
            .cmp(&self.row.key)
            .then(self.row.ts.cmp(&other.row.ts))
            .then(other.src.cmp(&self.src))
    }
}

/// K-way merge of per-rowset streams, ordered by key.
///
/// Keys are unique across rowsets except transiently while a
/// `DuplicatingRowSet` mirrors a swap; duplicates collapse to the version
/// with the newest visible mutation.
pub struct MergeIterator {
    iters: Vec<Box<dyn RowVersionIterator>>,
    heap: BinaryHeap<HeapEntry>,
    initialized: bool,
}

impl MergeIterator {
    pub fn new(iters: Vec<Box<dyn RowVersionIterator>>) -> MergeIterator {
        MergeIterator {
            heap: BinaryHeap::with_capacity(iters.len()),
            iters,
            initialized: false,
        }
    }

    async fn advance(&mut self, src: usize) -> TabletResult<()> {
        if let Some(row) = self.iters[src].next_row().await? {
            self.heap.push(HeapEntry { row, src });
        }
        Ok(())
    }
}

#[async_trait]
impl RowVersionIterator for MergeIterator {
    async fn next_row(&mut self) -> TabletResult<Option<VersionedRow>> {
        if !self.initialized {
            self.initialized = true;
            for src in 0..self.iters.len() {
                self.advance(src).await?;
            }
        }
        let Some(winner) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(winner.src).await?;
        // Collapse older versions of the same key from other rowsets.
        while let Some(top) = self.heap.peek() {
            if top.row.key != winner.row.key {
                break;
            }
            let dup = self.heap.pop().unwrap();
            self.advance(dup.src).await?;
        }
        Ok(Some(winner.row))
    }
}

/// A block of projected rows returned by [`TabletIterator::next_block`].
#[derive(Clone, Debug)]
pub struct RowBlock {
    schema: Arc<Schema>,
    rows: Vec<Row>,
}

impl RowBlock {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A tablet scan. Holds its components reference live for its whole
/// lifetime, so the rowsets it reads cannot be deleted underneath it.
///
/// Produced uninitialized by [`Tablet::new_iterator`]; [`init`] fixes the
/// range and predicates. The stream is finite and non-restartable.
///
/// [`Tablet::new_iterator`]: crate::tablet::Tablet::new_iterator
/// [`init`]: TabletIterator::init
pub struct TabletIterator {
    components: Arc<TabletComponents>,
    snapshot: MvccSnapshot,
    tablet_schema: Arc<Schema>,
    projection: Projection,
    spec: ScanSpec,
    merge: Option<MergeIterator>,
    done: bool,
}

impl TabletIterator {
    pub(crate) fn new(
        components: Arc<TabletComponents>,
        snapshot: MvccSnapshot,
        tablet_schema: Arc<Schema>,
        projection: Projection,
    ) -> TabletIterator {
        TabletIterator {
            components,
            snapshot,
            tablet_schema,
            projection,
            spec: ScanSpec::all(),
            merge: None,
            done: false,
        }
    }

    pub fn snapshot(&self) -> &MvccSnapshot {
        &self.snapshot
    }

    /// Fix the scan range and predicates and build the per-rowset streams.
    pub async fn init(&mut self, spec: ScanSpec) -> TabletResult<()> {
        if self.merge.is_some() {
            return Err(TracedTabletError::invalid_argument(
                "iterator already initialized",
            ));
        }
        let mut iters: Vec<Box<dyn RowVersionIterator>> = Vec::new();
        iters.push(self.components.memrowset.clone().version_iterator(
            &self.tablet_schema,
            &self.snapshot,
            &spec.range,
        ));
        for rowset in self.components.rowsets.overlapping(&spec.range) {
            iters.push(
                rowset
                    .new_iterator(&self.tablet_schema, &self.snapshot, &spec.range)
                    .await?,
            );
        }
        self.spec = spec;
        self.merge = Some(MergeIterator::new(iters));
        Ok(())
    }

    /// Yield up to `max_rows` projected rows, or `None` at the end of the
    /// scan.
    pub async fn next_block(&mut self, max_rows: usize) -> TabletResult<Option<RowBlock>> {
        let merge = self.merge.as_mut().ok_or_else(|| {
            TracedTabletError::invalid_argument("iterator used before init")
        })?;
        if self.done {
            return Ok(None);
        }
        let mapping: Vec<Option<usize>> = self.projection.resolve(&self.tablet_schema);
        let mut rows = Vec::new();
        while rows.len() < max_rows {
            match merge.next_row().await? {
                Some(version) => {
                    if self
                        .spec
                        .predicates
                        .iter()
                        .all(|p| p.matches(&self.tablet_schema, &version.row))
                    {
                        rows.push(self.projection.project_row(&mapping, &version.row));
                    }
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(RowBlock {
                schema: self.projection.schema().clone(),
                rows,
            }))
        }
    }

    /// Drain the remainder of the scan.
    pub async fn collect_rows(&mut self) -> TabletResult<Vec<Row>> {
        let mut all = Vec::new();
        while let Some(block) = self.next_block(1024).await? {
            all.extend(block.into_rows());
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecIterator {
        rows: std::vec::IntoIter<VersionedRow>,
    }

    #[async_trait]
    impl RowVersionIterator for VecIterator {
        async fn next_row(&mut self) -> TabletResult<Option<VersionedRow>> {
            Ok(self.rows.next())
        }
    }

    fn iter_of(rows: Vec<(&[u8], i64, u64)>) -> Box<dyn RowVersionIterator> {
        Box::new(VecIterator {
            rows: rows
                .into_iter()
                .map(|(key, v, ts)| VersionedRow {
                    key: key.to_vec(),
                    row: vec![Datum::Int64(v)],
                    ts: Timestamp::from_raw(ts),
                })
                .collect::<Vec<_>>()
                .into_iter(),
        })
    }

    #[tokio::test]
    async fn test_merge_orders_by_key() {
        let mut merge = MergeIterator::new(vec![
            iter_of(vec![(b"a", 1, 1), (b"c", 3, 1)]),
            iter_of(vec![(b"b", 2, 1), (b"d", 4, 1)]),
        ]);
        let mut keys = vec![];
        while let Some(row) = merge.next_row().await.unwrap() {
            keys.push(row.key);
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[tokio::test]
    async fn test_merge_collapses_duplicates_to_newest() {
        let mut merge = MergeIterator::new(vec![
            iter_of(vec![(b"a", 10, 5), (b"b", 1, 1)]),
            iter_of(vec![(b"a", 99, 9)]),
        ]);
        let row = merge.next_row().await.unwrap().unwrap();
        assert_eq!(row.row, vec![Datum::Int64(99)]);
        let row = merge.next_row().await.unwrap().unwrap();
        assert_eq!(row.key, b"b".to_vec());
        assert!(merge.next_row().await.unwrap().is_none());
    }

    #[test]
    fn test_scan_range() {
        let range = ScanRange::new(Some(b"b".to_vec()), Some(b"d".to_vec()));
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(!range.contains(b"d"));
        assert!(range.intersects(b"a", b"b"));
        assert!(!range.intersects(b"d", b"e"));
        assert!(!range.intersects(b"a", b"a"));
    }
}
