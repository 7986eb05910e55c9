//! Immutable interval index of rowsets by key range.
//!
//! Entries are sorted by minimum key with a running maximum of key-range
//! ends, which prunes stabbing and overlap queries the same way an interval
//! tree does. The tree is never mutated: [`replace`] builds a new tree and
//! the old one stays valid for readers that pinned it (copy-on-write, like
//! every component swap in the engine).
//!
//! Key ranges of distinct entries may intersect only when one of them is a
//! `DuplicatingRowSet` standing in for rowsets being rewritten.
//!
//! [`replace`]: RowSetTree::replace

use std::sync::Arc;

use crate::iterator::ScanRange;
use crate::rowset::RowSet;

pub struct RowSetTree {
    /// Sorted by `min_key`.
    entries: Vec<Arc<dyn RowSet>>,
    /// `prefix_max[i]` = max of `entries[0..=i].max_key()`.
    prefix_max: Vec<Vec<u8>>,
}

impl RowSetTree {
    pub fn empty() -> RowSetTree {
        RowSetTree {
            entries: Vec::new(),
            prefix_max: Vec::new(),
        }
    }

    pub fn new(mut rowsets: Vec<Arc<dyn RowSet>>) -> RowSetTree {
        rowsets.sort_by_key(|r| r.min_key());
        let mut prefix_max = Vec::with_capacity(rowsets.len());
        let mut running: Vec<u8> = Vec::new();
        for rowset in &rowsets {
            let max = rowset.max_key();
            if max > running {
                running = max;
            }
            prefix_max.push(running.clone());
        }
        RowSetTree {
            entries: rowsets,
            prefix_max,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn RowSet>> {
        self.entries.iter()
    }

    /// Rowsets whose key interval covers `key`. More than one only while a
    /// swap is in flight.
    pub fn probe(&self, key: &[u8]) -> Vec<Arc<dyn RowSet>> {
        let mut found = Vec::new();
        let end = self
            .entries
            .partition_point(|r| r.min_key().as_slice() <= key);
        for idx in (0..end).rev() {
            if self.prefix_max[idx].as_slice() < key {
                // Nothing at or before idx can reach up to `key`.
                break;
            }
            if self.entries[idx].max_key().as_slice() >= key {
                found.push(self.entries[idx].clone());
            }
        }
        found.reverse();
        found
    }

    /// Rowsets whose key interval intersects the scan range.
    pub fn overlapping(&self, range: &ScanRange) -> Vec<Arc<dyn RowSet>> {
        let end = match &range.upper {
            Some(upper) => self
                .entries
                .partition_point(|r| r.min_key().as_slice() < upper.as_slice()),
            None => self.entries.len(),
        };
        self.entries[..end]
            .iter()
            .filter(|r| range.intersects(&r.min_key(), &r.max_key()))
            .cloned()
            .collect()
    }

    /// A new tree with `remove` taken out and `add` put in. The removed
    /// entries are matched by identity; every one must be present.
    pub fn replace(&self, remove: &[Arc<dyn RowSet>], add: Vec<Arc<dyn RowSet>>) -> RowSetTree {
        let mut kept: Vec<Arc<dyn RowSet>> = Vec::with_capacity(self.entries.len() + add.len());
        let mut removed = 0;
        for entry in &self.entries {
            if remove.iter().any(|r| Arc::ptr_eq(r, entry)) {
                removed += 1;
            } else {
                kept.push(entry.clone());
            }
        }
        assert_eq!(
            removed,
            remove.len(),
            "rowset tree replace: input rowset not in tree"
        );
        kept.extend(add);
        RowSetTree::new(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memrowset::MemRowSet;
    use crate::schema::{ColumnDesc, DataType, Datum, Schema};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![ColumnDesc::new(0, "k", DataType::Int64, false)], 1).unwrap(),
        )
    }

    /// A MemRowSet spanning [lo, hi] stands in for any rowset in tree tests.
    fn rowset(id: u64, lo: i64, hi: i64) -> Arc<dyn RowSet> {
        let mrs = MemRowSet::new(id, schema());
        for k in [lo, hi] {
            let key = crate::keycode::encode_key(&[Datum::Int64(k)]).unwrap();
            mrs.insert(&key, vec![Datum::Int64(k)], crate::clock::Timestamp::from_raw(1))
                .unwrap();
        }
        mrs
    }

    fn key(k: i64) -> Vec<u8> {
        crate::keycode::encode_key(&[Datum::Int64(k)]).unwrap()
    }

    fn names(rowsets: &[Arc<dyn RowSet>]) -> Vec<String> {
        rowsets.iter().map(|r| r.debug_name()).collect()
    }

    #[test]
    fn test_probe_disjoint() {
        let tree = RowSetTree::new(vec![rowset(1, 0, 10), rowset(2, 20, 30), rowset(3, 40, 50)]);
        assert_eq!(names(&tree.probe(&key(5))), vec!["mrs-1"]);
        assert_eq!(names(&tree.probe(&key(20))), vec!["mrs-2"]);
        assert!(tree.probe(&key(15)).is_empty());
        assert!(tree.probe(&key(99)).is_empty());
    }

    #[test]
    fn test_probe_overlapping() {
        // Overlap as during a compaction swap.
        let tree = RowSetTree::new(vec![rowset(1, 0, 100), rowset(2, 20, 30)]);
        assert_eq!(names(&tree.probe(&key(25))), vec!["mrs-1", "mrs-2"]);
        assert_eq!(names(&tree.probe(&key(50))), vec!["mrs-1"]);
    }

    #[test]
    fn test_overlapping_range() {
        let tree = RowSetTree::new(vec![rowset(1, 0, 10), rowset(2, 20, 30), rowset(3, 40, 50)]);
        let range = ScanRange::new(Some(key(5)), Some(key(45)));
        assert_eq!(names(&tree.overlapping(&range)), vec!["mrs-1", "mrs-2", "mrs-3"]);
        let range = ScanRange::new(Some(key(11)), Some(key(20)));
        assert!(tree.overlapping(&range).is_empty());
        assert_eq!(tree.overlapping(&ScanRange::all()).len(), 3);
    }

    #[test]
    fn test_replace_preserves_old_tree() {
        let a = rowset(1, 0, 10);
        let b = rowset(2, 20, 30);
        let tree = RowSetTree::new(vec![a.clone(), b.clone()]);
        let replacement = rowset(3, 0, 30);
        let new_tree = tree.replace(&[a, b], vec![replacement]);

        assert_eq!(tree.len(), 2);
        assert_eq!(new_tree.len(), 1);
        assert_eq!(names(&new_tree.probe(&key(5))), vec!["mrs-3"]);
    }

    #[test]
    #[should_panic(expected = "not in tree")]
    fn test_replace_missing_input_panics() {
        let tree = RowSetTree::new(vec![rowset(1, 0, 10)]);
        tree.replace(&[rowset(9, 0, 1)], vec![]);
    }
}
