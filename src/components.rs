//! The atomically-swapped storage bundle of a tablet.

use std::sync::Arc;

use crate::memrowset::MemRowSet;
use crate::rowset_tree::RowSetTree;

/// Immutable pair of the current MemRowSet and the rowset tree.
///
/// Every write and every read clones one `Arc<TabletComponents>` under the
/// component lock and works against it; swaps install a whole new bundle
/// under the lock held exclusively. Storage referenced by a bundle stays
/// alive until the last clone drops, which is what lets maintenance delete
/// rowset files only once no reader can see them.
pub struct TabletComponents {
    pub memrowset: Arc<MemRowSet>,
    pub rowsets: Arc<RowSetTree>,
}

impl TabletComponents {
    pub fn new(memrowset: Arc<MemRowSet>, rowsets: Arc<RowSetTree>) -> Arc<TabletComponents> {
        Arc::new(TabletComponents { memrowset, rowsets })
    }
}
