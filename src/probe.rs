//! Named fault-injection probe points for flush and compaction.
//!
//! Tests register a callback for a probe name; the pipelines call
//! [`fire`] at each point. Outside of test builds (and the `failpoints`
//! feature) the whole registry compiles away.

/// Probe points fired by the flush pipeline.
pub const POST_SWAP_NEW_MRS: &str = "post_swap_new_mrs";
/// Probe points shared by flush and compaction.
pub const POST_TAKE_MVCC_SNAPSHOT: &str = "post_take_mvcc_snapshot";
pub const POST_WRITE_SNAPSHOT: &str = "post_write_snapshot";
pub const POST_SWAP_IN_DUPLICATING_ROWSET: &str = "post_swap_in_duplicating_rowset";
pub const POST_REUPDATE_MISSED_DELTAS: &str = "post_reupdate_missed_deltas";
pub const POST_SWAP_NEW_ROWSET: &str = "post_swap_new_rowset";

#[cfg(any(test, feature = "failpoints"))]
mod registry {
    use std::collections::HashMap;
    use std::sync::{Arc, OnceLock};

    use parking_lot::Mutex;

    type Hook = Arc<dyn Fn() + Send + Sync>;

    fn hooks() -> &'static Mutex<HashMap<&'static str, Hook>> {
        static HOOKS: OnceLock<Mutex<HashMap<&'static str, Hook>>> = OnceLock::new();
        HOOKS.get_or_init(Default::default)
    }

    pub fn set(name: &'static str, hook: impl Fn() + Send + Sync + 'static) {
        hooks().lock().insert(name, Arc::new(hook));
    }

    pub fn clear(name: &'static str) {
        hooks().lock().remove(name);
    }

    pub fn clear_all() {
        hooks().lock().clear();
    }

    pub fn fire(name: &str) {
        let hook = hooks().lock().get(name).cloned();
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[cfg(any(test, feature = "failpoints"))]
pub use registry::{clear, clear_all, fire, set};

#[cfg(not(any(test, feature = "failpoints")))]
#[inline(always)]
pub fn fire(_name: &str) {}
