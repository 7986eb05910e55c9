//! Multi-version concurrency control.
//!
//! Every write transaction gets a timestamp from the [`HybridClock`] and is
//! tracked in the in-flight set until commit. Snapshots capture
//! `(committed-before, exclusions)`: a mutation at `ts` is visible iff
//! `ts < committed_before` and `ts` is not excluded.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::clock::{HybridClock, Timestamp};
use crate::error::{TabletResult, TracedTabletError};

/// A consistent visibility cut.
#[derive(Clone, Debug, Default)]
pub struct MvccSnapshot {
    committed_before: Timestamp,
    /// In-flight timestamps below `committed_before`, sorted.
    exclusions: Vec<Timestamp>,
}

impl MvccSnapshot {
    /// A snapshot in which everything strictly before `ts` is visible.
    pub fn committed_before(ts: Timestamp) -> MvccSnapshot {
        MvccSnapshot {
            committed_before: ts,
            exclusions: Vec::new(),
        }
    }

    pub fn is_visible(&self, ts: Timestamp) -> bool {
        ts < self.committed_before && self.exclusions.binary_search(&ts).is_err()
    }

    /// Upper bound of this snapshot: no timestamp at or above this is visible.
    pub fn bound(&self) -> Timestamp {
        self.committed_before
    }
}

/// An open transaction's claim on its timestamp. Surrender it to
/// [`MvccManager::commit`].
#[derive(Debug)]
#[must_use = "a begun transaction must be committed"]
pub struct TxnHandle {
    ts: Timestamp,
}

impl TxnHandle {
    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }
}

#[derive(Default)]
struct MvccInner {
    in_flight: BTreeSet<Timestamp>,
}

/// Allocates transaction timestamps, tracks the in-flight set, and
/// materializes snapshots.
pub struct MvccManager {
    clock: Arc<HybridClock>,
    inner: Mutex<MvccInner>,
    /// Largest timestamp with no in-flight transaction at or below it.
    safe_tx: watch::Sender<Timestamp>,
    safe_rx: watch::Receiver<Timestamp>,
}

impl MvccManager {
    pub fn new(clock: Arc<HybridClock>) -> Self {
        let (safe_tx, safe_rx) = watch::channel(Timestamp::MIN);
        Self {
            clock,
            inner: Mutex::new(MvccInner::default()),
            safe_tx,
            safe_rx,
        }
    }

    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    /// Begin a transaction at a fresh timestamp.
    pub fn begin(&self) -> TxnHandle {
        let mut inner = self.inner.lock();
        let ts = self.clock.now();
        inner.in_flight.insert(ts);
        TxnHandle { ts }
    }

    /// Begin a transaction at a caller-supplied timestamp (replay). Fails if
    /// the timestamp is already inside the committed region.
    pub fn begin_at(&self, ts: Timestamp) -> TabletResult<TxnHandle> {
        let mut inner = self.inner.lock();
        if ts <= self.safe_time() {
            return Err(TracedTabletError::invalid_argument(format!(
                "replay timestamp {ts} is not beyond the safe timestamp"
            )));
        }
        if !inner.in_flight.insert(ts) {
            return Err(TracedTabletError::invalid_argument(format!(
                "timestamp {ts} is already in flight"
            )));
        }
        self.clock.observe(ts);
        Ok(TxnHandle { ts })
    }

    /// Commit a transaction. Committing an unknown transaction is a bug and
    /// aborts the process.
    pub fn commit(&self, handle: TxnHandle) {
        let mut inner = self.inner.lock();
        assert!(
            inner.in_flight.remove(&handle.ts),
            "commit of unknown transaction {:?}",
            handle.ts
        );
        let safe = match inner.in_flight.first() {
            Some(first) => Timestamp::from_raw(first.as_raw() - 1),
            None => self.clock.last_issued(),
        };
        self.safe_tx.send_if_modified(|current| {
            if safe > *current {
                *current = safe;
                true
            } else {
                false
            }
        });
    }

    /// Largest timestamp with nothing in flight at or below it.
    pub fn safe_time(&self) -> Timestamp {
        *self.safe_rx.borrow()
    }

    /// Snapshot the present: everything committed so far is visible,
    /// everything in flight is excluded.
    pub fn snapshot(&self) -> MvccSnapshot {
        let inner = self.inner.lock();
        // A fresh timestamp bounds the snapshot; it is never reused by any
        // transaction, so every committed mutation sorts strictly below it.
        let committed_before = self.clock.now();
        MvccSnapshot {
            committed_before,
            exclusions: inner.in_flight.iter().copied().collect(),
        }
    }

    /// Historical snapshot at `ts`: waits until the safe timestamp reaches
    /// `ts`, then returns a cut with no exclusions.
    pub async fn snapshot_at(&self, ts: Timestamp) -> MvccSnapshot {
        self.wait_until_safe(ts).await;
        MvccSnapshot::committed_before(ts.successor())
    }

    /// Wait until every transaction with a timestamp at or below `ts` has
    /// committed.
    pub async fn wait_until_safe(&self, ts: Timestamp) {
        let mut rx = self.safe_rx.clone();
        while *rx.borrow_and_update() < ts {
            // The sender lives as long as `self`.
            rx.changed().await.expect("mvcc manager dropped while waiting");
        }
    }
}
