//! Per-row exclusive locks keyed by encoded primary key.
//!
//! Row locks serialize all mutations to a key and are always acquired before
//! the transaction's MVCC timestamp, so per-key mutation timestamps strictly
//! increase. Deadlock avoidance is by total key order: multi-row transactions
//! sort their keys before acquiring.
//!
//! A lock slot is a bounded channel holding one permit. Receiving the permit
//! acquires the lock; the guard returns it on drop. This sidesteps the
//! lifetime entanglement of async mutex guards.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use async_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

const LOCK_SHARDS: usize = 16;

type LockSlot = (Sender<()>, Receiver<()>);

pub struct LockManager {
    shards: Vec<Mutex<HashMap<Vec<u8>, LockSlot>>>,
}

/// Exclusive hold on one row. Dropping releases the lock.
pub struct RowLock {
    key: Vec<u8>,
    permit: Sender<()>,
}

impl RowLock {
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl Drop for RowLock {
    fn drop(&mut self) {
        // The channel has capacity one and we hold the only permit.
        self.permit.try_send(()).expect("row lock released twice");
    }
}

impl std::fmt::Debug for RowLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowLock").field("key", &self.key).finish()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            shards: (0..LOCK_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn slot(&self, key: &[u8]) -> LockSlot {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = &self.shards[hasher.finish() as usize % LOCK_SHARDS];
        shard
            .lock()
            .entry(key.to_vec())
            .or_insert_with(|| {
                let (tx, rx) = bounded(1);
                tx.try_send(()).unwrap();
                (tx, rx)
            })
            .clone()
    }

    /// Acquire the exclusive lock for `key`, waiting for the current holder
    /// if necessary.
    pub async fn acquire(&self, key: &[u8]) -> RowLock {
        let (tx, rx) = self.slot(key);
        rx.recv().await.expect("lock slot closed");
        RowLock {
            key: key.to_vec(),
            permit: tx,
        }
    }

    /// Acquire without waiting; `None` if the lock is held.
    pub fn try_acquire(&self, key: &[u8]) -> Option<RowLock> {
        let (tx, rx) = self.slot(key);
        rx.try_recv().ok().map(|()| RowLock {
            key: key.to_vec(),
            permit: tx,
        })
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
