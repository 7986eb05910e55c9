use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for the logical counter of a hybrid timestamp.
const LOGICAL_BITS: u32 = 12;

/// A hybrid timestamp: microseconds since the epoch in the high bits, a
/// logical tie-break counter in the low [`LOGICAL_BITS`] bits. Totally
/// ordered; once issued by a [`HybridClock`] it never travels backward within
/// the process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn from_raw(value: u64) -> Self {
        Timestamp(value)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(self) -> u64 {
        self.0 & ((1 << LOGICAL_BITS) - 1)
    }

    /// The smallest timestamp strictly greater than `self`.
    pub(crate) fn successor(self) -> Timestamp {
        Timestamp(self.0 + 1)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts({}.{})", self.physical_micros(), self.logical())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic hybrid timestamp source feeding MVCC.
///
/// `now` reads the wall clock and bumps the logical counter whenever the
/// physical component did not advance, so issued timestamps are strictly
/// increasing process-wide.
#[derive(Debug)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    fn physical_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_micros() as u64
    }

    /// Issue a fresh timestamp, strictly greater than every previously issued
    /// or observed one.
    pub fn now(&self) -> Timestamp {
        let wall = Self::physical_now() << LOGICAL_BITS;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = std::cmp::max(wall, last + 1);
            match self.last.compare_exchange_weak(
                last,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Timestamp(next),
                Err(observed) => last = observed,
            }
        }
    }

    /// The latest timestamp issued or observed so far. Unlike [`now`], does
    /// not consume a timestamp.
    ///
    /// [`now`]: HybridClock::now
    pub fn last_issued(&self) -> Timestamp {
        Timestamp(self.last.load(Ordering::Acquire))
    }

    /// Record a timestamp issued elsewhere (replay), so that subsequently
    /// issued timestamps sort after it.
    pub fn observe(&self, ts: Timestamp) {
        self.last.fetch_max(ts.0, Ordering::AcqRel);
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_monotonic_single_thread() {
        let clock = HybridClock::new();
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_monotonic_across_threads() {
        let clock = Arc::new(HybridClock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..1000).map(|_| clock.now()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<Timestamp> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let len = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), len, "clock issued a duplicate timestamp");
    }

    #[test]
    fn test_observe_advances() {
        let clock = HybridClock::new();
        let far_future = Timestamp(u64::MAX / 2);
        clock.observe(far_future);
        assert!(clock.now() > far_future);
    }
}
