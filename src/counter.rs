//! # Counters
//!
//! Four ways to count from many threads at once:
//! - [RacyCounter] - no synchronization, loses updates, a negative control only
//! - [AtomicCounter] - lock-free, a single atomic read-modify-write per increment
//! - [GuardedCounter] - a plain integer behind a [Mutex]
//! - [KeyedCounter] - many named counters behind one [Mutex]
//!
//! The atomic and guarded ones are linearizable: N threads doing M increments each end with exactly N * M.

use std::{
    collections::HashMap,
    sync::atomic::{
        AtomicI64,
        Ordering::{Relaxed, SeqCst},
    },
    thread::scope,
};

use tracing::info;

use crate::locks::Mutex;

/// Increments as `load` then `store`, the way a plain `value += 1` compiles down to.
/// Two threads may load the same value and both store value + 1 => one increment is lost.
///
/// Relaxed atomics keep it free of UB in Rust, the race is a logical one.
#[derive(Debug, Default)]
pub struct RacyCounter {
    value: AtomicI64,
}

impl RacyCounter {
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    pub fn increment(&self) {
        let v = self.value.load(Relaxed);
        // another thread may store right here
        self.value.store(v + 1, Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Relaxed)
    }
}

/// Lock-free counter.
///
/// Everything is SeqCst so all threads observe the increments in a single total order.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicI64,
}

impl AtomicCounter {
    pub const fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    /// returns the new value
    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    /// returns the new value
    pub fn decrement(&self) -> i64 {
        self.add(-1)
    }

    /// fetch_add returns the old value, so the delta is added once more
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, SeqCst).wrapping_add(delta)
    }

    pub fn get(&self) -> i64 {
        self.value.load(SeqCst)
    }

    /// Stores `new` only if the counter still holds `expected`.
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, SeqCst, SeqCst)
            .is_ok()
    }
}

/// Integer protected by a mutex.
/// The guard unlocks on every exit path, unwinding included.
#[derive(Default)]
pub struct GuardedCounter {
    value: Mutex<i64>,
}

impl GuardedCounter {
    pub const fn new(initial: i64) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }

    pub fn increment(&self) {
        *self.value.lock() += 1;
    }

    /// Increments only if nobody holds the lock right now.
    pub fn try_increment(&self) -> bool {
        match self.value.try_lock() {
            Some(mut g) => {
                *g += 1;
                true
            }
            None => false,
        }
    }

    pub fn get(&self) -> i64 {
        *self.value.lock()
    }
}

/// Named counters sharing a single lock.
#[derive(Default)]
pub struct KeyedCounter {
    counts: Mutex<HashMap<String, i64>>,
}

impl KeyedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// returns the new value of the key's counter, a missing key starts from 0
    pub fn increment(&self, key: &str) -> i64 {
        let mut counts = self.counts.lock();
        // avoid allocating the key on every hit
        if let Some(n) = counts.get_mut(key) {
            *n += 1;
            return *n;
        }
        counts.insert(key.to_owned(), 1);
        1
    }

    pub fn get(&self, key: &str) -> i64 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }
}

/// `threads` threads doing `per_thread` calls of `f` each, all at once.
fn hammer(threads: usize, per_thread: usize, f: impl Fn() + Sync) {
    scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                for _ in 0..per_thread {
                    f();
                }
            });
        }
    });
}

pub fn run_race() {
    let racy = RacyCounter::new();
    hammer(100, 1000, || racy.increment());
    let got = racy.get();
    info!(expected = 100_000, got, lost = 100_000 - got, "unsynchronized counter");
}

pub fn run_atomic() {
    let counter = AtomicCounter::new(0);
    hammer(100, 1000, || {
        counter.increment();
    });
    info!(got = counter.get(), "atomic counter");
}

pub fn run_guarded() {
    let counter = GuardedCounter::new(0);
    hammer(50, 1000, || counter.increment());
    info!(got = counter.get(), "mutex-guarded counter");
}

pub fn run_keyed() {
    let counter = KeyedCounter::new();
    hammer(50, 100, || {
        counter.increment("A");
        counter.increment("B");
        counter.increment("C");
    });
    info!(
        a = counter.get("A"),
        b = counter.get("B"),
        c = counter.get("C"),
        "keyed counters"
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_atomic_counter_is_exact() {
        let counter = AtomicCounter::new(0);
        hammer(100, 1000, || {
            counter.increment();
        });
        assert_eq!(100_000, counter.get());
    }

    #[test]
    fn test_guarded_counter_is_exact() {
        let counter = GuardedCounter::new(0);
        hammer(100, 1000, || counter.increment());
        assert_eq!(100_000, counter.get());
    }

    #[test]
    fn test_racy_counter_never_overcounts() {
        let counter = RacyCounter::new();
        hammer(100, 1000, || counter.increment());
        // less is expected on most runs, but not guaranteed
        let got = counter.get();
        assert!(got <= 100_000);
        assert!(got > 0);
    }

    #[test]
    fn test_atomic_counter_ops() {
        let c = AtomicCounter::new(10);
        assert_eq!(11, c.increment());
        assert_eq!(10, c.decrement());
        assert_eq!(15, c.add(5));
        assert!(!c.compare_and_set(10, 0));
        assert_eq!(15, c.get());
        assert!(c.compare_and_set(15, 0));
        assert_eq!(0, c.get());
    }

    #[test]
    fn test_compare_and_set_has_a_single_winner() {
        let c = AtomicCounter::new(0);
        let winners = AtomicCounter::new(0);
        hammer(16, 1, || {
            if c.compare_and_set(0, 1) {
                winners.increment();
            }
        });
        assert_eq!(1, winners.get());
        assert_eq!(1, c.get());
    }

    #[test]
    fn test_try_increment() {
        let c = GuardedCounter::new(0);
        assert!(c.try_increment());
        {
            let _held = c.value.lock();
            scope(|s| {
                s.spawn(|| assert!(!c.try_increment()));
            });
        }
        assert!(c.try_increment());
        assert_eq!(2, c.get());
    }

    #[test]
    fn test_keyed_counter() {
        let counter = KeyedCounter::new();
        hammer(50, 100, || {
            counter.increment("A");
            counter.increment("B");
        });
        assert_eq!(5000, counter.get("A"));
        assert_eq!(5000, counter.get("B"));
        assert_eq!(0, counter.get("missing"));
    }
}
