//! # Mutex
//!
//! It's a u32 state instead of a boolean so it works with wait & wake.
//!
//! Wait and wake don't take any part in memory consistency or correctness of the Mutex.
//! They just spare us from wasting processor cycles.
//!
//! ## Avoiding syscalls
//! Both syscalls are slow => the state has a 3rd value, `2`, meaning "locked and somebody may be waiting".
//! Unlocking only calls `wake_one` if it sees the `2`, so an uncontended lock/unlock pair makes no syscalls at all.
//!
//! ## Spinning first
//! Most critical sections are short (a counter bump), so a waiter spins for a bit before going to sleep.
//! See [Mutex::lock_contended].

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicU32,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use atomic_wait::{wait, wake_one};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

pub struct Mutex<Y> {
    /// 0 - unlocked
    /// 1 - locked, no other threads
    /// 2 - locked, other threads may be waiting
    state: AtomicU32,
    value: UnsafeCell<Y>,
}

/// promise to the compiler that it's safe to share if the underlying value is safe to send
unsafe impl<Y> Sync for Mutex<Y> where Y: Send {}

impl<Y> Mutex<Y> {
    pub const fn new(value: Y) -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            value: UnsafeCell::new(value),
        }
    }

    /// Blocks until the lock is ours.
    pub fn lock(&self) -> MutexGuard<'_, Y> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_err()
        {
            // somebody holds it => do the logic to wait
            Self::lock_contended(&self.state);
        }
        MutexGuard { mutex: self }
    }

    /// Takes the lock only if it's free right now, never waits.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Y>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .ok()
            .map(|_| MutexGuard { mutex: self })
    }

    /// `&mut self` is a proof nobody else can lock it
    pub fn get_mut(&mut self) -> &mut Y {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> Y {
        self.value.into_inner()
    }

    /// The waiting part:
    /// - spin for some cycles
    /// - engage the wait syscall if still locked
    #[cold]
    fn lock_contended(state: &AtomicU32) {
        let mut spin_count = 0;

        // load here, as compare_exchange has impact on cache perf
        // only check for 1, as 2 means that some other thread already gave up spinning
        while state.load(Relaxed) == LOCKED && spin_count < 100 {
            spin_count += 1;
            std::hint::spin_loop();
        }

        if state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_ok()
        {
            return;
        }

        // the last resort - sleep
        // the lock is left in 2 on success so our unlock doesn't lose other potential waiters
        while state.swap(CONTENDED, Acquire) != UNLOCKED {
            wait(state, CONTENDED);
        }
    }
}

impl<Y: Default> Default for Mutex<Y> {
    fn default() -> Self {
        Self::new(Y::default())
    }
}

/// Guard structure to ease ownership and usage.
/// It's the only way to get to the value and dropping it is the only way to unlock.
pub struct MutexGuard<'a, Y> {
    mutex: &'a Mutex<Y>,
}

unsafe impl<Y> Send for MutexGuard<'_, Y> where Y: Send {}
unsafe impl<Y> Sync for MutexGuard<'_, Y> where Y: Sync {}

impl<Y> Deref for MutexGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Self::Target {
        // SAFETY: existence of the guard means the lock is ours
        unsafe { &*self.mutex.value.get() }
    }
}

impl<Y> DerefMut for MutexGuard<'_, Y> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: existence of the guard means the lock is ours
        unsafe { &mut *self.mutex.value.get() }
    }
}

/// There're no guarantees that the lock will be obtained by the thread we wake up.
/// Any other thread may be faster.
impl<Y> Drop for MutexGuard<'_, Y> {
    fn drop(&mut self) {
        // wake the thread only if someone switched the state to 2
        if self.mutex.state.swap(UNLOCKED, Release) == CONTENDED {
            wake_one(&self.mutex.state);
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread::scope;

    use super::*;

    #[test]
    fn test_mutex_counts_every_increment() {
        let m = Mutex::new(0u64);
        scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        *m.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(80_000, m.into_inner());
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let m = Mutex::new(());
        let g = m.lock();
        scope(|s| {
            // a different thread, as it's what matters
            s.spawn(|| assert!(m.try_lock().is_none()));
        });
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn test_guard_released_on_panic() {
        let m = Mutex::new(1);
        scope(|s| {
            let jh = s.spawn(|| {
                let _g = m.lock();
                panic!("unwinding through the guard");
            });
            assert!(jh.join().is_err());
        });
        // no poisoning - just unlocked
        assert_eq!(1, *m.lock());
    }
}
