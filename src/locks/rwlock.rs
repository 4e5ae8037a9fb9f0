//! # Read-write lock
//! It works similarly to the [super::Mutex], but allows 2 types of locking
//! - exclusive / write - completely identical to the Mutex
//! - shared / read - there can be multiple, but they don't allow modifications
//!
//! There could be only one type of locks at a given moment of time.
//!
//! ## Writer starvation
//! A naive lock (state = number of readers, u32::MAX = writer) lets new readers in while a writer waits.
//! With a steady stream of readers the count never drops to 0 and the writer waits forever.
//!
//! So the state is `2 * readers + (1 if a writer waits)`:
//! - even - readers are welcome
//! - odd - somebody wants to write => new readers wait, existing ones finish
//! - u32::MAX (odd too) - write locked
//!
//! Writers don't wait on the state itself, as it changes with every read lock/unlock.
//! They sleep on a separate `writer_wake_counter` which only moves when the lock becomes free for them.
//!
//! All the memory ordering below is for the external users: Release on unlocking and Acquire on locking.

use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{
        AtomicU32,
        Ordering::{Acquire, Relaxed, Release},
    },
};

use atomic_wait::{wait, wake_all, wake_one};

const WRITE_LOCKED: u32 = u32::MAX;

pub struct RwLock<Y> {
    /// number of readers * 2, plus 1 if a writer is waiting; u32::MAX if write locked
    state: AtomicU32,
    /// incremented to wake up writers
    writer_wake_counter: AtomicU32,
    value: UnsafeCell<Y>,
}

/// as the RwLock may hand out multiple &Y to different threads,
/// Y has to be not only Send, but also Sync
unsafe impl<Y> Sync for RwLock<Y> where Y: Send + Sync {}

impl<Y> RwLock<Y> {
    pub const fn new(value: Y) -> Self {
        Self {
            state: AtomicU32::new(0),
            writer_wake_counter: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// lock for reads, waits while there's a writer holding or waiting for the lock
    pub fn read(&self) -> ReadGuard<'_, Y> {
        let mut s = self.state.load(Relaxed);
        loop {
            if s % 2 == 0 {
                // be safe - don't let readers overflow into the write-locked value
                assert!(s < WRITE_LOCKED - 2, "too many readers!");
                match self.state.compare_exchange_weak(s, s + 2, Acquire, Relaxed) {
                    Ok(_) => return ReadGuard { lock: self },
                    Err(e) => s = e, // somebody changed it since we've read it - try again
                }
            }
            if s % 2 == 1 {
                // a writer holds or waits for the lock - let it go first
                wait(&self.state, s);
                s = self.state.load(Relaxed);
            }
        }
    }

    /// lock for reads only if it's possible right now
    pub fn try_read(&self) -> Option<ReadGuard<'_, Y>> {
        let mut s = self.state.load(Relaxed);
        while s % 2 == 0 {
            assert!(s < WRITE_LOCKED - 2, "too many readers!");
            match self.state.compare_exchange_weak(s, s + 2, Acquire, Relaxed) {
                Ok(_) => return Some(ReadGuard { lock: self }),
                Err(e) => s = e,
            }
        }
        None
    }

    /// lock for writes
    pub fn write(&self) -> WriteGuard<'_, Y> {
        let mut s = self.state.load(Relaxed);
        loop {
            // 0 - unlocked, 1 - unlocked with a writer (maybe us) waiting
            if s <= 1 {
                match self.state.compare_exchange(s, WRITE_LOCKED, Acquire, Relaxed) {
                    Ok(_) => return WriteGuard { lock: self },
                    Err(e) => {
                        s = e;
                        continue;
                    }
                }
            }

            // block new readers by making the state odd
            if s % 2 == 0 {
                if let Err(e) = self.state.compare_exchange(s, s + 1, Relaxed, Relaxed) {
                    s = e;
                    continue;
                }
            }

            // the counter is read before the re-check, so a wake between the two isn't lost
            let w = self.writer_wake_counter.load(Acquire);
            s = self.state.load(Relaxed);
            if s >= 2 {
                wait(&self.writer_wake_counter, w);
                s = self.state.load(Relaxed);
            }
        }
    }

    /// lock for writes only if nobody holds the lock right now
    pub fn try_write(&self) -> Option<WriteGuard<'_, Y>> {
        let mut s = self.state.load(Relaxed);
        while s <= 1 {
            match self.state.compare_exchange(s, WRITE_LOCKED, Acquire, Relaxed) {
                Ok(_) => return Some(WriteGuard { lock: self }),
                Err(e) => s = e,
            }
        }
        None
    }

    pub fn get_mut(&mut self) -> &mut Y {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> Y {
        self.value.into_inner()
    }
}

impl<Y: Default> Default for RwLock<Y> {
    fn default() -> Self {
        Self::new(Y::default())
    }
}

pub struct ReadGuard<'a, Y> {
    lock: &'a RwLock<Y>,
}

/// Read guard's main purpose - provide &Y
impl<Y> Deref for ReadGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Self::Target {
        // SAFETY: readers only get shared references and no writer is around
        unsafe { &*self.lock.value.get() }
    }
}

/// Unlocking the read guard - remove our 2 from the state.
/// 3 -> 1 means we were the last reader and a writer waits => wake it.
impl<Y> Drop for ReadGuard<'_, Y> {
    fn drop(&mut self) {
        if self.lock.state.fetch_sub(2, Release) == 3 {
            self.lock.writer_wake_counter.fetch_add(1, Release);
            wake_one(&self.lock.writer_wake_counter);
        }
    }
}

pub struct WriteGuard<'a, Y> {
    lock: &'a RwLock<Y>,
}

/// Write guard also allows to just read the data
impl<Y> Deref for WriteGuard<'_, Y> {
    type Target = Y;
    fn deref(&self) -> &Self::Target {
        // SAFETY: the lock is exclusively ours
        unsafe { &*self.lock.value.get() }
    }
}

/// write guard's main purpose - get &mut Y
impl<Y> DerefMut for WriteGuard<'_, Y> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the lock is exclusively ours
        unsafe { &mut *self.lock.value.get() }
    }
}

/// Unlocking the write guard - we can't tell who and how many are waiting,
/// so wake one writer and all the readers and let them race.
impl<Y> Drop for WriteGuard<'_, Y> {
    fn drop(&mut self) {
        self.lock.state.store(0, Release);
        self.lock.writer_wake_counter.fetch_add(1, Release);
        wake_one(&self.lock.writer_wake_counter);
        wake_all(&self.lock.state);
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
            mpsc, Barrier,
        },
        thread::scope,
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_readers_share_the_lock() {
        let lock = RwLock::new(5);
        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!(10, *r1 + *r2);
        assert!(lock.try_write().is_none());
        drop(r1);
        assert!(lock.try_write().is_none());
        drop(r2);
        assert!(lock.try_write().is_some());
    }

    #[test]
    fn test_writer_excludes_everybody() {
        let lock = RwLock::new(Vec::new());
        let mut w = lock.write();
        w.push(1);
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
        drop(w);
        assert_eq!(vec![1], *lock.read());
    }

    #[test]
    fn test_no_read_overlaps_a_write() {
        let lock = RwLock::new(0u64);
        let readers_inside = AtomicUsize::new(0);
        let writer_inside = AtomicBool::new(false);
        let max_readers = AtomicUsize::new(0);
        let barrier = Barrier::new(9);

        scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    for _ in 0..2_000 {
                        let g = lock.read();
                        let n = readers_inside.fetch_add(1, SeqCst) + 1;
                        max_readers.fetch_max(n, SeqCst);
                        assert!(!writer_inside.load(SeqCst), "read overlapped a write");
                        let _ = *g;
                        readers_inside.fetch_sub(1, SeqCst);
                    }
                });
            }
            s.spawn(|| {
                barrier.wait();
                for _ in 0..500 {
                    let mut g = lock.write();
                    writer_inside.store(true, SeqCst);
                    assert_eq!(0, readers_inside.load(SeqCst), "write overlapped a read");
                    *g += 1;
                    writer_inside.store(false, SeqCst);
                }
            });
        });

        assert_eq!(500, lock.into_inner());
        assert!(max_readers.load(SeqCst) >= 1);
    }

    #[test]
    fn test_writer_is_not_starved_by_readers() {
        let lock = RwLock::new(0);
        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel();

        scope(|s| {
            // a steady stream of overlapping readers
            for _ in 0..4 {
                s.spawn(|| {
                    while !stop.load(SeqCst) {
                        let _g = lock.read();
                        std::hint::spin_loop();
                    }
                });
            }
            s.spawn(|| {
                *lock.write() = 1;
                tx.send(()).unwrap();
            });

            let got_in = rx.recv_timeout(Duration::from_secs(10)).is_ok();
            stop.store(true, SeqCst);
            assert!(got_in, "writer starved");
        });

        assert_eq!(1, *lock.read());
    }
}
