//! # Hand-made locks
//!
//! The lock layer below [crate::counter::GuardedCounter] and [crate::cache::RwCache]: a mutex and a read-write lock.
//! Both are built on a single atomic state plus futex's wait and wake,
//! taken from the [atomic-wait](https://crates.io/crates/atomic-wait) crate, so not to deal with all the OS-specific stuff:
//! - `wait(&AtomicU32, u32)` - waits until woken up, blocks only if the atomic variable has the specified value, may wake up spuriously
//! - `wake_one(&AtomicU32)` - wakes a single thread that waits on the same atomic variable
//! - `wake_all(&AtomicU32)` - wakes all the threads waiting on the atomic variable
//!
//! Neither lock poisons: a panic while a guard is alive just unlocks on unwind.
//!
//! ## Lock order
//! Nothing in this crate holds two of these locks at once.
//! Code that needs two has to take them in a single global order, see [crate::deadlock].

mod mutex;
mod rwlock;

pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{ReadGuard, RwLock, WriteGuard};
