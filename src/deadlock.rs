//! # Deadlock
//!
//! Two threads, two locks:
//! - thread A takes L1, then wants L2
//! - thread B takes L2, then wants L1
//!
//! Each one holds what the other needs => a circular wait, nobody ever moves on.
//! Rust doesn't catch it, neither does the runtime: the only symptom is silence.
//!
//! [DeadlockScenario] reproduces it on purpose, but with a bounded patience for the second lock,
//! so a test can observe that nobody got through instead of hanging forever.
//!
//! Two ways out, both shown here:
//! - [LockOrder::Global] - every thread takes the locks in one global order (L1 before L2), no cycle is possible
//! - [LockOrder::Backoff] - try the second lock for a moment, on failure let go of the first one and retry later

use std::{
    sync::Barrier,
    thread::{self, scope},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// how long a backing-off thread tries for the second lock before letting go of the first
const BACKOFF_ATTEMPT: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOrder {
    /// A: L1 then L2, B: L2 then L1 - the deadlock
    Crossed,
    /// both: L1 then L2
    Global,
    /// crossed, but giving up and retrying instead of waiting
    Backoff,
}

/// Whether each thread reached the point of holding both locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlockReport {
    pub first_finished: bool,
    pub second_finished: bool,
}

impl DeadlockReport {
    pub fn deadlocked(&self) -> bool {
        !self.first_finished && !self.second_finished
    }
}

#[derive(Default)]
pub struct DeadlockScenario {
    lock1: Mutex<()>,
    lock2: Mutex<()>,
}

impl DeadlockScenario {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs both threads to the end. In [LockOrder::Crossed] the end comes after `patience`,
    /// for the others `patience` bounds how long the retries may take.
    /// A patience too large for a deadline (e.g. [Duration::MAX]) never runs out.
    pub fn run(&self, order: LockOrder, patience: Duration) -> DeadlockReport {
        let barrier = Barrier::new(2);
        let deadline = Instant::now().checked_add(patience);
        let (l1, l2) = (&self.lock1, &self.lock2);

        scope(|s| {
            let a = s.spawn(|| match order {
                LockOrder::Crossed => crossed(l1, l2, &barrier, patience),
                LockOrder::Global => ordered(l1, l2),
                LockOrder::Backoff => with_backoff(l1, l2, &barrier, deadline, 1),
            });
            let b = s.spawn(|| match order {
                LockOrder::Crossed => crossed(l2, l1, &barrier, patience),
                LockOrder::Global => ordered(l1, l2),
                LockOrder::Backoff => with_backoff(l2, l1, &barrier, deadline, 3),
            });
            DeadlockReport {
                first_finished: a.join().unwrap_or(false),
                second_finished: b.join().unwrap_or(false),
            }
        })
    }
}

fn crossed(first: &Mutex<()>, second: &Mutex<()>, barrier: &Barrier, patience: Duration) -> bool {
    let _first = first.lock();
    debug!(thread = ?thread::current().id(), "holding the first lock");
    // both hold their first lock past this point
    barrier.wait();
    let finished = second.try_lock_for(patience).is_some();
    // nobody lets go before both gave up, otherwise the slower one would sneak through
    barrier.wait();
    finished
}

fn ordered(l1: &Mutex<()>, l2: &Mutex<()>) -> bool {
    let _l1 = l1.lock();
    let _l2 = l2.lock();
    true
}

/// `seed` makes the two threads back off for different times, so they stop colliding
fn with_backoff(
    first: &Mutex<()>,
    second: &Mutex<()>,
    barrier: &Barrier,
    deadline: Option<Instant>,
    seed: u32,
) -> bool {
    let mut delay = Duration::from_micros(100) * seed;
    let mut first_round = true;
    loop {
        let held = first.lock();
        if first_round {
            // make the first round collide for sure
            barrier.wait();
            first_round = false;
        }
        if second.try_lock_for(BACKOFF_ATTEMPT).is_some() {
            return true;
        }
        drop(held);
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        debug!(?delay, "backing off");
        thread::sleep(delay);
        delay = (delay * 2).min(MAX_BACKOFF);
    }
}

pub fn run() {
    let scenario = DeadlockScenario::new();
    let report = scenario.run(LockOrder::Crossed, Duration::from_secs(2));
    if report.deadlocked() {
        warn!("deadlock: thread A holds lock1 and waits for lock2, thread B holds lock2 and waits for lock1");
    }
    for order in [LockOrder::Global, LockOrder::Backoff] {
        let report = scenario.run(order, Duration::from_secs(2));
        info!(?order, ?report, "same locks, no cycle");
    }
}
