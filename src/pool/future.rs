//! # Future
//!
//! A handle to the outcome of a task submitted to the [super::ThreadPool].
//!
//! It's a one-slot channel between the worker and whoever holds the handle: a Mutex'ed slot plus a Condvar to wait on.
//! The slot only moves forward: pending -> running -> one of completed / failed / cancelled, and never back.
//! A late writer (e.g. a task finishing after it got cancelled) finds the slot terminal and its result is dropped.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::{cancel::CancelToken, error::TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl FutureState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FutureState::Pending | FutureState::Running)
    }
}

enum Slot<T> {
    Pending,
    Running,
    Done(Result<T, TaskError>),
    /// the value went to `get`, which consumed the only handle
    Taken,
}

impl<T> Slot<T> {
    fn state(&self) -> FutureState {
        match self {
            Slot::Pending => FutureState::Pending,
            Slot::Running => FutureState::Running,
            Slot::Done(Ok(_)) | Slot::Taken => FutureState::Completed,
            Slot::Done(Err(TaskError::Cancelled)) => FutureState::Cancelled,
            Slot::Done(Err(_)) => FutureState::Failed,
        }
    }
}

/// The part shared between the handle and the worker.
pub(super) struct FutureCell<T> {
    id: u64,
    slot: Mutex<Slot<T>>,
    done: Condvar,
    token: CancelToken,
}

impl<T> FutureCell<T> {
    pub(super) fn new(id: u64, token: CancelToken) -> Arc<Self> {
        Arc::new(Self {
            id,
            slot: Mutex::new(Slot::Pending),
            done: Condvar::new(),
            token,
        })
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn token(&self) -> &CancelToken {
        &self.token
    }

    /// pending -> running, false if the task got cancelled before a worker reached it
    pub(super) fn start(&self) -> bool {
        let mut slot = self.slot.lock();
        match *slot {
            Slot::Pending => {
                *slot = Slot::Running;
                true
            }
            _ => false,
        }
    }

    /// Stores the outcome unless the slot is already terminal.
    pub(super) fn finish(&self, outcome: Result<T, TaskError>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending | Slot::Running) {
            trace!(task = self.id, "outcome arrived after cancellation, dropped");
            return false;
        }
        *slot = Slot::Done(outcome);
        drop(slot);
        self.done.notify_all();
        true
    }
}

pub struct Future<T> {
    cell: Arc<FutureCell<T>>,
}

impl<T> Future<T> {
    pub(super) fn new(cell: Arc<FutureCell<T>>) -> Self {
        Self { cell }
    }

    /// the pool-wide task number, handy in logs
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    /// Blocks until the task is done, then hands out its value or its failure.
    pub fn get(self) -> Result<T, TaskError> {
        let mut slot = self.cell.slot.lock();
        self.wait_done(&mut slot, None);
        take(&mut slot)
    }

    /// Like [Self::get], but gives up with [TaskError::TimedOut] after `timeout`.
    /// The task itself isn't affected. A timeout too large for a deadline waits for as long as it takes.
    pub fn get_timeout(self, timeout: Duration) -> Result<T, TaskError> {
        let mut slot = self.cell.slot.lock();
        if !self.wait_done(&mut slot, Instant::now().checked_add(timeout)) {
            return Err(TaskError::TimedOut);
        }
        take(&mut slot)
    }

    /// Waits up to `timeout` without consuming the outcome, true if it's there.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut slot = self.cell.slot.lock();
        self.wait_done(&mut slot, Instant::now().checked_add(timeout))
    }

    /// true once the slot is terminal, false if `deadline` passed first (None - no deadline)
    fn wait_done(&self, slot: &mut MutexGuard<'_, Slot<T>>, deadline: Option<Instant>) -> bool {
        while !slot.state().is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.cell.done.wait_until(slot, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cell.done.wait(slot),
            }
        }
        slot.state().is_terminal()
    }

    pub fn state(&self) -> FutureState {
        self.cell.slot.lock().state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Moves a not-yet-finished future to cancelled and raises the task's token.
    ///
    /// A task that hasn't started never will. A running one keeps going until it looks at its token,
    /// whatever it returns then is dropped. Returns false if the future was already done.
    pub fn cancel(&self) -> bool {
        {
            let mut slot = self.cell.slot.lock();
            if slot.state().is_terminal() {
                return false;
            }
            *slot = Slot::Done(Err(TaskError::Cancelled));
        }
        self.cell.done.notify_all();
        // outside of the slot's lock, the token runs callbacks
        self.cell.token.cancel();
        trace!(task = self.cell.id, "cancelled via its future");
        true
    }
}

fn take<T>(slot: &mut Slot<T>) -> Result<T, TaskError> {
    match std::mem::replace(slot, Slot::Taken) {
        Slot::Done(outcome) => outcome,
        // get consumes the handle and only returns once the slot is Done
        Slot::Pending | Slot::Running | Slot::Taken => Err(TaskError::Cancelled),
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("task", &self.cell.id)
            .field("state", &self.state())
            .finish()
    }
}
