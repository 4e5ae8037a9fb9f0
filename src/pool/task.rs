//! What actually travels through the pool's queue.
//!
//! The queue holds `Box<dyn Job>` so tasks with different result types share it.
//! A job either runs (a worker took it) or gets abandoned (`shutdown_now` drained it),
//! both paths end with its future in a terminal state.

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tracing::{trace, warn};

use super::future::FutureCell;
use crate::{cancel::CancelToken, error::TaskError};

pub(super) trait Job: Send {
    fn run(self: Box<Self>);
    fn abandon(self: Box<Self>);
}

pub(super) struct Task<T, F> {
    work: F,
    cell: Arc<FutureCell<T>>,
}

impl<T, F> Task<T, F> {
    pub(super) fn new(work: F, cell: Arc<FutureCell<T>>) -> Self {
        Self { work, cell }
    }
}

impl<T, F> Job for Task<T, F>
where
    T: Send,
    F: FnOnce(&CancelToken) -> Result<T, TaskError> + Send,
{
    fn run(self: Box<Self>) {
        let Task { work, cell } = *self;
        let id = cell.id();

        // shutdown_now may have raced us to it
        if cell.token().is_cancelled() {
            cell.finish(Err(TaskError::Cancelled));
            return;
        }
        if !cell.start() {
            trace!(task = id, "cancelled before start, skipped");
            return;
        }

        trace!(task = id, "task started");
        // a panicking task must not take the worker down with it
        let outcome = catch_unwind(AssertUnwindSafe(|| work(cell.token())))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                warn!(task = id, %message, "task panicked");
                Err(TaskError::Panicked(message))
            });
        if let Err(e) = &outcome {
            trace!(task = id, %e, "task ended without a value");
        }
        cell.finish(outcome);
    }

    fn abandon(self: Box<Self>) {
        trace!(task = self.cell.id(), "task discarded");
        self.cell.finish(Err(TaskError::Cancelled));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
