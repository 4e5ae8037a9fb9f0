//! # Cooperative cancellation
//!
//! Nothing here can stop a thread by force. A [CancelToken] is a flag somebody raises
//! and the code that got the token checks it at its own pace:
//! - long-running tasks poll [CancelToken::is_cancelled]
//! - blocking waits (see [crate::queue::BoundedQueue]) register a wake-up callback,
//!   so raising the flag gets them out of the wait right away instead of after a timeout
//!
//! Tokens are cheap to clone, all the clones share one flag.
//! A [CancelToken::child] is cancelled along with its parent, but not the other way around.
//!
//! ## Lock order
//! The callbacks run after the token's own lock is released.
//! They usually take some other lock, so holding both at once is never needed.

use std::{
    fmt,
    sync::{
        atomic::{
            AtomicBool, AtomicU64,
            Ordering::{Acquire, Relaxed, Release},
        },
        Arc, Weak,
    },
};

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    /// keeps a child hooked to its parent for as long as the child lives
    parent: Mutex<Option<Registration>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag and wakes everybody registered. Repeated calls are no-ops.
    pub fn cancel(&self) {
        Inner::cancel(&self.inner);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Acquire)
    }

    /// A token that gets cancelled when this one is. Cancelling the child leaves the parent alone.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let weak = Arc::downgrade(&child.inner);
        match self.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                Inner::cancel(&inner);
            }
        }) {
            Some(registration) => *child.inner.parent.lock() = Some(registration),
            None => child.cancel(),
        }
        child
    }

    /// Runs `callback` once the token is cancelled, on the cancelling thread.
    ///
    /// Returns None without registering anything if the token is already cancelled.
    /// Dropping the [Registration] unregisters the callback.
    pub(crate) fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) -> Option<Registration> {
        let mut callbacks = self.inner.callbacks.lock();
        // checked under the lock, as cancel raises the flag under the same lock
        if self.inner.cancelled.load(Relaxed) {
            return None;
        }
        let id = self.inner.next_id.fetch_add(1, Relaxed);
        callbacks.push((id, Box::new(callback)));
        Some(Registration {
            token: Arc::downgrade(&self.inner),
            id,
        })
    }
}

impl Inner {
    fn cancel(this: &Arc<Inner>) {
        let callbacks = {
            let mut callbacks = this.callbacks.lock();
            if this.cancelled.swap(true, Release) {
                return;
            }
            std::mem::take(&mut *callbacks)
        };
        // the lock is released here - callbacks are free to lock whatever they need
        for (_, callback) in callbacks {
            callback();
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Keeps a callback registered on a token, see [CancelToken::on_cancel].
pub(crate) struct Registration {
    token: Weak<Inner>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.token.upgrade() {
            inner.callbacks.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
