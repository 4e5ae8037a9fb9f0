//! # Bounded blocking queue
//!
//! A FIFO buffer of fixed capacity for producer / consumer handoff.
//! It's the VecDeque + Condvar channel with the flaws fixed:
//! - the size is limited => producers wait on `not_full` while it's full
//! - consumers wait on `not_empty` while it's empty
//! - every wait re-checks its predicate in a loop, as wake-ups can be spurious
//!   or stolen by another waiter of the same kind
//!
//! On top of that a queue can be closed (producers get [QueueError::Closed] right away,
//! consumers drain what's left first) and any blocking call can give up,
//! either on a deadline or on a [CancelToken].
//!
//! All the mutation happens under the queue's own lock, nobody sees a half-done put or take.
//! The lock is never held while calling out, so the queue can't take part in a lock-order cycle.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    thread::scope,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::{
    cancel::{CancelToken, Registration},
    error::QueueError,
};

/// don't preallocate more than this, unbounded queues included
const MAX_PREALLOCATED: usize = 1024;

pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// signalled after a take
    not_full: Condvar,
    /// signalled after a put
    not_empty: Condvar,
    /// usize::MAX for an unbounded queue
    capacity: usize,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Clones are handles to the same queue.
impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        Ok(Self::with_capacity(capacity))
    }

    /// A queue whose puts never wait for space.
    pub fn unbounded() -> Self {
        Self::with_capacity(usize::MAX)
    }

    fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity.min(MAX_PREALLOCATED)),
                    closed: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Waits for space, then appends the item.
    pub fn put(&self, item: T) -> Result<(), QueueError> {
        self.put_inner(item, None, None)
    }

    /// Waits for an item, then removes it from the front.
    /// Returns [QueueError::Closed] only once the queue is closed *and* empty.
    pub fn take(&self) -> Result<T, QueueError> {
        self.take_inner(None, None)
    }

    /// A timeout too large to form a deadline (e.g. [Duration::MAX]) means no deadline at all.
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        self.put_inner(item, None, Instant::now().checked_add(timeout))
    }

    pub fn take_timeout(&self, timeout: Duration) -> Result<T, QueueError> {
        self.take_inner(None, Instant::now().checked_add(timeout))
    }

    /// Never waits: [QueueError::Full] instead.
    pub fn try_put(&self, item: T) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.items.len() >= self.shared.capacity {
            return Err(QueueError::Full);
        }
        state.items.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Never waits: [QueueError::Empty] instead.
    pub fn try_take(&self) -> Result<T, QueueError> {
        let mut state = self.shared.state.lock();
        match state.items.pop_front() {
            Some(item) => {
                drop(state);
                self.shared.not_full.notify_one();
                Ok(item)
            }
            None if state.closed => Err(QueueError::Closed),
            None => Err(QueueError::Empty),
        }
    }

    /// No more puts. Takes keep working until the queue is empty.
    /// Wakes all the waiters so they see the news.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        debug!(remaining = state.items.len(), "queue closed");
        drop(state);
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Removes everything in one go, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.shared.state.lock().items.drain(..).collect();
        if !drained.is_empty() {
            self.shared.not_full.notify_all();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// None for an unbounded queue
    pub fn capacity(&self) -> Option<usize> {
        (self.shared.capacity != usize::MAX).then_some(self.shared.capacity)
    }

    fn put_inner(
        &self,
        item: T,
        token: Option<&CancelToken>,
        deadline: Option<Instant>,
    ) -> Result<(), QueueError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        loop {
            if token.is_some_and(CancelToken::is_cancelled) {
                return Err(give_up(state, &shared.not_full, QueueError::Cancelled, |s| {
                    s.items.len() < shared.capacity
                }));
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.items.len() < shared.capacity {
                break;
            }
            if wait(&shared.not_full, &mut state, deadline) {
                if state.items.len() >= shared.capacity && !state.closed {
                    return Err(QueueError::TimedOut);
                }
                // a take sneaked in right at the deadline - just go on
            }
        }
        state.items.push_back(item);
        drop(state);
        shared.not_empty.notify_one();
        Ok(())
    }

    fn take_inner(
        &self,
        token: Option<&CancelToken>,
        deadline: Option<Instant>,
    ) -> Result<T, QueueError> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        loop {
            if token.is_some_and(CancelToken::is_cancelled) {
                return Err(give_up(state, &shared.not_empty, QueueError::Cancelled, |s| {
                    !s.items.is_empty()
                }));
            }
            if let Some(item) = state.items.pop_front() {
                drop(state);
                shared.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            if wait(&shared.not_empty, &mut state, deadline)
                && state.items.is_empty()
                && !state.closed
            {
                return Err(QueueError::TimedOut);
            }
        }
    }
}

/// The cancellable flavour needs 'static items, as the wake-up callback outlives the call.
impl<T: Send + 'static> BoundedQueue<T> {
    /// Like [Self::put], but gives up with [QueueError::Cancelled] once the token is cancelled,
    /// both before and during the wait. The item is dropped then.
    pub fn put_cancellable(&self, item: T, token: &CancelToken) -> Result<(), QueueError> {
        // registered before the queue's lock is taken, see the lock order notes in crate::cancel
        let _registration = self.wake_on_cancel(token);
        self.put_inner(item, Some(token), None)
    }

    pub fn take_cancellable(&self, token: &CancelToken) -> Result<T, QueueError> {
        let _registration = self.wake_on_cancel(token);
        self.take_inner(Some(token), None)
    }

    fn wake_on_cancel(&self, token: &CancelToken) -> Option<Registration> {
        let shared: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        token.on_cancel(move || {
            if let Some(shared) = shared.upgrade() {
                // passing through the lock orders us after the waiter's flag check:
                // either it sees the flag or it's already waiting and gets the notification
                drop(shared.state.lock());
                shared.not_full.notify_all();
                shared.not_empty.notify_all();
            }
        })
    }
}

/// returns true if the deadline passed
fn wait<T>(
    condvar: &Condvar,
    state: &mut MutexGuard<'_, State<T>>,
    deadline: Option<Instant>,
) -> bool {
    match deadline {
        Some(deadline) => condvar.wait_until(state, deadline).timed_out(),
        None => {
            condvar.wait(state);
            false
        }
    }
}

/// A waiter leaving without doing its job may have eaten a notify_one meant for somebody else.
/// Pass it on if there's something to be done.
fn give_up<T>(
    state: MutexGuard<'_, State<T>>,
    condvar: &Condvar,
    error: QueueError,
    actionable: impl Fn(&State<T>) -> bool,
) -> QueueError {
    let pass_on = actionable(&state);
    drop(state);
    if pass_on {
        condvar.notify_one();
    }
    error
}

/// capacity 5, a producer of 1..=10 and a consumer
pub fn run() {
    let queue = match BoundedQueue::new(5) {
        Ok(queue) => queue,
        Err(e) => {
            tracing::error!(%e, "can't build the queue");
            return;
        }
    };
    scope(|s| {
        s.spawn(|| {
            for i in 1..=10 {
                if queue.put(i).is_err() {
                    return;
                }
                info!(item = i, size = queue.len(), "produced");
            }
        });
        s.spawn(|| {
            for _ in 1..=10 {
                match queue.take() {
                    Ok(item) => info!(item, size = queue.len(), "consumed"),
                    Err(_) => return,
                }
            }
        });
    });
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            mpsc,
        },
        thread::{self, sleep},
    };

    use super::*;

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert_eq!(Some(QueueError::ZeroCapacity), BoundedQueue::<u8>::new(0).err());
        assert_eq!(Some(3), BoundedQueue::<u8>::new(3).unwrap().capacity());
        assert_eq!(None, BoundedQueue::<u8>::unbounded().capacity());
    }

    #[test]
    fn test_fifo_single_producer_single_consumer() {
        let queue = BoundedQueue::new(5).unwrap();
        let taken = scope(|s| {
            s.spawn(|| {
                for i in 1..=10 {
                    queue.put(i).unwrap();
                }
            });
            s.spawn(|| (1..=10).map(|_| queue.take().unwrap()).collect::<Vec<_>>())
                .join()
                .unwrap()
        });
        assert_eq!((1..=10).collect::<Vec<_>>(), taken);
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let queue = BoundedQueue::new(3).unwrap();
        let max_seen = AtomicUsize::new(0);
        scope(|s| {
            for p in 0..4 {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..250 {
                        queue.put(p * 1000 + i).unwrap();
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    for _ in 0..500 {
                        max_seen.fetch_max(queue.len(), SeqCst);
                        queue.take().unwrap();
                    }
                });
            }
        });
        assert!(max_seen.load(SeqCst) <= 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_every_item_delivered_exactly_once() {
        let queue = BoundedQueue::new(4).unwrap();
        let (tx, rx) = mpsc::channel();
        scope(|s| {
            for p in 0..3 {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..100 {
                        queue.put(p * 100 + i).unwrap();
                    }
                });
            }
            for _ in 0..3 {
                let tx = tx.clone();
                s.spawn(|| {
                    for _ in 0..100 {
                        tx.send(queue.take().unwrap()).unwrap();
                    }
                    drop(tx);
                });
            }
        });
        drop(tx);
        let mut got: Vec<_> = rx.iter().collect();
        got.sort();
        assert_eq!((0..300).collect::<Vec<_>>(), got);
    }

    #[test]
    fn test_put_waits_for_a_take() {
        let queue = BoundedQueue::new(1).unwrap();
        queue.put(1).unwrap();
        let put_done = AtomicUsize::new(0);
        scope(|s| {
            s.spawn(|| {
                queue.put(2).unwrap();
                put_done.store(1, SeqCst);
            });
            // widen the window for a wrong put to sneak in
            sleep(Duration::from_millis(50));
            assert_eq!(0, put_done.load(SeqCst));
            assert_eq!(1, queue.len());
            assert_eq!(1, queue.take().unwrap());
        });
        assert_eq!(1, put_done.load(SeqCst));
        assert_eq!(2, queue.take().unwrap());
    }

    #[test]
    fn test_try_and_timeout_variants() {
        let queue = BoundedQueue::new(1).unwrap();
        assert_eq!(Err(QueueError::Empty), queue.try_take());
        assert_eq!(Err(QueueError::TimedOut), queue.take_timeout(Duration::from_millis(20)));
        queue.try_put('a').unwrap();
        assert_eq!(Err(QueueError::Full), queue.try_put('b'));
        assert_eq!(Err(QueueError::TimedOut), queue.put_timeout('b', Duration::from_millis(20)));
        assert_eq!(Ok('a'), queue.take_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_endless_timeout_waits_without_a_deadline() {
        let queue = BoundedQueue::new(1).unwrap();
        queue.put_timeout(1, Duration::MAX).unwrap();
        assert_eq!(Ok(1), queue.take_timeout(Duration::MAX));

        // nothing there yet: the take blocks until a put arrives
        scope(|s| {
            let taker = s.spawn(|| queue.take_timeout(Duration::from_secs(u64::MAX)));
            sleep(Duration::from_millis(20));
            queue.put(2).unwrap();
            assert_eq!(Ok(2), taker.join().unwrap());
        });
    }

    #[test]
    fn test_close_drains_then_fails() {
        let queue = BoundedQueue::new(4).unwrap();
        queue.put(1).unwrap();
        queue.put(2).unwrap();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(Err(QueueError::Closed), queue.put(3));
        assert_eq!(Ok(1), queue.take());
        assert_eq!(Ok(2), queue.take());
        assert_eq!(Err(QueueError::Closed), queue.take());
        assert_eq!(Err(QueueError::Closed), queue.try_take());
    }

    #[test]
    fn test_close_wakes_blocked_consumers() {
        let queue = &BoundedQueue::<u32>::new(2).unwrap();
        scope(|s| {
            let consumers: Vec<_> = (0..3).map(|_| s.spawn(move || queue.take())).collect();
            sleep(Duration::from_millis(20));
            queue.close();
            for c in consumers {
                assert_eq!(Err(QueueError::Closed), c.join().unwrap());
            }
        });
    }

    #[test]
    fn test_cancel_wakes_a_blocked_take() {
        let queue = BoundedQueue::<u32>::new(2).unwrap();
        let token = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let worker = {
            let queue = queue.clone();
            let token = token.clone();
            thread::spawn(move || tx.send(queue.take_cancellable(&token)).unwrap())
        };
        sleep(Duration::from_millis(20));
        token.cancel();
        let got = rx.recv_timeout(Duration::from_secs(5)).expect("take stayed blocked");
        assert_eq!(Err(QueueError::Cancelled), got);
        worker.join().unwrap();

        // the queue is fine afterwards
        queue.put(7).unwrap();
        assert_eq!(Ok(7), queue.take());
    }

    #[test]
    fn test_cancel_wakes_a_blocked_put() {
        let queue = BoundedQueue::new(1).unwrap();
        queue.put(1).unwrap();
        let token = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let worker = {
            let queue = queue.clone();
            let token = token.clone();
            thread::spawn(move || tx.send(queue.put_cancellable(2, &token)).unwrap())
        };
        sleep(Duration::from_millis(20));
        token.cancel();
        let got = rx.recv_timeout(Duration::from_secs(5)).expect("put stayed blocked");
        assert_eq!(Err(QueueError::Cancelled), got);
        worker.join().unwrap();

        // the cancelled put left no trace
        assert_eq!(vec![1], queue.drain());
    }

    #[test]
    fn test_cancelled_token_fails_fast() {
        let queue = BoundedQueue::new(1).unwrap();
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(Err(QueueError::Cancelled), queue.put_cancellable(1, &token));
        assert!(queue.is_empty());
        queue.put(1).unwrap();
        assert_eq!(Err(QueueError::Cancelled), queue.take_cancellable(&token));
        assert_eq!(1, queue.len());
    }
}
