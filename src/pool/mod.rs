//! # Thread pool
//!
//! A fixed set of worker threads taking tasks from one [BoundedQueue].
//! Submitting returns a [Future] right away, the caller decides when (and whether) to wait for it.
//!
//! ## Lifecycle
//! - running - accepts tasks
//! - shutting down - rejects new tasks, the queued ones still run; entered by [ThreadPool::shutdown]
//! - terminated - every worker has exited
//!
//! [ThreadPool::shutdown_now] also discards the queued tasks (their futures become cancelled)
//! and raises the cancel token of the running ones. It can't do more than that:
//! a running task stops only when it looks at its token, there's no preemption.
//!
//! ## Failures
//! A task's error or panic ends up in its future, the worker carries on with the next task.

mod future;
mod task;

use std::{
    sync::{
        atomic::{
            AtomicU64, AtomicUsize,
            Ordering::{Relaxed, SeqCst},
        },
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace};

pub use future::{Future, FutureState};

use crate::{
    cancel::CancelToken,
    error::{PoolError, QueueError, TaskError},
    queue::BoundedQueue,
};
use future::FutureCell;
use task::{Job, Task};

const DEFAULT_THREAD_NAME: &str = "pool-worker";

/// How to build a [ThreadPool].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    /// None - unbounded task queue, submit never waits
    /// Some(n) - at most n queued tasks, submit waits for space
    pub queue_capacity: Option<usize>,
    /// workers are named `<thread_name>-<index>`
    pub thread_name: String,
}

impl PoolConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            queue_capacity: None,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// One worker per CPU.
impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(thread::available_parallelism().map_or(1, |n| n.get()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Running,
    ShuttingDown,
    Terminated,
}

struct Lifecycle {
    stage: Stage,
    live_workers: usize,
}

struct Shared {
    queue: BoundedQueue<Box<dyn Job>>,
    lifecycle: Mutex<Lifecycle>,
    /// signalled once the last worker is gone
    terminated: Condvar,
    /// parent of every task's token, raised by shutdown_now
    cancel: CancelToken,
    active: AtomicUsize,
    next_task_id: AtomicU64,
}

impl Shared {
    fn worker_exited(&self, index: usize) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.live_workers -= 1;
        debug!(worker = index, left = lifecycle.live_workers, "worker exited");
        if lifecycle.live_workers == 0 {
            lifecycle.stage = Stage::Terminated;
            drop(lifecycle);
            debug!("pool terminated");
            self.terminated.notify_all();
        }
    }
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl ThreadPool {
    /// `workers` threads and an unbounded queue
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        Self::with_config(PoolConfig::new(workers))
    }

    pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
        if config.workers == 0 {
            return Err(PoolError::ZeroWorkers);
        }
        let queue = match config.queue_capacity {
            Some(capacity) => BoundedQueue::new(capacity).map_err(PoolError::Queue)?,
            None => BoundedQueue::unbounded(),
        };
        let shared = Arc::new(Shared {
            queue,
            lifecycle: Mutex::new(Lifecycle {
                stage: Stage::Running,
                live_workers: 0,
            }),
            terminated: Condvar::new(),
            cancel: CancelToken::new(),
            active: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || worker_loop(worker_shared, index));
            match spawned {
                Ok(handle) => {
                    // workers can't exit before the queue is closed, so counting after the spawn is fine
                    shared.lifecycle.lock().live_workers += 1;
                    workers.push(handle);
                }
                Err(e) => {
                    // let the ones already running go
                    shared.queue.close();
                    return Err(PoolError::Spawn(e));
                }
            }
        }
        debug!(workers = config.workers, capacity = ?config.queue_capacity, "pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            worker_count: config.workers,
        })
    }

    /// Queues `task`, waiting for space if the queue is bounded and full.
    pub fn submit<F, T>(&self, task: F) -> Result<Future<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with_token(move |_| Ok(task()))
    }

    /// For tasks that can fail or want to watch their cancel token.
    /// Returning `Err(TaskError::Cancelled)` marks the future as cancelled.
    pub fn submit_with_token<F, T>(&self, task: F) -> Result<Future<T>, PoolError>
    where
        F: FnOnce(&CancelToken) -> Result<T, TaskError> + Send + 'static,
        T: Send + 'static,
    {
        let (job, future) = self.package(task);
        self.shared.queue.put(job).map_err(rejected)?;
        trace!(task = future.id(), "task submitted");
        Ok(future)
    }

    /// Never waits for queue space: [PoolError::QueueFull] instead.
    pub fn try_submit<F, T>(&self, task: F) -> Result<Future<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (job, future) = self.package(move |_: &CancelToken| Ok(task()));
        self.shared.queue.try_put(job).map_err(rejected)?;
        Ok(future)
    }

    /// Fire and forget. A panic is still caught and logged.
    pub fn execute<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(task).map(drop)
    }

    /// Runs `f` on every item in parallel, results come back in the items' order.
    ///
    /// Blocks until all are done => don't call it from a task of the same pool,
    /// it could wait for tasks queued behind itself.
    pub fn map<I, F, T>(&self, items: I, f: F) -> Result<Vec<Result<T, TaskError>>, PoolError>
    where
        I: IntoIterator,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let futures = items
            .into_iter()
            .map(|item| {
                let f = f.clone();
                self.submit(move || f(item))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(futures.into_iter().map(Future::get).collect())
    }

    /// No new tasks from now on, the queued ones still run. Doesn't wait, see [Self::await_termination].
    pub fn shutdown(&self) {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.stage == Stage::Running {
                lifecycle.stage = Stage::ShuttingDown;
                debug!("pool shutting down");
            }
        }
        self.shared.queue.close();
    }

    /// Shutdown + cancel the running tasks + discard the queued ones.
    /// Returns how many queued tasks were discarded.
    pub fn shutdown_now(&self) -> usize {
        self.shutdown();
        // first, so a task a worker grabs from here on is cancelled before it starts
        self.shared.cancel.cancel();
        let discarded = self.shared.queue.drain();
        let count = discarded.len();
        for job in discarded {
            job.abandon();
        }
        debug!(discarded = count, "pool stopped");
        count
    }

    /// Waits up to `timeout` for all the workers to exit. True if they did.
    /// [Duration::MAX] waits for as long as it takes.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut lifecycle = self.shared.lifecycle.lock();
        while lifecycle.stage != Stage::Terminated {
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .terminated
                        .wait_until(&mut lifecycle, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.shared.terminated.wait(&mut lifecycle),
            }
        }
        lifecycle.stage == Stage::Terminated
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lifecycle.lock().stage != Stage::Running
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lifecycle.lock().stage == Stage::Terminated
    }

    /// tasks running right now
    pub fn active_count(&self) -> usize {
        self.shared.active.load(SeqCst)
    }

    /// tasks waiting for a worker
    pub fn queued_count(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn package<F, T>(&self, task: F) -> (Box<dyn Job>, Future<T>)
    where
        F: FnOnce(&CancelToken) -> Result<T, TaskError> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.shared.next_task_id.fetch_add(1, Relaxed);
        let cell = FutureCell::new(id, self.shared.cancel.child());
        (Box::new(Task::new(task, cell.clone())), Future::new(cell))
    }
}

/// Shuts down and waits for the workers to run what was queued.
impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        let me = thread::current().id();
        for handle in self.workers.get_mut().drain(..) {
            // dropped from inside one of its own tasks - can't wait for ourselves
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "worker started");
    // Closed means closed *and* drained
    while let Ok(job) = shared.queue.take() {
        shared.active.fetch_add(1, SeqCst);
        job.run();
        shared.active.fetch_sub(1, SeqCst);
    }
    shared.worker_exited(index);
}

fn rejected(e: QueueError) -> PoolError {
    match e {
        QueueError::Closed => PoolError::Rejected,
        QueueError::Full => PoolError::QueueFull,
        other => PoolError::Queue(other),
    }
}

/// 10 tasks, 3 workers
pub fn run_pool() -> Result<(), PoolError> {
    let pool = ThreadPool::with_config(PoolConfig::new(3).with_thread_name("demo-worker"))?;
    for task_id in 1..=10 {
        pool.execute(move || {
            let worker = thread::current().name().unwrap_or("unnamed").to_owned();
            info!(task_id, %worker, "task executed");
        })?;
    }
    pool.shutdown();
    if !pool.await_termination(Duration::from_secs(60)) {
        pool.shutdown_now();
    }
    info!("all tasks done");
    Ok(())
}

/// two tasks computing in parallel, the caller collects both
pub fn run_future() -> Result<(), PoolError> {
    let pool = ThreadPool::new(2)?;
    let sum = pool.submit(|| 100 + 200)?;
    let product = pool.submit(|| 10 * 20)?;
    info!("main thread keeps working meanwhile");
    match (sum.get(), product.get()) {
        (Ok(sum), Ok(product)) => info!(sum, product, "results"),
        (sum, product) => tracing::error!(?sum, ?product, "a task failed"),
    }
    pool.shutdown();
    Ok(())
}
