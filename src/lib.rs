pub mod cache;
pub mod cancel;
pub mod counter;
pub mod deadlock;
pub mod error;
pub mod locks;
pub mod pool;
pub mod queue;

pub use cache::RwCache;
pub use cancel::CancelToken;
pub use counter::{AtomicCounter, GuardedCounter, KeyedCounter};
pub use deadlock::{DeadlockReport, DeadlockScenario, LockOrder};
pub use error::{PoolError, QueueError, TaskError};
pub use pool::{Future, FutureState, PoolConfig, ThreadPool};
pub use queue::BoundedQueue;
