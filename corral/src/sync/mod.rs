//! Task-aware synchronization primitives.
//!
//! Blocking operations suspend the calling task and free the worker thread
//! for other tasks. All of them must be awaited from within a task.

mod condvar;
pub use condvar::{CondvarGuard, ConditionVariable};

mod mutex;
pub use mutex::{Mutex, MutexGuard};

mod semaphore;
pub use semaphore::{Semaphore, SemaphoreError, SemaphoreLock};

mod shared_mutex;
pub use shared_mutex::{SharedMutex, SharedMutexReadGuard, SharedMutexWriteGuard};

mod single_consumer_event;
pub use single_consumer_event::SingleConsumerEvent;

mod single_use_event;
pub use single_use_event::SingleUseEvent;

mod single_waiter_mutex;
pub use single_waiter_mutex::{SingleWaiterMutex, SingleWaiterMutexGuard};

mod striped_counter;
pub use striped_counter::StripedCounter;
