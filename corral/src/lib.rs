//! Cooperative M:N task engine.
//!
//! Tasks are futures multiplexed over the worker threads of a
//! [`TaskProcessor`]. They block on task-aware primitives ([`sync`],
//! [`time`], task handles) which suspend the task instead of the thread, and
//! they are cancelled cooperatively: a cancel request interrupts the current
//! or next wait of the task, and the task decides how to wind down.
//!
//! ```no_run
//! use corral::sync::Mutex;
//! use std::sync::Arc;
//!
//! #[corral::main(worker_threads = 4)]
//! async fn main() -> anyhow::Result<()> {
//!     let counter = Arc::new(Mutex::new(0));
//!     let tasks: Vec<_> = (0..8)
//!         .map(|_| {
//!             let counter = Arc::clone(&counter);
//!             corral::spawn(async move { *counter.lock().await += 1 })
//!         })
//!         .collect();
//!
//!     for task in tasks {
//!         task.get().await?;
//!     }
//!     assert_eq!(*counter.lock().await, 8);
//!     Ok(())
//! }
//! ```

#[doc(inline)]
pub use corral_macros::main;

#[doc(inline)]
pub use corral_macros::test;

mod coro;
pub use coro::CoroPoolStats;

pub mod deadline;
pub use deadline::Deadline;

pub mod error;
pub use error::{TaskError, WaitInterrupted};

pub mod runtime;
pub use runtime::{Builder, TaskProcessor, spawn, spawn_builder, spawn_critical};

pub mod sync;

pub mod task;
pub use task::TaskWithResult;
pub use task::current as current_task;

pub mod time;

pub mod timer;

mod utils;

pub mod wait;
pub use wait::WaitStatus;

#[cfg(test)]
mod test_utils;
