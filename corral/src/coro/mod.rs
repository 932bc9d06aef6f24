//! Pooled execution slots.
//!
//! A task body suspends as a future, so its frame already lives in the boxed
//! payload. What a [`Coroutine`] adds is the per-execution state that outlives
//! single polls: task-local storage and step accounting. Slots are bound to a
//! task on its first step and go back to the processor's [`CoroPool`] when the
//! task finishes.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

mod pool;
pub(crate) use pool::{CoroPool, CoroPoolConfig};
pub use pool::CoroPoolStats;

pub(crate) struct Coroutine {
    locals: HashMap<usize, Box<dyn Any + Send>>,
    steps: u64,
}

impl Coroutine {
    fn new() -> Self {
        Self {
            locals: HashMap::new(),
            steps: 0,
        }
    }

    pub(crate) fn record_step(&mut self) {
        self.steps += 1;
    }

    pub(crate) fn steps(&self) -> u64 {
        self.steps
    }

    /// Value stored under `key`, created with `init` on first access.
    pub(crate) fn local_mut<T, F>(&mut self, key: usize, init: F) -> &mut T
    where
        T: Send + 'static,
        F: FnOnce() -> T,
    {
        let slot = self.locals.entry(key).or_insert_with(|| Box::new(init()));
        match slot.downcast_mut::<T>() {
            Some(value) => value,
            None => unreachable!("task-local key reused with another type"),
        }
    }

    pub(crate) fn remove_local(&mut self, key: usize) -> bool {
        self.locals.remove(&key).is_some()
    }

    /// Drops everything the previous task left behind. Keeps the map allocation.
    fn reset(&mut self) {
        self.locals.clear();
        self.steps = 0;
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("locals", &self.locals.len())
            .field("steps", &self.steps)
            .finish()
    }
}
