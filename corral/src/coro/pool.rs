use crate::coro::Coroutine;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Clone, Copy)]
pub(crate) struct CoroPoolConfig {
    /// Slots created up front, and the floor for trimming.
    pub(crate) initial_size: usize,

    /// Upper bound on idle slots kept around.
    pub(crate) max_size: usize,

    /// Minimum time between two trims.
    pub(crate) trim_interval: Duration,
}

/// Snapshot of [`CoroPool`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoroPoolStats {
    /// Bound to a running or sleeping task.
    pub active: usize,
    /// Ready for reuse.
    pub idle: usize,
    pub created: usize,
    pub destroyed: usize,
}

/// Cache of reusable [`Coroutine`] slots owned by one task processor.
#[derive(Debug)]
pub(crate) struct CoroPool {
    cfg: CoroPoolConfig,
    idle: Mutex<Vec<Coroutine>>,
    last_trim: Mutex<Instant>,
    active: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl CoroPool {
    pub(crate) fn new(cfg: CoroPoolConfig) -> Self {
        let idle = (0..cfg.initial_size).map(|_| Coroutine::new()).collect();

        Self {
            cfg,
            idle: Mutex::new(idle),
            last_trim: Mutex::new(Instant::now()),
            active: AtomicUsize::new(0),
            created: AtomicUsize::new(cfg.initial_size),
            destroyed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn get(&self) -> Coroutine {
        self.active.fetch_add(1, Ordering::Relaxed);

        if let Some(coro) = self.idle.lock().pop() {
            return coro;
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        Coroutine::new()
    }

    pub(crate) fn put(&self, mut coro: Coroutine) {
        // Task-local destructors run outside of the pool lock.
        coro.reset();
        self.active.fetch_sub(1, Ordering::Relaxed);

        let mut idle = self.idle.lock();
        if idle.len() < self.cfg.max_size {
            idle.push(coro);
        } else {
            drop(idle);
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Shrinks the idle slots down to `initial_size`, at most once per
    /// `trim_interval`. Called by workers that ran out of work.
    pub(crate) fn maybe_trim(&self) {
        {
            let Some(mut last_trim) = self.last_trim.try_lock() else {
                return;
            };
            if last_trim.elapsed() < self.cfg.trim_interval {
                return;
            }
            *last_trim = Instant::now();
        }

        let trimmed = {
            let mut idle = self.idle.lock();
            if idle.len() <= self.cfg.initial_size {
                return;
            }
            idle.split_off(self.cfg.initial_size)
        };

        trace!(trimmed = trimmed.len(), "trimmed coroutine pool");
        self.destroyed.fetch_add(trimmed.len(), Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> CoroPoolStats {
        CoroPoolStats {
            active: self.active.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }
}
