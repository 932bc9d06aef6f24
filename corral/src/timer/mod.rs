//! Deadline timers.
//!
//! Sleeping tasks with a reachable deadline, and tasks with a cancel deadline,
//! arm a one-shot callback on the [`Reactor`] of their processor. The default
//! reactor is a dedicated [`TimerThread`].

use std::fmt;
use std::time::Instant;

mod thread;
pub use thread::TimerThread;

/// Identifies one armed timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    pub(crate) at: Instant,
    pub(crate) seq: u64,
}

impl TimerKey {
    pub fn new(at: Instant, seq: u64) -> Self {
        Self { at, seq }
    }

    pub fn at(&self) -> Instant {
        self.at
    }
}

/// Callback run once when a timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// External event source the engine delivers timer wakeups through.
///
/// Callbacks must run outside of any lock held by the reactor: they schedule
/// tasks, which may in turn arm or cancel timers.
pub trait Reactor: Send + Sync + fmt::Debug {
    /// Runs `cb` once, at or after `at`.
    fn arm_timer(&self, at: Instant, cb: TimerCallback) -> TimerKey;

    /// Drops the callback of a timer that did not fire yet. Cancelling an
    /// expired or unknown timer does nothing.
    fn cancel_timer(&self, key: TimerKey);

    /// Called once by the processor after its workers stopped.
    fn shutdown(&self) {}
}
