use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a task.
///
/// `Queued` and `Suspended` go back to `Running` only through a wakeup that
/// re-enqueues the task. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Constructed, not yet scheduled.
    New = 0,
    /// On a run queue.
    Queued = 1,
    /// Executing on a worker thread.
    Running = 2,
    /// Blocked on a wait list or a timer.
    Suspended = 3,
    /// The body was unwound after observing cancellation.
    Cancelled = 4,
    /// The body returned (or panicked).
    Completed = 5,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::New,
            1 => TaskState::Queued,
            2 => TaskState::Running,
            3 => TaskState::Suspended,
            4 => TaskState::Cancelled,
            5 => TaskState::Completed,
            _ => unreachable!("invalid task state {v}"),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub(crate) struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub(crate) fn new(state: TaskState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Scheduling class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Importance {
    /// May be cancelled by overload control before it starts.
    #[default]
    Normal,
    /// Always starts, even under overload or with a passed deadline.
    Critical,
}
