use crate::task::context::TaskContext;
use crate::task::current;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Why a task was asked to stop.
///
/// Only the first request is recorded. Later requests keep the original
/// reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CancellationReason {
    #[default]
    None = 0,
    /// Explicit [`request_cancel`](crate::task::TaskWithResult::request_cancel).
    UserRequest = 1,
    /// The task deadline passed.
    Deadline = 2,
    /// Dropped by overload control.
    Overload = 3,
    /// The owning handle was dropped before the task finished.
    Abandoned = 4,
    /// The task processor is shutting down.
    Shutdown = 5,
}

impl CancellationReason {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CancellationReason::None,
            1 => CancellationReason::UserRequest,
            2 => CancellationReason::Deadline,
            3 => CancellationReason::Overload,
            4 => CancellationReason::Abandoned,
            5 => CancellationReason::Shutdown,
            _ => unreachable!("invalid cancellation reason {v}"),
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancellationReason::None => "not cancelled",
            CancellationReason::UserRequest => "user request",
            CancellationReason::Deadline => "deadline",
            CancellationReason::Overload => "task processor overload",
            CancellationReason::Abandoned => "task handle abandoned",
            CancellationReason::Shutdown => "task processor shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub(crate) struct AtomicCancellationReason(AtomicU8);

impl AtomicCancellationReason {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(CancellationReason::None as u8))
    }

    pub(crate) fn load(&self) -> CancellationReason {
        CancellationReason::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Records `reason` if none was recorded yet. Returns whether this call won.
    pub(crate) fn try_set(&self, reason: CancellationReason) -> bool {
        debug_assert_ne!(reason, CancellationReason::None);
        self.0
            .compare_exchange(
                CancellationReason::None as u8,
                reason as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Suppresses cancellation delivery for the current task while alive.
///
/// Blockers nest: the task becomes cancellable again once every blocker is
/// dropped. A pending request is not cleared, so the next suspension point
/// after the last blocker is gone observes it.
///
/// ```no_run
/// # async fn doc() {
/// use corral::task::TaskCancellationBlocker;
///
/// let _blocker = TaskCancellationBlocker::new();
/// // Waits below cannot be interrupted by a cancel request.
/// corral::time::interruptible_sleep_for(std::time::Duration::from_millis(5)).await;
/// # }
/// ```
///
/// # Panics
///
/// Panics when created outside of a task.
#[must_use = "cancellation is only blocked while the blocker is alive"]
pub struct TaskCancellationBlocker {
    ctx: Arc<TaskContext>,
}

impl TaskCancellationBlocker {
    #[track_caller]
    pub fn new() -> Self {
        let ctx = current::expect_current();
        ctx.block_cancellation();
        Self { ctx }
    }
}

impl Default for TaskCancellationBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskCancellationBlocker {
    fn drop(&mut self) {
        self.ctx.unblock_cancellation();
    }
}

impl fmt::Debug for TaskCancellationBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCancellationBlocker")
            .field("task_id", &self.ctx.id())
            .finish()
    }
}

/// A cloneable permission to request cancellation of one task.
#[derive(Clone)]
pub struct CancellationToken {
    ctx: Arc<TaskContext>,
}

impl CancellationToken {
    pub(crate) fn new(ctx: Arc<TaskContext>) -> Self {
        Self { ctx }
    }

    pub fn request_cancel(&self) {
        self.ctx.request_cancel(CancellationReason::UserRequest);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.ctx.is_cancel_requested()
    }

    pub fn reason(&self) -> CancellationReason {
        self.ctx.cancellation_reason()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("task_id", &self.ctx.id())
            .finish()
    }
}
