//! Suspension machinery shared by every blocking primitive.
//!
//! A primitive describes how to register and unregister the current task
//! through a [`WaitStrategy`]. [`Sleep`] runs that pair around one suspension
//! of the task and reports which wakeup source ended it.

use crate::deadline::Deadline;
use crate::task::context::{TaskContext, YieldReason};
use crate::task::current;
use crate::task::sleep_state::{Epoch, WakeupSource};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

pub(crate) mod list;
pub(crate) use list::{WaitList, WaiterKey};

pub(crate) mod light;
pub(crate) use light::{LightKey, WaitListLight};

#[cfg(test)]
mod tests;

/// Outcome of a wait with a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitStatus {
    /// The awaited condition was met.
    NoTimeout,
    /// The deadline passed first.
    Timeout,
    /// The waiting task was cancelled.
    Cancelled,
}

impl WaitStatus {
    pub fn is_ready(self) -> bool {
        self == WaitStatus::NoTimeout
    }

    /// Status of a wait whose condition did not hold after waking up.
    pub(crate) fn not_ready(task: &TaskContext) -> WaitStatus {
        if task.should_cancel() {
            WaitStatus::Cancelled
        } else {
            WaitStatus::Timeout
        }
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WaitStatus::NoTimeout => "ready",
            WaitStatus::Timeout => "timeout",
            WaitStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The condition a task sleeps on turned out to be satisfied while
/// registering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EarlyWakeup(pub(crate) bool);

/// Registration hooks for one suspension of the current task.
pub(crate) trait WaitStrategy {
    /// Runs before the task yields. Must arrange for at least one wakeup, or
    /// report that the condition already holds.
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup;

    /// Runs after resumption, and after an early wakeup. Undoes whatever
    /// registration did not cause the wakeup, so it must tolerate
    /// registrations that a waker already consumed.
    fn disable_wakeups(&mut self, task: &Arc<TaskContext>);
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Init,
    Waiting { epoch: Epoch, has_deadline: bool },
    Done,
}

/// One suspension of the current task.
///
/// Returns immediately with `CancelRequest` when the task should observe a
/// pending cancellation. A task runs at most one `Sleep` at a time.
#[must_use = "futures do nothing unless polled"]
pub(crate) struct Sleep<'a, S: WaitStrategy> {
    task: Arc<TaskContext>,
    strategy: &'a mut S,
    deadline: Deadline,
    stage: Stage,
}

impl<'a, S: WaitStrategy> Sleep<'a, S> {
    #[track_caller]
    pub(crate) fn new(strategy: &'a mut S, deadline: Deadline) -> Self {
        Self {
            task: current::expect_current(),
            strategy,
            deadline,
            stage: Stage::Init,
        }
    }

    fn teardown(&mut self, epoch: Epoch, has_deadline: bool) -> WakeupSource {
        if has_deadline {
            self.task.cancel_sleep_timer();
        }
        self.strategy.disable_wakeups(&self.task);

        let prev = self.task.advance_epoch(epoch);
        self.task.exit_sleep();
        self.stage = Stage::Done;
        WakeupSource::primary(prev.flags)
    }
}

impl<S: WaitStrategy> Future for Sleep<'_, S> {
    type Output = WakeupSource;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<WakeupSource> {
        let this = &mut *self;

        match this.stage {
            Stage::Init => {
                // A cancel request may have been consumed together with another
                // wakeup source by the previous sleep, so check it first.
                if this.task.should_cancel() {
                    this.stage = Stage::Done;
                    return Poll::Ready(WakeupSource::CancelRequest);
                }

                this.task.enter_sleep();
                let epoch = this.task.epoch();

                if this.strategy.setup_wakeups(&this.task).0 {
                    this.strategy.disable_wakeups(&this.task);
                    this.task.advance_epoch(epoch);
                    this.task.exit_sleep();
                    this.stage = Stage::Done;
                    return Poll::Ready(WakeupSource::WaitList);
                }

                let has_deadline = this.deadline.is_reachable()
                    && (!this.task.is_cancellable() || this.deadline < this.task.cancel_deadline());
                if has_deadline {
                    this.task.arm_sleep_timer(this.deadline, epoch);
                }

                this.task.set_yield_reason(YieldReason::Waiting);
                this.stage = Stage::Waiting {
                    epoch,
                    has_deadline,
                };
                Poll::Pending
            }
            Stage::Waiting {
                epoch,
                has_deadline,
            } => Poll::Ready(this.teardown(epoch, has_deadline)),
            Stage::Done => unreachable!("Sleep polled after completion"),
        }
    }
}

impl<S: WaitStrategy> Drop for Sleep<'_, S> {
    fn drop(&mut self) {
        if let Stage::Waiting {
            epoch,
            has_deadline,
        } = self.stage
        {
            self.teardown(epoch, has_deadline);
            self.task.clear_waiting_reason();
        }
    }
}

/// Suspends the current task until `deadline` with nothing else to wake it.
pub(crate) struct DeadlineOnly;

impl WaitStrategy for DeadlineOnly {
    fn setup_wakeups(&mut self, _task: &Arc<TaskContext>) -> EarlyWakeup {
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self, _task: &Arc<TaskContext>) {}
}

/// Requeues the current task behind every task that is already runnable.
pub(crate) struct Yield;

impl WaitStrategy for Yield {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        task.wakeup_current();
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self, _task: &Arc<TaskContext>) {}
}

/// Permission for an outside event source to end one wait of a task.
///
/// Handed out by [`wait_external`]. Waking more than once, or after the wait
/// ended, is harmless.
#[derive(Clone)]
pub struct WakeupHandle {
    task: Weak<TaskContext>,
    state: Arc<ExternalState>,
}

#[derive(Debug)]
struct ExternalState {
    fired: AtomicBool,
    /// Epoch of the sleep currently waiting for this handle.
    epoch: AtomicU64,
}

impl WakeupHandle {
    pub fn wakeup(&self) {
        self.state.fired.store(true, Ordering::SeqCst);
        let epoch = Epoch::from_raw(self.state.epoch.load(Ordering::SeqCst));
        if let Some(task) = self.task.upgrade() {
            task.wakeup(WakeupSource::WaitList, epoch);
        }
    }
}

impl fmt::Debug for WakeupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeupHandle")
            .field("fired", &self.state.fired.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct ExternalStrategy<F> {
    arm: Option<F>,
    state: Arc<ExternalState>,
}

impl<F: FnOnce(WakeupHandle)> WaitStrategy for ExternalStrategy<F> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        // Publish the epoch before looking at `fired`. `wakeup` stores `fired`
        // before reading the epoch, so one side always sees the other.
        self.state
            .epoch
            .store(task.epoch().as_raw(), Ordering::SeqCst);

        if let Some(arm) = self.arm.take() {
            arm(WakeupHandle {
                task: Arc::downgrade(task),
                state: Arc::clone(&self.state),
            });
        }
        EarlyWakeup(self.state.fired.load(Ordering::SeqCst))
    }

    fn disable_wakeups(&mut self, _task: &Arc<TaskContext>) {}
}

/// Suspends the current task until an outside event source calls
/// [`WakeupHandle::wakeup`], the deadline passes or the task is cancelled.
///
/// `arm` runs once, right before the task yields, and typically hands the
/// handle to a reactor callback.
///
/// ```no_run
/// use corral::deadline::Deadline;
/// use corral::wait::{WaitStatus, wait_external};
/// use std::time::Duration;
///
/// # async fn doc() {
/// let status = wait_external(Deadline::from_duration(Duration::from_secs(1)), |handle| {
///     std::thread::spawn(move || handle.wakeup());
/// })
/// .await;
/// assert_eq!(status, WaitStatus::NoTimeout);
/// # }
/// ```
pub async fn wait_external<F>(deadline: Deadline, arm: F) -> WaitStatus
where
    F: FnOnce(WakeupHandle),
{
    let state = Arc::new(ExternalState {
        fired: AtomicBool::new(false),
        epoch: AtomicU64::new(0),
    });
    let mut strategy = ExternalStrategy {
        arm: Some(arm),
        state: Arc::clone(&state),
    };

    let task = current::expect_current();
    loop {
        Sleep::new(&mut strategy, deadline).await;

        if state.fired.load(Ordering::SeqCst) {
            return WaitStatus::NoTimeout;
        }
        if deadline.is_reached() || task.should_cancel() {
            return WaitStatus::not_ready(&task);
        }
    }
}
