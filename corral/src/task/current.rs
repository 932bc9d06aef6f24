//! Operations on the task that is currently executing.
//!
//! Every function here panics when called outside of a task, except the
//! `try_` variants.

use crate::deadline::Deadline;
use crate::task::context::{TaskContext, YieldReason};
use crate::task::{CancellationReason, CancellationToken, Id};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

thread_local! {
    static CURRENT: RefCell<Option<Arc<TaskContext>>> = const { RefCell::new(None) };
}

/// Makes a task current on this thread until dropped.
pub(crate) struct CurrentTaskScope {
    prev: Option<Arc<TaskContext>>,
}

impl CurrentTaskScope {
    pub(crate) fn enter(task: Arc<TaskContext>) -> Self {
        let prev = CURRENT.with(|c| c.borrow_mut().replace(task));
        Self { prev }
    }
}

impl Drop for CurrentTaskScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        // Dropping the replaced task may run arbitrary code, so do it once the
        // borrow is released.
        let _current = CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), prev));
    }
}

pub(crate) fn try_current() -> Option<Arc<TaskContext>> {
    CURRENT.with(|c| c.borrow().clone())
}

#[track_caller]
pub(crate) fn expect_current() -> Arc<TaskContext> {
    match try_current() {
        Some(task) => task,
        None => panic!("must be called from within a corral task"),
    }
}

fn with_current<R>(f: impl FnOnce(&Arc<TaskContext>) -> R) -> R {
    CURRENT.with(|c| match c.borrow().as_ref() {
        Some(task) => f(task),
        None => panic!("must be called from within a corral task"),
    })
}

/// Id of the current task.
pub fn id() -> Id {
    with_current(|task| task.id())
}

/// Id of the current task, or `None` on a thread that is not running one.
pub fn try_id() -> Option<Id> {
    CURRENT.with(|c| c.borrow().as_ref().map(|task| task.id()))
}

/// Whether cancellation was requested, even when currently blocked.
pub fn is_cancel_requested() -> bool {
    with_current(|task| task.is_cancel_requested())
}

/// Whether the current task should stop: cancellation was requested and no
/// [`TaskCancellationBlocker`](crate::task::TaskCancellationBlocker) is alive.
pub fn should_cancel() -> bool {
    with_current(|task| task.should_cancel())
}

pub fn cancellation_reason() -> CancellationReason {
    with_current(|task| task.cancellation_reason())
}

/// Cancels the current task. It stops at its next suspension point.
pub fn request_cancel() {
    with_current(|task| task.request_cancel(CancellationReason::UserRequest));
}

/// Replaces the deadline after which the current task gets cancelled.
pub fn set_deadline(deadline: Deadline) {
    with_current(|task| task.set_cancel_deadline(deadline));
}

pub fn deadline() -> Deadline {
    with_current(|task| task.cancel_deadline())
}

/// A token that can cancel the current task from elsewhere.
pub fn cancellation_token() -> CancellationToken {
    CancellationToken::new(expect_current())
}

/// Unwinds the current task if it should be cancelled.
///
/// The future never completes in that case: the task body is dropped, running
/// destructors, and the task finishes as `Cancelled`. Otherwise it completes
/// right away.
///
/// The root task of [`TaskProcessor::block_on`](crate::TaskProcessor::block_on)
/// is never unwound: its cancellation point completes and the request stays
/// visible through [`is_cancel_requested`] and the interrupted waits.
///
/// ```no_run
/// # async fn doc() {
/// loop {
///     corral::current_task::cancellation_point().await;
///     // ... one chunk of work
///     # break;
/// }
/// # }
/// ```
pub fn cancellation_point() -> CancellationPoint {
    CancellationPoint { _p: () }
}

/// Future returned by [`cancellation_point`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct CancellationPoint {
    _p: (),
}

impl Future for CancellationPoint {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        with_current(|task| {
            // The root task is polled by its caller's thread and cannot be
            // dropped from under it, so it only observes the request.
            if task.should_cancel() && !task.is_root() {
                task.set_yield_reason(YieldReason::Cancelled);
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
    }
}
