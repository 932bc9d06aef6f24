use crate::deadline::Deadline;
use crate::error::{TaskError, WaitInterrupted};
use crate::task::context::TaskContext;
use crate::task::current;
use crate::task::{CancellationReason, Id, TaskCancellationBlocker, TaskState};
use crate::wait::{EarlyWakeup, Sleep, WaitStatus, WaitStrategy, WaiterKey};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Registers the current task on the finish wait list of another task.
pub(crate) struct FutureWaitStrategy<'a> {
    target: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,
}

impl<'a> FutureWaitStrategy<'a> {
    #[track_caller]
    pub(crate) fn new(target: &'a Arc<TaskContext>, current: &Arc<TaskContext>) -> Self {
        assert!(
            !Arc::ptr_eq(target, current),
            "task {} is waiting for itself, this is a deadlock",
            target.id()
        );
        Self { target, key: None }
    }
}

impl WaitStrategy for FutureWaitStrategy<'_> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        let mut waiters = self.target.finish_waiters().lock();
        // Checked under the list lock: `finish` publishes the state before
        // draining the list.
        if self.target.is_finished() {
            return EarlyWakeup(true);
        }
        self.key = Some(waiters.append(task));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self, task: &Arc<TaskContext>) {
        if let Some(key) = self.key.take() {
            self.target.finish_waiters().lock().remove(key, task);
        }
    }
}

/// Waits from the current task until `target` finishes or `deadline` passes.
pub(crate) async fn wait_until_finished(target: &Arc<TaskContext>, deadline: Deadline) -> WaitStatus {
    if target.is_finished() {
        return WaitStatus::NoTimeout;
    }

    let current = current::expect_current();
    let mut strategy = FutureWaitStrategy::new(target, &current);

    loop {
        Sleep::new(&mut strategy, deadline).await;

        if target.is_finished() {
            return WaitStatus::NoTimeout;
        }
        if deadline.is_reached() || current.should_cancel() {
            return WaitStatus::not_ready(&current);
        }
    }
}

/// Owning handle to a spawned task.
///
/// Dropping the handle of a task that has not finished yet cancels it with
/// [`CancellationReason::Abandoned`]. Use [`TaskWithResult::detach`] to let
/// the task run on its own.
#[must_use = "dropping the handle cancels the task"]
pub struct TaskWithResult<T> {
    ctx: Option<Arc<TaskContext>>,
    _p: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> TaskWithResult<T> {
    pub(crate) fn new(ctx: Arc<TaskContext>) -> Self {
        Self {
            ctx: Some(ctx),
            _p: PhantomData,
        }
    }

    fn ctx(&self) -> &Arc<TaskContext> {
        match &self.ctx {
            Some(ctx) => ctx,
            None => unreachable!("task handle used after detach"),
        }
    }

    pub fn id(&self) -> Id {
        self.ctx().id()
    }

    pub fn state(&self) -> TaskState {
        self.ctx().state()
    }

    pub fn is_finished(&self) -> bool {
        self.ctx().is_finished()
    }

    pub fn cancellation_reason(&self) -> CancellationReason {
        self.ctx().cancellation_reason()
    }

    /// Asks the task to stop. Repeated requests keep the first reason.
    pub fn request_cancel(&self) {
        self.ctx().request_cancel(CancellationReason::UserRequest);
    }

    /// Cancels the task and waits for it to finish, ignoring cancellation of
    /// the current task while waiting.
    pub async fn sync_cancel(&self) {
        self.request_cancel();
        let _blocker = TaskCancellationBlocker::new();
        wait_until_finished(self.ctx(), Deadline::unreachable()).await;
    }

    /// Waits for the task to finish.
    ///
    /// Fails if the current task is cancelled first.
    pub async fn wait(&self) -> Result<(), WaitInterrupted> {
        match wait_until_finished(self.ctx(), Deadline::unreachable()).await {
            WaitStatus::NoTimeout => Ok(()),
            _ => Err(WaitInterrupted {
                reason: current::cancellation_reason(),
            }),
        }
    }

    pub async fn wait_until(&self, deadline: Deadline) -> WaitStatus {
        wait_until_finished(self.ctx(), deadline).await
    }

    pub async fn wait_for(&self, timeout: Duration) -> WaitStatus {
        self.wait_until(Deadline::from_duration(timeout)).await
    }

    /// Waits for the task and returns its result.
    ///
    /// A panic in the task body is returned as [`TaskError::Panicked`]. A task
    /// that was cancelled before producing a value yields
    /// [`TaskError::Cancelled`].
    pub async fn get(mut self) -> Result<T, TaskError> {
        self.wait().await?;
        self.take_result()
    }

    /// Blocks the calling OS thread until the task finishes.
    ///
    /// Meant for threads that do not run tasks. Blocking a worker thread this
    /// way stalls every task queued behind it.
    pub fn wait_blocking(&self) {
        self.ctx().wait_finished_blocking(Deadline::unreachable());
    }

    /// Like [`TaskWithResult::wait_blocking`] with a deadline. Returns whether
    /// the task finished.
    pub fn wait_blocking_until(&self, deadline: Deadline) -> bool {
        self.ctx().wait_finished_blocking(deadline)
    }

    /// Blocking counterpart of [`TaskWithResult::get`].
    pub fn get_blocking(mut self) -> Result<T, TaskError> {
        self.wait_blocking();
        self.take_result()
    }

    /// Lets the task run without an owner.
    pub fn detach(mut self) {
        self.ctx.take();
    }

    fn take_result(&mut self) -> Result<T, TaskError> {
        let ctx = self.ctx();
        debug_assert!(ctx.is_finished());

        let cancelled = TaskError::Cancelled {
            id: ctx.id(),
            reason: ctx.cancellation_reason(),
        };

        if ctx.state() == TaskState::Cancelled {
            return Err(cancelled);
        }

        match ctx.take_output::<T>() {
            Some(Ok(value)) => Ok(value),
            Some(Err(panic)) => Err(TaskError::panicked(ctx.id(), panic)),
            None => Err(cancelled),
        }
    }
}

impl<T> Drop for TaskWithResult<T> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take()
            && !ctx.is_finished()
        {
            ctx.request_cancel(CancellationReason::Abandoned);
        }
    }
}

impl<T> fmt::Debug for TaskWithResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ctx {
            Some(ctx) => f
                .debug_struct("TaskWithResult")
                .field("id", &ctx.id())
                .field("state", &ctx.state())
                .finish(),
            None => f.debug_struct("TaskWithResult").finish_non_exhaustive(),
        }
    }
}
