//! Spawning tasks onto the processor of the current task.
//!
//! [`spawn()`] and [`spawn_critical()`] cover the common cases. The
//! [`SpawnBuilder`] also sets a deadline, or targets a given processor.

use crate::deadline::Deadline;
use crate::runtime::shared::Shared;
use crate::task::context::{Driver, TaskContext};
use crate::task::current;
use crate::task::payload::{Payload, WrappedCall};
use crate::task::sleep_state::{Epoch, WakeupSource};
use crate::task::{Importance, TaskWithResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Spawns a task with [`Importance::Normal`] on the processor of the current
/// task.
///
/// # Panics
///
/// Panics when called outside of a task.
#[track_caller]
pub fn spawn<F>(future: F) -> TaskWithResult<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_builder().spawn(future)
}

/// Spawns a task that overload control never drops and that runs its body
/// even when cancelled before its first step.
#[track_caller]
pub fn spawn_critical<F>(future: F) -> TaskWithResult<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_builder().critical().spawn(future)
}

/// Creates a [`SpawnBuilder`] targeting the processor of the current task.
///
/// ```no_run
/// use std::time::Duration;
///
/// # async fn doc() {
/// let task = corral::spawn_builder()
///     .critical()
///     .timeout(Duration::from_secs(1))
///     .spawn(async { 1 + 1 });
/// assert_eq!(task.get().await.ok(), Some(2));
/// # }
/// ```
pub fn spawn_builder() -> SpawnBuilder {
    SpawnBuilder::default()
}

/// Configures and spawns one task.
#[derive(Debug, Default)]
#[must_use = "a SpawnBuilder does nothing until spawn is called"]
pub struct SpawnBuilder {
    shared: Option<Arc<Shared>>,
    importance: Importance,
    deadline: Deadline,
}

impl SpawnBuilder {
    pub(crate) fn on(shared: Arc<Shared>) -> Self {
        Self {
            shared: Some(shared),
            ..Self::default()
        }
    }

    pub fn importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn critical(self) -> Self {
        self.importance(Importance::Critical)
    }

    /// The task is cancelled with reason `Deadline` once `deadline` passes.
    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Deadline::from_duration(timeout))
    }

    #[track_caller]
    pub fn spawn<F>(self, future: F) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let shared = match self.shared {
            Some(shared) => shared,
            None => Arc::clone(current::expect_current().shared()),
        };

        spawn_inner(&shared, future, self.importance, self.deadline)
    }
}

pub(crate) fn spawn_inner<F>(
    shared: &Arc<Shared>,
    future: F,
    importance: Importance,
    deadline: Deadline,
) -> TaskWithResult<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let payload: Pin<Box<dyn Payload>> = Box::pin(WrappedCall::new(future));
    let task = TaskContext::new(
        Arc::clone(shared),
        Some(payload),
        importance,
        deadline,
        Driver::Queue,
    );

    // Registered first, so that `finish` always finds the entry to remove.
    shared.register(&task);
    task.wakeup(WakeupSource::Bootstrap, Epoch::ZERO);

    TaskWithResult::new(task)
}
