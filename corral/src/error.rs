use crate::task::{CancellationReason, Id};
use crate::utils::SyncWrapper;
use std::any::Any;
use thiserror::Error;

/// The current task was cancelled while it waited.
///
/// Returned by the convenience waits that turn a `Cancelled` status into an
/// error so that callers can bubble it up with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait interrupted: current task cancelled ({reason})")]
pub struct WaitInterrupted {
    pub reason: CancellationReason,
}

/// Failure to retrieve the result of a task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task was cancelled before producing a result.
    #[error("task {id} cancelled: {reason}")]
    Cancelled {
        id: Id,
        reason: CancellationReason,
    },

    /// The task body panicked. The payload is kept so that it can be resumed.
    #[error("task {id} panicked")]
    Panicked {
        id: Id,
        payload: SyncWrapper<Box<dyn Any + Send + 'static>>,
    },

    /// The waiting task itself was cancelled.
    #[error(transparent)]
    Interrupted(#[from] WaitInterrupted),
}

impl TaskError {
    pub(crate) fn panicked(id: Id, payload: Box<dyn Any + Send + 'static>) -> Self {
        TaskError::Panicked {
            id,
            payload: SyncWrapper::new(payload),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. })
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panicked { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, TaskError::Interrupted(_))
    }

    /// Reason of the cancellation, for `Cancelled` and `Interrupted` errors.
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        match self {
            TaskError::Cancelled { reason, .. } => Some(*reason),
            TaskError::Interrupted(WaitInterrupted { reason }) => Some(*reason),
            TaskError::Panicked { .. } => None,
        }
    }

    /// Message of the panic, if the payload was a string.
    pub fn panic_message(&mut self) -> Option<&str> {
        match self {
            TaskError::Panicked { payload, .. } => payload.panic_message(),
            _ => None,
        }
    }

    /// Consumes the error, returning the panic payload.
    ///
    /// # Panics
    ///
    /// Panics if the error is not a [`TaskError::Panicked`].
    #[track_caller]
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            TaskError::Panicked { payload, .. } => payload.into_inner(),
            other => panic!("`TaskError` is not a panic: {other}"),
        }
    }
}
