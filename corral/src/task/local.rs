use crate::task::current;
use std::fmt;

/// Task-local storage key.
///
/// Values live in the coroutine slot bound to a task and are dropped when the
/// task finishes. Each task sees its own value, lazily created by `init`.
///
/// ```no_run
/// use corral::task::TaskLocal;
///
/// static REQUEST_ID: TaskLocal<u64> = TaskLocal::new(|| 0);
///
/// # fn doc() {
/// REQUEST_ID.set(42);
/// assert_eq!(REQUEST_ID.get(), 42);
/// # }
/// ```
///
/// Accessing a task local from the closure passed to [`TaskLocal::with`]
/// panics.
pub struct TaskLocal<T: 'static> {
    init: fn() -> T,
}

impl<T: Send + 'static> TaskLocal<T> {
    pub const fn new(init: fn() -> T) -> Self {
        Self { init }
    }

    fn key(&'static self) -> usize {
        self as *const Self as usize
    }

    #[track_caller]
    pub fn with<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> R {
        current::expect_current().with_coroutine(|coro| f(coro.local_mut(self.key(), self.init)))
    }

    #[track_caller]
    pub fn set(&'static self, value: T) {
        self.with(|slot| *slot = value);
    }

    #[track_caller]
    pub fn get(&'static self) -> T
    where
        T: Clone,
    {
        self.with(|slot| slot.clone())
    }

    /// Resets the value, so that the next access builds a fresh one.
    #[track_caller]
    pub fn reset(&'static self) -> bool {
        current::expect_current().with_coroutine(|coro| coro.remove_local(self.key()))
    }
}

impl<T: 'static> fmt::Debug for TaskLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLocal").finish_non_exhaustive()
    }
}
