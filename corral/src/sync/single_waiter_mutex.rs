use crate::deadline::Deadline;
use crate::sync::condvar::CondvarGuard;
use crate::task::TaskCancellationBlocker;
use crate::task::context::TaskContext;
use crate::task::current;
use crate::wait::{EarlyWakeup, LightKey, Sleep, WaitListLight, WaitStrategy};
use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const UNLOCKED: u64 = 0;

/// Mutex for the case where at most one task contends with the owner.
///
/// Same API as [`Mutex`](super::Mutex) but the wait list is a single lock-free
/// slot. A second concurrent waiter panics.
pub struct SingleWaiterMutex<T: ?Sized> {
    owner: AtomicU64,
    waiter: WaitListLight,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialized by `owner`.
unsafe impl<T: ?Sized + Send> Send for SingleWaiterMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SingleWaiterMutex<T> {}

impl<T> SingleWaiterMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicU64::new(UNLOCKED),
            waiter: WaitListLight::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SingleWaiterMutex<T> {
    /// Locks the mutex, ignoring cancellation of the current task.
    pub async fn lock(&self) -> SingleWaiterMutexGuard<'_, T> {
        self.lock_raw().await;
        SingleWaiterMutexGuard::new(self)
    }

    pub fn try_lock(&self) -> Option<SingleWaiterMutexGuard<'_, T>> {
        self.try_lock_fast(current::id().as_u64())
            .then(|| SingleWaiterMutexGuard::new(self))
    }

    pub async fn try_lock_until(&self, deadline: Deadline) -> Option<SingleWaiterMutexGuard<'_, T>> {
        let task = current::expect_current();
        self.lock_slow(&task, deadline)
            .await
            .then(|| SingleWaiterMutexGuard::new(self))
    }

    pub async fn try_lock_for(&self, timeout: Duration) -> Option<SingleWaiterMutexGuard<'_, T>> {
        self.try_lock_until(Deadline::from_duration(timeout)).await
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNLOCKED
    }

    fn try_lock_fast(&self, id: u64) -> bool {
        self.owner
            .compare_exchange(UNLOCKED, id, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    async fn lock_raw(&self) {
        let task = current::expect_current();
        if self.try_lock_fast(task.id().as_u64()) {
            return;
        }

        let _blocker = TaskCancellationBlocker::new();
        self.lock_slow(&task, Deadline::unreachable()).await;
    }

    async fn lock_slow(&self, task: &Arc<TaskContext>, deadline: Deadline) -> bool {
        let id = task.id().as_u64();
        debug_assert_ne!(
            self.owner.load(Ordering::Relaxed),
            id,
            "task {} locked a SingleWaiterMutex it already holds",
            task.id()
        );

        let mut strategy = SingleWaiterWait {
            mutex: self,
            key: None,
        };
        loop {
            if self.try_lock_fast(id) {
                return true;
            }
            Sleep::new(&mut strategy, deadline).await;
            if self.try_lock_fast(id) {
                return true;
            }
            if deadline.is_reached() || task.should_cancel() {
                return false;
            }
        }
    }

    fn unlock_raw(&self) {
        let prev = self.owner.swap(UNLOCKED, Ordering::SeqCst);
        debug_assert_ne!(prev, UNLOCKED, "unlocking a SingleWaiterMutex that is not locked");
        self.waiter.wakeup_one();
    }
}

impl<T: ?Sized> fmt::Debug for SingleWaiterMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleWaiterMutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

struct SingleWaiterWait<'a, T: ?Sized> {
    mutex: &'a SingleWaiterMutex<T>,
    key: Option<LightKey>,
}

impl<T: ?Sized> WaitStrategy for SingleWaiterWait<'_, T> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        self.key = Some(self.mutex.waiter.append(task));
        EarlyWakeup(self.mutex.owner.load(Ordering::SeqCst) == UNLOCKED)
    }

    fn disable_wakeups(&mut self, _task: &Arc<TaskContext>) {
        if let Some(key) = self.key.take() {
            self.mutex.waiter.remove(key);
        }
    }
}

#[must_use = "if unused the SingleWaiterMutex will immediately unlock"]
pub struct SingleWaiterMutexGuard<'a, T: ?Sized> {
    mutex: &'a SingleWaiterMutex<T>,
    _p: PhantomData<&'a mut T>,
}

impl<'a, T: ?Sized> SingleWaiterMutexGuard<'a, T> {
    fn new(mutex: &'a SingleWaiterMutex<T>) -> Self {
        Self {
            mutex,
            _p: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for SingleWaiterMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves ownership of the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SingleWaiterMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves ownership of the lock.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for SingleWaiterMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock_raw();
    }
}

impl<T: ?Sized + Send> CondvarGuard for SingleWaiterMutexGuard<'_, T> {
    fn unlock_raw(&self) {
        self.mutex.unlock_raw();
    }

    fn lock_raw(&self) -> impl Future<Output = ()> + Send + '_ {
        self.mutex.lock_raw()
    }
}
