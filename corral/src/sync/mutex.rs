use crate::deadline::Deadline;
use crate::sync::condvar::CondvarGuard;
use crate::task::TaskCancellationBlocker;
use crate::task::context::TaskContext;
use crate::task::current;
use crate::wait::{EarlyWakeup, Sleep, WaitList, WaitStrategy, WaiterKey};
use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// No owner.
const UNLOCKED: u64 = 0;

/// Task-aware mutex.
///
/// Blocking in [`Mutex::lock`] suspends the current task instead of the
/// worker thread. There is no fairness guarantee between waiters.
///
/// Locking twice from the same task is a deadlock and panics in debug builds.
pub struct Mutex<T: ?Sized> {
    /// Id of the owning task.
    owner: AtomicU64,
    waiters: WaitList,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is serialized by `owner`.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            owner: AtomicU64::new(UNLOCKED),
            waiters: WaitList::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Locks the mutex, ignoring cancellation of the current task.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.lock_raw().await;
        MutexGuard::new(self)
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.try_lock_fast(current::id().as_u64())
            .then(|| MutexGuard::new(self))
    }

    /// Returns `None` once `deadline` passes or the current task is cancelled.
    pub async fn try_lock_until(&self, deadline: Deadline) -> Option<MutexGuard<'_, T>> {
        let task = current::expect_current();
        self.lock_slow(&task, deadline)
            .await
            .then(|| MutexGuard::new(self))
    }

    pub async fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        self.try_lock_until(Deadline::from_duration(timeout)).await
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn try_lock_fast(&self, id: u64) -> bool {
        self.owner
            .compare_exchange(UNLOCKED, id, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) async fn lock_raw(&self) {
        let task = current::expect_current();
        if self.try_lock_fast(task.id().as_u64()) {
            return;
        }

        let _blocker = TaskCancellationBlocker::new();
        let locked = self.lock_slow(&task, Deadline::unreachable()).await;
        debug_assert!(locked);
    }

    async fn lock_slow(&self, task: &Arc<TaskContext>, deadline: Deadline) -> bool {
        let id = task.id().as_u64();
        debug_assert_ne!(
            self.owner.load(Ordering::Relaxed),
            id,
            "task {} locked a Mutex it already holds",
            task.id()
        );

        let mut strategy = MutexWait {
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

    pub(crate) fn unlock_raw(&self) {
        let prev = self.owner.swap(UNLOCKED, Ordering::SeqCst);
        debug_assert_ne!(prev, UNLOCKED, "unlocking a Mutex that is not locked");

        // Pairs with the append in `MutexWait::setup_wakeups`.
        if self.waiters.count_of_sleepies() > 0 {
            self.waiters.wakeup_one();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNLOCKED
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

struct MutexWait<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    key: Option<WaiterKey>,
}

impl<T: ?Sized> WaitStrategy for MutexWait<'_, T> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        self.key = Some(self.mutex.waiters.lock().append(task));
        // Unlocked in the meantime: retry instead of sleeping.
        EarlyWakeup(self.mutex.owner.load(Ordering::SeqCst) == UNLOCKED)
    }

    fn disable_wakeups(&mut self, task: &Arc<TaskContext>) {
        if let Some(key) = self.key.take() {
            self.mutex.waiters.lock().remove(key, task);
        }
    }
}

/// Grants access to the value of a locked [`Mutex`]. Unlocks on drop.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    _p: PhantomData<&'a mut T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _p: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves ownership of the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves ownership of the lock.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock_raw();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + Send> CondvarGuard for MutexGuard<'_, T> {
    fn unlock_raw(&self) {
        self.mutex.unlock_raw();
    }

    fn lock_raw(&self) -> impl Future<Output = ()> + Send + '_ {
        self.mutex.lock_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corral;
    use crate::task::TaskWithResult;
    use static_assertions::assert_impl_all;
    use std::time::Instant;

    assert_impl_all!(Mutex<Vec<u8>>: Send, Sync);
    assert_impl_all!(MutexGuard<'static, Vec<u8>>: Send, Sync);

    #[crate::test(worker_threads = 4)]
    async fn test_counter_under_contention() -> anyhow::Result<()> {
        const TASKS: usize = 16;
        const INCREMENTS: usize = 500;

        let counter = Arc::new(Mutex::new(0_usize));
        let tasks = (0..TASKS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                corral::spawn(async move {
                    for i in 0..INCREMENTS {
                        let mut guard = counter.lock().await;
                        let seen = *guard;
                        if i % 16 == 0 {
                            corral::time::yield_now().await;
                        }
                        *guard = seen + 1;
                    }
                })
            })
            .collect::<Vec<TaskWithResult<()>>>();

        for task in tasks {
            task.get().await?;
        }

        assert_eq!(*counter.lock().await, TASKS * INCREMENTS);
        Ok(())
    }

    #[crate::test]
    async fn test_try_lock_until_times_out() -> anyhow::Result<()> {
        let mutex = Arc::new(Mutex::new(()));
        let _guard = mutex.lock().await;

        let contender = corral::spawn({
            let mutex = Arc::clone(&mutex);
            async move {
                let started = Instant::now();
                let locked = mutex.try_lock_for(Duration::from_millis(50)).await.is_some();
                (locked, started.elapsed())
            }
        });

        let (locked, elapsed) = contender.get().await?;
        assert!(!locked);
        assert!(elapsed >= Duration::from_millis(50));
        assert_eq!(mutex.waiters.count_of_sleepies(), 0);
        Ok(())
    }

    #[crate::test]
    async fn test_lock_ignores_cancellation() -> anyhow::Result<()> {
        let mutex = Arc::new(Mutex::new(0));
        let guard = mutex.lock().await;

        let waiter = corral::spawn({
            let mutex = Arc::clone(&mutex);
            async move {
                *mutex.lock().await += 1;
                corral::current_task::is_cancel_requested()
            }
        });

        corral::time::sleep_for(Duration::from_millis(10)).await;
        waiter.request_cancel();
        corral::time::sleep_for(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert!(waiter.get().await?);
        assert_eq!(*mutex.lock().await, 1);
        Ok(())
    }

    #[crate::test]
    async fn test_try_lock() {
        let mutex = Mutex::new(1);
        let guard = mutex.try_lock();
        assert!(guard.is_some());
        assert!(mutex.is_locked());
        drop(guard);
        assert!(!mutex.is_locked());
    }
}
