use crate::deadline::Deadline;
use crate::sync::condvar::CondvarGuard;
use crate::sync::semaphore::{Semaphore, SemaphoreError};
use crate::task::TaskCancellationBlocker;
use crate::task::context::TaskContext;
use crate::task::current;
use crate::utils::ScopeGuard;
use crate::wait::{EarlyWakeup, Sleep, WaitList, WaitStrategy, WaiterKey};
use std::cell::UnsafeCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Readers share the semaphore one unit each, a writer takes all of them.
const MAX_READERS: usize = usize::MAX >> 1;

/// Readers-writer lock for tasks.
///
/// Writers are preferred: once a writer waits, new readers queue behind it,
/// so a steady stream of readers cannot starve writers.
pub struct SharedMutex<T: ?Sized> {
    sem: Semaphore,
    waiting_writers: AtomicUsize,
    /// Readers waiting for `waiting_writers` to drop to zero.
    readers: WaitList,
    value: UnsafeCell<T>,
}

// Safety: shared access requires `T: Sync`, exclusive access is serialized by
// the semaphore.
unsafe impl<T: ?Sized + Send> Send for SharedMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for SharedMutex<T> {}

impl<T> SharedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            sem: Semaphore::new(MAX_READERS),
            waiting_writers: AtomicUsize::new(0),
            readers: WaitList::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SharedMutex<T> {
    /// Locks for writing, ignoring cancellation of the current task.
    pub async fn write(&self) -> SharedMutexWriteGuard<'_, T> {
        self.write_raw().await;
        SharedMutexWriteGuard::new(self)
    }

    pub fn try_write(&self) -> Option<SharedMutexWriteGuard<'_, T>> {
        self.sem
            .try_acquire_fast(MAX_READERS)
            .then(|| SharedMutexWriteGuard::new(self))
    }

    pub async fn try_write_until(&self, deadline: Deadline) -> Option<SharedMutexWriteGuard<'_, T>> {
        let res = {
            let _waiting = self.register_writer();
            self.sem.try_acquire_many_until(MAX_READERS, deadline).await
        };

        // The semaphore lock is replaced by the guard.
        res.ok().map(|lock| {
            std::mem::forget(lock);
            SharedMutexWriteGuard::new(self)
        })
    }

    pub async fn try_write_for(&self, timeout: Duration) -> Option<SharedMutexWriteGuard<'_, T>> {
        self.try_write_until(Deadline::from_duration(timeout)).await
    }

    /// Locks for reading, ignoring cancellation of the current task.
    pub async fn read(&self) -> SharedMutexReadGuard<'_, T> {
        let _blocker = TaskCancellationBlocker::new();
        let locked = self.read_slow(Deadline::unreachable()).await;
        debug_assert!(locked);
        SharedMutexReadGuard::new(self)
    }

    pub fn try_read(&self) -> Option<SharedMutexReadGuard<'_, T>> {
        (self.waiting_writers.load(Ordering::SeqCst) == 0 && self.sem.try_acquire_fast(1))
            .then(|| SharedMutexReadGuard::new(self))
    }

    pub async fn try_read_until(&self, deadline: Deadline) -> Option<SharedMutexReadGuard<'_, T>> {
        self.read_slow(deadline)
            .await
            .then(|| SharedMutexReadGuard::new(self))
    }

    pub async fn try_read_for(&self, timeout: Duration) -> Option<SharedMutexReadGuard<'_, T>> {
        self.try_read_until(Deadline::from_duration(timeout)).await
    }

    async fn write_raw(&self) {
        let _waiting = self.register_writer();
        let res = self.sem.acquire_raw(MAX_READERS).await;
        debug_assert!(res.is_ok(), "writer lock is always reachable");
    }

    fn unlock_write(&self) {
        self.sem.release(MAX_READERS);
    }

    async fn read_slow(&self, deadline: Deadline) -> bool {
        if !self.wait_no_writers(deadline).await {
            return false;
        }
        match self.sem.try_acquire_many_until(1, deadline).await {
            Ok(lock) => {
                std::mem::forget(lock);
                true
            }
            Err(SemaphoreError::Timeout | SemaphoreError::Cancelled) => false,
            Err(SemaphoreError::Unreachable { .. }) => {
                unreachable!("reader lock is always reachable")
            }
        }
    }

    async fn wait_no_writers(&self, deadline: Deadline) -> bool {
        if self.waiting_writers.load(Ordering::SeqCst) == 0 {
            return true;
        }

        let task = current::expect_current();
        let mut strategy = NoWritersWait {
            mutex: self,
            key: None,
        };
        loop {
            Sleep::new(&mut strategy, deadline).await;
            if self.waiting_writers.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if deadline.is_reached() || task.should_cancel() {
                return false;
            }
        }
    }

    /// Holds new readers back until the returned guard is dropped, including
    /// when the waiting future is.
    fn register_writer(&self) -> ScopeGuard<impl FnOnce() + '_> {
        self.waiting_writers.fetch_add(1, Ordering::SeqCst);
        ScopeGuard::new(move || {
            if self.waiting_writers.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.readers.wakeup_all();
            }
        })
    }
}

impl<T: Default> Default for SharedMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for SharedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMutex")
            .field("waiting_writers", &self.waiting_writers.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

struct NoWritersWait<'a, T: ?Sized> {
    mutex: &'a SharedMutex<T>,
    key: Option<WaiterKey>,
}

impl<T: ?Sized> WaitStrategy for NoWritersWait<'_, T> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        self.key = Some(self.mutex.readers.lock().append(task));
        EarlyWakeup(self.mutex.waiting_writers.load(Ordering::SeqCst) == 0)
    }

    fn disable_wakeups(&mut self, task: &Arc<TaskContext>) {
        if let Some(key) = self.key.take() {
            self.mutex.readers.lock().remove(key, task);
        }
    }
}

#[must_use = "if unused the SharedMutex will immediately unlock"]
pub struct SharedMutexReadGuard<'a, T: ?Sized> {
    mutex: &'a SharedMutex<T>,
    _p: PhantomData<&'a T>,
}

impl<'a, T: ?Sized> SharedMutexReadGuard<'a, T> {
    fn new(mutex: &'a SharedMutex<T>) -> Self {
        Self {
            mutex,
            _p: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for SharedMutexReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: readers only hand out shared references.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.sem.release(1);
    }
}

#[must_use = "if unused the SharedMutex will immediately unlock"]
pub struct SharedMutexWriteGuard<'a, T: ?Sized> {
    mutex: &'a SharedMutex<T>,
    _p: PhantomData<&'a mut T>,
}

impl<'a, T: ?Sized> SharedMutexWriteGuard<'a, T> {
    fn new(mutex: &'a SharedMutex<T>) -> Self {
        Self {
            mutex,
            _p: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for SharedMutexWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the writer holds every semaphore unit.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SharedMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the writer holds every semaphore unit.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: ?Sized> Drop for SharedMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock_write();
    }
}

impl<T: ?Sized + Send + Sync> CondvarGuard for SharedMutexWriteGuard<'_, T> {
    fn unlock_raw(&self) {
        self.mutex.unlock_write();
    }

    fn lock_raw(&self) -> impl Future<Output = ()> + Send + '_ {
        self.mutex.write_raw()
    }
}
