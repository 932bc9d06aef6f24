use crate::deadline::Deadline;
use crate::task::TaskCancellationBlocker;
use crate::task::context::TaskContext;
use crate::task::current;
use crate::wait::{EarlyWakeup, Sleep, WaitList, WaitStrategy, WaiterKey};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Why a semaphore acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SemaphoreError {
    #[error("semaphore acquisition timed out")]
    Timeout,

    #[error("semaphore acquisition interrupted by task cancellation")]
    Cancelled,

    /// More units were requested than the semaphore will ever hold.
    #[error("cannot acquire {requested} units of a semaphore with capacity {capacity}")]
    Unreachable { requested: usize, capacity: usize },
}

/// Counting semaphore for tasks.
///
/// Capacity can change at runtime. When it is lowered below the number of
/// units currently held, holders keep their units and new acquisitions wait
/// until enough of them are released.
pub struct Semaphore {
    acquired: AtomicUsize,
    capacity: AtomicUsize,
    waiters: WaitList,
    /// Sleeping waiters that want more than one unit.
    waiting_many: AtomicUsize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            acquired: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
            waiters: WaitList::new(),
            waiting_many: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Changes the capacity. Waiters re-evaluate their requests, those asking
    /// for more than `capacity` fail with [`SemaphoreError::Unreachable`].
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::SeqCst);
        // Unreachable requests must fail, so every waiter rechecks.
        self.waiters.wakeup_all();
    }

    /// Units available right now, zero while holders exceed the capacity.
    pub fn remaining_approx(&self) -> usize {
        self.capacity()
            .saturating_sub(self.acquired.load(Ordering::Acquire))
    }

    /// Acquires one unit, ignoring cancellation of the current task.
    pub async fn acquire(&self) -> Result<SemaphoreLock<'_>, SemaphoreError> {
        self.acquire_many(1).await
    }

    /// Acquires `count` units, ignoring cancellation of the current task.
    pub async fn acquire_many(&self, count: usize) -> Result<SemaphoreLock<'_>, SemaphoreError> {
        self.acquire_raw(count).await?;
        Ok(SemaphoreLock::new(self, count))
    }

    pub fn try_acquire(&self) -> Option<SemaphoreLock<'_>> {
        self.try_acquire_many(1)
    }

    pub fn try_acquire_many(&self, count: usize) -> Option<SemaphoreLock<'_>> {
        self.try_acquire_fast(count)
            .then(|| SemaphoreLock::new(self, count))
    }

    pub async fn try_acquire_many_until(
        &self,
        count: usize,
        deadline: Deadline,
    ) -> Result<SemaphoreLock<'_>, SemaphoreError> {
        let task = current::expect_current();
        self.acquire_slow(&task, count, deadline).await?;
        Ok(SemaphoreLock::new(self, count))
    }

    pub async fn try_acquire_many_for(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<SemaphoreLock<'_>, SemaphoreError> {
        self.try_acquire_many_until(count, Deadline::from_duration(timeout))
            .await
    }

    pub(crate) async fn acquire_raw(&self, count: usize) -> Result<(), SemaphoreError> {
        if self.try_acquire_fast(count) {
            return Ok(());
        }

        let task = current::expect_current();
        let _blocker = TaskCancellationBlocker::new();
        self.acquire_slow(&task, count, Deadline::unreachable()).await
    }

    /// Takes `count` units if they are available. Fails without waiting.
    pub(crate) fn try_acquire_fast(&self, count: usize) -> bool {
        let capacity = self.capacity.load(Ordering::SeqCst);
        let mut acquired = self.acquired.load(Ordering::SeqCst);
        loop {
            match acquired.checked_add(count) {
                Some(total) if total <= capacity => {}
                _ => return false,
            }

            match self.acquired.compare_exchange_weak(
                acquired,
                acquired + count,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => acquired = actual,
            }
        }
    }

    fn check_reachable(&self, count: usize) -> Result<(), SemaphoreError> {
        let capacity = self.capacity();
        if count > capacity {
            return Err(SemaphoreError::Unreachable {
                requested: count,
                capacity,
            });
        }
        Ok(())
    }

    async fn acquire_slow(
        &self,
        task: &Arc<TaskContext>,
        count: usize,
        deadline: Deadline,
    ) -> Result<(), SemaphoreError> {
        let mut strategy = SemaphoreWait {
            sem: self,
            count,
            key: None,
            finished: false,
        };

        let res = loop {
            if let Err(e) = self.check_reachable(count) {
                break Err(e);
            }
            if self.try_acquire_fast(count) {
                break Ok(());
            }

            Sleep::new(&mut strategy, deadline).await;

            if self.try_acquire_fast(count) {
                break Ok(());
            }
            if let Err(e) = self.check_reachable(count) {
                break Err(e);
            }
            if task.should_cancel() {
                break Err(SemaphoreError::Cancelled);
            }
            if deadline.is_reached() {
                break Err(SemaphoreError::Timeout);
            }
        };
        strategy.finished = true;
        res
    }

    pub(crate) fn release(&self, count: usize) {
        let prev = self.acquired.fetch_sub(count, Ordering::SeqCst);
        debug_assert!(prev >= count, "released more semaphore units than acquired");
        self.wake_waiters();
    }

    fn wake_waiters(&self) {
        let sleepies = self.waiters.count_of_sleepies();
        if sleepies == 0 {
            return;
        }

        if self.waiting_many.load(Ordering::SeqCst) > 0 {
            // Requests differ in size, so let every waiter recheck.
            self.waiters.wakeup_all();
        } else {
            // Single-unit requests: one waiter per free unit.
            for _ in 0..self.remaining_approx().min(sleepies) {
                self.waiters.wakeup_one();
            }
        }
    }

    fn would_succeed(&self, count: usize) -> bool {
        let capacity = self.capacity.load(Ordering::SeqCst);
        count > capacity
            || self
                .acquired
                .load(Ordering::SeqCst)
                .checked_add(count)
                .is_some_and(|total| total <= capacity)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("capacity", &self.capacity())
            .field("acquired", &self.acquired.load(Ordering::Relaxed))
            .finish()
    }
}

struct SemaphoreWait<'a> {
    sem: &'a Semaphore,
    count: usize,
    key: Option<WaiterKey>,
    /// Set once the acquisition returned, with or without units.
    finished: bool,
}

impl WaitStrategy for SemaphoreWait<'_> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        // Counted before the append, so a releaser that sees this waiter also
        // sees the request size.
        if self.count > 1 {
            self.sem.waiting_many.fetch_add(1, Ordering::SeqCst);
        }
        self.key = Some(self.sem.waiters.lock().append(task));
        // Either the units or an unreachable request need no sleep.
        EarlyWakeup(self.sem.would_succeed(self.count))
    }

    fn disable_wakeups(&mut self, task: &Arc<TaskContext>) {
        if let Some(key) = self.key.take() {
            self.sem.waiters.lock().remove(key, task);
            if self.count > 1 {
                self.sem.waiting_many.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for SemaphoreWait<'_> {
    fn drop(&mut self) {
        // A dropped acquisition may have been the target of a wakeup, pass it
        // on to the remaining waiters.
        if !self.finished {
            self.sem.wake_waiters();
        }
    }
}

/// Units held from a [`Semaphore`]. Released on drop.
#[must_use = "if unused the semaphore units are released immediately"]
pub struct SemaphoreLock<'a> {
    sem: &'a Semaphore,
    count: usize,
}

impl<'a> SemaphoreLock<'a> {
    fn new(sem: &'a Semaphore, count: usize) -> Self {
        Self { sem, count }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for SemaphoreLock<'_> {
    fn drop(&mut self) {
        self.sem.release(self.count);
    }
}

impl fmt::Debug for SemaphoreLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreLock")
            .field("count", &self.count)
            .finish()
    }
}
