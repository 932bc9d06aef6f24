use crate::deadline::Deadline;
use crate::task::TaskCancellationBlocker;
use crate::task::context::TaskContext;
use crate::task::sleep_state::WakeupSource;
use crate::wait::{EarlyWakeup, Sleep, WaitList, WaitStatus, WaitStrategy, WaiterKey};
use std::fmt;
use std::future::Future;
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A lock guard that a [`ConditionVariable`] can release and reacquire while
/// the task waits.
///
/// Implemented by the guards of [`Mutex`](super::Mutex),
/// [`SingleWaiterMutex`](super::SingleWaiterMutex) and the exclusive guard of
/// [`SharedMutex`](super::SharedMutex).
pub trait CondvarGuard {
    #[doc(hidden)]
    fn unlock_raw(&self);

    /// Reacquires the lock ignoring cancellation.
    #[doc(hidden)]
    fn lock_raw(&self) -> impl Future<Output = ()> + Send + '_;
}

/// Task-aware condition variable.
///
/// Waits release the guard, suspend the task and reacquire the guard before
/// returning, even when the wait ends by timeout or cancellation. Spurious
/// wakeups are possible, prefer the predicate forms.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: WaitList,
}

impl ConditionVariable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn wait<G: CondvarGuard>(&self, guard: G) -> (G, WaitStatus) {
        self.wait_until(guard, Deadline::unreachable()).await
    }

    pub async fn wait_for<G: CondvarGuard>(&self, guard: G, timeout: Duration) -> (G, WaitStatus) {
        self.wait_until(guard, Deadline::from_duration(timeout)).await
    }

    pub async fn wait_until<G: CondvarGuard>(&self, guard: G, deadline: Deadline) -> (G, WaitStatus) {
        let parked = ParkedGuard::new(guard);
        let mut strategy = CondvarWait {
            cv: self,
            parked: &parked,
            key: None,
        };

        let source = Sleep::new(&mut strategy, deadline).await;
        if !parked.locked.load(Ordering::Relaxed) {
            let _blocker = TaskCancellationBlocker::new();
            parked.guard.lock_raw().await;
            parked.locked.store(true, Ordering::Relaxed);
        }

        let status = match source {
            WakeupSource::None | WakeupSource::WaitList | WakeupSource::Bootstrap => {
                WaitStatus::NoTimeout
            }
            WakeupSource::DeadlineTimer => WaitStatus::Timeout,
            WakeupSource::CancelRequest => WaitStatus::Cancelled,
        };
        (parked.into_inner(), status)
    }

    /// Blocks while `condition` holds. Returns the guard and whether
    /// `condition` stopped holding, which is false only if the task was
    /// cancelled.
    pub async fn wait_while<G, F>(&self, guard: G, mut condition: F) -> (G, bool)
    where
        G: CondvarGuard,
        F: FnMut(&mut G) -> bool,
    {
        self.wait_until_pred(guard, Deadline::unreachable(), |g| !condition(g))
            .await
    }

    /// Blocks until `pred` holds or the wait is interrupted. Returns the guard
    /// and the last value of `pred`.
    pub async fn wait_until_pred<G, F>(&self, mut guard: G, deadline: Deadline, mut pred: F) -> (G, bool)
    where
        G: CondvarGuard,
        F: FnMut(&mut G) -> bool,
    {
        while !pred(&mut guard) {
            let (g, status) = self.wait_until(guard, deadline).await;
            guard = g;
            if status != WaitStatus::NoTimeout {
                let ready = pred(&mut guard);
                return (guard, ready);
            }
        }
        (guard, true)
    }

    pub async fn wait_for_pred<G, F>(&self, guard: G, timeout: Duration, pred: F) -> (G, bool)
    where
        G: CondvarGuard,
        F: FnMut(&mut G) -> bool,
    {
        self.wait_until_pred(guard, Deadline::from_duration(timeout), pred)
            .await
    }

    pub fn notify_one(&self) {
        self.waiters.wakeup_one();
    }

    pub fn notify_all(&self) {
        self.waiters.wakeup_all();
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.waiters.count_of_sleepies())
            .finish()
    }
}

/// Holds the caller's guard across the wait. A guard whose lock is released
/// when the wait future is dropped is forgotten instead of unlocked twice.
struct ParkedGuard<G: CondvarGuard> {
    guard: ManuallyDrop<G>,
    locked: AtomicBool,
}

impl<G: CondvarGuard> ParkedGuard<G> {
    fn new(guard: G) -> Self {
        Self {
            guard: ManuallyDrop::new(guard),
            locked: AtomicBool::new(true),
        }
    }

    fn into_inner(self) -> G {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        let mut this = ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so the guard is moved out once.
        unsafe { ManuallyDrop::take(&mut this.guard) }
    }
}

impl<G: CondvarGuard> Drop for ParkedGuard<G> {
    fn drop(&mut self) {
        if self.locked.load(Ordering::Relaxed) {
            // Safety: dropped once, `into_inner` skips this destructor.
            unsafe { ManuallyDrop::drop(&mut self.guard) };
        }
    }
}

struct CondvarWait<'a, G: CondvarGuard> {
    cv: &'a ConditionVariable,
    parked: &'a ParkedGuard<G>,
    key: Option<WaiterKey>,
}

impl<G: CondvarGuard> WaitStrategy for CondvarWait<'_, G> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        // Register before releasing the lock so a notify issued right after
        // the unlock finds this task.
        self.key = Some(self.cv.waiters.lock().append(task));
        self.parked.guard.unlock_raw();
        self.parked.locked.store(false, Ordering::Relaxed);
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self, task: &Arc<TaskContext>) {
        if let Some(key) = self.key.take() {
            self.cv.waiters.lock().remove(key, task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corral;
    use crate::sync::Mutex;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ConditionVariable: Send, Sync);

    #[derive(Default)]
    struct Channel {
        mutex: Mutex<Option<u32>>,
        cv: ConditionVariable,
    }

    #[crate::test(worker_threads = 2)]
    async fn test_ping_pong() -> anyhow::Result<()> {
        const ROUNDS: u32 = 100;
        let chan = Arc::new(Channel::default());

        let consumer = corral::spawn({
            let chan = Arc::clone(&chan);
            async move {
                let mut sum = 0;
                for _ in 0..ROUNDS {
                    let guard = chan.mutex.lock().await;
                    let (mut guard, ready) = chan.cv.wait_while(guard, |g| g.is_none()).await;
                    assert!(ready);
                    sum += guard.take().unwrap_or_default();
                    chan.cv.notify_one();
                }
                sum
            }
        });

        for i in 1..=ROUNDS {
            let guard = chan.mutex.lock().await;
            let (mut guard, ready) = chan.cv.wait_while(guard, |g| g.is_some()).await;
            assert!(ready);
            *guard = Some(i);
            drop(guard);
            chan.cv.notify_one();
        }

        assert_eq!(consumer.get().await?, ROUNDS * (ROUNDS + 1) / 2);
        Ok(())
    }

    #[crate::test]
    async fn test_timeout_reacquires_lock() {
        let chan = Channel::default();
        let guard = chan.mutex.lock().await;

        let (guard, status) = chan.cv.wait_for(guard, Duration::from_millis(20)).await;
        assert_eq!(status, WaitStatus::Timeout);
        assert!(chan.mutex.is_locked());
        drop(guard);

        assert!(!chan.mutex.is_locked());
        assert_eq!(chan.cv.waiters.count_of_sleepies(), 0);
    }

    #[crate::test]
    async fn test_predicate_false_on_timeout() {
        let chan = Channel::default();
        let guard = chan.mutex.lock().await;

        let (_guard, ready) = chan
            .cv
            .wait_for_pred(guard, Duration::from_millis(10), |g| g.is_some())
            .await;
        assert!(!ready);
    }

    #[crate::test]
    async fn test_cancelled_wait() -> anyhow::Result<()> {
        let chan = Arc::new(Channel::default());

        let waiter = corral::spawn({
            let chan = Arc::clone(&chan);
            async move {
                let guard = chan.mutex.lock().await;
                let (_guard, status) = chan.cv.wait(guard).await;
                status
            }
        });

        corral::time::sleep_for(Duration::from_millis(10)).await;
        waiter.request_cancel();
        assert_eq!(waiter.get().await?, WaitStatus::Cancelled);
        assert!(!chan.mutex.is_locked());
        Ok(())
    }
}
