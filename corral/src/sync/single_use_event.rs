use crate::deadline::Deadline;
use crate::error::WaitInterrupted;
use crate::task::TaskCancellationBlocker;
use crate::task::context::TaskContext;
use crate::task::current;
use crate::wait::light::Waiter;
use crate::wait::{EarlyWakeup, Sleep, WaitStatus, WaitStrategy};
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

/// Never a valid `Waiter` address, which is at least word aligned.
fn signaled() -> *mut Waiter {
    ptr::without_provenance_mut(1)
}

/// One-shot event: exactly one `send`, at most one waiting task.
///
/// The whole state is one word holding either nothing, the signal, or the
/// waiting task.
pub struct SingleUseEvent {
    state: AtomicPtr<Waiter>,
}

impl SingleUseEvent {
    pub const fn new() -> Self {
        Self {
            state: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Signals the event and wakes the waiter, if any.
    ///
    /// # Panics
    ///
    /// Sending twice is a programming error and panics in debug builds.
    pub fn send(&self) {
        let prev = self.state.swap(signaled(), Ordering::SeqCst);
        debug_assert_ne!(prev, signaled(), "SingleUseEvent sent twice");

        if !prev.is_null() && prev != signaled() {
            // Safety: the swap took the published waiter out of the word.
            unsafe { Waiter::reclaim(prev) }.wakeup();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == signaled()
    }

    pub async fn wait(&self) -> Result<(), WaitInterrupted> {
        match self.wait_until(Deadline::unreachable()).await {
            WaitStatus::NoTimeout => Ok(()),
            _ => Err(WaitInterrupted {
                reason: current::cancellation_reason(),
            }),
        }
    }

    pub async fn wait_for(&self, timeout: Duration) -> WaitStatus {
        self.wait_until(Deadline::from_duration(timeout)).await
    }

    pub async fn wait_until(&self, deadline: Deadline) -> WaitStatus {
        if self.is_ready() {
            return WaitStatus::NoTimeout;
        }

        let task = current::expect_current();
        let mut strategy = SingleUseWait {
            event: self,
            record: None,
        };
        loop {
            Sleep::new(&mut strategy, deadline).await;

            if self.is_ready() {
                return WaitStatus::NoTimeout;
            }
            if deadline.is_reached() || task.should_cancel() {
                return WaitStatus::not_ready(&task);
            }
        }
    }

    /// Waits for the signal, ignoring cancellation of the current task.
    pub async fn wait_non_cancellable(&self) {
        let _blocker = TaskCancellationBlocker::new();
        let status = self.wait_until(Deadline::unreachable()).await;
        debug_assert_eq!(status, WaitStatus::NoTimeout);
    }
}

impl Default for SingleUseEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SingleUseEvent {
    fn drop(&mut self) {
        let raw = *self.state.get_mut();
        debug_assert!(
            raw.is_null() || raw == signaled(),
            "SingleUseEvent destroyed with a sleeping task"
        );
        if !raw.is_null() && raw != signaled() {
            // Safety: exclusive access in drop.
            drop(unsafe { Waiter::reclaim(raw) });
        }
    }
}

impl fmt::Debug for SingleUseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleUseEvent")
            .field("ready", &self.is_ready())
            .finish()
    }
}

struct SingleUseWait<'a> {
    event: &'a SingleUseEvent,
    /// Record published by the current setup.
    record: Option<Arc<Waiter>>,
}

impl WaitStrategy for SingleUseWait<'_> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        let record = Waiter::new(task);
        let raw = Waiter::publish(&record);
        match self.event.state.compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.record = Some(record);
                EarlyWakeup(false)
            }
            Err(current) => {
                // Safety: `raw` was never published.
                drop(unsafe { Waiter::reclaim(raw) });
                assert_eq!(current, signaled(), "SingleUseEvent awaited by two tasks");
                EarlyWakeup(true)
            }
        }
    }

    fn disable_wakeups(&mut self, _task: &Arc<TaskContext>) {
        let Some(record) = self.record.take() else {
            return;
        };
        let raw = Arc::as_ptr(&record).cast_mut();

        // Fails when `send` already took the waiter.
        if self
            .event
            .state
            .compare_exchange(raw, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Safety: the exchange took it out of the word.
            drop(unsafe { Waiter::reclaim(raw) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corral;
    use static_assertions::assert_impl_all;

    assert_impl_all!(SingleUseEvent: Send, Sync);

    #[crate::test(worker_threads = 2)]
    async fn test_send_wakes_waiter() -> anyhow::Result<()> {
        let event = Arc::new(SingleUseEvent::new());
        let waiter = corral::spawn({
            let event = Arc::clone(&event);
            async move { event.wait().await }
        });

        corral::time::sleep_for(Duration::from_millis(5)).await;
        event.send();
        waiter.get().await??;
        assert!(event.is_ready());
        Ok(())
    }

    #[crate::test]
    async fn test_send_before_wait() {
        let event = SingleUseEvent::new();
        event.send();
        assert_eq!(event.wait_for(Duration::ZERO).await, WaitStatus::NoTimeout);
        // The signal is permanent.
        assert_eq!(event.wait_for(Duration::ZERO).await, WaitStatus::NoTimeout);
    }

    #[crate::test]
    async fn test_timeout_unlinks_waiter() {
        let event = SingleUseEvent::new();
        assert_eq!(
            event.wait_for(Duration::from_millis(10)).await,
            WaitStatus::Timeout
        );
        assert!(event.state.load(Ordering::SeqCst).is_null());

        event.send();
        assert!(event.wait().await.is_ok());
    }

    #[crate::test]
    async fn test_non_cancellable_wait() -> anyhow::Result<()> {
        let event = Arc::new(SingleUseEvent::new());
        let waiter = corral::spawn({
            let event = Arc::clone(&event);
            async move {
                event.wait_non_cancellable().await;
                corral::current_task::is_cancel_requested()
            }
        });

        corral::time::sleep_for(Duration::from_millis(5)).await;
        waiter.request_cancel();
        corral::time::sleep_for(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        event.send();
        assert!(waiter.get().await?);
        Ok(())
    }
}
