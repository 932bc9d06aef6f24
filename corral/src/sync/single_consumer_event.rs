use crate::deadline::Deadline;
use crate::error::WaitInterrupted;
use crate::task::TaskCancellationBlocker;
use crate::task::context::TaskContext;
use crate::task::current;
use crate::wait::{EarlyWakeup, LightKey, Sleep, WaitListLight, WaitStatus, WaitStrategy};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Reusable event with one waiting task at a time.
///
/// Any number of producers may [`send`](Self::send). By default a successful
/// wait consumes the signal, see [`SingleConsumerEvent::without_auto_reset`].
pub struct SingleConsumerEvent {
    signaled: AtomicBool,
    auto_reset: bool,
    waiter: WaitListLight,
}

impl SingleConsumerEvent {
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            auto_reset: true,
            waiter: WaitListLight::new(),
        }
    }

    /// The signal stays set after a wait until [`reset`](Self::reset).
    pub const fn without_auto_reset() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            auto_reset: false,
            waiter: WaitListLight::new(),
        }
    }

    pub fn send(&self) {
        self.signaled.store(true, Ordering::SeqCst);
        self.waiter.wakeup_one();
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
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
        if self.consume() {
            return WaitStatus::NoTimeout;
        }

        let task = current::expect_current();
        let mut strategy = ConsumerWait {
            event: self,
            key: None,
        };
        loop {
            Sleep::new(&mut strategy, deadline).await;

            if self.consume() {
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

    fn consume(&self) -> bool {
        if self.auto_reset {
            self.signaled.swap(false, Ordering::SeqCst)
        } else {
            self.signaled.load(Ordering::SeqCst)
        }
    }
}

impl Default for SingleConsumerEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SingleConsumerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleConsumerEvent")
            .field("signaled", &self.is_ready())
            .field("auto_reset", &self.auto_reset)
            .finish()
    }
}

struct ConsumerWait<'a> {
    event: &'a SingleConsumerEvent,
    key: Option<LightKey>,
}

impl WaitStrategy for ConsumerWait<'_> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        self.key = Some(self.event.waiter.append(task));
        EarlyWakeup(self.event.signaled.load(Ordering::SeqCst))
    }

    fn disable_wakeups(&mut self, _task: &Arc<TaskContext>) {
        if let Some(key) = self.key.take() {
            self.event.waiter.remove(key);
        }
    }
}
