//! Task sleeps.
//!
//! All functions suspend the current task and must be awaited from within a
//! task.

use crate::deadline::Deadline;
use crate::task::TaskCancellationBlocker;
use crate::task::current;
use crate::wait::{DeadlineOnly, Sleep, WaitStatus, Yield};
use std::time::{Duration, Instant};

/// Sleeps for `duration`. Cancellation of the current task is ignored.
pub async fn sleep_for(duration: Duration) {
    sleep_until(Deadline::from_duration(duration)).await;
}

/// Sleeps until `deadline`. Cancellation of the current task is ignored, an
/// unreachable deadline sleeps forever.
pub async fn sleep_until(deadline: Deadline) {
    let _blocker = TaskCancellationBlocker::new();
    while !deadline.is_reached() {
        Sleep::new(&mut DeadlineOnly, deadline).await;
    }
}

pub async fn sleep_until_instant(at: Instant) {
    sleep_until(Deadline::from_instant(at)).await;
}

/// Sleeps for `duration` or until the current task is cancelled.
pub async fn interruptible_sleep_for(duration: Duration) -> WaitStatus {
    interruptible_sleep_until(Deadline::from_duration(duration)).await
}

/// Sleeps until `deadline` or until the current task is cancelled.
///
/// Returns [`WaitStatus::Timeout`] when the full sleep elapsed.
pub async fn interruptible_sleep_until(deadline: Deadline) -> WaitStatus {
    let task = current::expect_current();
    loop {
        if task.should_cancel() {
            return WaitStatus::Cancelled;
        }
        if deadline.is_reached() {
            return WaitStatus::Timeout;
        }
        Sleep::new(&mut DeadlineOnly, deadline).await;
    }
}

/// Lets every task that is already runnable execute before resuming.
pub async fn yield_now() {
    Sleep::new(&mut Yield, Deadline::unreachable()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as corral;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[rstest]
    #[case::one_millisecond(Duration::from_millis(1))]
    #[case::twenty_milliseconds(Duration::from_millis(20))]
    #[corral::test]
    async fn test_sleep_duration_is_accurate(#[case] duration: Duration) {
        let start = Instant::now();
        sleep_for(duration).await;
        assert!(start.elapsed() >= duration);
    }

    #[corral::test]
    async fn test_sleep_ignores_cancellation() -> anyhow::Result<()> {
        let task = corral::spawn(async {
            let start = Instant::now();
            sleep_for(Duration::from_millis(30)).await;
            start.elapsed()
        });

        sleep_for(Duration::from_millis(5)).await;
        task.request_cancel();
        assert!(task.get().await? >= Duration::from_millis(30));
        Ok(())
    }

    #[corral::test]
    async fn test_interruptible_sleep() -> anyhow::Result<()> {
        assert_eq!(
            interruptible_sleep_for(Duration::from_millis(2)).await,
            WaitStatus::Timeout
        );

        let task = corral::spawn(interruptible_sleep_for(Duration::from_secs(30)));
        sleep_for(Duration::from_millis(5)).await;
        task.request_cancel();
        assert_eq!(task.get().await?, WaitStatus::Cancelled);
        Ok(())
    }

    #[corral::test(worker_threads = 1)]
    async fn test_yield_lets_others_run() -> anyhow::Result<()> {
        let flag = Arc::new(AtomicBool::new(false));
        let task = corral::spawn({
            let flag = Arc::clone(&flag);
            async move {
                let other = corral::spawn({
                    let flag = Arc::clone(&flag);
                    async move { flag.store(true, Ordering::SeqCst) }
                });
                // A single worker: only yielding lets `other` run.
                while !flag.load(Ordering::SeqCst) {
                    yield_now().await;
                }
                other.get().await.is_ok()
            }
        });
        assert!(task.get().await?);
        Ok(())
    }
}
