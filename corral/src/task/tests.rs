use crate as corral;
use crate::deadline::Deadline;
use crate::error::TaskError;
use crate::sync::SingleUseEvent;
use crate::task::{CancellationReason, TaskCancellationBlocker, TaskLocal, TaskState, TaskWithResult, current};
use crate::test_utils::init_processor;
use crate::time::{interruptible_sleep_for, sleep_for};
use crate::wait::WaitStatus;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

assert_impl_all!(TaskWithResult<Vec<u8>>: Send, Sync);

/// Sets the flag when dropped, to observe the task body unwinding.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[crate::test]
async fn test_get_returns_value() -> anyhow::Result<()> {
    let task = corral::spawn(async { String::from("corral") });
    assert_eq!(task.get().await?, "corral");
    Ok(())
}

#[crate::test]
async fn test_panic_is_reported() {
    let task = corral::spawn(async {
        panic!("task body exploded");
    });

    let mut err: TaskError = task.get().await.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(err.panic_message(), Some("task body exploded"));
}

#[rstest]
#[case::normal(false, TaskState::Cancelled)]
#[case::critical(true, TaskState::Completed)]
#[corral::test]
async fn test_cancelled_before_start(#[case] critical: bool, #[case] expected: TaskState) {
    let builder = corral::spawn_builder().deadline(Deadline::from_duration(Duration::ZERO));
    let builder = if critical { builder.critical() } else { builder };

    let task = builder.spawn(async { current::is_cancel_requested() });
    let status = task.wait_for(Duration::from_secs(5)).await;
    assert_eq!(status, WaitStatus::NoTimeout);
    assert_eq!(task.state(), expected);
    assert_eq!(task.cancellation_reason(), CancellationReason::Deadline);

    match task.get().await {
        Ok(saw_cancel) => assert!(critical && saw_cancel),
        Err(err) => {
            assert!(!critical);
            assert_eq!(err.cancellation_reason(), Some(CancellationReason::Deadline));
        }
    }
}

#[crate::test]
async fn test_cancellation_point_unwinds_body() -> anyhow::Result<()> {
    let dropped = Arc::new(AtomicBool::new(false));
    let iterations = Arc::new(AtomicUsize::new(0));

    let task = corral::spawn({
        let (dropped, iterations) = (Arc::clone(&dropped), Arc::clone(&iterations));
        async move {
            let _flag = DropFlag(dropped);
            loop {
                current::cancellation_point().await;
                iterations.fetch_add(1, Ordering::SeqCst);
                corral::time::yield_now().await;
            }
        }
    });

    while iterations.load(Ordering::SeqCst) == 0 {
        sleep_for(Duration::from_millis(1)).await;
    }
    task.request_cancel();

    let err = task.get().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.cancellation_reason(), Some(CancellationReason::UserRequest));
    assert!(dropped.load(Ordering::SeqCst));
    Ok(())
}

#[crate::test]
async fn test_first_cancellation_reason_wins() -> anyhow::Result<()> {
    let task = corral::spawn_builder()
        .timeout(Duration::from_millis(10))
        .spawn(async { interruptible_sleep_for(Duration::from_secs(30)).await });

    assert_eq!(task.wait_for(Duration::from_secs(5)).await, WaitStatus::NoTimeout);
    task.request_cancel();
    task.request_cancel();

    assert_eq!(task.cancellation_reason(), CancellationReason::Deadline);
    assert_eq!(task.get().await?, WaitStatus::Cancelled);
    Ok(())
}

#[crate::test]
async fn test_cancel_after_completion_is_ignored() {
    let task = corral::spawn(async { 5 });
    assert_eq!(task.wait_for(Duration::from_secs(5)).await, WaitStatus::NoTimeout);

    task.request_cancel();
    task.request_cancel();
    assert_eq!(task.state(), TaskState::Completed);
    assert_eq!(task.cancellation_reason(), CancellationReason::None);
    assert_eq!(task.get().await.ok(), Some(5));
}

#[crate::test]
async fn test_blocker_defers_cancellation() -> anyhow::Result<()> {
    let task = corral::spawn(async {
        let blocked = {
            let _blocker = TaskCancellationBlocker::new();
            current::request_cancel();
            assert!(current::is_cancel_requested());
            assert!(!current::should_cancel());
            interruptible_sleep_for(Duration::from_millis(10)).await
        };
        let unblocked = interruptible_sleep_for(Duration::from_secs(30)).await;
        (blocked, unblocked)
    });

    assert_eq!(
        task.get().await?,
        (WaitStatus::Timeout, WaitStatus::Cancelled)
    );
    Ok(())
}

#[crate::test]
async fn test_own_deadline_cancels() -> anyhow::Result<()> {
    let task = corral::spawn(async {
        current::set_deadline(Deadline::from_duration(Duration::from_millis(10)));
        let status = interruptible_sleep_for(Duration::from_secs(30)).await;
        (status, current::cancellation_reason())
    });

    assert_eq!(
        task.get().await?,
        (WaitStatus::Cancelled, CancellationReason::Deadline)
    );
    Ok(())
}

#[crate::test]
async fn test_dropped_handle_abandons_task() {
    let reason = Arc::new(Mutex::new(None));
    let done = Arc::new(SingleUseEvent::new());

    let task = corral::spawn({
        let (reason, done) = (Arc::clone(&reason), Arc::clone(&done));
        async move {
            interruptible_sleep_for(Duration::from_secs(30)).await;
            *reason.lock() = Some(current::cancellation_reason());
            done.send();
        }
    });

    sleep_for(Duration::from_millis(5)).await;
    drop(task);

    assert_eq!(done.wait_for(Duration::from_secs(5)).await, WaitStatus::NoTimeout);
    assert_eq!(*reason.lock(), Some(CancellationReason::Abandoned));
}

#[crate::test]
async fn test_detached_task_runs_to_completion() {
    let done = Arc::new(SingleUseEvent::new());

    corral::spawn({
        let done = Arc::clone(&done);
        async move {
            sleep_for(Duration::from_millis(5)).await;
            done.send();
        }
    })
    .detach();

    assert_eq!(done.wait_for(Duration::from_secs(5)).await, WaitStatus::NoTimeout);
}

#[crate::test]
async fn test_wait_for_and_sync_cancel() {
    let task = corral::spawn(async { interruptible_sleep_for(Duration::from_secs(30)).await });

    assert_eq!(task.wait_for(Duration::from_millis(10)).await, WaitStatus::Timeout);
    assert!(!task.is_finished());

    task.sync_cancel().await;
    assert!(task.is_finished());
    assert_eq!(task.state(), TaskState::Completed);
}

#[crate::test]
async fn test_waiter_cancellation_interrupts_get() -> anyhow::Result<()> {
    let waiter = corral::spawn(async {
        let inner = corral::spawn(interruptible_sleep_for(Duration::from_secs(30)));
        inner.get().await.map_err(|e| e.is_interrupted())
    });

    sleep_for(Duration::from_millis(5)).await;
    waiter.request_cancel();
    assert_eq!(waiter.get().await?, Err(true));
    Ok(())
}

#[crate::test(worker_threads = 2)]
async fn test_task_locals_are_per_task() -> anyhow::Result<()> {
    static VALUE: TaskLocal<usize> = TaskLocal::new(|| 0);

    let tasks: Vec<_> = (1..=8)
        .map(|i| {
            corral::spawn(async move {
                assert_eq!(VALUE.get(), 0);
                VALUE.set(i);
                corral::time::yield_now().await;
                VALUE.get()
            })
        })
        .collect();

    for (i, task) in (1..=8).zip(tasks) {
        assert_eq!(task.get().await?, i);
    }
    Ok(())
}

#[crate::test]
async fn test_cancellation_token() -> anyhow::Result<()> {
    let (tx, rx) = (Arc::new(SingleUseEvent::new()), Arc::new(SingleUseEvent::new()));
    let token = Arc::new(Mutex::new(None));

    let task = corral::spawn({
        let (tx, rx, token) = (Arc::clone(&tx), Arc::clone(&rx), Arc::clone(&token));
        async move {
            *token.lock() = Some(current::cancellation_token());
            tx.send();
            rx.wait().await
        }
    });

    tx.wait().await?;
    let token = token.lock().take().unwrap();
    assert!(!token.is_cancel_requested());
    token.request_cancel();

    assert!(task.get().await?.is_err());
    assert_eq!(token.reason(), CancellationReason::UserRequest);
    Ok(())
}

#[test]
fn test_get_blocking_from_plain_thread() -> anyhow::Result<()> {
    let processor = init_processor(2, None)?;
    let task = processor.spawn(async {
        sleep_for(Duration::from_millis(5)).await;
        current::id()
    });

    let id = task.id();
    assert_eq!(task.get_blocking()?, id);
    processor.shutdown()
}

#[test]
fn test_ids_are_unique() -> anyhow::Result<()> {
    let processor = init_processor(1, None)?;
    let tasks: Vec<_> = (0..32).map(|_| processor.spawn(async { current::id() })).collect();

    let mut ids = tasks
        .into_iter()
        .map(|t| t.get_blocking())
        .collect::<Result<Vec<_>, _>>()?;
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 32);
    Ok(())
}
