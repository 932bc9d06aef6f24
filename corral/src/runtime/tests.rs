use crate as corral;
use crate::deadline::Deadline;
use crate::runtime::{Builder, OverloadAction, ProcessorSettings, TaskProcessor};
use crate::task::{CancellationReason, current};
use crate::test_utils::{ManualReactor, init_processor};
use crate::time::{interruptible_sleep_for, interruptible_sleep_until, sleep_for};
use crate::wait::WaitStatus;
use anyhow::Result;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(TaskProcessor: Send, Sync);

fn wait_all_destroyed(processor: &TaskProcessor) {
    let started = Instant::now();
    while processor.stats().alive != 0 {
        assert!(started.elapsed() < Duration::from_secs(10), "tasks leaked");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Occupies the only worker of `processor` until the returned flag is set.
fn block_worker(processor: &TaskProcessor) -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    processor
        .spawn_critical({
            let (running, release) = (Arc::clone(&running), Arc::clone(&release));
            async move {
                running.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        })
        .detach();

    while !running.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    release
}

#[rstest]
#[case::single_worker(1)]
#[case::many_workers(4)]
fn test_many_tasks_are_all_destroyed(#[case] worker_threads: usize) -> Result<()> {
    const TASKS: u64 = 10_000;
    let processor = init_processor(worker_threads, None)?;

    let tasks: Vec<_> = (0..TASKS)
        .map(|i| {
            processor.spawn(async move {
                corral::time::yield_now().await;
                i
            })
        })
        .collect();

    let mut sum = 0;
    for task in tasks {
        sum += task.get_blocking()?;
    }
    assert_eq!(sum, TASKS * (TASKS - 1) / 2);

    wait_all_destroyed(&processor);
    let stats = processor.stats();
    assert_eq!(stats.created, TASKS);
    assert_eq!(stats.destroyed, TASKS);
    assert_eq!(stats.cancelled, 0);
    assert_eq!(stats.coro_pool.active, 0);
    processor.shutdown()
}

#[test]
fn test_queue_length_limit_cancels_normal_tasks() -> Result<()> {
    let settings = ProcessorSettings::default().wait_queue_length_limit(1);
    let processor = init_processor(1, Some(Builder::new().settings(settings)))?;
    let release = block_worker(&processor);

    let normal: Vec<_> = (0..8).map(|_| processor.spawn(async { 1 })).collect();
    let critical = processor.spawn_critical(async { current::is_cancel_requested() });
    release.store(true, Ordering::SeqCst);

    assert!(!critical.get_blocking()?);

    let mut cancelled = 0;
    for task in normal {
        match task.get_blocking() {
            Ok(v) => assert_eq!(v, 1),
            Err(err) => {
                assert_eq!(err.cancellation_reason(), Some(CancellationReason::Overload));
                cancelled += 1;
            }
        }
    }
    assert!(cancelled > 0);

    wait_all_destroyed(&processor);
    let stats = processor.stats();
    assert!(stats.overloaded >= cancelled);
    assert_eq!(stats.cancelled_overload, cancelled);
    processor.shutdown()
}

#[test]
fn test_overload_ignore_only_counts() -> Result<()> {
    let settings = ProcessorSettings::default()
        .wait_queue_length_limit(1)
        .overload_action(OverloadAction::Ignore);
    let processor = init_processor(1, Some(Builder::new().settings(settings)))?;
    let release = block_worker(&processor);

    let tasks: Vec<_> = (0..8).map(|i| processor.spawn(async move { i })).collect();
    release.store(true, Ordering::SeqCst);

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.get_blocking()?, i);
    }

    let stats = processor.stats();
    assert!(stats.overloaded > 0);
    assert_eq!(stats.cancelled_overload, 0);
    processor.shutdown()
}

#[test]
fn test_wait_queue_time_limit_cancels_stale_tasks() -> Result<()> {
    let settings = ProcessorSettings::default()
        .wait_queue_time_limit(Duration::from_millis(5))
        .sensor_wait_queue_time_limit(Duration::from_millis(1));
    let processor = init_processor(1, Some(Builder::new().settings(settings)))?;
    let release = block_worker(&processor);

    let tasks: Vec<_> = (0..16).map(|_| processor.spawn(async {})).collect();
    thread::sleep(Duration::from_millis(20));
    release.store(true, Ordering::SeqCst);

    let cancelled = tasks
        .into_iter()
        .filter_map(|task| task.get_blocking().err())
        .inspect(|err| assert_eq!(err.cancellation_reason(), Some(CancellationReason::Overload)))
        .count();
    assert!(cancelled > 0);

    let stats = processor.stats();
    assert!(stats.overload_sensor > 0);
    processor.shutdown()
}

#[test]
fn test_settings_can_be_changed_at_runtime() -> Result<()> {
    let processor = init_processor(1, None)?;
    assert_eq!(processor.settings(), ProcessorSettings::default());

    let settings = ProcessorSettings::default()
        .wait_queue_length_limit(100)
        .wait_queue_time_limit(Duration::from_millis(3))
        .overload_action(OverloadAction::Ignore)
        .profiler_execution_slice_threshold(Duration::from_micros(500));
    processor.set_settings(settings);
    assert_eq!(processor.settings(), settings);
    processor.shutdown()
}

#[test]
fn test_every_step_is_profiled() -> Result<()> {
    let processor = init_processor(
        1,
        Some(Builder::new().profiler_execution_slice_threshold(Duration::from_millis(1))),
    )?;

    let task = processor.spawn(async {
        // A slow step, logged by the profiler.
        thread::sleep(Duration::from_millis(3));
        sleep_for(Duration::from_millis(1)).await;
    });
    task.get_blocking()?;

    assert!(processor.stats().context_switches >= 2);
    processor.shutdown()
}

#[test]
fn test_shutdown_waits_for_every_task() -> Result<()> {
    let processor = init_processor(2, None)?;
    let reason = Arc::new(Mutex::new(None));
    let stubborn_done = Arc::new(AtomicBool::new(false));

    processor
        .spawn({
            let reason = Arc::clone(&reason);
            async move {
                let status = interruptible_sleep_for(Duration::from_secs(30)).await;
                *reason.lock() = Some((status, current::cancellation_reason()));
            }
        })
        .detach();

    processor
        .spawn({
            let done = Arc::clone(&stubborn_done);
            async move {
                sleep_for(Duration::from_millis(50)).await;
                done.store(true, Ordering::SeqCst);
            }
        })
        .detach();

    thread::sleep(Duration::from_millis(5));
    processor.shutdown()?;

    assert!(stubborn_done.load(Ordering::SeqCst));
    assert_eq!(
        *reason.lock(),
        Some((WaitStatus::Cancelled, CancellationReason::Shutdown))
    );
    Ok(())
}

#[test]
fn test_block_on_accepts_non_send_futures() -> Result<()> {
    let processor = init_processor(1, None)?;

    let local = Rc::new(41);
    let value = processor.block_on(async {
        let remote = corral::spawn(async { 1 });
        sleep_for(Duration::from_millis(1)).await;
        *local + remote.get().await.unwrap_or_default()
    });

    assert_eq!(value, 42);
    processor.shutdown()
}

#[test]
fn test_cancelled_root_task_keeps_running() -> Result<()> {
    let processor = init_processor(2, None)?;

    let (status, reason) = processor.block_on(async {
        let token = current::cancellation_token();
        corral::spawn(async move { token.request_cancel() })
            .get()
            .await
            .ok();

        current::cancellation_point().await;
        assert!(current::is_cancel_requested());
        let status = interruptible_sleep_for(Duration::from_secs(30)).await;
        (status, current::cancellation_reason())
    });

    assert_eq!(status, WaitStatus::Cancelled);
    assert_eq!(reason, CancellationReason::UserRequest);
    processor.shutdown()
}

#[test]
fn test_block_on_from_a_task_panics() -> Result<()> {
    let processor = Arc::new(init_processor(1, None)?);
    let task = processor.spawn({
        let processor = Arc::clone(&processor);
        async move {
            let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                processor.block_on(async {});
            }));
            res.is_err()
        }
    });

    assert!(task.get_blocking()?);
    wait_all_destroyed(&processor);
    Ok(())
}

#[test]
fn test_processors_are_independent() -> Result<()> {
    let first = init_processor(1, Some(Builder::new().name("first")))?;
    let second = init_processor(1, Some(Builder::new().name("second")))?;
    assert_eq!(first.name(), "first");
    assert_eq!(second.worker_threads(), 1);

    let task = first.spawn(async { thread::current().name().map(str::to_owned) });
    let name = task.get_blocking()?.unwrap_or_default();
    assert!(name.starts_with("first"), "{name}");

    let hop = second.spawn(async { thread::current().name().map(str::to_owned) });
    let name = hop.get_blocking()?.unwrap_or_default();
    assert!(name.starts_with("second"), "{name}");

    first.shutdown()?;
    second.shutdown()
}

#[test]
fn test_custom_reactor_receives_timers() -> Result<()> {
    let reactor = Arc::new(ManualReactor::default());
    let processor = init_processor(1, Some(Builder::new().reactor(reactor.clone())))?;

    let task = processor.spawn(interruptible_sleep_until(Deadline::from_duration(
        Duration::from_secs(30),
    )));

    let started = Instant::now();
    while reactor.armed() == 0 {
        assert!(started.elapsed() < Duration::from_secs(5));
        thread::sleep(Duration::from_millis(1));
    }

    // An early firing only makes the task re-check its deadline.
    assert_eq!(reactor.fire_all(), 1);
    while reactor.armed() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!task.is_finished());

    task.request_cancel();
    assert_eq!(task.get_blocking()?, WaitStatus::Cancelled);
    assert_eq!(reactor.armed(), 0);
    processor.shutdown()
}

#[test]
#[should_panic(expected = "must be called from within a corral task")]
fn test_spawn_outside_of_a_task_panics() {
    let _task = corral::spawn(async {});
}
