use crate::coro::CoroPool;
use crate::runtime::builder::ProcessorConfig;
use crate::runtime::counter::TaskCounter;
use crate::runtime::queue::RunQueue;
use crate::runtime::settings::{AtomicSettings, OverloadAction, ProcessorSettings};
use crate::runtime::ticker::{SchedulePolicy, Ticker, TickerEvents};
use crate::task::CancellationReason;
use crate::task::Id;
use crate::task::context::TaskContext;
use crate::timer::Reactor;
use crate::utils::LimitedLog;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

thread_local! {
    static SCHEDULE_TICKER: Ticker = const { Ticker::new() };
}

/// Poll interval while waiting for tasks to finish on shutdown.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State of a processor shared by its workers, its tasks and their handles.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) worker_threads: usize,

    pub(crate) queue: RunQueue,

    /// Every spawned task that did not finish yet.
    registry: DashMap<Id, Arc<TaskContext>>,
    drained: Mutex<()>,
    drained_cv: Condvar,

    pub(crate) counter: TaskCounter,
    pub(crate) coro_pool: CoroPool,
    pub(crate) reactor: Arc<dyn Reactor>,

    settings: AtomicSettings,
    policy: SchedulePolicy,

    /// Run queue length as of the last sample.
    sampled_queue_size: AtomicUsize,

    /// Verdict of the last stamped dequeue, kept for unstamped ones.
    overloaded: AtomicBool,
    overload_log: LimitedLog,

    shutting_down: AtomicBool,
}

impl Shared {
    pub(crate) fn new(cfg: &ProcessorConfig, reactor: Arc<dyn Reactor>) -> Self {
        Self {
            name: cfg.name.clone(),
            worker_threads: cfg.worker_threads,
            queue: RunQueue::new(cfg.worker_threads),
            registry: DashMap::new(),
            drained: Mutex::new(()),
            drained_cv: Condvar::new(),
            counter: TaskCounter::default(),
            coro_pool: CoroPool::new(cfg.coro_pool),
            reactor,
            settings: AtomicSettings::new(cfg.settings),
            policy: SchedulePolicy {
                sample_queue_size_interval: u32::try_from(cfg.worker_threads).unwrap_or(u32::MAX),
            },
            sampled_queue_size: AtomicUsize::new(0),
            overloaded: AtomicBool::new(false),
            overload_log: LimitedLog::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    // --- Task registry ---

    pub(crate) fn register(&self, task: &Arc<TaskContext>) {
        let prev = self.registry.insert(task.id(), Arc::clone(task));
        debug_assert!(prev.is_none(), "task {} registered twice", task.id());
    }

    pub(crate) fn unregister(&self, id: Id) {
        if self.registry.remove(&id).is_some() && self.is_shutting_down() && self.registry.is_empty() {
            let _guard = self.drained.lock();
            self.drained_cv.notify_all();
        }
    }

    // --- Scheduling ---

    pub(crate) fn schedule(&self, task: Arc<TaskContext>) {
        let events = SCHEDULE_TICKER.with(|ticker| ticker.tick(&self.policy));

        if events.contains(TickerEvents::SAMPLE_QUEUE_SIZE) {
            self.sampled_queue_size
                .store(self.queue.len(), Ordering::Relaxed);
        }

        let limit = self.settings.wait_queue_length_limit();
        if limit != 0
            && !task.is_critical()
            && self.sampled_queue_size.load(Ordering::Relaxed) >= limit
        {
            self.handle_overload(&task);
        }

        if self.is_shutting_down() {
            task.request_cancel(CancellationReason::Shutdown);
        }

        task.set_queued_at(
            events
                .contains(TickerEvents::STAMP_WAIT_TIME)
                .then(Instant::now),
        );
        self.queue.push(task);
    }

    /// Measures how long `task` sat in the queue. Returns whether the
    /// processor is overloaded.
    pub(crate) fn check_wait_time(&self, task: &TaskContext) -> bool {
        let max = self.settings.wait_queue_time_limit();
        let sensor = self.settings.sensor_wait_queue_time_limit();

        if max.is_zero() && sensor.is_zero() {
            self.overloaded.store(false, Ordering::Relaxed);
            return false;
        }

        if let Some(queued_at) = task.take_queued_at() {
            let waited = queued_at.elapsed();

            if !max.is_zero() {
                self.overloaded.store(waited >= max, Ordering::Relaxed);
            }
            if !sensor.is_zero() && waited >= sensor {
                self.counter.account_overload_sensor();
            }
        }

        self.overloaded.load(Ordering::Relaxed)
    }

    pub(crate) fn handle_overload(&self, task: &Arc<TaskContext>) {
        self.counter.account_overload();

        if self.settings.overload_action() == OverloadAction::Cancel && !task.is_critical() {
            if let Some(n) = self.overload_log.should_log() {
                warn!(
                    processor = %self.name,
                    task_id = %task.id(),
                    occurrences = n,
                    "processor overloaded, cancelling task"
                );
            }
            task.request_cancel(CancellationReason::Overload);
            self.counter.account_cancelled_overload();
        }
    }

    pub(crate) fn profile_step(&self, id: Id, elapsed: Duration) {
        self.counter.account_context_switch();

        let threshold = self.settings.profiler_threshold();
        if !threshold.is_zero() && elapsed >= threshold {
            warn!(
                processor = %self.name,
                task_id = %id,
                ?elapsed,
                ?threshold,
                "task step exceeded the execution slice threshold"
            );
        }
    }

    // --- Settings ---

    pub(crate) fn settings(&self) -> ProcessorSettings {
        self.settings.load()
    }

    pub(crate) fn set_settings(&self, settings: ProcessorSettings) {
        let prev = self.settings.load().profiler_execution_slice_threshold;
        let next = settings.profiler_execution_slice_threshold;

        if prev.is_zero() && !next.is_zero() {
            warn!(processor = %self.name, threshold = ?next, "task profiling enabled");
        } else if !prev.is_zero() && next.is_zero() {
            warn!(processor = %self.name, "task profiling disabled");
        }

        self.settings.store(settings);
    }

    // --- Shutdown ---

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Cancels every task and blocks until all of them finished.
    pub(crate) fn cancel_all_and_drain(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let tasks = self
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect::<Vec<_>>();
        info!(processor = %self.name, tasks = tasks.len(), "cancelling remaining tasks");

        for task in tasks {
            task.request_cancel(CancellationReason::Shutdown);
        }

        let mut guard = self.drained.lock();
        while !self.registry.is_empty() {
            self.drained_cv.wait_for(&mut guard, DRAIN_POLL_INTERVAL);
        }
    }
}
