use crate::coro::CoroPoolConfig;
use crate::runtime::{ProcessorSettings, TaskProcessor};
use crate::timer::Reactor;
use anyhow::{Result, anyhow};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Coroutine slots created with the processor.
const CORO_POOL_INITIAL_SIZE: usize = 64;

/// Idle coroutine slots kept at most.
const CORO_POOL_MAX_SIZE: usize = 4096;

const CORO_POOL_TRIM_INTERVAL: Duration = Duration::from_secs(10);

/// Default processor name, used in logs and worker thread names.
const PROCESSOR_NAME: &str = "corral";

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn(prefix: &str) -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));
    let prefix = prefix.to_owned();

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{id}")
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Builds a [`TaskProcessor`].
///
/// ```no_run
/// use corral::runtime::{Builder, OverloadAction, ProcessorSettings};
/// use std::time::Duration;
///
/// # fn doc() -> anyhow::Result<()> {
/// let processor = Builder::new()
///     .name("main")
///     .worker_threads(4)
///     .settings(
///         ProcessorSettings::default()
///             .wait_queue_time_limit(Duration::from_millis(50))
///             .overload_action(OverloadAction::Cancel),
///     )
///     .try_build()?;
///
/// let answer = processor.block_on(async { corral::spawn(async { 42 }).get().await });
/// assert_eq!(answer?, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Builder {
    name: String,

    /// Defaults to 1 worker per CPU core.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the processor. Derived from `name`
    /// unless set explicitly.
    thread_name: Option<ThreadNameFn>,

    thread_stack_size: Option<usize>,

    coro_pool_initial_size: usize,
    coro_pool_max_size: usize,
    coro_pool_trim_interval: Duration,

    settings: ProcessorSettings,

    /// Delivers deadline wakeups. A dedicated timer thread when unset.
    reactor: Option<Arc<dyn Reactor>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            name: PROCESSOR_NAME.to_owned(),
            worker_threads: None,
            thread_name: None,
            thread_stack_size: None,
            coro_pool_initial_size: CORO_POOL_INITIAL_SIZE,
            coro_pool_max_size: CORO_POOL_MAX_SIZE,
            coro_pool_trim_interval: CORO_POOL_TRIM_INTERVAL,
            settings: ProcessorSettings::default(),
            reactor: None,
        }
    }

    /// Processor name, shows up in logs. Worker threads are named
    /// "{name}-{N}" unless [`Builder::thread_name`] is used.
    #[track_caller]
    pub fn name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        assert!(!val.is_empty(), "name must not be empty");
        self.name = val;
        self
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name of every worker thread.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = Some(ThreadNameFn(Arc::new(move || val.clone())));
        self
    }

    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = Some(ThreadNameFn(Arc::new(f)));
        self
    }

    /// Stack size (in bytes) of worker threads. Task bodies live on the heap,
    /// so this only bounds the depth of a single step.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    pub fn coro_pool_initial_size(mut self, val: usize) -> Self {
        self.coro_pool_initial_size = val;
        self
    }

    #[track_caller]
    pub fn coro_pool_max_size(mut self, val: usize) -> Self {
        assert!(val > 0, "coro_pool_max_size must be greater than 0");
        self.coro_pool_max_size = val;
        self
    }

    pub fn coro_pool_trim_interval(mut self, val: Duration) -> Self {
        self.coro_pool_trim_interval = val;
        self
    }

    pub fn settings(mut self, val: ProcessorSettings) -> Self {
        self.settings = val;
        self
    }

    /// Shortcut for the profiler knob of [`Builder::settings`].
    pub fn profiler_execution_slice_threshold(mut self, val: Duration) -> Self {
        self.settings.profiler_execution_slice_threshold = val;
        self
    }

    /// Uses an external reactor for deadline wakeups.
    pub fn reactor(mut self, reactor: Arc<dyn Reactor>) -> Self {
        self.reactor = Some(reactor);
        self
    }

    /// Creates the processor. Its workers are running once this returns.
    pub fn try_build(self) -> Result<TaskProcessor> {
        let cfg = ProcessorConfig::try_from(self)?;
        TaskProcessor::new(cfg)
    }
}

/// Validated form of a [`Builder`].
#[derive(Debug, Clone)]
pub(crate) struct ProcessorConfig {
    pub(crate) name: String,
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) coro_pool: CoroPoolConfig,
    pub(crate) settings: ProcessorSettings,
    pub(crate) reactor: Option<Arc<dyn Reactor>>,
}

impl ProcessorConfig {
    fn validate(&self) -> Result<()> {
        if self.coro_pool.initial_size > self.coro_pool.max_size {
            return Err(anyhow!(
                "coro_pool_initial_size ({}) exceeds coro_pool_max_size ({})",
                self.coro_pool.initial_size,
                self.coro_pool.max_size
            ));
        }

        let s = &self.settings;
        if !s.sensor_wait_queue_time_limit.is_zero()
            && !s.wait_queue_time_limit.is_zero()
            && s.sensor_wait_queue_time_limit > s.wait_queue_time_limit
        {
            return Err(anyhow!(
                "sensor_wait_queue_time_limit ({:?}) exceeds wait_queue_time_limit ({:?})",
                s.sensor_wait_queue_time_limit,
                s.wait_queue_time_limit
            ));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for ProcessorConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let thread_name = builder
            .thread_name
            .unwrap_or_else(|| default_thread_name_fn(&builder.name));

        let cfg = ProcessorConfig {
            name: builder.name,
            worker_threads,
            thread_name,
            thread_stack_size: builder.thread_stack_size,
            coro_pool: CoroPoolConfig {
                initial_size: builder.coro_pool_initial_size,
                max_size: builder.coro_pool_max_size,
                trim_interval: builder.coro_pool_trim_interval,
            },
            settings: builder.settings,
            reactor: builder.reactor,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ProcessorConfig: Send, Sync, Clone);

    #[test]
    fn test_default_thread_names() -> Result<()> {
        let cfg = ProcessorConfig::try_from(Builder::new().name("db").worker_threads(2))?;
        assert_eq!(cfg.worker_threads, 2);
        assert_eq!(cfg.thread_name.0(), "db-0");
        assert_eq!(cfg.thread_name.0(), "db-1");
        Ok(())
    }

    #[rstest]
    #[case::pool_initial_above_max(Builder::new().coro_pool_initial_size(10).coro_pool_max_size(5))]
    #[case::sensor_above_limit(Builder::new().settings(
        ProcessorSettings::default()
            .wait_queue_time_limit(Duration::from_millis(1))
            .sensor_wait_queue_time_limit(Duration::from_millis(2)),
    ))]
    fn test_invalid_config(#[case] builder: Builder) {
        assert!(ProcessorConfig::try_from(builder).is_err());
    }

    #[test]
    #[should_panic(expected = "worker_threads must be greater than 0")]
    fn test_zero_workers_panics() {
        let _ = Builder::new().worker_threads(0);
    }
}
