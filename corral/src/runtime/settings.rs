use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// What to do with a task once the processor is detected as overloaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OverloadAction {
    /// Cancel non-critical tasks with reason `Overload`.
    #[default]
    Cancel = 0,
    /// Run them anyway. Overload is only counted.
    Ignore = 1,
}

/// Overload control and profiling knobs. They can be changed while the
/// processor runs through [`TaskProcessor::set_settings`].
///
/// A zero limit disables the check it controls.
///
/// [`TaskProcessor::set_settings`]: crate::runtime::TaskProcessor::set_settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorSettings {
    /// Queue length at which newly scheduled non-critical tasks are overload
    /// handled.
    pub wait_queue_length_limit: usize,

    /// Time in queue after which the processor counts as overloaded.
    pub wait_queue_time_limit: Duration,

    /// Time in queue that is counted, without any other effect.
    pub sensor_wait_queue_time_limit: Duration,

    pub overload_action: OverloadAction,

    /// Task steps longer than this are logged.
    pub profiler_execution_slice_threshold: Duration,
}

impl ProcessorSettings {
    pub fn wait_queue_length_limit(mut self, val: usize) -> Self {
        self.wait_queue_length_limit = val;
        self
    }

    pub fn wait_queue_time_limit(mut self, val: Duration) -> Self {
        self.wait_queue_time_limit = val;
        self
    }

    pub fn sensor_wait_queue_time_limit(mut self, val: Duration) -> Self {
        self.sensor_wait_queue_time_limit = val;
        self
    }

    pub fn overload_action(mut self, val: OverloadAction) -> Self {
        self.overload_action = val;
        self
    }

    pub fn profiler_execution_slice_threshold(mut self, val: Duration) -> Self {
        self.profiler_execution_slice_threshold = val;
        self
    }
}

/// Lock-free copy of [`ProcessorSettings`] read on every schedule and dequeue.
#[derive(Debug, Default)]
pub(crate) struct AtomicSettings {
    wait_queue_length_limit: AtomicUsize,
    wait_queue_time_limit_us: AtomicU64,
    sensor_wait_queue_time_limit_us: AtomicU64,
    overload_action: AtomicU8,
    profiler_threshold_us: AtomicU64,
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

impl AtomicSettings {
    pub(crate) fn new(settings: ProcessorSettings) -> Self {
        let this = Self::default();
        this.store(settings);
        this
    }

    pub(crate) fn store(&self, s: ProcessorSettings) {
        self.wait_queue_length_limit
            .store(s.wait_queue_length_limit, Ordering::Relaxed);
        self.wait_queue_time_limit_us
            .store(micros(s.wait_queue_time_limit), Ordering::Relaxed);
        self.sensor_wait_queue_time_limit_us
            .store(micros(s.sensor_wait_queue_time_limit), Ordering::Relaxed);
        self.overload_action
            .store(s.overload_action as u8, Ordering::Relaxed);
        self.profiler_threshold_us
            .store(micros(s.profiler_execution_slice_threshold), Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> ProcessorSettings {
        ProcessorSettings {
            wait_queue_length_limit: self.wait_queue_length_limit(),
            wait_queue_time_limit: self.wait_queue_time_limit(),
            sensor_wait_queue_time_limit: self.sensor_wait_queue_time_limit(),
            overload_action: self.overload_action(),
            profiler_execution_slice_threshold: self.profiler_threshold(),
        }
    }

    pub(crate) fn wait_queue_length_limit(&self) -> usize {
        self.wait_queue_length_limit.load(Ordering::Relaxed)
    }

    pub(crate) fn wait_queue_time_limit(&self) -> Duration {
        Duration::from_micros(self.wait_queue_time_limit_us.load(Ordering::Relaxed))
    }

    pub(crate) fn sensor_wait_queue_time_limit(&self) -> Duration {
        Duration::from_micros(self.sensor_wait_queue_time_limit_us.load(Ordering::Relaxed))
    }

    pub(crate) fn overload_action(&self) -> OverloadAction {
        match self.overload_action.load(Ordering::Relaxed) {
            1 => OverloadAction::Ignore,
            _ => OverloadAction::Cancel,
        }
    }

    pub(crate) fn profiler_threshold(&self) -> Duration {
        Duration::from_micros(self.profiler_threshold_us.load(Ordering::Relaxed))
    }
}
