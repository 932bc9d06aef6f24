use crate::coro::CoroPoolStats;
use crate::sync::StripedCounter;

/// Per-processor task accounting. Every counter only grows.
#[derive(Debug, Default)]
pub(crate) struct TaskCounter {
    created: StripedCounter,
    destroyed: StripedCounter,
    cancelled: StripedCounter,
    overloaded: StripedCounter,
    cancelled_overload: StripedCounter,
    overload_sensor: StripedCounter,
    context_switches: StripedCounter,
}

impl TaskCounter {
    pub(crate) fn account_created(&self) {
        self.created.increment();
    }

    pub(crate) fn account_destroyed(&self) {
        self.destroyed.increment();
    }

    pub(crate) fn account_cancelled(&self) {
        self.cancelled.increment();
    }

    pub(crate) fn account_overload(&self) {
        self.overloaded.increment();
    }

    pub(crate) fn account_cancelled_overload(&self) {
        self.cancelled_overload.increment();
    }

    pub(crate) fn account_overload_sensor(&self) {
        self.overload_sensor.increment();
    }

    pub(crate) fn account_context_switch(&self) {
        self.context_switches.increment();
    }

    pub(crate) fn snapshot(&self, queue_size: usize, coro_pool: CoroPoolStats) -> ProcessorStats {
        let created = self.created.read_non_negative();
        let destroyed = self.destroyed.read_non_negative();

        ProcessorStats {
            created,
            destroyed,
            alive: created.saturating_sub(destroyed),
            cancelled: self.cancelled.read_non_negative(),
            overloaded: self.overloaded.read_non_negative(),
            cancelled_overload: self.cancelled_overload.read_non_negative(),
            overload_sensor: self.overload_sensor.read_non_negative(),
            context_switches: self.context_switches.read_non_negative(),
            queue_size,
            coro_pool,
        }
    }
}

/// Approximate snapshot of the counters of a [`TaskProcessor`].
///
/// [`TaskProcessor`]: crate::runtime::TaskProcessor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub created: u64,
    pub destroyed: u64,
    /// Task contexts still referenced by someone.
    pub alive: u64,
    pub cancelled: u64,
    /// Tasks that went through overload handling.
    pub overloaded: u64,
    /// Tasks cancelled with reason `Overload`.
    pub cancelled_overload: u64,
    /// Dequeues that waited longer than the sensor limit.
    pub overload_sensor: u64,
    /// Task steps executed.
    pub context_switches: u64,
    pub queue_size: usize,
    pub coro_pool: CoroPoolStats,
}
