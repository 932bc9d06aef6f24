use bitflags::bitflags;
use std::cell::Cell;

/// Per-thread schedule counter driving the periodic bookkeeping of
/// `Shared::schedule`.
#[derive(Debug)]
pub(crate) struct Ticker {
    tick: Cell<u32>,
}

impl Ticker {
    pub(crate) const fn new() -> Self {
        Self { tick: Cell::new(0) }
    }

    pub(crate) fn tick<T: TickerData>(&self, data: &T) -> TickerEvents {
        let tick = self.tick.get().wrapping_add(1);
        self.tick.set(tick);
        data.check(tick)
    }
}

/// Decouples the tick policy from the tick itself.
pub(crate) trait TickerData {
    fn check(&self, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// Refresh the cached run queue length.
        const SAMPLE_QUEUE_SIZE = 1;

        /// Record when the task got queued, to measure its time in queue.
        const STAMP_WAIT_TIME = 1 << 1;
    }
}

/// Interval between wait time stamps.
pub(crate) const STAMP_WAIT_TIME_INTERVAL: u32 = 4;

/// Schedule policy of one processor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SchedulePolicy {
    pub(crate) sample_queue_size_interval: u32,
}

impl TickerData for SchedulePolicy {
    fn check(&self, tick: u32) -> TickerEvents {
        let mut events = TickerEvents::empty();

        if tick.is_multiple_of(self.sample_queue_size_interval) {
            events.insert(TickerEvents::SAMPLE_QUEUE_SIZE);
        }
        if tick.is_multiple_of(STAMP_WAIT_TIME_INTERVAL) {
            events.insert(TickerEvents::STAMP_WAIT_TIME);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_policy_events() {
        let ticker = Ticker::new();
        let policy = SchedulePolicy {
            sample_queue_size_interval: 3,
        };

        let events = (0..12).map(|_| ticker.tick(&policy)).collect::<Vec<_>>();

        let sampled = events
            .iter()
            .filter(|e| e.contains(TickerEvents::SAMPLE_QUEUE_SIZE))
            .count();
        let stamped = events
            .iter()
            .filter(|e| e.contains(TickerEvents::STAMP_WAIT_TIME))
            .count();

        assert_eq!(sampled, 4);
        assert_eq!(stamped, 3);
        assert!(events[11].contains(TickerEvents::SAMPLE_QUEUE_SIZE | TickerEvents::STAMP_WAIT_TIME));
    }
}
