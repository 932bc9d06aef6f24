use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct SleepFlags: u16 {
        /// Set by the worker once the task has actually yielded.
        const SLEEPING = 1;

        /// The current sleep ignores cancel-request wakeups.
        const NON_CANCELLABLE = 1 << 1;

        const WAKEUP_BY_WAIT_LIST = 1 << 2;
        const WAKEUP_BY_DEADLINE_TIMER = 1 << 3;
        const WAKEUP_BY_BOOTSTRAP = 1 << 4;
        const WAKEUP_BY_CANCEL_REQUEST = 1 << 5;
    }
}

/// What ended a sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeupSource {
    None,
    WaitList,
    DeadlineTimer,
    Bootstrap,
    CancelRequest,
}

impl WakeupSource {
    pub(crate) fn as_flag(self) -> SleepFlags {
        match self {
            WakeupSource::None => SleepFlags::empty(),
            WakeupSource::WaitList => SleepFlags::WAKEUP_BY_WAIT_LIST,
            WakeupSource::DeadlineTimer => SleepFlags::WAKEUP_BY_DEADLINE_TIMER,
            WakeupSource::Bootstrap => SleepFlags::WAKEUP_BY_BOOTSTRAP,
            WakeupSource::CancelRequest => SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
        }
    }

    /// Picks the source reported to the sleeper when several fired in the same
    /// epoch.
    pub(crate) fn primary(flags: SleepFlags) -> WakeupSource {
        const ORDER: [(SleepFlags, WakeupSource); 4] = [
            (SleepFlags::WAKEUP_BY_WAIT_LIST, WakeupSource::WaitList),
            (SleepFlags::WAKEUP_BY_DEADLINE_TIMER, WakeupSource::DeadlineTimer),
            (SleepFlags::WAKEUP_BY_BOOTSTRAP, WakeupSource::Bootstrap),
            (SleepFlags::WAKEUP_BY_CANCEL_REQUEST, WakeupSource::CancelRequest),
        ];

        ORDER
            .iter()
            .find(|(flag, _)| flags.contains(*flag))
            .map_or(WakeupSource::None, |(_, source)| *source)
    }
}

const FLAGS_BITS: u32 = 16;
const EPOCH_MASK: u64 = (1 << (64 - FLAGS_BITS)) - 1;

/// Sleep attempt counter. A wakeup carrying a stale epoch is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Epoch(u64);

impl Epoch {
    pub(crate) const ZERO: Epoch = Epoch(0);

    pub(crate) fn next(self) -> Epoch {
        Epoch((self.0 + 1) & EPOCH_MASK)
    }

    pub(crate) fn as_raw(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Epoch {
        Epoch(raw & EPOCH_MASK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SleepState {
    pub(crate) flags: SleepFlags,
    pub(crate) epoch: Epoch,
}

impl SleepState {
    pub(crate) fn new(flags: SleepFlags, epoch: Epoch) -> Self {
        Self { flags, epoch }
    }

    /// Fresh state for the sleep attempt after `current`.
    pub(crate) fn next_epoch(current: Epoch) -> Self {
        Self::new(SleepFlags::empty(), current.next())
    }

    fn pack(self) -> u64 {
        (self.epoch.0 << FLAGS_BITS) | u64::from(self.flags.bits())
    }

    fn unpack(raw: u64) -> Self {
        Self {
            flags: SleepFlags::from_bits_truncate(raw as u16),
            epoch: Epoch(raw >> FLAGS_BITS),
        }
    }
}

/// Flags and epoch share one word so that a wakeup can check the epoch and set
/// its flag in a single compare-and-swap.
#[derive(Debug)]
pub(crate) struct AtomicSleepState(AtomicU64);

impl AtomicSleepState {
    pub(crate) fn new(state: SleepState) -> Self {
        Self(AtomicU64::new(state.pack()))
    }

    pub(crate) fn load(&self, order: Ordering) -> SleepState {
        SleepState::unpack(self.0.load(order))
    }

    pub(crate) fn exchange(&self, state: SleepState, order: Ordering) -> SleepState {
        SleepState::unpack(self.0.swap(state.pack(), order))
    }

    pub(crate) fn compare_exchange_weak(
        &self,
        current: SleepState,
        new: SleepState,
    ) -> Result<SleepState, SleepState> {
        self.0
            .compare_exchange_weak(
                current.pack(),
                new.pack(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .map(SleepState::unpack)
            .map_err(SleepState::unpack)
    }

    pub(crate) fn fetch_or_flags(&self, flags: SleepFlags) -> SleepState {
        SleepState::unpack(self.0.fetch_or(u64::from(flags.bits()), Ordering::SeqCst))
    }

    pub(crate) fn clear_flags(&self, flags: SleepFlags) -> SleepState {
        SleepState::unpack(self.0.fetch_and(!u64::from(flags.bits()), Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::wait_list_beats_deadline(
        SleepFlags::WAKEUP_BY_DEADLINE_TIMER | SleepFlags::WAKEUP_BY_WAIT_LIST,
        WakeupSource::WaitList
    )]
    #[case::deadline_beats_cancel(
        SleepFlags::WAKEUP_BY_CANCEL_REQUEST | SleepFlags::WAKEUP_BY_DEADLINE_TIMER,
        WakeupSource::DeadlineTimer
    )]
    #[case::bootstrap_beats_cancel(
        SleepFlags::WAKEUP_BY_CANCEL_REQUEST | SleepFlags::WAKEUP_BY_BOOTSTRAP,
        WakeupSource::Bootstrap
    )]
    #[case::cancel_alone(SleepFlags::WAKEUP_BY_CANCEL_REQUEST, WakeupSource::CancelRequest)]
    #[case::sleeping_only(SleepFlags::SLEEPING, WakeupSource::None)]
    fn test_primary_wakeup_source(#[case] flags: SleepFlags, #[case] expected: WakeupSource) {
        assert_eq!(WakeupSource::primary(flags), expected);
    }

    #[test]
    fn test_flag_ops_keep_epoch() {
        let epoch = Epoch::ZERO.next().next();
        let state = AtomicSleepState::new(SleepState::new(SleepFlags::SLEEPING, epoch));

        let prev = state.fetch_or_flags(SleepFlags::WAKEUP_BY_WAIT_LIST);
        assert_eq!(prev.flags, SleepFlags::SLEEPING);

        state.clear_flags(SleepFlags::SLEEPING);
        let now = state.load(Ordering::SeqCst);
        assert_eq!(now.flags, SleepFlags::WAKEUP_BY_WAIT_LIST);
        assert_eq!(now.epoch, epoch);
    }

    #[test]
    fn test_epoch_wraps_within_mask() {
        let last = Epoch(EPOCH_MASK);
        assert_eq!(last.next(), Epoch::ZERO);

        let state = AtomicSleepState::new(SleepState::new(SleepFlags::all(), last));
        let loaded = state.load(Ordering::SeqCst);
        assert_eq!(loaded.epoch, last);
        assert_eq!(loaded.flags, SleepFlags::all());
    }
}
