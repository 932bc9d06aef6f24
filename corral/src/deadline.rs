use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, Instant};

/// An absolute point in time after which a wait is considered timed out.
///
/// Blocking calls take a `Deadline` instead of a relative timeout so that a
/// chain of nested waits shares one effective limit. The default value is an
/// *unreachable* deadline, which never passes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never passes.
    pub const fn unreachable() -> Self {
        Deadline(None)
    }

    /// Deadline `duration` from now. Saturates to an unreachable deadline if
    /// the addition overflows `Instant`.
    pub fn from_duration(duration: Duration) -> Self {
        Deadline(Instant::now().checked_add(duration))
    }

    pub fn from_instant(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    /// A deadline that has already passed.
    pub fn passed() -> Self {
        Deadline(Some(Instant::now()))
    }

    pub fn is_reachable(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_reached(&self) -> bool {
        self.0.is_some_and(|at| at <= Instant::now())
    }

    /// Time left until the deadline, `None` for an unreachable deadline.
    pub fn time_left(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        if self <= other { self } else { other }
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Deadline::from_instant(instant)
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Deadline::from_duration(duration)
    }
}

// Unreachable sorts after every reachable deadline.
impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0, other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.time_left() {
            None => f.write_str("Deadline(unreachable)"),
            Some(left) => write!(f, "Deadline(in {:?})", left),
        }
    }
}
