use std::sync::atomic::{AtomicU64, Ordering};

/// Rate limiter for log lines emitted on hot paths.
///
/// Lets through the 1st, 2nd, 4th, 8th, ... occurrence. The occurrence number
/// is returned so that the line can mention how many were skipped.
#[derive(Debug, Default)]
pub(crate) struct LimitedLog {
    occurrences: AtomicU64,
}

impl LimitedLog {
    pub(crate) const fn new() -> Self {
        Self {
            occurrences: AtomicU64::new(0),
        }
    }

    pub(crate) fn should_log(&self) -> Option<u64> {
        let n = self.occurrences.fetch_add(1, Ordering::Relaxed) + 1;
        n.is_power_of_two().then_some(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let log = LimitedLog::new();
        let logged = (0..20).filter_map(|_| log.should_log()).collect::<Vec<_>>();
        assert_eq!(logged, vec![1, 2, 4, 8, 16]);
    }
}
