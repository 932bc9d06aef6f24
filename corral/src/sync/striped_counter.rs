use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;

/// Counter sharded across cache lines, one shard per CPU.
///
/// Writers touch only the shard of the CPU they run on, so concurrent updates
/// do not bounce a cache line between cores. Reads sum every shard and may
/// observe a transient state in which a `subtract` landed before the matching
/// `add`.
pub struct StripedCounter {
    shards: Box<[CachePadded<AtomicI64>]>,
}

impl StripedCounter {
    pub fn new() -> Self {
        let n = thread::available_parallelism().map_or(1, |n| n.get());
        Self::with_shards(n)
    }

    pub(crate) fn with_shards(n: usize) -> Self {
        let shards = (0..n.max(1))
            .map(|_| CachePadded::new(AtomicI64::new(0)))
            .collect();
        Self { shards }
    }

    fn shard(&self) -> &AtomicI64 {
        let idx = current_cpu().unwrap_or_else(|| fastrand::usize(..self.shards.len()));
        &self.shards[idx % self.shards.len()]
    }

    pub fn add(&self, delta: u64) {
        self.shard().fetch_add(delta as i64, Ordering::Relaxed);
    }

    pub fn subtract(&self, delta: u64) {
        self.shard().fetch_sub(delta as i64, Ordering::Relaxed);
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn decrement(&self) {
        self.subtract(1);
    }

    /// Racy sum of all shards.
    pub fn read(&self) -> i64 {
        self.shards
            .iter()
            .map(|shard| shard.load(Ordering::Relaxed))
            .fold(0_i64, i64::wrapping_add)
    }

    /// Like [`StripedCounter::read`], clamping transient negative sums to 0.
    pub fn read_non_negative(&self) -> u64 {
        self.read().max(0) as u64
    }
}

impl Default for StripedCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StripedCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedCounter")
            .field("value", &self.read())
            .field("shards", &self.shards.len())
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn current_cpu() -> Option<usize> {
    // Safety: no preconditions, returns -1 on failure.
    let cpu = unsafe { libc::sched_getcpu() };
    usize::try_from(cpu).ok()
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> Option<usize> {
    None
}
