use crate::runtime::{Builder, TaskProcessor};
use crate::timer::{Reactor, TimerCallback, TimerKey};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Once;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Routes engine logs to the test harness. Filtered by `RUST_LOG`, warnings
/// only by default.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .try_init();
    });
}

pub(crate) fn init_processor(worker_threads: usize, builder: Option<Builder>) -> Result<TaskProcessor> {
    init_tracing();
    builder
        .unwrap_or_default()
        .worker_threads(worker_threads)
        .try_build()
}

/// Reactor whose timers only fire when the test says so.
#[derive(Default)]
pub(crate) struct ManualReactor {
    timers: Mutex<(BTreeMap<TimerKey, TimerCallback>, u64)>,
}

impl ManualReactor {
    pub(crate) fn armed(&self) -> usize {
        self.timers.lock().0.len()
    }

    /// Fires every timer, due or not, in deadline order. Returns how many ran.
    pub(crate) fn fire_all(&self) -> usize {
        let fired = std::mem::take(&mut self.timers.lock().0);
        let count = fired.len();
        for (_, cb) in fired {
            cb();
        }
        count
    }
}

impl fmt::Debug for ManualReactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualReactor")
            .field("armed", &self.armed())
            .finish()
    }
}

impl Reactor for ManualReactor {
    fn arm_timer(&self, at: Instant, cb: TimerCallback) -> TimerKey {
        let mut timers = self.timers.lock();
        timers.1 += 1;
        let key = TimerKey::new(at, timers.1);
        timers.0.insert(key, cb);
        key
    }

    fn cancel_timer(&self, key: TimerKey) {
        let cb = self.timers.lock().0.remove(&key);
        drop(cb);
    }
}
