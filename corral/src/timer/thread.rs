use crate::timer::{Reactor, TimerCallback, TimerKey};
use anyhow::{Result, anyhow};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{error, trace};

use crate::runtime::SPILL_TO_HEAP_THRESHOLD;

/// Timers ordered by expiry. The sequence number breaks ties between timers
/// armed for the same instant.
#[derive(Default)]
struct Timers {
    entries: BTreeMap<TimerKey, TimerCallback>,
    next_seq: u64,
    shutdown: bool,
}

struct Inner {
    timers: Mutex<Timers>,
    cv: Condvar,
}

/// Reactor backed by one OS thread sleeping until the earliest deadline.
pub struct TimerThread {
    inner: Arc<Inner>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerThread {
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let inner = Arc::new(Inner {
            timers: Mutex::new(Timers::default()),
            cv: Condvar::new(),
        });

        let handle = thread::Builder::new().name(name.into()).spawn({
            let inner = Arc::clone(&inner);
            move || run(&inner)
        })?;

        Ok(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Number of timers waiting to fire.
    pub fn pending(&self) -> usize {
        self.inner.timers.lock().entries.len()
    }

    fn join(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        if handle.thread().id() == thread::current().id() {
            // Shut down from a timer callback, the thread exits on its own.
            return Ok(());
        }
        handle
            .join()
            .map_err(|_| anyhow!("timer thread panicked"))
    }
}

fn run(inner: &Inner) {
    let mut timers = inner.timers.lock();

    loop {
        if timers.shutdown {
            // Pending callbacks are dropped unrun.
            timers.entries.clear();
            return;
        }

        let now = Instant::now();
        let mut expired = SmallVec::<[TimerCallback; SPILL_TO_HEAP_THRESHOLD]>::new();
        while let Some(entry) = timers.entries.first_entry() {
            if entry.key().at > now {
                break;
            }
            expired.push(entry.remove());
        }

        if !expired.is_empty() {
            trace!(count = expired.len(), "timers expired");
            drop(timers);
            for cb in expired {
                cb();
            }
            timers = inner.timers.lock();
            continue;
        }

        match timers.entries.keys().next().map(|key| key.at) {
            Some(at) => {
                inner.cv.wait_until(&mut timers, at);
            }
            None => inner.cv.wait(&mut timers),
        }
    }
}

impl Reactor for TimerThread {
    fn arm_timer(&self, at: Instant, cb: TimerCallback) -> TimerKey {
        let mut timers = self.inner.timers.lock();
        let key = TimerKey::new(at, timers.next_seq);
        timers.next_seq += 1;

        let earliest = timers.entries.keys().next().is_none_or(|first| key < *first);
        timers.entries.insert(key, cb);
        drop(timers);

        if earliest {
            self.inner.cv.notify_one();
        }
        key
    }

    fn cancel_timer(&self, key: TimerKey) {
        // The callback may own the last reference to a task, drop it unlocked.
        let _cb = self.inner.timers.lock().entries.remove(&key);
    }

    fn shutdown(&self) {
        self.inner.timers.lock().shutdown = true;
        self.inner.cv.notify_one();

        if let Err(e) = self.join() {
            error!("{e}");
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        Reactor::shutdown(self);
    }
}

impl fmt::Debug for TimerThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerThread")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_fires_in_deadline_order() -> Result<()> {
        let timer = TimerThread::spawn("corral-timer-test")?;
        let (tx, rx) = mpsc::channel();
        let now = Instant::now();

        for (i, ms) in [30_u64, 10, 20].into_iter().enumerate() {
            let tx = tx.clone();
            timer.arm_timer(
                now + Duration::from_millis(ms),
                Box::new(move || tx.send(i).unwrap_or(())),
            );
        }

        let fired = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(fired, vec![1, 2, 0]);
        Ok(())
    }

    #[test]
    fn test_cancelled_timer_never_fires() -> Result<()> {
        let timer = TimerThread::spawn("corral-timer-test")?;
        let hits = Arc::new(AtomicUsize::new(0));

        let key = timer.arm_timer(
            Instant::now() + Duration::from_millis(20),
            Box::new({
                let hits = Arc::clone(&hits);
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        timer.cancel_timer(key);
        assert_eq!(timer.pending(), 0);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_shutdown_drops_pending_timers() -> Result<()> {
        let timer = TimerThread::spawn("corral-timer-test")?;
        timer.arm_timer(Instant::now() + Duration::from_secs(3600), Box::new(|| {}));
        assert_eq!(timer.pending(), 1);

        Reactor::shutdown(&timer);
        assert_eq!(timer.pending(), 0);
        Ok(())
    }
}
