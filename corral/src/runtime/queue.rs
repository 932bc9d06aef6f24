use crate::task::context::TaskContext;
use crossbeam_deque::{Injector, Steal};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::thread::{self, Thread};

/// Unpark flag of one worker thread.
#[derive(Debug, Default)]
pub(crate) struct ParkToken {
    should_unpark: AtomicBool,
}

/// Run queue shared by every worker of a processor.
#[derive(Debug)]
pub(crate) struct RunQueue {
    injector: Injector<Arc<TaskContext>>,

    /// LIFO collection of parked workers. The latest parked thread is unparked
    /// first as its CPU cache is the hottest.
    parked_threads: RwLock<VecDeque<(Thread, Arc<ParkToken>)>>,
    num_parked: AtomicUsize,

    stopped: AtomicBool,
}

impl RunQueue {
    pub(crate) fn new(worker_threads: usize) -> Self {
        Self {
            injector: Injector::new(),
            parked_threads: RwLock::new(VecDeque::with_capacity(worker_threads)),
            num_parked: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.injector.len()
    }

    pub(crate) fn push(&self, task: Arc<TaskContext>) {
        self.injector.push(task);

        // Pairs with the fence in `park`: either the parker sees the task, or
        // we see the parker.
        fence(Ordering::SeqCst);
        if self.num_parked.load(Ordering::Relaxed) > 0 {
            self.unpark_one();
        }
    }

    pub(crate) fn pop(&self) -> Option<Arc<TaskContext>> {
        loop {
            match self.injector.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    /// Pops the next task, parking the current thread while the queue is
    /// empty. `on_idle` runs before each park. Returns `None` once stopped.
    pub(crate) fn pop_blocking(&self, token: &Arc<ParkToken>, on_idle: impl Fn()) -> Option<Arc<TaskContext>> {
        loop {
            if let Some(task) = self.pop() {
                return Some(task);
            }
            if self.is_stopped() {
                return None;
            }

            on_idle();
            self.park(token);
        }
    }

    fn park(&self, token: &Arc<ParkToken>) {
        {
            let mut parked_threads = self.parked_threads.write();
            self.num_parked.fetch_add(1, Ordering::Relaxed);
            fence(Ordering::SeqCst);

            // Checked *while holding the lock*, `unpark_one` takes it too.
            if !self.injector.is_empty() || self.is_stopped() {
                self.num_parked.fetch_sub(1, Ordering::Relaxed);
                return;
            }

            token.should_unpark.store(false, Ordering::Release);
            parked_threads.push_back((thread::current(), Arc::clone(token)));
        }

        // Loop to account for spurious wakeups.
        while !token.should_unpark.load(Ordering::Acquire) {
            thread::park();
        }
    }

    fn unpark_one(&self) -> bool {
        let Some((thread, token)) = self.parked_threads.write().pop_back() else {
            return false;
        };
        self.num_parked.fetch_sub(1, Ordering::Relaxed);
        token.should_unpark.store(true, Ordering::Release);
        thread.unpark();
        true
    }

    fn unpark_all(&self) -> usize {
        let mut num_unparked = 0;
        let mut parked_threads = self.parked_threads.write();

        while let Some((thread, token)) = parked_threads.pop_back() {
            num_unparked += 1;
            self.num_parked.fetch_sub(1, Ordering::Relaxed);
            token.should_unpark.store(true, Ordering::Release);
            thread.unpark();
        }

        num_unparked
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wakes every parked worker and makes `pop_blocking` return `None` once
    /// the queue is drained.
    pub(crate) fn stop(&self) {
        {
            let _guard = self.parked_threads.write();
            self.stopped.store(true, Ordering::Release);
        }
        self.unpark_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::time::Duration;

    assert_impl_all!(RunQueue: Send, Sync);

    #[test]
    fn test_stop_releases_parked_workers() {
        let queue = Arc::new(RunQueue::new(2));

        let handles = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let token = Arc::new(ParkToken::default());
                    queue.pop_blocking(&token, || {}).is_none()
                })
            })
            .collect::<Vec<_>>();

        // Give the workers a chance to park.
        thread::sleep(Duration::from_millis(20));
        queue.stop();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert!(queue.parked_threads.read().is_empty());
    }
}
