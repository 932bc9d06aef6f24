use crate::runtime::builder::ThreadNameFn;
use crate::runtime::queue::ParkToken;
use crate::runtime::shared::Shared;
use anyhow::{Result, anyhow};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};

/// OS threads stepping the tasks of one processor.
#[derive(Debug)]
pub(crate) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub(crate) fn spawn(
        shared: &Arc<Shared>,
        thread_name: &ThreadNameFn,
        stack_size: Option<usize>,
    ) -> Result<Self> {
        let num_workers = shared.worker_threads;
        let started = Arc::new(StartupLatch::default());

        let mut handles = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let mut builder = thread::Builder::new().name(thread_name.0());
            if let Some(stack_size) = stack_size {
                builder = builder.stack_size(stack_size);
            }

            let spawned = builder.spawn({
                let shared = Arc::clone(shared);
                let started = Arc::clone(&started);
                move || {
                    started.arrive();
                    worker_loop(&shared);
                }
            });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Release the workers that did start.
                    shared.queue.stop();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(anyhow!("failed to spawn worker thread: {e}"));
                }
            }
        }

        // Spawning threads is async, wait for all threads to be started...
        started.wait(num_workers);

        Ok(Self {
            handles: Mutex::new(handles),
        })
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let errors = handles
            .drain(..)
            .filter_map(|handle| handle.join().err())
            .count();

        if errors == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked", errors))
        }
    }
}

/// Counts started workers.
#[derive(Debug, Default)]
struct StartupLatch {
    started: Mutex<usize>,
    cv: Condvar,
}

impl StartupLatch {
    fn arrive(&self) {
        *self.started.lock() += 1;
        self.cv.notify_one();
    }

    fn wait(&self, n: usize) {
        let mut started = self.started.lock();
        while *started < n {
            self.cv.wait(&mut started);
        }
    }
}

fn worker_loop(shared: &Arc<Shared>) {
    let token = Arc::new(ParkToken::default());
    debug!(processor = %shared.name, "worker started");

    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        while let Some(task) = shared
            .queue
            .pop_blocking(&token, || shared.coro_pool.maybe_trim())
        {
            if shared.check_wait_time(&task) {
                shared.handle_overload(&task);
            }
            task.do_step();
        }
    }));

    if let Err(panic) = res {
        error!(
            processor = %shared.name,
            thread = ?thread::current().name(),
            "worker thread panicked"
        );
        panic::resume_unwind(panic);
    }

    debug!(processor = %shared.name, "worker stopped");
}
