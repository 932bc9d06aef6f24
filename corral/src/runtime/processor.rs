use crate::deadline::Deadline;
use crate::runtime::builder::ProcessorConfig;
use crate::runtime::counter::ProcessorStats;
use crate::runtime::settings::ProcessorSettings;
use crate::runtime::shared::Shared;
use crate::runtime::spawn::{SpawnBuilder, spawn_inner};
use crate::runtime::worker::ThreadPool;
use crate::task::context::{Driver, RootParker, TaskContext};
use crate::task::current::{self, CurrentTaskScope};
use crate::task::{Importance, TaskWithResult};
use crate::timer::{Reactor, TimerThread};
use crate::utils::ScopeGuard;
use anyhow::Result;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Poll;
use tracing::{error, info};

/// Scheduler instance: a pool of worker threads stepping tasks off one run
/// queue.
///
/// Several processors may coexist, for instance to isolate blocking work on a
/// small dedicated pool. Dropping the processor shuts it down.
#[derive(Debug)]
pub struct TaskProcessor {
    shared: Arc<Shared>,
    pool: ThreadPool,

    /// Set when the reactor is the processor's own timer thread.
    owns_reactor: bool,
    stopped: AtomicBool,
}

impl TaskProcessor {
    pub(crate) fn new(cfg: ProcessorConfig) -> Result<Self> {
        let (reactor, owns_reactor): (Arc<dyn Reactor>, bool) = match &cfg.reactor {
            Some(reactor) => (Arc::clone(reactor), false),
            None => (
                Arc::new(TimerThread::spawn(format!("{}-timer", cfg.name))?),
                true,
            ),
        };

        let shared = Arc::new(Shared::new(&cfg, reactor));
        let pool = ThreadPool::spawn(&shared, &cfg.thread_name, cfg.thread_stack_size)?;

        info!(
            processor = %cfg.name,
            worker_threads = cfg.worker_threads,
            "task processor started"
        );

        Ok(Self {
            shared,
            pool,
            owns_reactor,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn worker_threads(&self) -> usize {
        self.shared.worker_threads
    }

    pub fn spawn<F>(&self, future: F) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_inner(&self.shared, future, Importance::Normal, Deadline::unreachable())
    }

    pub fn spawn_critical<F>(&self, future: F) -> TaskWithResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_inner(&self.shared, future, Importance::Critical, Deadline::unreachable())
    }

    pub fn spawn_builder(&self) -> SpawnBuilder {
        SpawnBuilder::on(Arc::clone(&self.shared))
    }

    /// Runs `future` to completion on the calling thread, as a task of this
    /// processor.
    ///
    /// The future may use every primitive of the crate and spawn tasks. It does
    /// not need to be `Send`. It is never cancelled by shutdown or overload.
    ///
    /// # Panics
    ///
    /// Panics when called from within a task, blocking a worker thread.
    #[track_caller]
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        assert!(
            current::try_current().is_none(),
            "block_on called from within a task, this would block a worker thread"
        );

        let parker = Arc::new(RootParker::default());
        let root = TaskContext::new(
            Arc::clone(&self.shared),
            None,
            Importance::Critical,
            Deadline::unreachable(),
            Driver::Root(Arc::clone(&parker)),
        );

        let _scope = CurrentTaskScope::enter(Arc::clone(&root));
        root.enter_root();
        let _finish = ScopeGuard::new(|| root.finish_root());

        // Dropped before `_finish` runs, while the root task is still current.
        let mut future = pin!(future);
        loop {
            match root.poll_root(future.as_mut()) {
                Some(Poll::Ready(output)) => return output,
                Some(Poll::Pending) => {}
                None => {
                    parker.park();
                    root.resume_root();
                }
            }
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        self.shared
            .counter
            .snapshot(self.shared.queue.len(), self.shared.coro_pool.stats())
    }

    pub fn settings(&self) -> ProcessorSettings {
        self.shared.settings()
    }

    /// Replaces the overload and profiling settings. Takes effect for the
    /// following schedules and dequeues.
    pub fn set_settings(&self, settings: ProcessorSettings) {
        self.shared.set_settings(settings);
    }

    /// Cancels every task, waits for all of them to finish and stops the
    /// worker threads.
    ///
    /// Tasks that ignore cancellation keep shutdown waiting.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(processor = %self.shared.name, "shutting down task processor");
        self.shared.cancel_all_and_drain();
        self.shared.queue.stop();

        let res = self.pool.join_all();
        if self.owns_reactor {
            self.shared.reactor.shutdown();
        }

        info!(processor = %self.shared.name, "task processor stopped");
        res
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            error!(processor = %self.shared.name, "error during shutdown: {e:?}");
        }
    }
}
