use crate::coro::Coroutine;
use crate::deadline::Deadline;
use crate::runtime::shared::Shared;
use crate::task::cancel::{AtomicCancellationReason, CancellationReason};
use crate::task::current::CurrentTaskScope;
use crate::task::payload::Payload;
use crate::task::sleep_state::{AtomicSleepState, Epoch, SleepFlags, SleepState, WakeupSource};
use crate::task::state::{AtomicTaskState, Importance, TaskState};
use crate::task::Id;
use crate::timer::TimerKey;
use crate::wait::WaitList;
use futures::task::{ArcWake, waker_ref};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::thread;
use std::time::Instant;
use tracing::{trace, trace_span};

/// Why the body of a task returned `Poll::Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum YieldReason {
    /// Pending on something that only knows about the std `Waker`.
    None = 0,
    /// Suspended inside a `Sleep`.
    Waiting = 1,
    /// Observed cancellation at a cancellation point. The body never resumes.
    Cancelled = 2,
}

impl YieldReason {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => YieldReason::None,
            1 => YieldReason::Waiting,
            2 => YieldReason::Cancelled,
            _ => unreachable!("invalid yield reason {v}"),
        }
    }
}

/// Who resumes the task once it is woken up.
#[derive(Debug)]
pub(crate) enum Driver {
    /// Pushed onto the processor run queue and stepped by a worker.
    Queue,
    /// Polled in place by a thread blocked in `block_on`.
    Root(Arc<RootParker>),
}

/// Parking spot of a thread driving a root task.
#[derive(Debug, Default)]
pub(crate) struct RootParker {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl RootParker {
    pub(crate) fn unpark(&self) {
        *self.notified.lock() = true;
        self.cv.notify_one();
    }

    pub(crate) fn park(&self) {
        let mut notified = self.notified.lock();
        while !*notified {
            self.cv.wait(&mut notified);
        }
        *notified = false;
    }
}

#[derive(Debug, Default)]
struct TaskTimers {
    sleep: Option<TimerKey>,
    cancel: Option<TimerKey>,
}

/// State machine of one task.
///
/// Shared between the handle, the run queue, wait lists and timers. The sleep
/// state word decides who gets to schedule the task: only the first wakeup of
/// a sleeping task in the current epoch does.
pub(crate) struct TaskContext {
    id: Id,
    importance: Importance,
    state: AtomicTaskState,
    sleep_state: AtomicSleepState,
    yield_reason: AtomicU8,

    /// Previous step ended pending on a std `Waker`, so its wakeup flags must
    /// be discarded before the next step.
    foreign_wait: AtomicBool,

    /// Set once the body has been entered.
    started: AtomicBool,

    /// Debug check against overlapping sleeps.
    within_sleep: AtomicBool,

    cancellation_reason: AtomicCancellationReason,
    cancellation_blockers: AtomicU32,
    cancel_deadline: Mutex<Deadline>,

    payload: Mutex<Option<Pin<Box<dyn Payload>>>>,
    coro: Mutex<Option<Coroutine>>,

    /// Tasks waiting for this one to finish.
    finish_waiters: WaitList,

    /// Same, for plain OS threads.
    finished: Mutex<bool>,
    finished_cv: Condvar,

    timers: Mutex<TaskTimers>,
    queued_at: Mutex<Option<Instant>>,

    shared: Arc<Shared>,
    driver: Driver,
}

impl TaskContext {
    pub(crate) fn new(
        shared: Arc<Shared>,
        payload: Option<Pin<Box<dyn Payload>>>,
        importance: Importance,
        deadline: Deadline,
        driver: Driver,
    ) -> Arc<Self> {
        shared.counter.account_created();

        Arc::new(Self {
            id: Id::next(),
            importance,
            state: AtomicTaskState::new(TaskState::New),
            sleep_state: AtomicSleepState::new(SleepState::new(SleepFlags::SLEEPING, Epoch::ZERO)),
            yield_reason: AtomicU8::new(YieldReason::None as u8),
            foreign_wait: AtomicBool::new(false),
            started: AtomicBool::new(false),
            within_sleep: AtomicBool::new(false),
            cancellation_reason: AtomicCancellationReason::new(),
            cancellation_blockers: AtomicU32::new(0),
            cancel_deadline: Mutex::new(deadline),
            payload: Mutex::new(payload),
            coro: Mutex::new(None),
            finish_waiters: WaitList::new(),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
            timers: Mutex::new(TaskTimers::default()),
            queued_at: Mutex::new(None),
            shared,
            driver,
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.load()
    }

    fn set_state(&self, state: TaskState) {
        self.state.store(state);
        trace!(task_id = %self.id, ?state, "task state transition");
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Running tasks are never shed by overload control, they may need to run
    /// to process their own cancellation.
    pub(crate) fn is_critical(&self) -> bool {
        self.importance == Importance::Critical || self.started.load(Ordering::Relaxed)
    }

    pub(crate) fn is_root(&self) -> bool {
        matches!(self.driver, Driver::Root(_))
    }

    pub(crate) fn finish_waiters(&self) -> &WaitList {
        &self.finish_waiters
    }

    // --- Sleep state ---

    pub(crate) fn epoch(&self) -> Epoch {
        self.sleep_state.load(Ordering::Acquire).epoch
    }

    /// Starts the next sleep epoch, returning the state of the one that ended.
    pub(crate) fn advance_epoch(&self, epoch: Epoch) -> SleepState {
        self.sleep_state
            .exchange(SleepState::next_epoch(epoch), Ordering::AcqRel)
    }

    pub(crate) fn enter_sleep(&self) {
        let was_sleeping = self.within_sleep.swap(true, Ordering::Relaxed);
        debug_assert!(!was_sleeping, "task {} entered Sleep recursively", self.id);
    }

    pub(crate) fn exit_sleep(&self) {
        let was_sleeping = self.within_sleep.swap(false, Ordering::Relaxed);
        debug_assert!(was_sleeping, "task {} left a Sleep it never entered", self.id);
    }

    pub(crate) fn set_yield_reason(&self, reason: YieldReason) {
        self.yield_reason.store(reason as u8, Ordering::Relaxed);
    }

    /// Forgets a `Waiting` reason left by a sleep that ended during the same
    /// poll it was set in.
    pub(crate) fn clear_waiting_reason(&self) {
        let _ = self.yield_reason.compare_exchange(
            YieldReason::Waiting as u8,
            YieldReason::None as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    fn take_yield_reason(&self) -> YieldReason {
        YieldReason::from_u8(self.yield_reason.swap(YieldReason::None as u8, Ordering::Relaxed))
    }

    /// Delivers a wakeup for the sleep identified by `epoch`.
    pub(crate) fn wakeup(self: &Arc<Self>, source: WakeupSource, epoch: Epoch) {
        if self.is_finished() {
            return;
        }

        let mut prev = self.sleep_state.load(Ordering::Relaxed);
        loop {
            if prev.epoch != epoch {
                // Meant for a sleep that already ended.
                return;
            }

            if source == WakeupSource::CancelRequest && prev.flags.contains(SleepFlags::NON_CANCELLABLE)
            {
                return;
            }

            let next = SleepState::new(prev.flags | source.as_flag(), prev.epoch);
            match self.sleep_state.compare_exchange_weak(prev, next) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }

        if should_schedule(prev.flags, source) {
            self.schedule();
        }
    }

    /// Delivers a wakeup to whatever sleep is current, or to the next one if
    /// the task is between sleeps.
    pub(crate) fn wakeup_no_epoch(self: &Arc<Self>, source: WakeupSource) {
        debug_assert_eq!(source, WakeupSource::WaitList);

        if self.is_finished() {
            return;
        }

        let prev = self.sleep_state.fetch_or_flags(source.as_flag());
        if should_schedule(prev.flags, source) {
            self.schedule();
        }
    }

    /// Marks the current task as woken before it even sleeps.
    pub(crate) fn wakeup_current(&self) {
        self.sleep_state
            .fetch_or_flags(WakeupSource::WaitList.as_flag());
    }

    pub(crate) fn schedule(self: &Arc<Self>) {
        match &self.driver {
            Driver::Queue => {
                self.set_state(TaskState::Queued);
                self.shared.schedule(Arc::clone(self));
            }
            Driver::Root(parker) => parker.unpark(),
        }
    }

    // --- Cancellation ---

    pub(crate) fn is_cancellable(&self) -> bool {
        self.cancellation_blockers.load(Ordering::Relaxed) == 0
    }

    pub(crate) fn block_cancellation(&self) {
        self.cancellation_blockers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unblock_cancellation(&self) {
        let prev = self.cancellation_blockers.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unbalanced TaskCancellationBlocker");
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancellation_reason() != CancellationReason::None
    }

    pub(crate) fn should_cancel(&self) -> bool {
        self.is_cancel_requested() && self.is_cancellable()
    }

    pub(crate) fn cancellation_reason(&self) -> CancellationReason {
        self.cancellation_reason.load()
    }

    /// Records `reason` and wakes the task if it sleeps cancellably. Only the
    /// first request has an effect.
    pub(crate) fn request_cancel(self: &Arc<Self>, reason: CancellationReason) {
        if self.is_finished() {
            return;
        }

        if self.cancellation_reason.try_set(reason) {
            trace!(task_id = %self.id, %reason, "task cancellation requested");
            let epoch = self.epoch();
            self.wakeup(WakeupSource::CancelRequest, epoch);
        }
    }

    pub(crate) fn cancel_deadline(&self) -> Deadline {
        *self.cancel_deadline.lock()
    }

    pub(crate) fn set_cancel_deadline(self: &Arc<Self>, deadline: Deadline) {
        *self.cancel_deadline.lock() = deadline;
        if self.started.load(Ordering::Relaxed) {
            self.arm_cancel_timer();
        }
    }

    // --- Timers ---

    pub(crate) fn arm_sleep_timer(self: &Arc<Self>, deadline: Deadline, epoch: Epoch) {
        let Some(at) = deadline.instant() else {
            return;
        };

        let task = Arc::downgrade(self);
        let key = self.shared.reactor.arm_timer(
            at,
            Box::new(move || {
                if let Some(task) = task.upgrade() {
                    task.wakeup(WakeupSource::DeadlineTimer, epoch);
                }
            }),
        );

        let prev = self.timers.lock().sleep.replace(key);
        debug_assert!(prev.is_none(), "sleep timer armed twice");
    }

    pub(crate) fn cancel_sleep_timer(&self) {
        let key = self.timers.lock().sleep.take();
        if let Some(key) = key {
            self.shared.reactor.cancel_timer(key);
        }
    }

    fn arm_cancel_timer(self: &Arc<Self>) {
        let prev = self.timers.lock().cancel.take();
        if let Some(key) = prev {
            self.shared.reactor.cancel_timer(key);
        }

        let Some(at) = self.cancel_deadline().instant() else {
            return;
        };

        let task = Arc::downgrade(self);
        let key = self.shared.reactor.arm_timer(
            at,
            Box::new(move || {
                if let Some(task) = task.upgrade() {
                    task.request_cancel(CancellationReason::Deadline);
                }
            }),
        );
        self.timers.lock().cancel = Some(key);
    }

    fn stop_timers(&self) {
        let timers = std::mem::take(&mut *self.timers.lock());
        for key in [timers.sleep, timers.cancel].into_iter().flatten() {
            self.shared.reactor.cancel_timer(key);
        }
    }

    // --- Run queue accounting ---

    pub(crate) fn set_queued_at(&self, at: Option<Instant>) {
        *self.queued_at.lock() = at;
    }

    pub(crate) fn take_queued_at(&self) -> Option<Instant> {
        self.queued_at.lock().take()
    }

    // --- Execution ---

    /// Resumes the task once. Called by a worker after popping the task.
    pub(crate) fn do_step(self: &Arc<Self>) {
        if self.is_finished() {
            return;
        }

        let first_step = !self.started.load(Ordering::Relaxed);
        let mut clear = SleepFlags::SLEEPING;
        if first_step {
            *self.coro.lock() = Some(self.shared.coro_pool.get());
            self.started.store(true, Ordering::Relaxed);
            clear |= SleepFlags::WAKEUP_BY_BOOTSTRAP;
        }
        self.sleep_state.clear_flags(clear);

        if self.foreign_wait.swap(false, Ordering::Relaxed) {
            self.advance_epoch(self.epoch());
        }

        let _scope = CurrentTaskScope::enter(Arc::clone(self));
        let span = trace_span!("task", id = %self.id);
        let _span = span.enter();

        if first_step {
            if self.cancel_deadline().is_reached() {
                self.request_cancel(CancellationReason::Deadline);
            }

            // Only critical tasks enter their body once cancelled.
            if self.is_cancel_requested() && self.importance != Importance::Critical {
                self.drop_payload();
                self.finish(TaskState::Cancelled);
                return;
            }

            self.arm_cancel_timer();
        }

        self.set_state(TaskState::Running);
        if let Some(coro) = self.coro.lock().as_mut() {
            coro.record_step();
        }

        let started = Instant::now();
        let poll = {
            let waker = waker_ref(self);
            let mut cx = Context::from_waker(&waker);
            let mut payload = self.payload.lock();
            match payload.as_mut() {
                Some(body) => body.as_mut().poll(&mut cx),
                None => Poll::Ready(()),
            }
        };
        self.shared.profile_step(self.id, started.elapsed());

        match poll {
            Poll::Ready(()) => self.finish(TaskState::Completed),
            Poll::Pending => match self.take_yield_reason() {
                YieldReason::Cancelled => {
                    self.drop_payload();
                    self.finish(TaskState::Cancelled);
                }
                reason => {
                    if reason == YieldReason::None {
                        self.foreign_wait.store(true, Ordering::Relaxed);
                    }
                    if self.suspend() {
                        self.schedule();
                    }
                }
            },
        }
    }

    /// Publishes that the task yielded. Returns true if a wakeup arrived while
    /// it was still running, in which case it must be rescheduled right away.
    fn suspend(&self) -> bool {
        self.set_state(TaskState::Suspended);

        let non_cancellable = !self.is_cancellable();
        let mut new_flags = SleepFlags::SLEEPING;
        if non_cancellable {
            new_flags |= SleepFlags::NON_CANCELLABLE;
        }

        // Wakeup flags of this epoch are kept, so a cancel request that came in
        // while running still interrupts the upcoming sleep.
        let mut prev = self.sleep_state.fetch_or_flags(new_flags).flags;
        debug_assert!(!prev.contains(SleepFlags::SLEEPING));

        if non_cancellable {
            prev.remove(SleepFlags::WAKEUP_BY_CANCEL_REQUEST | SleepFlags::NON_CANCELLABLE);
        }
        !prev.is_empty()
    }

    fn drop_payload(&self) {
        // Destructors may touch task-local storage or wake other tasks.
        let _blocker = NonCancellableScope::enter(self);
        if let Some(body) = self.payload.lock().as_mut() {
            body.as_mut().drop_future();
        }
    }

    fn finish(&self, state: TaskState) {
        debug_assert!(state.is_finished());

        if let Some(coro) = self.coro.lock().take() {
            trace!(task_id = %self.id, ?state, steps = coro.steps(), "task finished");
            self.shared.coro_pool.put(coro);
        }
        if self.is_cancel_requested() {
            self.shared.counter.account_cancelled();
        }

        self.set_state(state);
        self.stop_timers();

        // Waiters check the state under the list lock. Passing through it
        // orders the state store before the emptiness check of `wakeup_all`.
        drop(self.finish_waiters.lock());
        self.finish_waiters.wakeup_all();

        *self.finished.lock() = true;
        self.finished_cv.notify_all();

        self.shared.unregister(self.id);
    }

    // --- Root tasks ---

    /// Prepares a root task to be polled by the thread that owns it.
    pub(crate) fn enter_root(&self) {
        debug_assert!(self.is_root());
        *self.coro.lock() = Some(self.shared.coro_pool.get());
        self.started.store(true, Ordering::Relaxed);
        self.sleep_state
            .clear_flags(SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_BOOTSTRAP);
        self.set_state(TaskState::Running);
    }

    /// Polls the body of a root task once. Returns `None` once the future is
    /// pending and nothing woke it yet, so the caller should park.
    pub(crate) fn poll_root<F: Future>(
        self: &Arc<Self>,
        fut: Pin<&mut F>,
    ) -> Option<Poll<F::Output>> {
        if self.foreign_wait.swap(false, Ordering::Relaxed) {
            self.advance_epoch(self.epoch());
        }
        self.set_state(TaskState::Running);

        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        let started = Instant::now();
        let poll = fut.poll(&mut cx);
        self.shared.profile_step(self.id, started.elapsed());

        match poll {
            Poll::Ready(v) => Some(Poll::Ready(v)),
            Poll::Pending => {
                match self.take_yield_reason() {
                    YieldReason::None => self.foreign_wait.store(true, Ordering::Relaxed),
                    // Cancellation points of a root task never yield.
                    YieldReason::Waiting | YieldReason::Cancelled => {}
                }

                if self.suspend() {
                    self.sleep_state.clear_flags(SleepFlags::SLEEPING);
                    Some(Poll::Pending)
                } else {
                    None
                }
            }
        }
    }

    /// Called by the root thread once it got unparked.
    pub(crate) fn resume_root(&self) {
        self.sleep_state.clear_flags(SleepFlags::SLEEPING);
    }

    pub(crate) fn finish_root(&self) {
        debug_assert!(self.is_root());
        self.finish(TaskState::Completed);
    }

    // --- Results ---

    /// Blocks the calling OS thread until the task finishes or `deadline`
    /// passes. Returns whether the task finished.
    pub(crate) fn wait_finished_blocking(&self, deadline: Deadline) -> bool {
        let mut finished = self.finished.lock();
        while !*finished {
            match deadline.instant() {
                Some(at) => {
                    if self.finished_cv.wait_until(&mut finished, at).timed_out() {
                        return *finished;
                    }
                }
                None => self.finished_cv.wait(&mut finished),
            }
        }
        true
    }

    pub(crate) fn take_output<T: Send + 'static>(&self) -> Option<thread::Result<T>> {
        let mut slot: Option<thread::Result<T>> = None;
        if let Some(body) = self.payload.lock().as_mut() {
            body.as_mut().take_output(&mut slot);
        }
        slot
    }

    /// Runs `f` on the coroutine bound to this task.
    ///
    /// # Panics
    ///
    /// Panics on reentrant access, or when the task is not executing.
    #[track_caller]
    pub(crate) fn with_coroutine<R>(&self, f: impl FnOnce(&mut Coroutine) -> R) -> R {
        let Some(mut coro) = self.coro.try_lock() else {
            panic!("task-local storage accessed reentrantly");
        };
        match coro.as_mut() {
            Some(coro) => f(coro),
            None => panic!("task-local storage accessed outside of task execution"),
        }
    }
}

/// Decides whether a successful wakeup of a task whose flags were `prev`
/// must schedule it. Only the first wakeup of a sleeping task does.
fn should_schedule(prev: SleepFlags, source: WakeupSource) -> bool {
    if !prev.contains(SleepFlags::SLEEPING) {
        return false;
    }

    match source {
        // Not while non-cancellable, nor when another source already fired.
        WakeupSource::CancelRequest => prev == SleepFlags::SLEEPING,
        _ => {
            let mut prev = prev;
            if prev.contains(SleepFlags::NON_CANCELLABLE) {
                // A blocked cancel request did not schedule, we are first.
                prev.remove(SleepFlags::NON_CANCELLABLE | SleepFlags::WAKEUP_BY_CANCEL_REQUEST);
            }
            prev == SleepFlags::SLEEPING
        }
    }
}

/// Holds cancellation off while a task's body is being destroyed.
struct NonCancellableScope<'a>(&'a TaskContext);

impl<'a> NonCancellableScope<'a> {
    fn enter(task: &'a TaskContext) -> Self {
        task.block_cancellation();
        Self(task)
    }
}

impl Drop for NonCancellableScope<'_> {
    fn drop(&mut self) {
        self.0.unblock_cancellation();
    }
}

impl ArcWake for TaskContext {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.wakeup_no_epoch(WakeupSource::WaitList);
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        self.shared.counter.account_destroyed();
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("importance", &self.importance)
            .field("state", &self.state())
            .field("cancellation_reason", &self.cancellation_reason())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SLEEPING: SleepFlags = SleepFlags::SLEEPING;
    const NON_CANC: SleepFlags = SleepFlags::NON_CANCELLABLE;
    const BY_LIST: SleepFlags = SleepFlags::WAKEUP_BY_WAIT_LIST;
    const BY_CANCEL: SleepFlags = SleepFlags::WAKEUP_BY_CANCEL_REQUEST;

    #[rstest]
    #[case::first_wait_list(SLEEPING, WakeupSource::WaitList, true)]
    #[case::not_sleeping(SleepFlags::empty(), WakeupSource::WaitList, false)]
    #[case::second_wakeup(SLEEPING.union(BY_LIST), WakeupSource::DeadlineTimer, false)]
    #[case::cancel_first(SLEEPING, WakeupSource::CancelRequest, true)]
    #[case::cancel_after_list(SLEEPING.union(BY_LIST), WakeupSource::CancelRequest, false)]
    #[case::cancel_while_blocked(SLEEPING.union(NON_CANC), WakeupSource::CancelRequest, false)]
    #[case::list_after_blocked_cancel(
        SLEEPING.union(NON_CANC).union(BY_CANCEL),
        WakeupSource::WaitList,
        true
    )]
    #[case::list_after_cancel(SLEEPING.union(BY_CANCEL), WakeupSource::WaitList, false)]
    #[case::bootstrap(SLEEPING, WakeupSource::Bootstrap, true)]
    #[case::bootstrap_after_cancel(SLEEPING.union(BY_CANCEL), WakeupSource::Bootstrap, false)]
    fn test_should_schedule(
        #[case] prev: SleepFlags,
        #[case] source: WakeupSource,
        #[case] expected: bool,
    ) {
        assert_eq!(should_schedule(prev, source), expected);
    }
}
