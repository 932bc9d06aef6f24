use crate::task::context::TaskContext;
use crate::task::sleep_state::{Epoch, WakeupSource};
use std::ptr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicPtr, Ordering};

/// A sleeping task together with the epoch it sleeps in. Does not keep the
/// task alive.
#[derive(Debug)]
pub(crate) struct Waiter {
    task: Weak<TaskContext>,
    epoch: Epoch,
}

impl Waiter {
    pub(crate) fn new(task: &Arc<TaskContext>) -> Arc<Waiter> {
        Arc::new(Waiter {
            task: Arc::downgrade(task),
            epoch: task.epoch(),
        })
    }

    /// Hands one reference to `record` over to an atomic word.
    pub(crate) fn publish(record: &Arc<Waiter>) -> *mut Waiter {
        Arc::into_raw(Arc::clone(record)).cast_mut()
    }

    /// Takes back the reference owned by an atomic word.
    ///
    /// # Safety
    ///
    /// `raw` must come from [`Waiter::publish`] and the caller must have
    /// removed it from the word it was published in.
    pub(crate) unsafe fn reclaim(raw: *mut Waiter) -> Arc<Waiter> {
        // Safety: guaranteed by the caller.
        unsafe { Arc::from_raw(raw) }
    }

    pub(crate) fn wakeup(&self) {
        if let Some(task) = self.task.upgrade() {
            task.wakeup(WakeupSource::WaitList, self.epoch);
        }
    }
}

/// Lock-free wait list that holds at most one task.
///
/// The list word owns one reference to the published record and the
/// [`LightKey`] of the appender owns another. While a key is alive its record
/// cannot be freed, so no later append can be published at the same address
/// and a stale key never matches a newer registration.
///
/// Appending while another task is already linked is a programming error.
#[derive(Debug)]
pub(crate) struct WaitListLight {
    waiter: AtomicPtr<Waiter>,
}

/// Proof of a successful append. Needed to unlink the same record later.
#[derive(Debug)]
pub(crate) struct LightKey(Arc<Waiter>);

impl WaitListLight {
    pub(crate) const fn new() -> Self {
        Self {
            waiter: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[track_caller]
    pub(crate) fn append(&self, task: &Arc<TaskContext>) -> LightKey {
        let record = Waiter::new(task);
        let raw = Waiter::publish(&record);

        if let Err(other) =
            self.waiter
                .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
        {
            // Safety: `raw` was never published.
            drop(unsafe { Waiter::reclaim(raw) });
            panic!("WaitListLight already holds a waiter ({other:p}), only one task may sleep here");
        }
        LightKey(record)
    }

    /// Unlinks the record published by the matching `append`. Returns false if
    /// a wakeup already took it.
    pub(crate) fn remove(&self, key: LightKey) -> bool {
        let raw = Arc::as_ptr(&key.0).cast_mut();
        let removed = self
            .waiter
            .compare_exchange(raw, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();

        if removed {
            // Safety: the exchange took it out of the list.
            drop(unsafe { Waiter::reclaim(raw) });
        }
        removed
    }

    pub(crate) fn wakeup_one(&self) {
        let raw = self.waiter.swap(ptr::null_mut(), Ordering::SeqCst);
        if !raw.is_null() {
            // Safety: the swap took it out of the list.
            unsafe { Waiter::reclaim(raw) }.wakeup();
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiter.load(Ordering::SeqCst).is_null()
    }
}

impl Default for WaitListLight {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitListLight {
    fn drop(&mut self) {
        let raw = *self.waiter.get_mut();
        debug_assert!(raw.is_null(), "WaitListLight destroyed with a sleeping task");
        if !raw.is_null() {
            // Safety: exclusive access in drop.
            drop(unsafe { Waiter::reclaim(raw) });
        }
    }
}
