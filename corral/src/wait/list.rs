use crate::runtime::SPILL_TO_HEAP_THRESHOLD;
use crate::task::context::TaskContext;
use crate::task::sleep_state::{Epoch, WakeupSource};
use parking_lot::{Mutex, MutexGuard};
use slab::Slab;
use smallvec::SmallVec;
use std::ptr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};

/// FIFO queue of sleeping tasks, the building block of every blocking
/// primitive.
///
/// Nodes live in a slab and are chained into a doubly-linked list, so append
/// and remove are O(1). Nodes do not own their task: a sleeping task is kept
/// alive by its processor's registry (or by `block_on` for a root task), and
/// a node whose task is gone is skipped. Wakeups carry the epoch recorded at
/// append time, so a task that already left the sleep it registered for is
/// not disturbed.
#[derive(Debug)]
pub(crate) struct WaitList {
    waiters: Mutex<Waiters>,

    /// Number of linked nodes. Read without the lock by fast paths that skip
    /// the wakeup when nobody sleeps.
    sleepies: AtomicUsize,
}

/// Handle to a linked node. Only valid for the list that returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterKey(usize);

#[derive(Debug)]
struct Node {
    task: Weak<TaskContext>,
    epoch: Epoch,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct Waiters {
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
}

type Batch = SmallVec<[(Weak<TaskContext>, Epoch); SPILL_TO_HEAP_THRESHOLD]>;

impl WaitList {
    pub(crate) fn new() -> Self {
        Self {
            waiters: Mutex::new(Waiters::default()),
            sleepies: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock(&self) -> WaitListGuard<'_> {
        WaitListGuard {
            list: self,
            waiters: self.waiters.lock(),
        }
    }

    /// Racy count of linked tasks. Callers must tolerate stale answers.
    pub(crate) fn count_of_sleepies(&self) -> usize {
        self.sleepies.load(Ordering::SeqCst)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count_of_sleepies() == 0
    }

    pub(crate) fn wakeup_one(&self) {
        if self.is_empty() {
            return;
        }

        // Nodes of destroyed tasks would swallow the wakeup.
        loop {
            let first = self.lock().pop_front();
            match first {
                Some((task, epoch)) if !wakeup(&task, epoch) => continue,
                _ => return,
            }
        }
    }

    pub(crate) fn wakeup_all(&self) {
        if self.is_empty() {
            return;
        }

        let batch = self.lock().drain();
        for (task, epoch) in batch {
            wakeup(&task, epoch);
        }
    }
}

/// Returns false if the task no longer exists.
fn wakeup(task: &Weak<TaskContext>, epoch: Epoch) -> bool {
    match task.upgrade() {
        Some(task) => {
            task.wakeup(WakeupSource::WaitList, epoch);
            true
        }
        None => false,
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitList {
    fn drop(&mut self) {
        debug_assert!(
            self.waiters.get_mut().nodes.is_empty(),
            "WaitList destroyed with sleeping tasks"
        );
    }
}

/// Locked view of a [`WaitList`].
pub(crate) struct WaitListGuard<'a> {
    list: &'a WaitList,
    waiters: MutexGuard<'a, Waiters>,
}

impl WaitListGuard<'_> {
    /// Links `task` at the tail for its current sleep epoch.
    pub(crate) fn append(&mut self, task: &Arc<TaskContext>) -> WaiterKey {
        let epoch = task.epoch();
        let prev = self.waiters.tail;

        let key = self.waiters.nodes.insert(Node {
            task: Arc::downgrade(task),
            epoch,
            prev,
            next: None,
        });

        match prev {
            Some(tail) => self.waiters.nodes[tail].next = Some(key),
            None => self.waiters.head = Some(key),
        }
        self.waiters.tail = Some(key);

        self.list.sleepies.fetch_add(1, Ordering::SeqCst);
        WaiterKey(key)
    }

    /// Unlinks the node for `task`. A node already popped by a wakeup, or a
    /// slot since reused by another task, is left alone.
    pub(crate) fn remove(&mut self, key: WaiterKey, task: &Arc<TaskContext>) -> bool {
        match self.waiters.nodes.get(key.0) {
            Some(node) if ptr::eq(node.task.as_ptr(), Arc::as_ptr(task)) => {}
            _ => return false,
        }

        self.unlink(key.0);
        true
    }

    pub(crate) fn pop_front(&mut self) -> Option<(Weak<TaskContext>, Epoch)> {
        let head = self.waiters.head?;
        Some(self.unlink(head))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.head.is_none()
    }

    fn drain(&mut self) -> Batch {
        let mut batch = Batch::new();
        while let Some(entry) = self.pop_front() {
            batch.push(entry);
        }
        batch
    }

    fn unlink(&mut self, key: usize) -> (Weak<TaskContext>, Epoch) {
        let node = self.waiters.nodes.remove(key);

        match node.prev {
            Some(prev) => self.waiters.nodes[prev].next = node.next,
            None => self.waiters.head = node.next,
        }
        match node.next {
            Some(next) => self.waiters.nodes[next].prev = node.prev,
            None => self.waiters.tail = node.prev,
        }

        self.list.sleepies.fetch_sub(1, Ordering::SeqCst);
        (node.task, node.epoch)
    }
}
