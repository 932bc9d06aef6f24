use super::*;
use crate as corral;
use crate::task::TaskWithResult;
use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};

/// Minimal primitive: tasks sleep until the gate opens.
#[derive(Default)]
struct Gate {
    open: AtomicBool,
    waiters: WaitList,
}

impl Gate {
    async fn wait_until(&self, deadline: Deadline) -> WaitStatus {
        let task = current::expect_current();
        let mut strategy = GateWait {
            gate: self,
            key: None,
        };
        loop {
            if self.open.load(Ordering::SeqCst) {
                return WaitStatus::NoTimeout;
            }
            Sleep::new(&mut strategy, deadline).await;
            if self.open.load(Ordering::SeqCst) {
                return WaitStatus::NoTimeout;
            }
            if deadline.is_reached() || task.should_cancel() {
                return WaitStatus::not_ready(&task);
            }
        }
    }

    fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.waiters.wakeup_all();
    }
}

struct GateWait<'a> {
    gate: &'a Gate,
    key: Option<WaiterKey>,
}

impl WaitStrategy for GateWait<'_> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        self.key = Some(self.gate.waiters.lock().append(task));
        EarlyWakeup(self.gate.open.load(Ordering::SeqCst))
    }

    fn disable_wakeups(&mut self, task: &Arc<TaskContext>) {
        if let Some(key) = self.key.take() {
            self.gate.waiters.lock().remove(key, task);
        }
    }
}

#[crate::test(worker_threads = 4)]
async fn test_wakeup_all_releases_every_waiter() -> anyhow::Result<()> {
    const WAITERS: usize = 64;
    let gate = Arc::new(Gate::default());

    let tasks: Vec<TaskWithResult<WaitStatus>> = (0..WAITERS)
        .map(|_| {
            let gate = Arc::clone(&gate);
            corral::spawn(async move { gate.wait_until(Deadline::unreachable()).await })
        })
        .collect();

    while gate.waiters.count_of_sleepies() < WAITERS {
        corral::time::sleep_for(Duration::from_millis(1)).await;
    }
    gate.open();

    for task in tasks {
        assert_eq!(task.get().await?, WaitStatus::NoTimeout);
    }
    assert!(gate.waiters.is_empty());
    Ok(())
}

#[crate::test(worker_threads = 2)]
async fn test_wakeup_one_wakes_a_single_waiter() -> anyhow::Result<()> {
    let list = Arc::new(WaitList::new());
    let woken = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let (list, woken) = (Arc::clone(&list), Arc::clone(&woken));
            corral::spawn(async move {
                let mut strategy = ListWait {
                    list: &list,
                    key: None,
                };
                let source = Sleep::new(&mut strategy, Deadline::unreachable()).await;
                woken.fetch_add(1, Ordering::SeqCst);
                source
            })
        })
        .collect();

    while list.count_of_sleepies() < 3 {
        corral::time::sleep_for(Duration::from_millis(1)).await;
    }

    list.wakeup_one();
    corral::time::sleep_for(Duration::from_millis(20)).await;
    assert_eq!(woken.load(Ordering::SeqCst), 1);
    assert_eq!(list.count_of_sleepies(), 2);

    list.wakeup_all();
    for task in tasks {
        assert_eq!(task.get().await?, WakeupSource::WaitList);
    }
    Ok(())
}

struct ListWait<'a> {
    list: &'a WaitList,
    key: Option<WaiterKey>,
}

impl WaitStrategy for ListWait<'_> {
    fn setup_wakeups(&mut self, task: &Arc<TaskContext>) -> EarlyWakeup {
        self.key = Some(self.list.lock().append(task));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self, task: &Arc<TaskContext>) {
        if let Some(key) = self.key.take() {
            self.list.lock().remove(key, task);
        }
    }
}

#[crate::test(worker_threads = 2)]
async fn test_wakeup_one_skips_destroyed_tasks() -> anyhow::Result<()> {
    let list = Arc::new(WaitList::new());

    // A node whose task is destroyed while linked.
    let gone = corral::spawn(async { current::expect_current() }).get().await?;
    let _stale = list.lock().append(&gone);
    let weak = Arc::downgrade(&gone);
    drop(gone);
    while weak.strong_count() > 0 {
        corral::time::sleep_for(Duration::from_millis(1)).await;
    }

    let sleeper = corral::spawn({
        let list = Arc::clone(&list);
        async move {
            let mut strategy = ListWait {
                list: &list,
                key: None,
            };
            Sleep::new(&mut strategy, Deadline::unreachable()).await
        }
    });
    while list.count_of_sleepies() < 2 {
        corral::time::sleep_for(Duration::from_millis(1)).await;
    }

    list.wakeup_one();
    assert_eq!(
        sleeper.wait_for(Duration::from_secs(5)).await,
        WaitStatus::NoTimeout
    );
    assert_eq!(sleeper.get().await?, WakeupSource::WaitList);
    assert!(list.is_empty());
    Ok(())
}

#[crate::test]
async fn test_deadline_times_out_and_unlinks() {
    let gate = Gate::default();
    let started = Instant::now();

    let status = gate
        .wait_until(Deadline::from_duration(Duration::from_millis(50)))
        .await;

    assert_eq!(status, WaitStatus::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(gate.waiters.is_empty());
}

#[crate::test]
async fn test_passed_deadline_returns_without_blocking() {
    let gate = Gate::default();
    let status = gate.wait_until(Deadline::from_duration(Duration::ZERO)).await;
    assert_eq!(status, WaitStatus::Timeout);
}

#[crate::test]
async fn test_cancel_interrupts_wait() -> anyhow::Result<()> {
    let gate = Arc::new(Gate::default());
    let waiter = corral::spawn({
        let gate = Arc::clone(&gate);
        async move { gate.wait_until(Deadline::unreachable()).await }
    });

    while gate.waiters.is_empty() {
        corral::time::sleep_for(Duration::from_millis(1)).await;
    }
    waiter.request_cancel();

    assert_eq!(waiter.get().await?, WaitStatus::Cancelled);
    assert!(gate.waiters.is_empty());
    Ok(())
}

#[crate::test]
async fn test_wait_external() -> anyhow::Result<()> {
    let status = wait_external(Deadline::from_duration(Duration::from_secs(5)), |handle| {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            handle.wakeup();
            // Late wakeups are ignored.
            handle.wakeup();
        });
    })
    .await;
    assert_eq!(status, WaitStatus::NoTimeout);

    let status = wait_external(Deadline::from_duration(Duration::from_millis(10)), drop).await;
    assert_eq!(status, WaitStatus::Timeout);
    Ok(())
}

#[crate::test]
async fn test_light_list_single_slot() {
    let task = current::expect_current();
    let light = WaitListLight::new();

    let key = light.append(&task);
    assert!(!light.is_empty());
    assert!(light.remove(key));
    assert!(light.is_empty());

    let key = light.append(&task);
    light.wakeup_one();
    assert!(light.is_empty());
    assert!(!light.remove(key));
}

#[crate::test]
async fn test_light_list_stale_key_keeps_newer_waiter() {
    let task = current::expect_current();
    let light = WaitListLight::new();

    // The wakeup frees the list's reference, the key still holds its own,
    // so the next record cannot reuse the address.
    let stale = light.append(&task);
    light.wakeup_one();
    let fresh = light.append(&task);

    assert!(!light.remove(stale));
    assert!(!light.is_empty());
    assert!(light.remove(fresh));
    assert!(light.is_empty());
}

#[test]
fn test_wait_status() {
    assert!(WaitStatus::NoTimeout.is_ready());
    assert!(!WaitStatus::Timeout.is_ready());
    assert!(!WaitStatus::Cancelled.is_ready());
    assert_eq!(WaitStatus::Cancelled.to_string(), "cancelled");
}
