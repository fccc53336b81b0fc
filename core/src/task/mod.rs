//! Cooperative, priority-ordered task scheduler.
//!
//! One [`Scheduler`] per worker thread drives every session, applet and
//! timer on that thread. There is no preemption: a task runs its `process`
//! callback to completion, and the only suspension points are returning to
//! the scheduler, registering for IO readiness, or scheduling a future
//! wakeup (see spec.md §4.3, §5).

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::clock::{self, Clock, Tick};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    /// keep the task around, idle until next woken.
    Keep,
    /// the task is finished; remove it entirely.
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    /// neither queued for a timer nor runnable.
    Idle,
    Waiting(Tick),
    /// the run-queue priority key this task is currently stored under.
    Runnable(u64),
}

struct TaskSlot {
    nice: i32,
    state: QueueState,
    process: Box<dyn FnMut(Tick) -> TaskResult>,
}

/// Maps a signed `nice` in `[-1024, 1024]` to an unsigned offset so it sorts
/// correctly inside the `u64` priority key.
const NICE_BIAS: i32 = 1024;

fn priority_key(epoch: u64, nice: i32) -> u64 {
    debug_assert!((-1024..=1024).contains(&nice));
    (epoch << 16) | (nice + NICE_BIAS) as u64
}

/// Single-threaded cooperative scheduler: a time-indexed wait queue plus a
/// nice-ordered run queue, both keyed off one monotonic [`Clock`].
pub struct Scheduler {
    clock: Clock,
    tasks: BTreeMap<TaskId, TaskSlot>,
    /// expiry -> set of tasks waiting on that exact tick. A `BTreeMap` keeps
    /// `tick()` draining expired entries in expiry order cheaply.
    wait_queue: BTreeMap<Tick, Vec<TaskId>>,
    run_queue: BTreeSet<(u64, TaskId)>,
    next_id: u64,
    /// bumped every time a task is dispatched; part of the priority key so a
    /// task that keeps re-waking itself can never starve tasks that have
    /// been runnable since an earlier epoch.
    epoch: u64,
    soft_stop: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            clock: Clock::new(),
            tasks: BTreeMap::new(),
            wait_queue: BTreeMap::new(),
            run_queue: BTreeSet::new(),
            next_id: 0,
            epoch: 0,
            soft_stop: false,
        }
    }

    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    /// Register a new task. It starts idle: call [`Scheduler::wake_now`] or
    /// [`Scheduler::schedule_at`] to make it runnable.
    pub fn spawn<F>(&mut self, nice: i32, process: F) -> TaskId
    where
        F: FnMut(Tick) -> TaskResult + 'static,
    {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(
            id,
            TaskSlot {
                nice,
                state: QueueState::Idle,
                process: Box::new(process),
            },
        );
        id
    }

    /// Explicit destruction: removes the task from both queues immediately.
    /// This is the only way to remove a task other than its `process`
    /// callback returning [`TaskResult::Destroy`].
    pub fn destroy(&mut self, id: TaskId) {
        if let Some(slot) = self.tasks.remove(&id) {
            match slot.state {
                QueueState::Waiting(t) => {
                    if let Some(v) = self.wait_queue.get_mut(&t) {
                        v.retain(|&x| x != id);
                        if v.is_empty() {
                            self.wait_queue.remove(&t);
                        }
                    }
                }
                QueueState::Runnable(k) => {
                    self.run_queue.remove(&(k, id));
                }
                QueueState::Idle => {}
            }
        }
    }

    /// "Eternity" cancellation: stop waiting on any timer without
    /// destroying the task. It stays idle until something calls
    /// [`Scheduler::wake_now`] again.
    pub fn cancel_timer(&mut self, id: TaskId) {
        if let Some(slot) = self.tasks.get_mut(&id) {
            if let QueueState::Waiting(t) = slot.state {
                if let Some(v) = self.wait_queue.get_mut(&t) {
                    v.retain(|&x| x != id);
                    if v.is_empty() {
                        self.wait_queue.remove(&t);
                    }
                }
            }
            slot.state = QueueState::Idle;
        }
    }

    /// Move the task into the time-indexed wait queue, to become runnable
    /// once the clock reaches `deadline`. Removes any prior queue
    /// membership first (a task is in at most one queue, spec.md §8).
    pub fn schedule_at(&mut self, id: TaskId, deadline: Tick) {
        self.remove_from_queues(id);
        if deadline == clock::ETERNITY {
            return;
        }
        if let Some(slot) = self.tasks.get_mut(&id) {
            slot.state = QueueState::Waiting(deadline);
            self.wait_queue.entry(deadline).or_default().push(id);
        }
    }

    /// Make the task immediately runnable. Idempotent: waking an
    /// already-runnable task is a no-op.
    pub fn wake_now(&mut self, id: TaskId) {
        let Some(slot) = self.tasks.get_mut(&id) else { return };
        if matches!(slot.state, QueueState::Runnable(_)) {
            return;
        }
        if let QueueState::Waiting(t) = slot.state {
            if let Some(v) = self.wait_queue.get_mut(&t) {
                v.retain(|&x| x != id);
                if v.is_empty() {
                    self.wait_queue.remove(&t);
                }
            }
        }
        let key = priority_key(self.epoch, slot.nice);
        slot.state = QueueState::Runnable(key);
        self.run_queue.insert((key, id));
    }

    fn remove_from_queues(&mut self, id: TaskId) {
        let Some(slot) = self.tasks.get_mut(&id) else { return };
        match slot.state {
            QueueState::Waiting(t) => {
                if let Some(v) = self.wait_queue.get_mut(&t) {
                    v.retain(|&x| x != id);
                    if v.is_empty() {
                        self.wait_queue.remove(&t);
                    }
                }
            }
            QueueState::Runnable(k) => {
                self.run_queue.remove(&(k, id));
            }
            QueueState::Idle => {}
        }
        slot.state = QueueState::Idle;
    }

    /// Advance the clock and drain any wait-queue entries whose deadline has
    /// passed into the run queue.
    pub fn tick(&mut self, delta_ms: u64) {
        self.clock.tick(delta_ms);
        self.drain_expired();
    }

    fn drain_expired(&mut self) {
        let now = self.clock.now();
        let expired: Vec<Tick> = self.wait_queue.range(..=now).map(|(&t, _)| t).collect();
        for t in expired {
            if let Some(ids) = self.wait_queue.remove(&t) {
                for id in ids {
                    if let Some(slot) = self.tasks.get_mut(&id) {
                        slot.state = QueueState::Idle;
                    }
                    self.wake_now(id);
                }
            }
        }
    }

    /// Dispatch up to `max` tasks from the run queue in priority order.
    /// Returns the number actually dispatched.
    pub fn run_once(&mut self, max: usize) -> usize {
        let mut dispatched = 0;
        while dispatched < max {
            let Some(&(key, id)) = self.run_queue.iter().next() else { break };
            self.run_queue.remove(&(key, id));
            let now = self.clock.now();
            let result = {
                let Some(slot) = self.tasks.get_mut(&id) else { continue };
                slot.state = QueueState::Idle;
                (slot.process)(now)
            };
            self.epoch += 1;
            match result {
                TaskResult::Keep => trace!(?id, "task yielded"),
                TaskResult::Destroy => {
                    self.tasks.remove(&id);
                    trace!(?id, "task destroyed");
                }
            }
            dispatched += 1;
        }
        dispatched
    }

    pub fn pending_run(&self) -> usize {
        self.run_queue.len()
    }

    pub fn pending_wait(&self) -> usize {
        self.wait_queue.values().map(Vec::len).sum()
    }

    pub fn next_wakeup(&self) -> Tick {
        self.wait_queue.keys().next().copied().unwrap_or(clock::ETERNITY)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Begin a graceful drain: no new behavior is forced on existing tasks,
    /// but callers (the worker loop) can check [`Scheduler::is_soft_stopping`]
    /// to stop accepting new sessions. Grounded on `xitca-server`'s
    /// `worker::shutdown` + `signals` split, generalized here because the
    /// session engine's only other mention of a drain path is peer-protocol
    /// specific (`DONOTSTOP`, spec.md §4.9).
    pub fn begin_soft_stop(&mut self) {
        self.soft_stop = true;
    }

    pub fn is_soft_stopping(&self) -> bool {
        self.soft_stop
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn priority_orders_by_epoch_then_nice() {
        let mut sched = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        let lo_nice = sched.spawn(-10, move |_| {
            o1.borrow_mut().push("lo_nice");
            TaskResult::Keep
        });
        let o2 = order.clone();
        let hi_nice = sched.spawn(10, move |_| {
            o2.borrow_mut().push("hi_nice");
            TaskResult::Keep
        });

        sched.wake_now(hi_nice);
        sched.wake_now(lo_nice);
        sched.run_once(2);

        assert_eq!(*order.borrow(), vec!["lo_nice", "hi_nice"]);
    }

    #[test]
    fn wake_is_idempotent() {
        let mut sched = Scheduler::new();
        let id = sched.spawn(0, |_| TaskResult::Keep);
        sched.wake_now(id);
        sched.wake_now(id);
        assert_eq!(sched.pending_run(), 1);
    }

    #[test]
    fn timer_expiry_moves_task_to_run_queue() {
        let mut sched = Scheduler::new();
        let id = sched.spawn(0, |_| TaskResult::Destroy);
        sched.schedule_at(id, 100);
        assert_eq!(sched.pending_wait(), 1);
        sched.tick(50);
        assert_eq!(sched.pending_run(), 0);
        sched.tick(60);
        assert_eq!(sched.pending_run(), 1);
        assert_eq!(sched.run_once(10), 1);
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn destroy_removes_from_both_queues() {
        let mut sched = Scheduler::new();
        let id = sched.spawn(0, |_| TaskResult::Keep);
        sched.schedule_at(id, 10);
        sched.destroy(id);
        assert_eq!(sched.pending_wait(), 0);
        assert_eq!(sched.task_count(), 0);
    }

    #[test]
    fn cancel_to_eternity_stops_timer_without_destroying() {
        let mut sched = Scheduler::new();
        let id = sched.spawn(0, |_| TaskResult::Keep);
        sched.schedule_at(id, 10);
        sched.cancel_timer(id);
        sched.tick(20);
        assert_eq!(sched.pending_run(), 0);
        assert_eq!(sched.task_count(), 1);
    }

    #[test]
    fn starvation_prevention_lets_waiting_task_run_eventually() {
        let mut sched = Scheduler::new();
        let reque_count = Rc::new(RefCell::new(0));
        let rc = reque_count.clone();
        // a task that immediately re-wakes itself every time it runs.
        let hog_ids: Rc<RefCell<Option<TaskId>>> = Rc::new(RefCell::new(None));
        let hog_ids2 = hog_ids.clone();
        let hog = sched.spawn(0, move |_| {
            *rc.borrow_mut() += 1;
            TaskResult::Keep
        });
        *hog_ids2.borrow_mut() = Some(hog);

        let victim_ran = Rc::new(RefCell::new(false));
        let vr = victim_ran.clone();
        let victim = sched.spawn(0, move |_| {
            *vr.borrow_mut() = true;
            TaskResult::Destroy
        });

        sched.wake_now(hog);
        sched.wake_now(victim);
        // dispatch hog once, then re-wake it; since epoch advanced, victim
        // (enqueued at an earlier epoch) must still run before hog's new entry.
        sched.run_once(1);
        sched.wake_now(hog);
        sched.run_once(1);
        assert!(*victim_ran.borrow(), "victim task starved by re-waking hog");
    }
}
