// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread cooperative scheduler.
//!
//! The run queue is a deque whose front is the running task. Control moves
//! only at suspension points: `schedule` rotates the caller to the back,
//! blocking removes it, `run` turns the caller into a driver that gets
//! control back whenever the queue drains. When every task of a scheduler
//! is blocked but something outside it can still wake one, the scheduler
//! goes idle: nobody holds the baton and the first task to be unblocked
//! takes it directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result, TaskFailure};
use crate::runtime::{Runtime, RuntimeInner};
use crate::task::{self, Entry, Interrupt, Outcome, TaskCore, TaskId, TaskState};

pub(crate) type SwitchCallback = Arc<dyn Fn(TaskId, TaskId) + Send + Sync>;

pub(crate) struct Scheduler {
    pub(crate) id: u64,
    runtime: Weak<RuntimeInner>,
    main: Arc<TaskCore>,
    idle: AtomicBool,
    state: Mutex<SchedState>,
}

struct SchedState {
    runnable: VecDeque<Arc<TaskCore>>,
    /// Baton holder. `None` while idle.
    current: Option<Arc<TaskCore>>,
    blocked: usize,
    /// Tasks blocked on something only another thread can complete.
    external_waits: usize,
    /// Callers of `run`, innermost last.
    drivers: Vec<Arc<TaskCore>>,
    /// Baton holder parked in `idle_wait`; kicked on unblock.
    idle_waiter: Option<Arc<TaskCore>>,
    callback: Option<SwitchCallback>,
    failures: VecDeque<TaskFailure>,
}

impl SchedState {
    fn detach(&mut self, id: TaskId) -> bool {
        match self.runnable.iter().position(|t| t.id == id) {
            Some(index) => {
                self.runnable.remove(index);
                true
            }
            None => false,
        }
    }

    /// Normal insertion goes to the back; priority insertion lands right
    /// after the running task.
    fn insert(&mut self, task: Arc<TaskCore>, normal: bool) {
        if normal {
            self.runnable.push_back(task);
        } else {
            let at = self.runnable.len().min(1);
            self.runnable.insert(at, task);
        }
    }

    /// Who gets the baton when `me` gives it up.
    fn next_after(&self, me: TaskId) -> Option<Arc<TaskCore>> {
        self.runnable
            .front()
            .cloned()
            .or_else(|| self.drivers.last().filter(|d| d.id != me).cloned())
    }

    fn is_current(&self, id: TaskId) -> bool {
        self.current.as_ref().is_some_and(|t| t.id == id)
    }
}

/// A completed baton transfer, finished outside the scheduler lock.
struct Handoff {
    next: Arc<TaskCore>,
    entry: Option<Entry>,
    notify: Option<(SwitchCallback, TaskId)>,
}

/// Marks the scheduler as waiting on something external for as long as
/// it lives.
pub(crate) struct ExternalWait {
    scheduler: Arc<Scheduler>,
}

impl Drop for ExternalWait {
    fn drop(&mut self) {
        let mut st = self.scheduler.state.lock();
        st.external_waits = st.external_waits.saturating_sub(1);
    }
}

impl Scheduler {
    /// Create the scheduler for a host thread and its main task.
    pub(crate) fn attach(runtime: &Runtime) -> Arc<Self> {
        let inner = runtime.inner();
        let id = inner.next_scheduler_id();
        let main_id = inner.next_task_id();
        let scheduler = Arc::new_cyclic(|weak| {
            let main = TaskCore::main(main_id, weak.clone());
            Scheduler {
                id,
                runtime: Arc::downgrade(inner),
                main: main.clone(),
                idle: AtomicBool::new(false),
                state: Mutex::new(SchedState {
                    runnable: VecDeque::from([main.clone()]),
                    current: Some(main),
                    blocked: 0,
                    external_waits: 0,
                    drivers: Vec::new(),
                    idle_waiter: None,
                    callback: None,
                    failures: VecDeque::new(),
                }),
            }
        });
        inner.register_scheduler(&scheduler);
        inner.track(&scheduler.main);
        debug!(scheduler = id, main = %main_id, "scheduler attached");
        scheduler
    }

    pub(crate) fn main_task(&self) -> &Arc<TaskCore> {
        &self.main
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Running task included.
    pub(crate) fn runnable_count(&self) -> usize {
        self.state.lock().runnable.len()
    }

    pub(crate) fn blocked_count(&self) -> usize {
        self.state.lock().blocked
    }

    pub(crate) fn set_callback(&self, callback: Option<SwitchCallback>) {
        self.state.lock().callback = callback;
    }

    pub(crate) fn external_wait(self: &Arc<Self>) -> ExternalWait {
        self.state.lock().external_waits += 1;
        ExternalWait {
            scheduler: self.clone(),
        }
    }

    /// Enqueue a freshly set up task at the back.
    pub(crate) fn append(&self, task: &Arc<TaskCore>) {
        let mut st = self.state.lock();
        task.set_state(TaskState::Runnable);
        st.runnable.push_back(task.clone());
        trace!(scheduler = self.id, task = %task.id, label = %task.label, "task scheduled");
    }

    /// Take `task` off the run queue and count it as blocked. The caller
    /// holds the lock of whatever the task is now queued on.
    pub(crate) fn block(&self, task: &Arc<TaskCore>) {
        let mut st = self.state.lock();
        st.detach(task.id);
        task.set_state(TaskState::Blocked);
        st.blocked += 1;
    }

    /// Put a blocked task back on the run queue. Returns false if it was
    /// not blocked.
    pub(crate) fn unblock(self: &Arc<Self>, task: &Arc<TaskCore>, normal: bool) -> bool {
        let mut st = self.state.lock();
        if task.state() != TaskState::Blocked {
            return false;
        }
        st.blocked = st.blocked.saturating_sub(1);

        // Woken between blocking and suspending: it still holds the baton.
        if st.is_current(task.id) {
            task.set_state(TaskState::Running);
            st.runnable.push_front(task.clone());
            return true;
        }

        task.set_state(TaskState::Runnable);
        st.insert(task.clone(), normal);
        if st.current.is_none() {
            if let Some(next) = st.runnable.front().cloned() {
                let handoff = self.hand_over(&mut st, &next);
                drop(st);
                trace!(scheduler = self.id, task = %next.id, "scheduler resumed from idle");
                self.complete(handoff);
            }
        } else if let Some(waiter) = &st.idle_waiter {
            waiter.parker.kick();
        }
        true
    }

    /// Rotate `me` to the back and run the new front.
    pub(crate) fn schedule(self: &Arc<Self>, me: &Arc<TaskCore>) -> Result<()> {
        let mut st = self.state.lock();
        if st.runnable.front().is_some_and(|t| t.id == me.id) {
            st.runnable.rotate_left(1);
        }
        match st.next_after(me.id) {
            Some(next) if next.id != me.id => {
                me.set_state(TaskState::Runnable);
                self.switch(st, me, next)
            }
            _ => {
                drop(st);
                me.take_interrupt()
            }
        }
    }

    /// Give up the baton after `block`. Returns when the task has been
    /// unblocked, with any interrupt delivered as an error.
    ///
    /// With nobody left to run, the scheduler goes idle if anything can
    /// still wake `me`: another busy scheduler, an outstanding completion,
    /// or a handle on its wait site held outside the blocked waiters.
    /// Otherwise the wait is a deadlock.
    pub(crate) fn suspend(self: &Arc<Self>, me: &Arc<TaskCore>) -> Result<()> {
        let reachable = me.wait_reachable();
        let mut st = self.state.lock();
        if me.state() != TaskState::Blocked {
            drop(st);
            return me.take_interrupt();
        }
        if let Some(next) = st.next_after(me.id) {
            return self.switch(st, me, next);
        }
        if reachable || self.wakeable(&st) {
            st.current = None;
            self.idle.store(true, Ordering::Release);
            me.parker.release();
            drop(st);
            trace!(scheduler = self.id, task = %me.id, "scheduler idle");
            me.parker.wait_turn();
            return me.take_interrupt();
        }

        st.blocked = st.blocked.saturating_sub(1);
        me.set_state(TaskState::Running);
        st.runnable.push_front(me.clone());
        drop(st);
        warn!(scheduler = self.id, task = %me.id, label = %me.label, "deadlock detected");
        Err(Error::Deadlock)
    }

    /// Yield once, or park up to `limit` when `me` is the only runnable
    /// task. Used by the timer driver while its next deadline is ahead.
    pub(crate) fn pause(self: &Arc<Self>, me: &Arc<TaskCore>, limit: Duration) -> Result<()> {
        let mut st = self.state.lock();
        let alone = st.runnable.len() == 1 && st.runnable.front().is_some_and(|t| t.id == me.id);
        if !alone {
            drop(st);
            return self.schedule(me);
        }
        st.idle_waiter = Some(me.clone());
        drop(st);
        me.parker.idle_wait(limit);
        self.clear_idle_waiter(me.id);
        me.take_interrupt()
    }

    /// Drive the run queue until it drains. Surfaces the first unhandled
    /// task failure.
    pub(crate) fn run(self: &Arc<Self>, me: &Arc<TaskCore>, poll: Duration) -> Result<()> {
        {
            let mut st = self.state.lock();
            st.detach(me.id);
            st.drivers.push(me.clone());
        }
        let pumped = self.pump(me, poll);

        let mut st = self.state.lock();
        if let Some(at) = st.drivers.iter().rposition(|d| d.id == me.id) {
            st.drivers.remove(at);
        }
        me.set_state(TaskState::Running);
        st.runnable.push_front(me.clone());
        let failure = st.failures.pop_front();
        drop(st);

        pumped?;
        match failure {
            Some(failure) => Err(Error::TaskFailed(Box::new(failure))),
            None => Ok(()),
        }
    }

    fn pump(self: &Arc<Self>, me: &Arc<TaskCore>, poll: Duration) -> Result<()> {
        loop {
            let mut st = self.state.lock();
            if !st.failures.is_empty() {
                return Ok(());
            }
            if let Some(next) = st.runnable.front().cloned() {
                me.set_state(TaskState::Runnable);
                self.switch(st, me, next)?;
            } else if st.external_waits > 0 {
                st.idle_waiter = Some(me.clone());
                drop(st);
                me.parker.idle_wait(poll);
                self.clear_idle_waiter(me.id);
                me.take_interrupt()?;
            } else {
                return Ok(());
            }
        }
    }

    /// Final step of every task: leave the queue and pass the baton on.
    /// Unhandled failures go straight to the innermost driver.
    pub(crate) fn retire(self: &Arc<Self>, runtime: &Runtime, me: &Arc<TaskCore>, outcome: Outcome) {
        let mut failure = outcome.into_failure(me);
        if let Some(f) = failure.take() {
            match runtime.inner().failure_handler() {
                Some(handler) => handler(&f),
                None => {
                    error!(task = %f.task, label = %f.label, "unhandled task failure: {}", f);
                    failure = Some(f);
                }
            }
        }

        let main_reachable = self.main.wait_reachable();
        let mut st = self.state.lock();
        st.detach(me.id);
        me.set_state(TaskState::Dead);
        if st.idle_waiter.as_ref().is_some_and(|t| t.id == me.id) {
            st.idle_waiter = None;
        }
        let next = match failure {
            Some(f) => {
                st.failures.push_back(f);
                st.drivers
                    .last()
                    .cloned()
                    .or_else(|| st.next_after(me.id))
            }
            None => st.next_after(me.id),
        };

        match next {
            Some(next) => {
                let handoff = self.hand_over(&mut st, &next);
                drop(st);
                self.complete(handoff);
            }
            None => {
                st.current = None;
                self.idle.store(true, Ordering::Release);
                let stuck = self.main.state() == TaskState::Blocked
                    && !main_reachable
                    && !self.wakeable(&st);
                drop(st);
                if stuck {
                    self.break_deadlock();
                }
            }
        }
    }

    /// Cancel a task owned by this scheduler.
    pub(crate) fn kill(self: &Arc<Self>, runtime: &Runtime, task: &Arc<TaskCore>) {
        {
            let mut st = self.state.lock();
            if task.state() == TaskState::Dead {
                return;
            }
            // Never started: no thread to unwind, discard it here.
            if let Some(entry) = task.take_entry() {
                st.detach(task.id);
                task.set_state(TaskState::Dead);
                drop(st);
                drop(entry);
                runtime.inner().task_exited(task, &Outcome::Cancelled);
                debug!(scheduler = self.id, task = %task.id, "killed before first run");
                return;
            }
        }

        task.set_interrupt(Interrupt::Cancelled);
        if let Some(site) = task.take_wait_site() {
            site.withdraw(task.id);
        }
        if !self.unblock(task, false) {
            self.hurry(task);
            task.parker.kick();
        }
        debug!(scheduler = self.id, task = %task.id, "kill delivered");
    }

    /// Move a runnable task right behind the running one.
    fn hurry(&self, task: &Arc<TaskCore>) {
        let mut st = self.state.lock();
        if task.state() == TaskState::Runnable && !st.is_current(task.id) && st.detach(task.id) {
            st.insert(task.clone(), false);
        }
    }

    /// The host thread is going away. Its main task retires; the other
    /// tasks keep the scheduler alive.
    pub(crate) fn detach_host(self: &Arc<Self>, runtime: &Runtime) {
        let main = self.main.clone();
        if main.state() == TaskState::Dead {
            return;
        }
        runtime.inner().task_exited(&main, &Outcome::Finished);
        self.retire(runtime, &main, Outcome::Finished);
        debug!(scheduler = self.id, "host thread detached");
    }

    /// The host thread exited while still bound. Runs from a thread-local
    /// destructor, so it must not log, spawn, or run user callbacks: the
    /// main task is dropped without notifying its links and the baton goes
    /// to the next task only if that task already has a thread.
    pub(crate) fn abandon(&self, runtime: &Runtime) {
        let main = self.main.clone();
        if main.state() == TaskState::Dead {
            return;
        }
        runtime.inner().forget_task(main.id);
        let mut st = self.state.lock();
        st.detach(main.id);
        main.set_state(TaskState::Dead);
        if !st.is_current(main.id) {
            return;
        }
        match st.runnable.front().filter(|next| !next.has_entry()).cloned() {
            Some(next) => {
                st.current = Some(next.clone());
                next.set_state(TaskState::Running);
                drop(st);
                next.parker.grant();
            }
            None => {
                // A queued task that never ran starts on the next unblock.
                st.current = None;
                self.idle.store(true, Ordering::Release);
            }
        }
    }

    fn switch(
        self: &Arc<Self>,
        mut st: MutexGuard<'_, SchedState>,
        me: &Arc<TaskCore>,
        next: Arc<TaskCore>,
    ) -> Result<()> {
        let handoff = self.hand_over(&mut st, &next);
        me.parker.release();
        drop(st);
        trace!(scheduler = self.id, from = %me.id, to = %next.id, "switch");
        self.complete(handoff);
        me.parker.wait_turn();
        me.take_interrupt()
    }

    fn hand_over(&self, st: &mut SchedState, next: &Arc<TaskCore>) -> Handoff {
        let prev = st.current.replace(next.clone()).map(|t| t.id);
        self.idle.store(false, Ordering::Release);
        next.set_state(TaskState::Running);
        let notify = match (prev, &st.callback) {
            (Some(prev), Some(cb)) if prev != next.id => Some((cb.clone(), prev)),
            _ => None,
        };
        Handoff {
            next: next.clone(),
            entry: next.take_entry(),
            notify,
        }
    }

    fn complete(self: &Arc<Self>, handoff: Handoff) {
        let Handoff { next, entry, notify } = handoff;
        if let Some((cb, prev)) = notify {
            cb(prev, next.id);
        }
        next.parker.grant();
        let Some(entry) = entry else {
            return;
        };
        let launched = match self.runtime.upgrade() {
            Some(inner) => {
                let runtime = Runtime::from_inner(inner);
                task::launch(runtime.clone(), self.clone(), next.clone(), entry)
                    .map_err(|err| (runtime, err))
            }
            None => {
                drop(entry);
                next.set_state(TaskState::Dead);
                return;
            }
        };
        if let Err((runtime, err)) = launched {
            error!(scheduler = self.id, task = %next.id, %err, "failed to launch task thread");
            let outcome = Outcome::Failed(err);
            runtime.inner().task_exited(&next, &outcome);
            self.retire(&runtime, &next, outcome);
        }
    }

    /// Could anything outside this scheduler's switch graph still wake one
    /// of its tasks?
    fn wakeable(&self, st: &SchedState) -> bool {
        st.external_waits > 0
            || self
                .runtime
                .upgrade()
                .is_some_and(|inner| inner.can_wake(self.id))
    }

    fn clear_idle_waiter(&self, id: TaskId) {
        let mut st = self.state.lock();
        if st.idle_waiter.as_ref().is_some_and(|t| t.id == id) {
            st.idle_waiter = None;
        }
    }

    fn break_deadlock(self: &Arc<Self>) {
        let main = self.main.clone();
        warn!(scheduler = self.id, task = %main.id, "main task can never be woken; raising deadlock");
        main.set_interrupt(Interrupt::Deadlock);
        if let Some(site) = main.take_wait_site() {
            site.withdraw(main.id);
        }
        self.unblock(&main, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(id: u64) -> Arc<TaskCore> {
        TaskCore::new(TaskId(id), format!("t{id}"))
    }

    fn state_with(ids: &[u64]) -> SchedState {
        SchedState {
            runnable: ids.iter().map(|&id| core(id)).collect(),
            current: None,
            blocked: 0,
            external_waits: 0,
            drivers: Vec::new(),
            idle_waiter: None,
            callback: None,
            failures: VecDeque::new(),
        }
    }

    fn ids(st: &SchedState) -> Vec<u64> {
        st.runnable.iter().map(|t| t.id.0).collect()
    }

    #[test]
    fn priority_insert_lands_after_running_task() {
        let mut st = state_with(&[1, 2, 3]);
        st.insert(core(9), false);
        assert_eq!(ids(&st), vec![1, 9, 2, 3]);
        st.insert(core(8), true);
        assert_eq!(ids(&st), vec![1, 9, 2, 3, 8]);
    }

    #[test]
    fn priority_insert_into_empty_queue() {
        let mut st = state_with(&[]);
        st.insert(core(4), false);
        assert_eq!(ids(&st), vec![4]);
    }

    #[test]
    fn next_falls_back_to_innermost_driver() {
        let mut st = state_with(&[]);
        st.drivers.push(core(1));
        st.drivers.push(core(2));
        assert_eq!(st.next_after(TaskId(5)).map(|t| t.id.0), Some(2));
        assert!(st.next_after(TaskId(2)).is_none());

        st.runnable.push_back(core(7));
        assert_eq!(st.next_after(TaskId(5)).map(|t| t.id.0), Some(7));
    }

    #[test]
    fn detach_removes_only_the_named_task() {
        let mut st = state_with(&[1, 2, 3]);
        assert!(st.detach(TaskId(2)));
        assert!(!st.detach(TaskId(2)));
        assert_eq!(ids(&st), vec![1, 3]);
    }
}
