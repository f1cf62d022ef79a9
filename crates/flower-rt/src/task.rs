// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackful task representation.
//!
//! Each task runs on its own OS thread, launched the first time the
//! scheduler switches to it. Threads that do not hold their scheduler's
//! baton are parked on their `Parker`, so exactly one task per scheduler
//! executes at a time and every task keeps a real call stack it can
//! suspend from at any depth.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::context::{self, Context};
use crate::error::{Error, FailureReason, Result, TaskFailure};
use crate::runtime::Runtime;
use crate::scheduler::Scheduler;

/// Stable task identifier, unique within a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet set up.
    New,
    /// In its scheduler's run queue, waiting for the baton.
    Runnable,
    /// Holding the baton.
    Running,
    /// Parked on a channel, timer or completion.
    Blocked,
    /// Returned, failed or killed.
    Dead,
}

/// Signal delivered at the next suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Cancelled,
    Deadlock,
}

impl Interrupt {
    fn into_error(self) -> Error {
        match self {
            Interrupt::Cancelled => Error::Cancelled,
            Interrupt::Deadlock => Error::Deadlock,
        }
    }
}

/// Something a blocked task is queued on. `kill` uses it to pull the
/// task out before waking it.
pub(crate) trait WaitSite: Send + Sync {
    /// Drop the waiter entry of `task`. Returns false if it had already
    /// been matched.
    fn withdraw(&self, task: TaskId) -> bool;

    /// Could a handle held by someone other than the blocked waiters
    /// still complete a wait here?
    fn reachable(&self) -> bool {
        false
    }
}

pub(crate) type Entry = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Baton handoff between task threads.
pub(crate) struct Parker {
    state: Mutex<ParkState>,
    cond: Condvar,
}

struct ParkState {
    turn: bool,
    kicked: bool,
}

impl Parker {
    fn new(turn: bool) -> Self {
        Self {
            state: Mutex::new(ParkState {
                turn,
                kicked: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn grant(&self) {
        let mut st = self.state.lock();
        st.turn = true;
        self.cond.notify_one();
    }

    pub(crate) fn release(&self) {
        self.state.lock().turn = false;
    }

    pub(crate) fn wait_turn(&self) {
        let mut st = self.state.lock();
        while !st.turn {
            self.cond.wait(&mut st);
        }
    }

    /// Wake an `idle_wait` early. Sticky until consumed.
    pub(crate) fn kick(&self) {
        let mut st = self.state.lock();
        st.kicked = true;
        self.cond.notify_one();
    }

    /// Park while holding the baton, until kicked or `limit` elapses.
    pub(crate) fn idle_wait(&self, limit: Duration) {
        let deadline = Instant::now() + limit;
        let mut st = self.state.lock();
        while !st.kicked {
            if self.cond.wait_until(&mut st, deadline).timed_out() {
                break;
            }
        }
        st.kicked = false;
    }
}

struct Status {
    state: TaskState,
    interrupt: Option<Interrupt>,
    wait_site: Option<Arc<dyn WaitSite>>,
}

/// Scheduler-side task object, shared by the run queue, waiter queues
/// and `Task` handles.
pub(crate) struct TaskCore {
    pub(crate) id: TaskId,
    pub(crate) label: String,
    pub(crate) is_main: bool,
    scheduler: OnceLock<Weak<Scheduler>>,
    status: Mutex<Status>,
    entry: Mutex<Option<Entry>>,
    pub(crate) parker: Parker,
}

impl fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

impl TaskCore {
    pub(crate) fn new(id: TaskId, label: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            label,
            is_main: false,
            scheduler: OnceLock::new(),
            status: Mutex::new(Status {
                state: TaskState::New,
                interrupt: None,
                wait_site: None,
            }),
            entry: Mutex::new(None),
            parker: Parker::new(false),
        })
    }

    /// The task standing for a host thread. It already runs and holds
    /// the baton.
    pub(crate) fn main(id: TaskId, scheduler: Weak<Scheduler>) -> Arc<Self> {
        let lock = OnceLock::new();
        let _ = lock.set(scheduler);
        Arc::new(Self {
            id,
            label: "main".to_string(),
            is_main: true,
            scheduler: lock,
            status: Mutex::new(Status {
                state: TaskState::Running,
                interrupt: None,
                wait_site: None,
            }),
            entry: Mutex::new(None),
            parker: Parker::new(true),
        })
    }

    pub(crate) fn state(&self) -> TaskState {
        self.status.lock().state
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.status.lock().state = state;
    }

    pub(crate) fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.get().and_then(Weak::upgrade)
    }

    /// Record the owning scheduler. Fails if one was already assigned.
    pub(crate) fn assign(&self, scheduler: &Arc<Scheduler>) -> bool {
        self.scheduler.set(Arc::downgrade(scheduler)).is_ok()
    }

    pub(crate) fn set_interrupt(&self, interrupt: Interrupt) {
        let mut st = self.status.lock();
        if st.interrupt.is_none() || interrupt == Interrupt::Cancelled {
            st.interrupt = Some(interrupt);
        }
    }

    /// Consume a pending interrupt as an error.
    pub(crate) fn take_interrupt(&self) -> Result<()> {
        match self.status.lock().interrupt.take() {
            Some(interrupt) => Err(interrupt.into_error()),
            None => Ok(()),
        }
    }

    pub(crate) fn set_wait_site(&self, site: Option<Arc<dyn WaitSite>>) {
        self.status.lock().wait_site = site;
    }

    pub(crate) fn take_wait_site(&self) -> Option<Arc<dyn WaitSite>> {
        self.status.lock().wait_site.take()
    }

    /// Whether the site this task is blocked on can still be reached from
    /// outside its waiters. Call without holding any channel or scheduler
    /// lock.
    pub(crate) fn wait_reachable(&self) -> bool {
        let site = self.status.lock().wait_site.clone();
        site.is_some_and(|site| site.reachable())
    }

    pub(crate) fn has_entry(&self) -> bool {
        self.entry.lock().is_some()
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.lock().take()
    }

    fn put_entry(&self, entry: Entry) {
        *self.entry.lock() = Some(entry);
    }
}

/// How a task's entry ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Finished,
    Cancelled,
    Failed(Error),
    Panicked(String),
}

impl Outcome {
    fn from_result(result: thread::Result<Result<()>>) -> Self {
        match result {
            Ok(Ok(())) => Outcome::Finished,
            Ok(Err(err)) => Outcome::from_error(err),
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Outcome::Panicked(msg)
            }
        }
    }

    fn from_error(err: Error) -> Self {
        if err.is_cancelled() {
            Outcome::Cancelled
        } else {
            Outcome::Failed(err)
        }
    }

    pub(crate) fn into_failure(self, core: &TaskCore) -> Option<TaskFailure> {
        let reason = match self {
            Outcome::Finished | Outcome::Cancelled => return None,
            Outcome::Failed(err) => FailureReason::Error(err),
            Outcome::Panicked(msg) => FailureReason::Panic(msg),
        };
        Some(TaskFailure {
            task: core.id,
            label: core.label.clone(),
            reason,
        })
    }
}

/// Start the thread backing `core`. Its parker already holds the turn.
pub(crate) fn launch(
    runtime: Runtime,
    scheduler: Arc<Scheduler>,
    core: Arc<TaskCore>,
    entry: Entry,
) -> Result<()> {
    let config = runtime.config();
    let mut builder =
        thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, core.id.0));
    if let Some(bytes) = config.stack_size {
        builder = builder.stack_size(bytes);
    }
    builder.spawn(move || trampoline(runtime, scheduler, core, entry))?;
    Ok(())
}

/// Runs the entry and then unconditionally tears the task down.
fn trampoline(runtime: Runtime, scheduler: Arc<Scheduler>, core: Arc<TaskCore>, entry: Entry) {
    core.parker.wait_turn();
    context::enter_task(Context {
        runtime: runtime.clone(),
        scheduler: scheduler.clone(),
        task: core.clone(),
    });
    trace!(task = %core.id, label = %core.label, "task started");

    let outcome = match core.take_interrupt() {
        // Killed between launch and first turn.
        Err(err) => {
            drop(entry);
            Outcome::from_error(err)
        }
        Ok(()) => Outcome::from_result(panic::catch_unwind(AssertUnwindSafe(entry))),
    };

    context::leave_task();
    trace!(task = %core.id, ?outcome, "task finished");
    runtime.inner().task_exited(&core, &outcome);
    scheduler.retire(&runtime, &core, outcome);
}

/// Handle to a task.
///
/// Cloning the handle does not clone the task.
#[derive(Clone)]
pub struct Task {
    pub(crate) core: Arc<TaskCore>,
    pub(crate) runtime: Runtime,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("label", &self.core.label)
            .field("state", &self.core.state())
            .finish()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Task {}

impl Task {
    /// Create an unbound task.
    pub fn new(runtime: &Runtime) -> Self {
        Self::named(runtime, "task")
    }

    pub fn named(runtime: &Runtime, label: impl Into<String>) -> Self {
        let id = runtime.inner().next_task_id();
        Self {
            core: TaskCore::new(id, label.into()),
            runtime: runtime.clone(),
        }
    }

    pub(crate) fn from_core(runtime: &Runtime, core: Arc<TaskCore>) -> Self {
        Self {
            core,
            runtime: runtime.clone(),
        }
    }

    /// Attach the function the task will run. Rebinding replaces the
    /// previous function; both are only legal before `setup`.
    pub fn bind<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.core.state() != TaskState::New {
            return Err(Error::AlreadySetup(self.core.id));
        }
        self.core.put_entry(Box::new(f));
        Ok(())
    }

    /// Make the task runnable on the calling thread's scheduler.
    pub fn setup(&self) -> Result<()> {
        let ctx = context::current(&self.runtime)?;
        if self.core.state() != TaskState::New {
            return Err(Error::AlreadySetup(self.core.id));
        }
        if !self.core.has_entry() {
            return Err(Error::Unbound);
        }
        if !self.core.assign(&ctx.scheduler) {
            return Err(Error::AlreadySetup(self.core.id));
        }
        self.runtime.inner().track(&self.core);
        ctx.scheduler.append(&self.core);
        Ok(())
    }

    /// Cancel the task. It observes `Error::Cancelled` at its next
    /// suspension point and is queued right behind the running task so
    /// it unwinds promptly. Killing the calling task returns
    /// `Err(Error::Cancelled)` straight away.
    pub fn kill(&self) -> Result<()> {
        if context::current_task_id(&self.runtime) == Some(self.core.id) {
            return Err(Error::Cancelled);
        }
        match self.core.state() {
            TaskState::Dead => return Ok(()),
            TaskState::New => {
                self.core.set_state(TaskState::Dead);
                drop(self.core.take_entry());
                self.runtime.inner().task_exited(&self.core, &Outcome::Cancelled);
                debug!(task = %self.core.id, "killed before setup");
                return Ok(());
            }
            _ => {}
        }
        match self.core.scheduler() {
            Some(scheduler) => scheduler.kill(&self.runtime, &self.core),
            None => self.core.set_state(TaskState::Dead),
        }
        Ok(())
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn label(&self) -> &str {
        &self.core.label
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Set up and not yet dead.
    pub fn is_alive(&self) -> bool {
        !matches!(self.core.state(), TaskState::New | TaskState::Dead)
    }

    pub fn is_blocked(&self) -> bool {
        self.core.state() == TaskState::Blocked
    }

    /// Whether this task stands for a host thread.
    pub fn is_main(&self) -> bool {
        self.core.is_main
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_is_delivered_once() {
        let core = TaskCore::new(TaskId(1), "t".into());
        core.set_interrupt(Interrupt::Cancelled);
        assert!(matches!(core.take_interrupt(), Err(Error::Cancelled)));
        assert!(core.take_interrupt().is_ok());
    }

    #[test]
    fn cancellation_overrides_deadlock() {
        let core = TaskCore::new(TaskId(1), "t".into());
        core.set_interrupt(Interrupt::Deadlock);
        core.set_interrupt(Interrupt::Cancelled);
        assert!(matches!(core.take_interrupt(), Err(Error::Cancelled)));

        core.set_interrupt(Interrupt::Cancelled);
        core.set_interrupt(Interrupt::Deadlock);
        assert!(matches!(core.take_interrupt(), Err(Error::Cancelled)));
    }

    #[test]
    fn outcome_classification() {
        let core = TaskCore::new(TaskId(3), "w".into());
        assert!(Outcome::from_result(Ok(Ok(()))).into_failure(&core).is_none());
        assert!(Outcome::from_result(Ok(Err(Error::Cancelled)))
            .into_failure(&core)
            .is_none());

        let failure = Outcome::from_result(Ok(Err(Error::ChannelClosed)))
            .into_failure(&core)
            .unwrap();
        assert_eq!(failure.task, TaskId(3));
        assert!(matches!(failure.reason, FailureReason::Error(Error::ChannelClosed)));

        let panicked = panic::catch_unwind(|| -> Result<()> { panic!("kaboom") });
        match Outcome::from_result(panicked) {
            Outcome::Panicked(msg) => assert_eq!(msg, "kaboom"),
            other => panic!("expected panic outcome, got {:?}", other),
        }
    }

    #[test]
    fn parker_kick_is_sticky() {
        let parker = Parker::new(true);
        parker.kick();
        let start = Instant::now();
        parker.idle_wait(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn parker_idle_wait_times_out() {
        let parker = Parker::new(true);
        let start = Instant::now();
        parker.idle_wait(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn parker_hands_turn_across_threads() {
        let parker = Arc::new(Parker::new(false));
        let remote = parker.clone();
        let handle = thread::spawn(move || {
            remote.wait_turn();
            42
        });
        parker.grant();
        assert_eq!(handle.join().unwrap(), 42);
    }
}
