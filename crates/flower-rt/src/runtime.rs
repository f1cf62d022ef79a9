// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The runtime context object.
//!
//! A `Runtime` owns everything that would otherwise be process-wide: id
//! counters, the task and actor arenas, the timer heap and the name
//! registry. Handles are cheap to clone and several runtimes can coexist
//! in one process; a thread may only be bound to one of them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::actor::{self, ActorCell, ActorRef, Destination, ExitReason, Mailbox, Message, Registry};
use crate::bridge::{self, Completer, Completion};
use crate::channel::Channel;
use crate::config::Config;
use crate::context::{self, EnterGuard};
use crate::error::{Result, TaskFailure};
use crate::scheduler::{Scheduler, SwitchCallback};
use crate::task::{Outcome, Task, TaskCore, TaskId, TaskState};
use crate::time::{self, Ticker};
use crate::timer::{Timer, TimerQueue};

/// Receives task failures instead of having them abort `run()`.
pub type FailureHandler = Arc<dyn Fn(&TaskFailure) + Send + Sync>;

static RUNTIME_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) struct RuntimeInner {
    id: u64,
    config: Config,
    task_ids: AtomicU64,
    ref_ids: AtomicU64,
    scheduler_ids: AtomicU64,
    tasks: Mutex<HashMap<TaskId, Arc<TaskCore>>>,
    actors: Mutex<HashMap<TaskId, Arc<ActorCell>>>,
    schedulers: Mutex<Vec<Weak<Scheduler>>>,
    pub(crate) timers: TimerQueue,
    pub(crate) registry: Registry,
    completions: AtomicUsize,
    failure_handler: Mutex<Option<FailureHandler>>,
}

impl RuntimeInner {
    pub(crate) fn next_task_id(&self) -> TaskId {
        TaskId(self.task_ids.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_scheduler_id(&self) -> u64 {
        self.scheduler_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_scheduler(&self, scheduler: &Arc<Scheduler>) {
        let mut schedulers = self.schedulers.lock();
        schedulers.retain(|s| s.strong_count() > 0);
        schedulers.push(Arc::downgrade(scheduler));
    }

    /// Is some scheduler other than `except` busy, or some completion
    /// still outstanding?
    pub(crate) fn can_wake(&self, except: u64) -> bool {
        if self.completions.load(Ordering::Acquire) > 0 {
            return true;
        }
        self.schedulers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .any(|s| s.id != except && !s.is_idle())
    }

    pub(crate) fn track(&self, task: &Arc<TaskCore>) {
        self.tasks.lock().insert(task.id, task.clone());
    }

    /// Drop a finished task from the arenas and tell its links.
    pub(crate) fn task_exited(self: &Arc<Self>, task: &Arc<TaskCore>, outcome: &Outcome) {
        self.tasks.lock().remove(&task.id);
        let cell = self.actors.lock().remove(&task.id);
        if let Some(cell) = cell {
            let runtime = Runtime::from_inner(self.clone());
            actor::notify_exit(&runtime, &cell, ExitReason::from_outcome(outcome));
        }
    }

    pub(crate) fn failure_handler(&self) -> Option<FailureHandler> {
        self.failure_handler.lock().clone()
    }

    pub(crate) fn actor(&self, task: TaskId) -> Option<Arc<ActorCell>> {
        self.actors.lock().get(&task).cloned()
    }

    /// The actor wrapping `task`, created on first use.
    pub(crate) fn adopt(self: &Arc<Self>, runtime: &Runtime, task: &Arc<TaskCore>) -> Arc<ActorCell> {
        let mut actors = self.actors.lock();
        if let Some(cell) = actors.get(&task.id) {
            return cell.clone();
        }
        let ref_id = self.ref_ids.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(ActorCell::new(
            ActorRef::new(ref_id, task.id, self),
            Mailbox::new(runtime),
        ));
        actors.insert(task.id, cell.clone());
        cell
    }

    pub(crate) fn forget_actor(&self, task: TaskId) {
        self.actors.lock().remove(&task);
    }

    /// Drop a task from the arenas without telling anyone.
    pub(crate) fn forget_task(&self, task: TaskId) {
        self.tasks.lock().remove(&task);
        self.actors.lock().remove(&task);
    }

    pub(crate) fn completion_opened(&self) {
        self.completions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn completion_settled(&self) {
        self.completions.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("live_tasks", &self.live_tasks())
            .field("pending_timers", &self.pending_timers())
            .finish()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                id: RUNTIME_IDS.fetch_add(1, Ordering::Relaxed),
                config,
                task_ids: AtomicU64::new(1),
                ref_ids: AtomicU64::new(1),
                scheduler_ids: AtomicU64::new(1),
                tasks: Mutex::new(HashMap::new()),
                actors: Mutex::new(HashMap::new()),
                schedulers: Mutex::new(Vec::new()),
                timers: TimerQueue::new(),
                registry: Registry::new(),
                completions: AtomicUsize::new(0),
                failure_handler: Mutex::new(None),
            }),
        }
    }

    /// Runtime configured from `FLOWER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(Config::from_env()?))
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    pub(crate) fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Bind the calling thread now instead of on first use. Dropping the
    /// guard detaches the thread: its main task exits, linked actors are
    /// told, and the thread's remaining tasks keep running without it.
    pub fn enter(&self) -> Result<EnterGuard> {
        context::enter(self)
    }

    // ---- tasks -----------------------------------------------------------

    /// An unbound task; see `Task::bind` and `Task::setup`.
    pub fn task(&self) -> Task {
        Task::new(self)
    }

    /// Create a task running `f` and queue it on this thread's scheduler.
    pub fn spawn<F>(&self, f: F) -> Result<Task>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.spawn_named("task", f)
    }

    pub fn spawn_named<F>(&self, label: impl Into<String>, f: F) -> Result<Task>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let task = Task::named(self, label);
        task.bind(f)?;
        task.setup()?;
        Ok(task)
    }

    /// Let the other runnable tasks of this thread run once.
    pub fn schedule(&self) -> Result<()> {
        let ctx = context::current(self)?;
        ctx.scheduler.schedule(&ctx.task)
    }

    /// Run this thread's tasks until none is runnable. While tasks wait on
    /// external completions the call keeps polling. Returns
    /// `Err(Error::TaskFailed)` for a task failure no handler took.
    pub fn run(&self) -> Result<()> {
        let ctx = context::current(self)?;
        ctx.scheduler.run(&ctx.task, self.inner.config.poll_interval)
    }

    /// Kill every other task of this thread's scheduler and run until
    /// they have unwound.
    pub fn shutdown(&self) -> Result<()> {
        let ctx = context::current(self)?;
        let victims: Vec<Arc<TaskCore>> = self
            .inner
            .tasks
            .lock()
            .values()
            .filter(|t| !t.is_main && t.id != ctx.task.id)
            .filter(|t| t.scheduler().is_some_and(|s| Arc::ptr_eq(&s, &ctx.scheduler)))
            .cloned()
            .collect();
        for core in victims {
            Task::from_core(self, core).kill()?;
        }
        self.run()
    }

    pub fn current_task(&self) -> Result<Task> {
        let ctx = context::current(self)?;
        Ok(Task::from_core(self, ctx.task))
    }

    /// The task standing for this thread.
    pub fn main_task(&self) -> Result<Task> {
        let ctx = context::current(self)?;
        Ok(Task::from_core(self, ctx.scheduler.main_task().clone()))
    }

    /// Runnable tasks on this thread, the running one included.
    pub fn runnable_count(&self) -> Result<usize> {
        Ok(context::current(self)?.scheduler.runnable_count())
    }

    pub fn blocked_count(&self) -> Result<usize> {
        Ok(context::current(self)?.scheduler.blocked_count())
    }

    /// Tasks set up and not yet dead, across all threads. Each bound host
    /// thread counts one.
    pub fn live_tasks(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .values()
            .filter(|t| t.state() != TaskState::Dead)
            .count()
    }

    /// Call `f(previous, next)` on every switch of this thread's scheduler.
    pub fn set_switch_callback<F>(&self, f: F) -> Result<()>
    where
        F: Fn(TaskId, TaskId) + Send + Sync + 'static,
    {
        let callback: SwitchCallback = Arc::new(f);
        context::current(self)?.scheduler.set_callback(Some(callback));
        Ok(())
    }

    pub fn clear_switch_callback(&self) -> Result<()> {
        context::current(self)?.scheduler.set_callback(None);
        Ok(())
    }

    pub fn set_failure_handler<F>(&self, f: F)
    where
        F: Fn(&TaskFailure) + Send + Sync + 'static,
    {
        *self.inner.failure_handler.lock() = Some(Arc::new(f));
    }

    pub fn clear_failure_handler(&self) {
        *self.inner.failure_handler.lock() = None;
    }

    // ---- channels --------------------------------------------------------

    pub fn channel<T: Send + 'static>(&self) -> Channel<T> {
        Channel::new(self)
    }

    pub fn buffered_channel<T: Send + 'static>(&self, capacity: usize) -> Channel<T> {
        Channel::with_capacity(self, capacity)
    }

    // ---- time ------------------------------------------------------------

    /// Suspend the calling task for at least `duration`.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        time::sleep(self, duration)
    }

    /// A channel that receives the firing instant once, after `delay`.
    pub fn after(&self, delay: Duration) -> Result<Channel<Instant>> {
        time::after(self, delay)
    }

    pub fn tick(&self, period: Duration) -> Result<Ticker> {
        time::tick(self, period)
    }

    pub fn timer<F>(&self, callback: F) -> Timer
    where
        F: FnMut(Instant) + Send + 'static,
    {
        Timer::new(self, callback)
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.timers.pending()
    }

    // ---- external completions --------------------------------------------

    pub fn completion<T: Send + 'static>(&self) -> (Completer<T>, Completion<T>) {
        bridge::pair(self)
    }

    // ---- actors ----------------------------------------------------------

    pub fn spawn_actor<F>(&self, f: F) -> Result<ActorRef>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        actor::spawn(self, "actor", f, None, None)
    }

    pub fn spawn_actor_named<F>(&self, label: &str, f: F) -> Result<ActorRef>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        actor::spawn(self, label, f, None, None)
    }

    /// Spawn an actor linked both ways with the calling task.
    pub fn spawn_link<F>(&self, f: F) -> Result<ActorRef>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let me = actor::self_ref(self)?;
        actor::spawn(self, "actor", f, Some(me), None)
    }

    /// The ref is usable at once; the task starts after `delay`. Messages
    /// sent before then wait in its mailbox.
    pub fn spawn_actor_after<F>(&self, delay: Duration, f: F) -> Result<ActorRef>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        actor::spawn(self, "actor", f, None, Some(delay))
    }

    /// Never blocks. Messages to exited actors are dropped.
    pub fn send<M: Any + Send>(&self, dest: impl Into<Destination>, msg: M) -> Result<()> {
        actor::send(self, dest.into(), msg)
    }

    pub fn send_after<M: Any + Send>(
        &self,
        delay: Duration,
        dest: impl Into<Destination>,
        msg: M,
    ) -> Result<Timer> {
        actor::send_after(self, delay, dest.into(), msg)
    }

    /// Next message for the calling task.
    pub fn receive(&self) -> Result<Message> {
        actor::receive(self)
    }

    pub fn self_ref(&self) -> Result<ActorRef> {
        actor::self_ref(self)
    }

    pub fn link(&self, peer: &ActorRef) -> Result<()> {
        actor::link(self, peer)
    }

    pub fn unlink(&self, peer: &ActorRef) -> Result<()> {
        actor::unlink(self, peer)
    }

    /// Actors linked with the calling task.
    pub fn links(&self) -> Result<Vec<ActorRef>> {
        actor::links(self)
    }

    pub fn mailbox_of(&self, aref: &ActorRef) -> Option<Mailbox> {
        self.inner
            .actor(aref.task_id())
            .filter(|cell| cell.aref == *aref)
            .map(|cell| cell.mailbox.clone())
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn register(&self, name: &str, aref: &ActorRef) -> Result<()> {
        self.inner.registry.register(name, aref)
    }

    pub fn unregister(&self, key: impl Into<actor::RegistryKey>) {
        self.inner.registry.unregister(key)
    }

    pub fn lookup(&self, name: &str) -> Option<ActorRef> {
        self.inner.registry.lookup(name)
    }
}

