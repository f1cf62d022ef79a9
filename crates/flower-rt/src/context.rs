// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-thread binding to a runtime.
//!
//! Every OS thread that touches a runtime is bound to exactly one
//! scheduler. Host threads get a fresh scheduler (with their own main
//! task) on first use; task threads are bound by the trampoline before
//! their entry runs.
//!
//! A host thread leaves its runtime when the guard from `Runtime::enter`
//! drops. A binding that is still in place when the thread exits is torn
//! down from the thread-local destructor, where other thread locals (the
//! subscriber's buffers among them) may already be gone, so that path
//! neither logs nor spawns.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::scheduler::Scheduler;
use crate::task::{TaskCore, TaskId};

/// What a suspension point needs: the runtime, the scheduler owning the
/// calling thread, and the task that is running on it.
#[derive(Clone)]
pub(crate) struct Context {
    pub(crate) runtime: Runtime,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) task: Arc<TaskCore>,
}

struct Binding {
    ctx: Context,
    host: bool,
}

impl Drop for Binding {
    fn drop(&mut self) {
        if self.host {
            self.ctx.scheduler.abandon(&self.ctx.runtime);
        }
    }
}

/// Keeps the calling thread bound to a runtime. Dropping it detaches the
/// thread's scheduler.
#[must_use = "the thread is detached as soon as the guard is dropped"]
pub struct EnterGuard {
    /// Whether this guard created the binding. Nested guards leave it to
    /// the outermost one.
    owner: bool,
    _thread: PhantomData<*const ()>,
}

impl fmt::Debug for EnterGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterGuard").field("owner", &self.owner).finish()
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        let binding = CURRENT
            .try_with(|slot| slot.borrow_mut().take())
            .ok()
            .flatten();
        if let Some(mut binding) = binding {
            binding.host = false;
            binding.ctx.scheduler.detach_host(&binding.ctx.runtime);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

/// The calling thread's context for `runtime`, attaching a new scheduler
/// if the thread has never used it.
pub(crate) fn current(runtime: &Runtime) -> Result<Context> {
    let bound = CURRENT
        .try_with(|slot| slot.borrow().as_ref().map(|b| b.ctx.clone()))
        .map_err(|_| Error::Shutdown)?;
    if let Some(ctx) = bound {
        if !ctx.runtime.ptr_eq(runtime) {
            return Err(Error::ForeignRuntime);
        }
        return Ok(ctx);
    }

    let scheduler = Scheduler::attach(runtime);
    let ctx = Context {
        runtime: runtime.clone(),
        task: scheduler.main_task().clone(),
        scheduler,
    };
    CURRENT
        .try_with(|slot| {
            *slot.borrow_mut() = Some(Binding {
                ctx: ctx.clone(),
                host: true,
            })
        })
        .map_err(|_| Error::Shutdown)?;
    Ok(ctx)
}

/// Bind the calling thread to `runtime` and hand back the guard that
/// detaches it again.
pub(crate) fn enter(runtime: &Runtime) -> Result<EnterGuard> {
    let bound = CURRENT
        .try_with(|slot| slot.borrow().is_some())
        .map_err(|_| Error::Shutdown)?;
    current(runtime)?;
    Ok(EnterGuard {
        owner: !bound,
        _thread: PhantomData,
    })
}

/// Id of the task running on this thread, if the thread is bound to
/// `runtime`.
pub(crate) fn current_task_id(runtime: &Runtime) -> Option<TaskId> {
    CURRENT
        .try_with(|slot| {
            slot.borrow()
                .as_ref()
                .filter(|b| b.ctx.runtime.ptr_eq(runtime))
                .map(|b| b.ctx.task.id)
        })
        .ok()
        .flatten()
}

/// Bind a freshly launched task thread.
pub(crate) fn enter_task(ctx: Context) {
    let _ = CURRENT.try_with(|slot| *slot.borrow_mut() = Some(Binding { ctx, host: false }));
}

/// Unbind a task thread whose entry has returned.
pub(crate) fn leave_task() {
    let binding = CURRENT
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten();
    drop(binding);
}
