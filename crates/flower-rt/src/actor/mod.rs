// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Actors: tasks with a mailbox, links and names.
//!
//! Any task becomes an actor the first time it asks for its own ref or
//! receives a message. Linked actors are told when their peer exits
//! through an `Exit` message in their mailbox.

mod mailbox;
mod reference;
mod registry;

pub use mailbox::Mailbox;
pub use reference::ActorRef;
pub use registry::{Registry, RegistryKey};

use std::any::Any;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::context;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::task::{Outcome, Task};
use crate::timer::Timer;

/// Why a linked actor exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Normal,
    Killed,
    Failed(String),
}

impl ExitReason {
    pub(crate) fn from_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Finished => ExitReason::Normal,
            Outcome::Cancelled => ExitReason::Killed,
            Outcome::Failed(err) => ExitReason::Failed(err.to_string()),
            Outcome::Panicked(msg) => ExitReason::Failed(format!("panicked: {msg}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    pub from: ActorRef,
    pub reason: ExitReason,
}

pub enum Message {
    User {
        from: Option<ActorRef>,
        payload: Box<dyn Any + Send>,
    },
    Exit(ExitSignal),
}

impl Message {
    pub fn user<M: Any + Send>(from: Option<ActorRef>, payload: M) -> Self {
        Message::User {
            from,
            payload: Box::new(payload),
        }
    }

    pub fn sender(&self) -> Option<&ActorRef> {
        match self {
            Message::User { from, .. } => from.as_ref(),
            Message::Exit(signal) => Some(&signal.from),
        }
    }

    pub fn is<M: Any>(&self) -> bool {
        self.downcast_ref::<M>().is_some()
    }

    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        match self {
            Message::User { payload, .. } => payload.downcast_ref::<M>(),
            Message::Exit(_) => None,
        }
    }

    /// Take the payload out as `M`, or get the message back untouched.
    pub fn downcast<M: Any>(self) -> Result<M, Message> {
        match self {
            Message::User { from, payload } => match payload.downcast::<M>() {
                Ok(value) => Ok(*value),
                Err(payload) => Err(Message::User { from, payload }),
            },
            exit => Err(exit),
        }
    }

    pub fn exit_signal(&self) -> Option<&ExitSignal> {
        match self {
            Message::Exit(signal) => Some(signal),
            Message::User { .. } => None,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::User { from, .. } => f.debug_struct("User").field("from", from).finish(),
            Message::Exit(signal) => f.debug_tuple("Exit").field(signal).finish(),
        }
    }
}

/// Where `send` delivers: a ref, or a registered name resolved at send
/// time.
#[derive(Debug, Clone)]
pub enum Destination {
    Ref(ActorRef),
    Name(String),
}

impl From<ActorRef> for Destination {
    fn from(aref: ActorRef) -> Self {
        Destination::Ref(aref)
    }
}

impl From<&ActorRef> for Destination {
    fn from(aref: &ActorRef) -> Self {
        Destination::Ref(aref.clone())
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Destination::Name(name.to_string())
    }
}

impl From<String> for Destination {
    fn from(name: String) -> Self {
        Destination::Name(name)
    }
}

/// Runtime-side state of an actor.
pub(crate) struct ActorCell {
    pub(crate) aref: ActorRef,
    pub(crate) mailbox: Mailbox,
    links: Mutex<Vec<ActorRef>>,
}

impl ActorCell {
    pub(crate) fn new(aref: ActorRef, mailbox: Mailbox) -> Self {
        Self {
            aref,
            mailbox,
            links: Mutex::new(Vec::new()),
        }
    }

    fn link(&self, peer: &ActorRef) {
        let mut links = self.links.lock();
        if *peer != self.aref && !links.contains(peer) {
            links.push(peer.clone());
        }
    }

    fn unlink(&self, peer: &ActorRef) {
        self.links.lock().retain(|l| l != peer);
    }

    pub(crate) fn take_links(&self) -> Vec<ActorRef> {
        std::mem::take(&mut *self.links.lock())
    }

    pub(crate) fn linked(&self) -> Vec<ActorRef> {
        self.links.lock().clone()
    }
}

/// Tell every linked actor that `cell` exited.
pub(crate) fn notify_exit(runtime: &Runtime, cell: &ActorCell, reason: ExitReason) {
    for peer in cell.take_links() {
        if let Some(peer_cell) = runtime.inner().actor(peer.task_id()) {
            peer_cell.unlink(&cell.aref);
            peer_cell.mailbox.send(Message::Exit(ExitSignal {
                from: cell.aref.clone(),
                reason: reason.clone(),
            }));
        }
    }
    debug!(actor = %cell.aref, ?reason, "actor exited");
}

pub(crate) fn spawn<F>(
    runtime: &Runtime,
    label: &str,
    f: F,
    link_to: Option<ActorRef>,
    delay: Option<Duration>,
) -> Result<ActorRef>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let task = Task::named(runtime, label);
    task.bind(f)?;
    let cell = runtime.inner().adopt(runtime, &task.core);
    if let Some(peer) = link_to.and_then(|p| runtime.inner().actor(p.task_id())) {
        peer.link(&cell.aref);
        cell.link(&peer.aref);
    }

    let started = match delay {
        None => task.setup(),
        Some(delay) => {
            let mut pending = Some(task.clone());
            let timer = Timer::new(runtime, move |_| {
                if let Some(task) = pending.take() {
                    if let Err(err) = task.setup() {
                        warn!(task = %task.id(), %err, "deferred actor failed to start");
                    }
                }
            });
            timer.start(delay, None)
        }
    };
    if let Err(err) = started {
        runtime.inner().forget_actor(task.id());
        return Err(err);
    }
    trace!(actor = %cell.aref, task = %task.id(), "actor spawned");
    Ok(cell.aref.clone())
}

pub(crate) fn self_ref(runtime: &Runtime) -> Result<ActorRef> {
    let ctx = context::current(runtime)?;
    Ok(runtime.inner().adopt(runtime, &ctx.task).aref.clone())
}

pub(crate) fn resolve(runtime: &Runtime, dest: Destination) -> Result<ActorRef> {
    match dest {
        Destination::Ref(aref) => Ok(aref),
        Destination::Name(name) => runtime
            .inner()
            .registry
            .lookup(&name)
            .ok_or(Error::UnknownName(name)),
    }
}

/// Drop `msg` into the mailbox of `target`. Dead targets swallow it.
pub(crate) fn deliver(runtime: &Runtime, target: &ActorRef, msg: Message) {
    match runtime.inner().actor(target.task_id()) {
        Some(cell) if cell.aref == *target => cell.mailbox.send(msg),
        _ => trace!(actor = %target, "message to dead actor dropped"),
    }
}

pub(crate) fn send<M: Any + Send>(runtime: &Runtime, dest: Destination, payload: M) -> Result<()> {
    let target = resolve(runtime, dest)?;
    let from = self_ref(runtime)?;
    deliver(runtime, &target, Message::user(Some(from), payload));
    Ok(())
}

pub(crate) fn send_after<M: Any + Send>(
    runtime: &Runtime,
    delay: Duration,
    dest: Destination,
    payload: M,
) -> Result<Timer> {
    let target = resolve(runtime, dest)?;
    let from = self_ref(runtime)?;
    let delivering = runtime.clone();
    let mut pending = Some(Message::user(Some(from), payload));
    let timer = Timer::new(runtime, move |_| {
        if let Some(msg) = pending.take() {
            deliver(&delivering, &target, msg);
        }
    });
    timer.start(delay, None)?;
    Ok(timer)
}

pub(crate) fn receive(runtime: &Runtime) -> Result<Message> {
    let ctx = context::current(runtime)?;
    let cell = runtime.inner().adopt(runtime, &ctx.task);
    cell.mailbox.receive(&ctx)
}

pub(crate) fn link(runtime: &Runtime, peer: &ActorRef) -> Result<()> {
    let ctx = context::current(runtime)?;
    let me = runtime.inner().adopt(runtime, &ctx.task);
    let other = runtime
        .inner()
        .actor(peer.task_id())
        .filter(|cell| cell.aref == *peer)
        .ok_or_else(|| Error::DeadActor(peer.to_string()))?;
    me.link(&other.aref);
    other.link(&me.aref);
    Ok(())
}

pub(crate) fn unlink(runtime: &Runtime, peer: &ActorRef) -> Result<()> {
    let ctx = context::current(runtime)?;
    let me = runtime.inner().adopt(runtime, &ctx.task);
    me.unlink(peer);
    if let Some(other) = runtime.inner().actor(peer.task_id()) {
        other.unlink(&me.aref);
    }
    Ok(())
}

pub(crate) fn links(runtime: &Runtime) -> Result<Vec<ActorRef>> {
    let ctx = context::current(runtime)?;
    Ok(runtime.inner().adopt(runtime, &ctx.task).linked())
}
