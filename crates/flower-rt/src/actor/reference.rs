// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-owning actor handles.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::runtime::RuntimeInner;
use crate::task::TaskId;

/// Handle to an actor. Holding one never keeps the actor alive; once the
/// actor exits, messages sent through the handle are dropped.
#[derive(Clone)]
pub struct ActorRef {
    id: u64,
    task: TaskId,
    runtime: Weak<RuntimeInner>,
}

impl ActorRef {
    pub(crate) fn new(id: u64, task: TaskId, runtime: &Arc<RuntimeInner>) -> Self {
        Self {
            id,
            task,
            runtime: Arc::downgrade(runtime),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn is_alive(&self) -> bool {
        self.runtime
            .upgrade()
            .and_then(|inner| inner.actor(self.task))
            .is_some_and(|cell| cell.aref.id == self.id)
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.runtime, &other.runtime)
    }
}

impl Eq for ActorRef {}

impl Hash for ActorRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<actor:{}>", self.id)
    }
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id)
            .field("task", &self.task)
            .finish()
    }
}
