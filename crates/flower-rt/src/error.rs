// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy for the runtime.

use std::fmt;

use thiserror::Error;

use crate::task::TaskId;

/// Boxed error carried across a channel by `send_exception`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A task tried to block with nothing left that could ever wake it.
    #[error("deadlock: no runnable task and nothing outside the scheduler can wake this one")]
    Deadlock,

    /// Delivered at a suspension point after `Task::kill`.
    #[error("task was cancelled")]
    Cancelled,

    /// The peer raised an error through `send_exception`.
    #[error("peer raised: {0}")]
    Remote(#[source] BoxError),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("{0}")]
    TaskFailed(Box<TaskFailure>),

    #[error("task has no function bound")]
    Unbound,

    #[error("{0} is already set up")]
    AlreadySetup(TaskId),

    #[error("thread is bound to a different runtime")]
    ForeignRuntime,

    #[error("runtime has been dropped")]
    Shutdown,

    #[error("name `{name}` is already registered to {holder}")]
    NameTaken { name: String, holder: String },

    #[error("no actor registered under `{0}`")]
    UnknownName(String),

    #[error("{0} is not alive")]
    DeadActor(String),

    #[error("completion source dropped without delivering a result")]
    CompletionDropped,

    #[error("invalid value `{value}` for {var}: {reason}")]
    Config {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to launch task thread: {0}")]
    Launch(#[from] std::io::Error),
}

impl Error {
    /// Wrap an arbitrary error as a remote failure.
    pub fn remote<E: Into<BoxError>>(err: E) -> Self {
        Error::Remote(err.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, Error::Deadlock)
    }
}

/// A task that ended with an error or a panic.
#[derive(Debug)]
pub struct TaskFailure {
    pub task: TaskId,
    pub label: String,
    pub reason: FailureReason,
}

#[derive(Debug)]
pub enum FailureReason {
    Error(Error),
    Panic(String),
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            FailureReason::Error(e) => write!(f, "{} ({}) failed: {}", self.task, self.label, e),
            FailureReason::Panic(msg) => {
                write!(f, "{} ({}) panicked: {}", self.task, self.label, msg)
            }
        }
    }
}

impl std::error::Error for TaskFailure {}
