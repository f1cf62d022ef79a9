// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Flower runtime library.
//!
//! Cooperative stackful tasks, one scheduler per OS thread. Each task runs
//! on its own thread but only one task per scheduler holds the baton at a
//! time, so control moves only at suspension points: `schedule`, channel
//! operations, `sleep`, actor `receive`.
//!
//! Components:
//! - task/scheduler: lifecycle, run queue, deadlock detection
//! - channel: synchronous and buffered CSP channels with wake preference
//! - timer/time: timer heap served by a driver task, `sleep`, `after`, `tick`
//! - bridge: one-shot completions fed from outside the runtime
//! - actor: mailboxes, links, send-after and a name registry
//!
//! All state lives in a [`Runtime`]; nothing is process-global.

pub mod actor;
pub mod bridge;
pub mod channel;
pub mod config;
mod context;
pub mod error;
pub mod runtime;
mod scheduler;
pub mod task;
pub mod time;
pub mod timer;

pub use actor::{ActorRef, Destination, ExitReason, ExitSignal, Mailbox, Message, Registry, RegistryKey};
pub use bridge::{Completer, Completion};
pub use channel::{Channel, Preference, TrySendError};
pub use config::Config;
pub use context::EnterGuard;
pub use error::{BoxError, Error, FailureReason, Result, TaskFailure};
pub use runtime::{FailureHandler, Runtime};
pub use task::{Task, TaskId, TaskState};
pub use time::Ticker;
pub use timer::Timer;
