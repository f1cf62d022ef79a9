// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Boundary to external event sources.
//!
//! A reactor, thread pool or callback API gets a `Completer`; the task
//! that wants the result waits on the matching `Completion`. Delivery is a
//! non-blocking channel send, so it works from any thread, with or without
//! a runtime binding, and wakes whatever is parked waiting for work on the
//! waiter's scheduler.

use std::fmt;

use crate::channel::Channel;
use crate::context;
use crate::error::{BoxError, Error, Result};
use crate::runtime::Runtime;

pub(crate) fn pair<T: Send + 'static>(runtime: &Runtime) -> (Completer<T>, Completion<T>) {
    let channel = Channel::with_capacity(runtime, 1);
    runtime.inner().completion_opened();
    (
        Completer {
            channel: channel.clone(),
            runtime: runtime.clone(),
            settled: false,
        },
        Completion {
            channel,
            runtime: runtime.clone(),
        },
    )
}

/// Producer side. Delivers exactly one result; dropping it unsettled
/// delivers `Error::CompletionDropped`.
pub struct Completer<T: Send + 'static> {
    channel: Channel<Result<T>>,
    runtime: Runtime,
    settled: bool,
}

impl<T: Send + 'static> Completer<T> {
    pub fn complete(mut self, value: T) {
        self.settle(Ok(value));
    }

    pub fn fail<E: Into<BoxError>>(mut self, err: E) {
        self.settle(Err(Error::Remote(err.into())));
    }

    fn settle(&mut self, result: Result<T>) {
        if self.settled {
            return;
        }
        self.settled = true;
        let _ = self.channel.try_send(result);
        self.runtime.inner().completion_settled();
    }
}

impl<T: Send + 'static> Drop for Completer<T> {
    fn drop(&mut self) {
        self.settle(Err(Error::CompletionDropped));
    }
}

impl<T: Send + 'static> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("settled", &self.settled)
            .finish()
    }
}

/// Waiting side.
pub struct Completion<T: Send + 'static> {
    channel: Channel<Result<T>>,
    runtime: Runtime,
}

impl<T: Send + 'static> Completion<T> {
    /// Suspend the calling task until the result arrives. While waiting the
    /// scheduler counts an external wait, so `run()` keeps polling and no
    /// deadlock is reported.
    pub fn wait(self) -> Result<T> {
        let ctx = context::current(&self.runtime)?;
        let _external = ctx.scheduler.external_wait();
        self.channel.receive()?
    }

    /// The result, if it has already arrived.
    pub fn try_take(&self) -> Result<Option<T>> {
        match self.channel.try_receive()? {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.channel.balance() > 0
    }
}

impl<T: Send + 'static> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("ready", &self.is_ready())
            .finish()
    }
}
