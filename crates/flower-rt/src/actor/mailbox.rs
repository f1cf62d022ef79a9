// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Actor mailboxes.
//!
//! Sending never blocks: a parked receiver gets the message directly,
//! otherwise it is queued. The queue check and the parking of a receiver
//! happen under the mailbox lock, so a sender on another thread cannot
//! slip a message into the queue after the receiver found it empty.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Message;
use crate::channel::Channel;
use crate::context::Context;
use crate::error::Result;
use crate::runtime::Runtime;

#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

struct MailboxInner {
    queue: Mutex<VecDeque<Message>>,
    channel: Channel<Message>,
}

impl Mailbox {
    pub(crate) fn new(runtime: &Runtime) -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                queue: Mutex::new(VecDeque::new()),
                channel: Channel::new(runtime),
            }),
        }
    }

    /// Never blocks: a parked owner gets `msg` directly, otherwise it is
    /// queued.
    pub fn send(&self, msg: Message) {
        let mut queue = self.inner.queue.lock();
        if let Err(rejected) = self.inner.channel.try_send(msg) {
            queue.push_back(rejected.into_inner());
        }
    }

    pub(crate) fn receive(&self, ctx: &Context) -> Result<Message> {
        let mut queue = self.inner.queue.lock();
        if let Some(msg) = queue.pop_front() {
            return Ok(msg);
        }
        let receipt = self.inner.channel.begin_receive(ctx)?;
        drop(queue);
        self.inner.channel.finish_receive(ctx, receipt)
    }

    /// Messages queued and not yet received.
    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the owner is parked waiting for a message.
    pub fn has_waiting_receiver(&self) -> bool {
        self.inner.channel.balance() < 0
    }

    /// Drop every queued message, returning them.
    pub fn flush(&self) -> Vec<Message> {
        self.inner.queue.lock().drain(..).collect()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("queued", &self.len())
            .field("waiting", &self.has_waiting_receiver())
            .finish()
    }
}
