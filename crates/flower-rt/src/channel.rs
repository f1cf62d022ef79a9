// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CSP channels.
//!
//! Rendezvous by default, bounded with `with_capacity`. Blocked senders and
//! receivers wait in FIFO queues; the matching step runs under one lock and
//! the woken peer is rescheduled according to the channel's preference.
//! Channels are the only primitive that is safe to share across threads.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::context::{self, Context};
use crate::error::{BoxError, Error, Result};
use crate::runtime::Runtime;
use crate::task::{Interrupt, TaskCore, TaskId, WaitSite};

/// Which side a channel favours when an operation wakes a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preference {
    /// A send that wakes a receiver lets it run at once.
    Receiver,
    /// The woken peer goes to the back of its run queue; the caller keeps
    /// running.
    #[default]
    Neither,
    /// A receive that wakes a sender lets it run at once.
    Sender,
}

impl Preference {
    pub fn as_i8(self) -> i8 {
        match self {
            Preference::Receiver => -1,
            Preference::Neither => 0,
            Preference::Sender => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send,
    Receive,
}

impl Direction {
    fn as_i8(self) -> i8 {
        match self {
            Direction::Send => 1,
            Direction::Receive => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakePolicy {
    Back,
    BackAndYield,
    FrontAndYield,
}

/// Error from `try_send`; hands the value back.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No receiver waiting and no buffer room.
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel is full"),
            TrySendError::Closed(_) => write!(f, "channel is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for TrySendError<T> {}

pub(crate) enum Payload<T> {
    Value(T),
    Error(BoxError),
    Closed,
}

impl<T> Payload<T> {
    fn into_result(self) -> Result<T> {
        match self {
            Payload::Value(v) => Ok(v),
            Payload::Error(e) => Err(Error::Remote(e)),
            Payload::Closed => Err(Error::ChannelClosed),
        }
    }
}

type Slot<T> = Arc<Mutex<Option<Payload<T>>>>;

struct Waiter<T> {
    task: Arc<TaskCore>,
    /// A sender's outgoing payload, or where a receiver's value lands.
    slot: Slot<T>,
}

struct ChannelState<T> {
    /// Zero for rendezvous channels.
    capacity: usize,
    buffer: VecDeque<Payload<T>>,
    senders: VecDeque<Waiter<T>>,
    receivers: VecDeque<Waiter<T>>,
    closing: bool,
    preference: Preference,
    schedule_all: bool,
}

impl<T> ChannelState<T> {
    fn has_room(&self) -> bool {
        self.capacity > 0 && self.buffer.len() < self.capacity
    }

    fn balance(&self) -> isize {
        (self.buffer.len() + self.senders.len()) as isize - self.receivers.len() as isize
    }

    fn wake_policy(&self, dir: Direction) -> WakePolicy {
        if self.schedule_all {
            WakePolicy::BackAndYield
        } else if self.preference.as_i8() == -dir.as_i8() {
            WakePolicy::FrontAndYield
        } else {
            WakePolicy::Back
        }
    }

    /// Oldest sender with a payload still attached.
    fn pop_sender(&mut self) -> Option<(Arc<TaskCore>, Payload<T>)> {
        while let Some(waiter) = self.senders.pop_front() {
            if let Some(payload) = waiter.slot.lock().take() {
                return Some((waiter.task, payload));
            }
        }
        None
    }
}

struct Shared<T> {
    state: Mutex<ChannelState<T>>,
    /// Live `Channel` handles.
    handles: AtomicUsize,
}

impl<T: Send> WaitSite for Shared<T> {
    fn withdraw(&self, task: TaskId) -> bool {
        let mut st = self.state.lock();
        let before = st.senders.len() + st.receivers.len();
        st.senders.retain(|w| w.task.id != task);
        st.receivers.retain(|w| w.task.id != task);
        before != st.senders.len() + st.receivers.len()
    }

    /// Every blocked waiter is assumed to hold one handle; any handle
    /// beyond those may belong to a thread that has not bound yet.
    fn reachable(&self) -> bool {
        let st = self.state.lock();
        self.handles.load(Ordering::Acquire) > st.senders.len() + st.receivers.len()
    }
}

/// A peer to reschedule once the channel lock is released.
pub(crate) struct Wakeup {
    task: Arc<TaskCore>,
    policy: WakePolicy,
}

/// First half of a receive, split so callers can drop their own locks
/// before the task suspends.
pub(crate) enum Receipt<T> {
    Ready {
        payload: Payload<T>,
        wakeup: Option<Wakeup>,
    },
    Parked {
        slot: Slot<T>,
    },
}

pub struct Channel<T> {
    shared: Arc<Shared<T>>,
    runtime: Runtime,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        self.shared.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        self.shared.handles.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Channel")
            .field("capacity", &st.capacity)
            .field("balance", &st.balance())
            .field("closing", &st.closing)
            .field("preference", &st.preference)
            .finish()
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Rendezvous channel.
    pub fn new(runtime: &Runtime) -> Self {
        Self::with_capacity(runtime, 0)
    }

    /// Bounded channel holding up to `capacity` values. Zero means
    /// rendezvous.
    pub fn with_capacity(runtime: &Runtime, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState {
                    capacity,
                    buffer: VecDeque::with_capacity(capacity),
                    senders: VecDeque::new(),
                    receivers: VecDeque::new(),
                    closing: false,
                    preference: Preference::default(),
                    schedule_all: false,
                }),
                handles: AtomicUsize::new(1),
            }),
            runtime: runtime.clone(),
        }
    }

    /// Send a value, blocking until a receiver takes it or buffer room
    /// opens.
    pub fn send(&self, value: T) -> Result<()> {
        self.put(Payload::Value(value))
    }

    /// Deliver an error; the receiving side sees `Err(Error::Remote(e))`.
    pub fn send_exception<E: Into<BoxError>>(&self, err: E) -> Result<()> {
        self.put(Payload::Error(err.into()))
    }

    /// Send every item in order. Returns how many were sent.
    pub fn send_sequence<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
    {
        let mut sent = 0;
        for item in items {
            self.send(item)?;
            sent += 1;
        }
        Ok(sent)
    }

    pub fn receive(&self) -> Result<T> {
        let ctx = context::current(&self.runtime)?;
        let receipt = self.begin_receive(&ctx)?;
        self.finish_receive(&ctx, receipt)
    }

    /// Send without blocking. Usable from any thread, including ones that
    /// never touched the runtime.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut st = self.shared.state.lock();
        if let Some(receiver) = st.receivers.pop_front() {
            *receiver.slot.lock() = Some(Payload::Value(value));
            drop(st);
            if let Some(scheduler) = receiver.task.scheduler() {
                scheduler.unblock(&receiver.task, true);
            }
            return Ok(());
        }
        if st.closing {
            return Err(TrySendError::Closed(value));
        }
        if st.has_room() {
            st.buffer.push_back(Payload::Value(value));
            return Ok(());
        }
        Err(TrySendError::Full(value))
    }

    /// Receive without blocking. `Ok(None)` when nothing is pending.
    pub fn try_receive(&self) -> Result<Option<T>> {
        let mut st = self.shared.state.lock();
        let (payload, woken) = if let Some(payload) = st.buffer.pop_front() {
            let woken = st.pop_sender().map(|(task, refill)| {
                st.buffer.push_back(refill);
                task
            });
            (payload, woken)
        } else if let Some((task, payload)) = st.pop_sender() {
            (payload, Some(task))
        } else if st.closing {
            return Err(Error::ChannelClosed);
        } else {
            return Ok(None);
        };
        drop(st);
        if let Some(task) = woken {
            if let Some(scheduler) = task.scheduler() {
                scheduler.unblock(&task, true);
            }
        }
        payload.into_result().map(Some)
    }

    /// Blocking iterator that ends once the channel is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }

    /// Stop the channel from filling up. Blocked senders and buffered
    /// values can still be received; blocked receivers are released with
    /// `Error::ChannelClosed`.
    pub fn close(&self) {
        let mut st = self.shared.state.lock();
        st.closing = true;
        let released: Vec<Waiter<T>> = st.receivers.drain(..).collect();
        drop(st);
        for waiter in released {
            *waiter.slot.lock() = Some(Payload::Closed);
            if let Some(scheduler) = waiter.task.scheduler() {
                scheduler.unblock(&waiter.task, true);
            }
        }
    }

    /// Undo `close`.
    pub fn open(&self) {
        self.shared.state.lock().closing = false;
    }

    pub fn is_closing(&self) -> bool {
        self.shared.state.lock().closing
    }

    /// Closing and fully drained.
    pub fn is_closed(&self) -> bool {
        let st = self.shared.state.lock();
        st.closing && st.balance() == 0
    }

    /// Buffered values plus blocked senders minus blocked receivers.
    pub fn balance(&self) -> isize {
        self.shared.state.lock().balance()
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    pub fn preference(&self) -> Preference {
        self.shared.state.lock().preference
    }

    pub fn set_preference(&self, preference: Preference) {
        self.shared.state.lock().preference = preference;
    }

    pub fn schedule_all(&self) -> bool {
        self.shared.state.lock().schedule_all
    }

    /// When set, every wake sends the peer to the back of its queue and
    /// the caller yields, regardless of preference.
    pub fn set_schedule_all(&self, on: bool) {
        self.shared.state.lock().schedule_all = on;
    }

    fn put(&self, payload: Payload<T>) -> Result<()> {
        let ctx = context::current(&self.runtime)?;
        let mut st = self.shared.state.lock();
        if let Some(receiver) = st.receivers.pop_front() {
            *receiver.slot.lock() = Some(payload);
            let policy = st.wake_policy(Direction::Send);
            drop(st);
            wake(
                &ctx,
                Wakeup {
                    task: receiver.task,
                    policy,
                },
            );
            return Ok(());
        }
        if st.closing {
            return Err(Error::ChannelClosed);
        }
        if st.has_room() {
            st.buffer.push_back(payload);
            return Ok(());
        }

        let slot: Slot<T> = Arc::new(Mutex::new(Some(payload)));
        st.senders.push_back(Waiter {
            task: ctx.task.clone(),
            slot: slot.clone(),
        });
        self.block(&ctx, st);

        let resumed = ctx.scheduler.suspend(&ctx.task);
        ctx.task.set_wait_site(None);
        let undelivered = slot.lock().take();
        match undelivered {
            None => {
                rearm(&ctx, resumed);
                Ok(())
            }
            Some(_) => {
                self.shared.withdraw(ctx.task.id);
                resumed.and(Err(Error::ChannelClosed))
            }
        }
    }

    pub(crate) fn begin_receive(&self, ctx: &Context) -> Result<Receipt<T>> {
        let mut st = self.shared.state.lock();
        if let Some(payload) = st.buffer.pop_front() {
            let policy = st.wake_policy(Direction::Receive);
            let wakeup = st.pop_sender().map(|(task, refill)| {
                st.buffer.push_back(refill);
                Wakeup { task, policy }
            });
            return Ok(Receipt::Ready { payload, wakeup });
        }
        if let Some((task, payload)) = st.pop_sender() {
            let policy = st.wake_policy(Direction::Receive);
            return Ok(Receipt::Ready {
                payload,
                wakeup: Some(Wakeup { task, policy }),
            });
        }
        if st.closing {
            return Err(Error::ChannelClosed);
        }

        let slot: Slot<T> = Arc::new(Mutex::new(None));
        st.receivers.push_back(Waiter {
            task: ctx.task.clone(),
            slot: slot.clone(),
        });
        self.block(ctx, st);
        Ok(Receipt::Parked { slot })
    }

    pub(crate) fn finish_receive(&self, ctx: &Context, receipt: Receipt<T>) -> Result<T> {
        match receipt {
            Receipt::Ready { payload, wakeup } => {
                if let Some(wakeup) = wakeup {
                    wake(ctx, wakeup);
                }
                payload.into_result()
            }
            Receipt::Parked { slot } => {
                let resumed = ctx.scheduler.suspend(&ctx.task);
                ctx.task.set_wait_site(None);
                let delivered = slot.lock().take();
                match delivered {
                    Some(payload) => {
                        rearm(ctx, resumed);
                        payload.into_result()
                    }
                    None => {
                        self.shared.withdraw(ctx.task.id);
                        resumed.and(Err(Error::ChannelClosed))
                    }
                }
            }
        }
    }

    /// Take the caller off its run queue while it is already queued here.
    fn block(&self, ctx: &Context, st: MutexGuard<'_, ChannelState<T>>) {
        let site: Arc<dyn WaitSite> = self.shared.clone();
        ctx.task.set_wait_site(Some(site));
        ctx.scheduler.block(&ctx.task);
        drop(st);
    }
}

/// Reschedule a matched peer, yielding if the policy says so.
fn wake(ctx: &Context, wakeup: Wakeup) {
    let Wakeup { task, policy } = wakeup;
    let Some(scheduler) = task.scheduler() else {
        return;
    };
    match policy {
        WakePolicy::Back => {
            scheduler.unblock(&task, true);
        }
        WakePolicy::BackAndYield => {
            scheduler.unblock(&task, true);
            rearm(ctx, ctx.scheduler.schedule(&ctx.task));
        }
        WakePolicy::FrontAndYield => {
            scheduler.unblock(&task, false);
            rearm(ctx, ctx.scheduler.schedule(&ctx.task));
        }
    }
}

/// The exchange already happened, so a cancellation that raced it is
/// kept for the next suspension point.
fn rearm(ctx: &Context, resumed: Result<()>) {
    if let Err(err) = resumed {
        if err.is_cancelled() {
            ctx.task.set_interrupt(Interrupt::Cancelled);
        }
    }
}

pub struct Iter<'a, T> {
    channel: &'a Channel<T>,
}

impl<T: Send + 'static> Iterator for Iter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.channel.receive() {
            Err(Error::ChannelClosed) => None,
            other => Some(other),
        }
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a Channel<T> {
    type Item = Result<T>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(preference: Preference, schedule_all: bool) -> ChannelState<u8> {
        ChannelState {
            capacity: 0,
            buffer: VecDeque::new(),
            senders: VecDeque::new(),
            receivers: VecDeque::new(),
            closing: false,
            preference,
            schedule_all,
        }
    }

    #[test]
    fn wake_policy_table() {
        let st = state(Preference::Receiver, false);
        assert_eq!(st.wake_policy(Direction::Send), WakePolicy::FrontAndYield);
        assert_eq!(st.wake_policy(Direction::Receive), WakePolicy::Back);

        let st = state(Preference::Sender, false);
        assert_eq!(st.wake_policy(Direction::Send), WakePolicy::Back);
        assert_eq!(st.wake_policy(Direction::Receive), WakePolicy::FrontAndYield);

        let st = state(Preference::Neither, false);
        assert_eq!(st.wake_policy(Direction::Send), WakePolicy::Back);
        assert_eq!(st.wake_policy(Direction::Receive), WakePolicy::Back);

        let st = state(Preference::Receiver, true);
        assert_eq!(st.wake_policy(Direction::Send), WakePolicy::BackAndYield);
        assert_eq!(st.wake_policy(Direction::Receive), WakePolicy::BackAndYield);
    }

    #[test]
    fn room_only_for_buffered() {
        let mut st = state(Preference::Neither, false);
        assert!(!st.has_room());
        st.capacity = 2;
        assert!(st.has_room());
        st.buffer.push_back(Payload::Value(1));
        st.buffer.push_back(Payload::Value(2));
        assert!(!st.has_room());
        assert_eq!(st.balance(), 2);
    }

    #[test]
    fn reachable_counts_handles_beyond_waiters() {
        let rt = Runtime::default();
        let ch = Channel::<u8>::new(&rt);
        ch.shared.state.lock().receivers.push_back(Waiter {
            task: TaskCore::new(TaskId(1), "rx".into()),
            slot: Arc::new(Mutex::new(None)),
        });
        assert!(!ch.shared.reachable());

        let peer = ch.clone();
        assert!(ch.shared.reachable());
        drop(peer);
        assert!(!ch.shared.reachable());

        assert!(ch.shared.withdraw(TaskId(1)));
        assert!(ch.shared.reachable());
    }

    #[test]
    fn try_ops_need_no_runtime_binding() {
        let rt = Runtime::default();
        let ch = Channel::with_capacity(&rt, 1);
        let remote = ch.clone();
        let sent = std::thread::spawn(move || remote.try_send(5u32).is_ok())
            .join()
            .unwrap();
        assert!(sent);
        assert_eq!(ch.try_send(6), Err(TrySendError::Full(6)));
        assert_eq!(ch.try_receive().unwrap(), Some(5));
        assert_eq!(ch.try_receive().unwrap(), None);
        ch.close();
        assert!(ch.is_closed());
        assert!(matches!(ch.try_receive(), Err(Error::ChannelClosed)));
        assert_eq!(ch.try_send(7), Err(TrySendError::Closed(7)));
    }
}
