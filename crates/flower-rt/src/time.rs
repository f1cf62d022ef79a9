// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep and timer-backed channels.
//!
//! Everything here follows the same shape: arm a timer whose callback does
//! a non-blocking send, then receive on the channel.

use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::context;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::timer::Timer;

pub(crate) fn sleep(runtime: &Runtime, duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return Ok(());
    }
    let ctx = context::current(runtime)?;
    let wake = Channel::<()>::with_capacity(runtime, 1);
    let tx = wake.clone();
    let timer = Timer::new(runtime, move |_| {
        let _ = tx.try_send(());
    });
    timer.start(duration, None)?;

    let _external = ctx.scheduler.external_wait();
    let woke = wake.receive();
    if woke.is_err() {
        timer.stop();
    }
    woke
}

pub(crate) fn after(runtime: &Runtime, delay: Duration) -> Result<Channel<Instant>> {
    let fired = Channel::with_capacity(runtime, 1);
    let tx = fired.clone();
    let timer = Timer::new(runtime, move |at| {
        let _ = tx.try_send(at);
    });
    timer.start(delay, None)?;
    Ok(fired)
}

pub(crate) fn tick(runtime: &Runtime, period: Duration) -> Result<Ticker> {
    let ticks = Channel::with_capacity(runtime, 1);
    let tx = ticks.clone();
    let timer = Timer::new(runtime, move |at| {
        let _ = tx.try_send(at);
    });
    timer.start(period, Some(period))?;
    Ok(Ticker {
        channel: ticks,
        timer,
    })
}

/// Periodic ticks delivered on a channel. A tick the reader has not
/// consumed yet absorbs the following ones. Stops when dropped.
#[derive(Debug)]
pub struct Ticker {
    channel: Channel<Instant>,
    timer: Timer,
}

impl Ticker {
    /// Block until the next tick.
    pub fn receive(&self) -> Result<Instant> {
        self.channel.receive()
    }

    pub fn channel(&self) -> &Channel<Instant> {
        &self.channel
    }

    pub fn period(&self) -> Option<Duration> {
        self.timer.period()
    }

    /// Stop ticking and release anyone blocked on the channel.
    pub fn stop(&self) {
        self.timer.stop();
        self.channel.close();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.timer.stop();
    }
}
