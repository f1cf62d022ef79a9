// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared timer heap and its driver task.
//!
//! All timers of a runtime live in one min-heap keyed by deadline. A
//! single driver task pops due entries and runs their callbacks. It exits
//! once the heap drains; the next `add` spawns a fresh one. Deadlines
//! are only checked when the driver gets the baton, so a timer fires no
//! earlier than its deadline but may fire later when tasks do not yield.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::context;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::task::{Task, TaskCore, TaskState};

type Callback = Box<dyn FnMut(Instant) + Send + 'static>;

pub(crate) struct TimerShared {
    id: u64,
    callback: Mutex<Callback>,
    schedule: Mutex<Schedule>,
    active: AtomicBool,
}

#[derive(Default)]
struct Schedule {
    deadline: Option<Instant>,
    period: Option<Duration>,
}

struct Entry {
    when: Instant,
    seq: u64,
    timer: Arc<TimerShared>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so `BinaryHeap` pops the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct HeapState {
    entries: BinaryHeap<Entry>,
    /// Cleared by the driver, under this lock, as it exits.
    driver: Option<Arc<TaskCore>>,
}

/// Per-runtime timer heap.
pub(crate) struct TimerQueue {
    heap: Mutex<HeapState>,
    seq: AtomicU64,
    ids: AtomicU64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(HeapState {
                entries: BinaryHeap::new(),
                driver: None,
            }),
            seq: AtomicU64::new(0),
            ids: AtomicU64::new(1),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.heap.lock().entries.len()
    }

    fn add(&self, runtime: &Runtime, timer: Arc<TimerShared>, when: Instant) -> Result<()> {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut heap = self.heap.lock();
        heap.entries.push(Entry { when, seq, timer });

        let live_driver = heap
            .driver
            .clone()
            .filter(|d| d.state() != TaskState::Dead);
        match live_driver {
            Some(driver) => driver.parker.kick(),
            None => {
                let task = Task::named(runtime, "timer-driver");
                let driven = runtime.clone();
                task.bind(move || drive(driven))?;
                task.setup()?;
                trace!(task = %task.id(), "timer driver spawned");
                heap.driver = Some(task.core.clone());
            }
        }
        Ok(())
    }

    fn remove(&self, timer_id: u64) {
        self.heap.lock().entries.retain(|e| e.timer.id != timer_id);
    }
}

/// Driver loop. Returns once the heap is empty.
fn drive(runtime: Runtime) -> Result<()> {
    let ctx = context::current(&runtime)?;
    let queue = &runtime.inner().timers;
    loop {
        let mut heap = queue.heap.lock();
        let Some(entry) = heap.entries.pop() else {
            if heap.driver.as_ref().is_some_and(|d| d.id == ctx.task.id) {
                heap.driver = None;
            }
            drop(heap);
            trace!(task = %ctx.task.id, "timer driver exiting");
            return Ok(());
        };
        if !entry.timer.active.load(AtomicOrdering::Acquire) {
            continue;
        }

        let now = Instant::now();
        if entry.when > now {
            let wait = entry.when - now;
            heap.entries.push(entry);
            drop(heap);
            ctx.scheduler.pause(&ctx.task, wait)?;
            continue;
        }

        let timer = entry.timer;
        {
            let mut schedule = timer.schedule.lock();
            match schedule.period {
                Some(period) if !period.is_zero() => {
                    let next = next_deadline(entry.when, period, now);
                    schedule.deadline = Some(next);
                    let seq = queue.seq.fetch_add(1, AtomicOrdering::Relaxed);
                    heap.entries.push(Entry {
                        when: next,
                        seq,
                        timer: timer.clone(),
                    });
                }
                _ => {
                    schedule.deadline = None;
                    timer.active.store(false, AtomicOrdering::Release);
                }
            }
        }
        drop(heap);
        let mut callback = timer.callback.lock();
        (&mut **callback)(now);
    }
}

/// First multiple of `period` after `when` that lies beyond `now`.
pub(crate) fn next_deadline(when: Instant, period: Duration, now: Instant) -> Instant {
    let behind = now.saturating_duration_since(when).as_nanos();
    let step = period.as_nanos().max(1);
    let steps = behind / step + 1;
    let offset = u64::try_from(step.saturating_mul(steps)).unwrap_or(u64::MAX);
    when + Duration::from_nanos(offset)
}

/// A callback armed on the runtime's timer heap.
pub struct Timer {
    shared: Arc<TimerShared>,
    runtime: Runtime,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.shared.id)
            .field("active", &self.is_active())
            .field("deadline", &self.deadline())
            .finish()
    }
}

impl Timer {
    pub fn new<F>(runtime: &Runtime, callback: F) -> Self
    where
        F: FnMut(Instant) + Send + 'static,
    {
        let id = runtime.inner().timers.ids.fetch_add(1, AtomicOrdering::Relaxed);
        Self {
            shared: Arc::new(TimerShared {
                id,
                callback: Mutex::new(Box::new(callback)),
                schedule: Mutex::new(Schedule::default()),
                active: AtomicBool::new(false),
            }),
            runtime: runtime.clone(),
        }
    }

    /// Arm the timer to fire after `delay`, then every `period` if given.
    /// Restarting an active timer replaces its old deadline.
    pub fn start(&self, delay: Duration, period: Option<Duration>) -> Result<()> {
        let queue = &self.runtime.inner().timers;
        if self.shared.active.swap(true, AtomicOrdering::AcqRel) {
            queue.remove(self.shared.id);
        }
        let when = Instant::now() + delay;
        *self.shared.schedule.lock() = Schedule {
            deadline: Some(when),
            period,
        };
        let added = queue.add(&self.runtime, self.shared.clone(), when);
        if added.is_err() {
            self.shared.active.store(false, AtomicOrdering::Release);
            queue.remove(self.shared.id);
        }
        added
    }

    /// Disarm. Returns whether the timer was active.
    pub fn stop(&self) -> bool {
        let was_active = self.shared.active.swap(false, AtomicOrdering::AcqRel);
        self.runtime.inner().timers.remove(self.shared.id);
        self.shared.schedule.lock().deadline = None;
        was_active
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(AtomicOrdering::Acquire)
    }

    /// Next time the timer fires.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.schedule.lock().deadline
    }

    pub fn period(&self) -> Option<Duration> {
        self.shared.schedule.lock().period
    }
}
