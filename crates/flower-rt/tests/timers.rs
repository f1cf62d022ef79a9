// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Sleep, timers and the completion bridge.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{init_logging, Log};
use flower_rt::{Error, Runtime, TaskState};
use parking_lot::Mutex;

#[test]
fn shorter_sleep_wakes_first() {
    init_logging();
    let rt = Runtime::default();
    let woke: Arc<Mutex<Vec<(&'static str, Duration)>>> = Arc::default();
    let started = Instant::now();

    for (name, ms) in [("a", 400), ("b", 100)] {
        let (rt2, sink) = (rt.clone(), woke.clone());
        rt.spawn(move || {
            rt2.sleep(Duration::from_millis(ms))?;
            sink.lock().push((name, started.elapsed()));
            Ok(())
        })
        .unwrap();
    }
    rt.run().unwrap();

    let woke = woke.lock().clone();
    let order: Vec<&str> = woke.iter().map(|(name, _)| *name).collect();
    assert_eq!(order, vec!["b", "a"]);
    let (b, a) = (woke[0].1, woke[1].1);
    assert!(b >= Duration::from_millis(100) && b < Duration::from_millis(400), "b woke at {b:?}");
    assert!(a >= Duration::from_millis(400), "a woke at {a:?}");
    assert_eq!(rt.pending_timers(), 0);
}

#[test]
fn main_task_can_sleep() {
    let rt = Runtime::default();
    let started = Instant::now();
    rt.sleep(Duration::from_millis(30)).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn timer_driver_exits_once_heap_drains() {
    init_logging();
    let rt = Runtime::default();
    rt.sleep(Duration::from_millis(5)).unwrap();
    assert_eq!(rt.live_tasks(), 1);

    // The next timer gets a fresh driver.
    let fired = rt.after(Duration::from_millis(5)).unwrap();
    fired.receive().unwrap();
    assert_eq!(rt.live_tasks(), 1);

    for _ in 0..3 {
        thread::spawn(|| {
            let rt = Runtime::default();
            let _guard = rt.enter().unwrap();
            rt.sleep(Duration::from_millis(5)).unwrap();
            assert_eq!(rt.live_tasks(), 1);
            assert_eq!(rt.pending_timers(), 0);
        })
        .join()
        .unwrap();
    }
}

#[test]
fn zero_sleep_does_not_touch_timers() {
    let rt = Runtime::default();
    rt.sleep(Duration::ZERO).unwrap();
    assert_eq!(rt.pending_timers(), 0);
}

#[test]
fn after_delivers_firing_time_once() {
    let rt = Runtime::default();
    let started = Instant::now();
    let fired = rt.after(Duration::from_millis(25)).unwrap();
    let at = fired.receive().unwrap();
    assert!(at >= started + Duration::from_millis(25));
    assert_eq!(fired.try_receive().unwrap(), None);
}

#[test]
fn ticker_fires_repeatedly_until_stopped() {
    let rt = Runtime::default();
    let ticker = rt.tick(Duration::from_millis(10)).unwrap();
    assert_eq!(ticker.period(), Some(Duration::from_millis(10)));

    let first = ticker.receive().unwrap();
    let second = ticker.receive().unwrap();
    assert!(second > first);

    ticker.stop();
    assert_eq!(rt.pending_timers(), 0);
    assert!(ticker.channel().is_closing());
}

#[test]
fn timer_callback_and_stop() {
    let rt = Runtime::default();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let timer = rt.timer(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(!timer.is_active());
    assert!(!timer.stop());

    timer.start(Duration::from_millis(5), None).unwrap();
    assert!(timer.is_active());
    assert!(timer.deadline().is_some());
    rt.sleep(Duration::from_millis(40)).unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!timer.is_active());

    timer.start(Duration::from_secs(60), None).unwrap();
    assert_eq!(rt.pending_timers(), 1);
    assert!(timer.stop());
    assert_eq!(rt.pending_timers(), 0);
    assert_eq!(timer.deadline(), None);
}

#[test]
fn killing_a_sleeper_disarms_its_timer() {
    let rt = Runtime::default();
    let rt2 = rt.clone();
    let sleeper = rt
        .spawn(move || rt2.sleep(Duration::from_secs(10)))
        .unwrap();

    rt.schedule().unwrap();
    assert!(sleeper.is_blocked());
    assert_eq!(rt.pending_timers(), 1);

    sleeper.kill().unwrap();
    rt.run().unwrap();
    assert_eq!(sleeper.state(), TaskState::Dead);
    assert_eq!(rt.pending_timers(), 0);
}

#[test]
fn completion_from_foreign_thread() {
    init_logging();
    let rt = Runtime::default();
    let (completer, completion) = rt.completion::<u32>();
    assert!(!completion.is_ready());

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        completer.complete(7);
    });
    assert_eq!(completion.wait().unwrap(), 7);
    worker.join().unwrap();
}

#[test]
fn completion_failures_reach_waiter() {
    let rt = Runtime::default();

    let (completer, completion) = rt.completion::<u32>();
    completer.fail("upstream timed out");
    assert!(completion.is_ready());
    assert!(matches!(completion.try_take(), Err(Error::Remote(_))));

    let (completer, completion) = rt.completion::<u32>();
    drop(completer);
    assert!(matches!(completion.wait(), Err(Error::CompletionDropped)));
}

#[test]
fn task_waiting_on_completion_keeps_run_alive() {
    let rt = Runtime::default();
    let (completer, completion) = rt.completion::<&'static str>();
    let log = Log::default();
    let out = log.clone();
    rt.spawn(move || {
        out.push(completion.wait()?);
        Ok(())
    })
    .unwrap();

    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        completer.complete("done");
    });
    rt.run().unwrap();
    worker.join().unwrap();
    assert_eq!(log.entries(), vec!["done"]);
}
