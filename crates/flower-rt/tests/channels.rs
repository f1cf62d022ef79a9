// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channel semantics and wake ordering.

mod common;

use std::thread;
use std::time::Duration;

use common::{init_logging, Log};
use flower_rt::{Error, Preference, Runtime, TrySendError};

/// One producer sending 0..10 to two consumers taking five values each.
fn interleaving(preference: Preference, schedule_all: bool) -> String {
    init_logging();
    let rt = Runtime::default();
    let ch = rt.channel::<u32>();
    ch.set_preference(preference);
    ch.set_schedule_all(schedule_all);
    let log = Log::default();

    let (tx, out) = (ch.clone(), log.clone());
    rt.spawn_named("producer", move || {
        for i in 0..10 {
            out.push(format!("s{i}"));
            tx.send(i)?;
        }
        Ok(())
    })
    .unwrap();

    for consumer in 1..=2 {
        let (rx, out) = (ch.clone(), log.clone());
        rt.spawn_named(format!("consumer-{consumer}"), move || {
            for _ in 0..5 {
                let v = rx.receive()?;
                out.push(format!("r{consumer}:{v}"));
            }
            Ok(())
        })
        .unwrap();
    }

    rt.run().unwrap();
    log.line()
}

#[test]
fn receiver_preference_runs_receiver_at_once() {
    assert_eq!(
        interleaving(Preference::Receiver, false),
        "s0 r1:0 s1 r1:1 s2 r2:2 s3 r1:3 s4 r2:4 s5 r1:5 s6 r2:6 s7 r1:7 s8 r2:8 s9 r2:9"
    );
}

#[test]
fn neither_preference_keeps_caller_running() {
    assert_eq!(
        interleaving(Preference::Neither, false),
        "s0 r1:0 s1 s2 s3 r1:1 r1:3 r2:2 s4 s5 s6 r1:4 r1:6 r2:5 s7 s8 r2:7 r2:8 s9 r2:9"
    );
}

#[test]
fn sender_preference_runs_sender_at_once() {
    assert_eq!(
        interleaving(Preference::Sender, false),
        "s0 s1 s2 r1:0 s3 r2:1 s4 r1:2 s5 r2:3 s6 r1:4 s7 r2:5 s8 r1:6 s9 r2:7 r1:8 r2:9"
    );
}

#[test]
fn schedule_all_yields_on_every_wake() {
    assert_eq!(
        interleaving(Preference::Receiver, true),
        "s0 s1 r1:0 r2:1 s2 r1:2 s3 r2:3 s4 r1:4 s5 r2:5 s6 r1:6 s7 r2:7 s8 r1:8 s9 r2:9"
    );
}

#[test]
fn default_preference_is_neither() {
    let rt = Runtime::default();
    let ch = rt.channel::<()>();
    assert_eq!(ch.preference(), Preference::Neither);
    assert!(!ch.schedule_all());
    assert_eq!(ch.capacity(), 0);
}

#[test]
fn simple_rendezvous_with_main() {
    let rt = Runtime::default();
    let ch = rt.channel::<&'static str>();
    let log = Log::default();

    let (tx, out) = (ch.clone(), log.clone());
    rt.spawn(move || {
        out.push("sending");
        tx.send("foo")
    })
    .unwrap();

    rt.schedule().unwrap();
    log.push("receiving");
    let got = ch.receive().unwrap();
    log.push(got);
    rt.run().unwrap();

    assert_eq!(log.entries(), vec!["sending", "receiving", "foo"]);
}

#[test]
fn receiver_preference_alternates_with_single_consumer() {
    let rt = Runtime::default();
    let ch = rt.channel::<u32>();
    ch.set_preference(Preference::Receiver);
    let log = Log::default();

    let (tx, out) = (ch.clone(), log.clone());
    rt.spawn(move || {
        for i in 0..3 {
            out.push(format!("s{i}"));
            tx.send(i)?;
        }
        Ok(())
    })
    .unwrap();
    let (rx, out) = (ch.clone(), log.clone());
    rt.spawn(move || {
        for _ in 0..3 {
            out.push(format!("r{}", rx.receive()?));
        }
        Ok(())
    })
    .unwrap();
    rt.run().unwrap();

    assert_eq!(log.line(), "s0 r0 s1 r1 s2 r2");
}

#[test]
fn buffered_send_does_not_block_until_full() {
    let rt = Runtime::default();
    let ch = rt.buffered_channel::<u32>(2);
    ch.send(1).unwrap();
    ch.send(2).unwrap();
    assert_eq!(ch.balance(), 2);
    assert_eq!(ch.try_send(3), Err(TrySendError::Full(3)));

    assert_eq!(ch.receive().unwrap(), 1);
    assert_eq!(ch.receive().unwrap(), 2);
    assert_eq!(ch.balance(), 0);
}

#[test]
fn blocked_sender_refills_buffer() {
    let rt = Runtime::default();
    let ch = rt.buffered_channel::<u32>(1);
    let tx = ch.clone();
    rt.spawn(move || tx.send_sequence([1, 2, 3]).map(drop)).unwrap();

    rt.schedule().unwrap();
    // One buffered, one blocked sender.
    assert_eq!(ch.balance(), 2);

    let got: Vec<u32> = (0..3).map(|_| ch.receive().unwrap()).collect();
    assert_eq!(got, vec![1, 2, 3]);
    rt.run().unwrap();
}

#[test]
fn close_ends_iteration() {
    let rt = Runtime::default();
    let ch = rt.channel::<u32>();
    let tx = ch.clone();
    rt.spawn(move || {
        tx.send_sequence(0..3)?;
        tx.close();
        Ok(())
    })
    .unwrap();

    let got: Vec<u32> = ch.iter().collect::<Result<_, _>>().unwrap();
    assert_eq!(got, vec![0, 1, 2]);
    assert!(ch.is_closing());
    assert!(ch.is_closed());
    assert!(matches!(ch.send(9), Err(Error::ChannelClosed)));
    rt.run().unwrap();

    ch.open();
    assert!(!ch.is_closing());
}

#[test]
fn send_exception_raises_in_receiver() {
    let rt = Runtime::default();
    let ch = rt.channel::<u32>();
    let tx = ch.clone();
    rt.spawn(move || tx.send_exception("disk on fire")).unwrap();

    match ch.receive() {
        Err(Error::Remote(err)) => assert_eq!(err.to_string(), "disk on fire"),
        other => panic!("expected remote error, got {other:?}"),
    }
    rt.run().unwrap();
}

#[test]
fn try_receive_drains_blocked_sender() {
    let rt = Runtime::default();
    let ch = rt.channel::<u32>();
    assert_eq!(ch.try_receive().unwrap(), None);

    let tx = ch.clone();
    rt.spawn(move || tx.send(7)).unwrap();
    rt.schedule().unwrap();
    assert_eq!(ch.balance(), 1);
    assert_eq!(ch.try_receive().unwrap(), Some(7));
    rt.run().unwrap();
}

#[test]
fn rendezvous_with_thread_that_binds_later() {
    init_logging();
    let rt = Runtime::default();
    let ch = rt.channel::<u32>();

    let tx = ch.clone();
    let peer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        tx.send(42).unwrap();
    });
    assert_eq!(ch.receive().unwrap(), 42);
    peer.join().unwrap();

    let rx = ch.clone();
    let peer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        rx.receive().unwrap()
    });
    ch.send(7).unwrap();
    assert_eq!(peer.join().unwrap(), 7);
}

#[test]
fn balance_tracks_unmatched_operations() {
    let rt = Runtime::default();
    let ch = rt.channel::<u32>();

    let tx = ch.clone();
    rt.spawn(move || tx.send(1)).unwrap();
    rt.schedule().unwrap();
    assert_eq!(ch.balance(), 1);
    assert_eq!(ch.receive().unwrap(), 1);
    assert_eq!(ch.balance(), 0);

    let rx = ch.clone();
    rt.spawn(move || rx.receive().map(drop)).unwrap();
    rt.schedule().unwrap();
    assert_eq!(ch.balance(), -1);
    ch.send(2).unwrap();
    assert_eq!(ch.balance(), 0);
    rt.run().unwrap();
}
