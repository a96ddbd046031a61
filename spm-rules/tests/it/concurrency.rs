use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
};

use spm_rules::{RuleDb, RuleEvent, UpdateError, UpdateOutcome};
use spm_wire::{Rule, RuleInner, RuleOutput};

use crate::tcp_packet;

fn always(p: u8) -> RuleInner {
    RuleInner::new(RuleOutput::Priority(p)).always()
}

#[test]
fn second_writer_is_rejected_while_first_is_in_flight() {
    let _ = tracing_subscriber::fmt::try_init();

    let db = Arc::new(RuleDb::new());
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let first = Arc::new(AtomicBool::new(true));

    {
        let (entered, release) = (Arc::clone(&entered), Arc::clone(&release));
        // Parks the first update inside its notification, with the writer flag held.
        db.register(move |_: &RuleEvent| {
            if first.swap(false, Ordering::SeqCst) {
                entered.wait();
                release.wait();
            }
        })
        .unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || db.apply_update(&Rule::add(1, 10, always(1))))
    };

    entered.wait();
    assert_eq!(db.apply_update(&Rule::add(2, 20, always(2))), Err(UpdateError::WriterBusy));
    release.wait();

    assert_eq!(writer.join().unwrap(), Ok(UpdateOutcome::Added));
    assert_eq!(db.len(), 1);
    assert!(db.lookup(1).is_some());
    assert!(db.lookup(2).is_none());

    // The flag is free again.
    assert_eq!(db.apply_update(&Rule::add(2, 20, always(2))), Ok(UpdateOutcome::Added));
}

#[test]
fn unregister_while_observer_runs() {
    let _ = tracing_subscriber::fmt::try_init();

    let db = Arc::new(RuleDb::new());
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let (entered, release, calls) =
            (Arc::clone(&entered), Arc::clone(&release), Arc::clone(&calls));
        db.register(move |_: &RuleEvent| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                entered.wait();
                release.wait();
            }
        })
        .unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || db.apply_update(&Rule::add(1, 10, always(1))))
    };

    entered.wait();
    // The in-flight notification keeps the observer alive until it returns.
    assert!(db.unregister());
    assert!(!db.unregister());
    release.wait();

    assert_eq!(writer.join().unwrap(), Ok(UpdateOutcome::Added));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(db.apply_update(&Rule::add(2, 20, always(2))), Ok(UpdateOutcome::Added));
    assert_eq!(db.apply_update(&Rule::delete(1)), Ok(UpdateOutcome::Deleted));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The slot is free for a new observer.
    db.register(|_: &RuleEvent| {}).unwrap();
}

#[test]
fn racing_writers_leave_a_consistent_table() {
    for _ in 0..100 {
        let db = RuleDb::new();
        let start = Barrier::new(2);

        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (1..=2u32)
                .map(|id| {
                    let (db, start) = (&db, &start);
                    s.spawn(move || {
                        start.wait();
                        db.apply_update(&Rule::add(id, id as u8, always(id as u8)))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let added = results.iter().filter(|r| **r == Ok(UpdateOutcome::Added)).count();
        let busy = results.iter().filter(|r| **r == Err(UpdateError::WriterBusy)).count();
        assert!(added >= 1);
        assert_eq!(added + busy, 2);
        assert_eq!(db.len(), added);
        assert_eq!(db.scan().count(), added);
    }
}

#[test]
fn readers_see_whole_versions_during_updates() {
    let db = RuleDb::new();
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    // dsfield 0x60 falls back to priority 3 when the table is empty.
                    let mut packet = tcp_packet(0x60, 80, 0);
                    db.apply(&mut packet);
                    assert!(matches!(packet.priority, 2 | 3 | 5), "got {}", packet.priority);

                    let snapshot = db.snapshot();
                    assert_eq!(snapshot.iter().count(), snapshot.len());
                }
            });
        }

        for round in 0..2_000u32 {
            let precedence = (round % 200) as u8;
            let output = if round % 2 == 0 { 2 } else { 5 };
            db.apply_update(&Rule::add(1, precedence, always(output))).unwrap();
            if round % 7 == 0 {
                db.apply_update(&Rule::delete(1)).unwrap();
            }
        }

        done.store(true, Ordering::Relaxed);
    });

    assert!(db.len() <= 1);
}
