// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::support::{at, kernel_with_targets, periodic, run_to_end, schedule, Tally};
use crate::config::KernelConfig;
use crate::event::Event;
use crate::io::{IoTarget, MemorySink};
use crate::types::SimTime;

#[test]
fn test_global_order_across_lps() {
    let sink = MemorySink::new();
    let (mut k, _, _) = kernel_with_targets(periodic(10), IoTarget::Append(Box::new(sink.clone())), None);
    let a = k.add_lp(Tally::default(), 1).unwrap();
    let b = k.add_lp(Tally::default(), 2).unwrap();
    schedule(&mut k, a, &[5, 9]);
    schedule(&mut k, b, &[3, 7]);
    run_to_end(&mut k, a);
    run_to_end(&mut k, b);

    // nothing is certified before every LP has reported a horizon
    k.io_collect(a, at(8)).unwrap();
    assert_eq!(k.io_execute().unwrap(), 0);
    assert!(sink.contents().is_empty());

    k.io_collect(b, at(8)).unwrap();
    assert_eq!(k.io().global_horizon(), at(8));
    assert_eq!(k.io_execute().unwrap(), 3);
    assert_eq!(sink.contents(), b"3;5;7;".to_vec());
    assert_eq!(k.io().committed(), 3);

    // 9 stays buffered until shutdown
    assert_eq!(k.io_execute().unwrap(), 0);
    k.io_flush().unwrap();
    assert_eq!(sink.contents(), b"3;5;7;9;".to_vec());
    assert!(k.io_clean() > 0);
}

#[test]
fn test_horizon_clamped_to_unexecuted_events() {
    let sink = MemorySink::new();
    let (mut k, _, _) = kernel_with_targets(periodic(10), IoTarget::Append(Box::new(sink.clone())), None);
    let lp = k.add_lp(Tally::default(), 1).unwrap();
    schedule(&mut k, lp, &[2, 4, 6]);
    k.execute_next(lp).unwrap();

    k.io_collect(lp, at(100)).unwrap();
    assert_eq!(k.io().horizon(lp), Some(at(4)));
    k.io_execute().unwrap();
    assert_eq!(sink.contents(), b"2;".to_vec());

    // horizons never move back
    k.io_collect(lp, at(1)).unwrap();
    assert_eq!(k.io().horizon(lp), Some(at(4)));
}

#[test]
fn test_in_place_writes_restored_on_rollback() {
    let ledger = tempfile::NamedTempFile::new().unwrap();
    let file = ledger.reopen().unwrap();
    let (mut k, _, _) = kernel_with_targets(
        periodic(10),
        IoTarget::Append(Box::new(MemorySink::new())),
        Some(IoTarget::Seekable(Box::new(file))),
    );
    let lp = k.add_lp(Tally::default(), 1).unwrap();
    schedule(&mut k, lp, &[1, 3]);
    run_to_end(&mut k, lp);
    assert_eq!(std::fs::read(ledger.path()).unwrap(), b"0003".to_vec());

    k.insert_event(Event::new(lp, at(2), 0, 1, vec![])).unwrap();
    k.rollback(lp, at(2), 0).unwrap();
    assert_eq!(std::fs::read(ledger.path()).unwrap(), b"0001".to_vec());

    run_to_end(&mut k, lp);
    assert_eq!(std::fs::read(ledger.path()).unwrap(), b"0003".to_vec());
}

#[test]
fn test_direct_mode_writes_immediately() {
    let sink = MemorySink::new();
    let config = KernelConfig { reversible_io: false, ..periodic(10) };
    let (mut k, log, _) = kernel_with_targets(config, IoTarget::Append(Box::new(sink.clone())), None);
    let lp = k.add_lp(Tally::default(), 1).unwrap();
    schedule(&mut k, lp, &[3, 5]);
    run_to_end(&mut k, lp);
    assert_eq!(sink.contents(), b"3;5;".to_vec());
    assert!(!k.lp(lp).unwrap().history().iter().any(|e| e.has_pending_io()));

    k.io_destroy().unwrap();
    assert!(k.io().is_closed(log));
    assert_eq!(k.io().global_horizon(), SimTime::NEG_INFINITY);
}
