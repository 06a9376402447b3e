// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::support::{kernel, periodic, Recorder, Tally};
use crate::event::Event;
use crate::kernel::Kernel;
use crate::lp::LpState;
use crate::types::{EventKey, LpId, SimTime};

fn tied_history() -> (Kernel<Recorder>, LpId) {
    let mut k = kernel(periodic(10), Recorder::default());
    let lp = k.add_lp(Tally::default(), 5).unwrap();
    let one = SimTime::new(1.0).unwrap();
    let two = SimTime::new(2.0).unwrap();
    for (ts, tb) in [(one, 0), (one, 1), (two, 0)] {
        k.insert_event(Event::new(lp, ts, tb, 1, vec![])).unwrap();
    }
    (k, lp)
}

#[test]
fn test_ordinary_replay_stops_before_tied_target() {
    let (mut k, lp) = tied_history();
    let replayed = k.silent_execution(lp, EventKey::ORIGIN, SimTime::new(1.0).unwrap(), 1).unwrap();
    assert_eq!(replayed, 1);
    assert_eq!(k.lp(lp).unwrap().buffer().executed, 1);
    assert_eq!(k.lp(lp).unwrap().bound(), EventKey::new(SimTime::new(1.0).unwrap(), 0));
}

#[test]
fn test_gvt_replay_includes_tied_target() {
    let (mut k, lp) = tied_history();
    k.begin_gvt_realignment(lp).unwrap();
    let replayed = k.silent_execution(lp, EventKey::ORIGIN, SimTime::new(1.0).unwrap(), 1).unwrap();
    assert_eq!(replayed, 2);
    assert_eq!(k.lp(lp).unwrap().buffer().executed, 2);
    // realignment never moves the execution bound
    assert_eq!(k.lp(lp).unwrap().bound(), EventKey::ORIGIN);
    assert_eq!(k.lp(lp).unwrap().state(), LpState::OnGvt);
    assert!(!k.lp(lp).unwrap().is_aligned());

    k.end_gvt_realignment(lp).unwrap();
    assert_eq!(k.lp(lp).unwrap().buffer().executed, 0);
    assert_eq!(k.lp(lp).unwrap().state(), LpState::Ready);
}

#[test]
fn test_rollback_between_tied_events() {
    let (mut k, lp) = tied_history();
    while k.execute_next(lp).unwrap().is_some() {}
    assert_eq!(k.lp(lp).unwrap().frames(), 3);

    let one = SimTime::new(1.0).unwrap();
    k.request_rollback(lp, EventKey::new(one, 1)).unwrap();
    let report = k.rollback(lp, one, 1).unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.undone, 2);
    assert_eq!(k.lp(lp).unwrap().bound(), EventKey::new(one, 0));
    assert_eq!(k.lp(lp).unwrap().frames(), 1);
}
