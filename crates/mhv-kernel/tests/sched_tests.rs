//! Dispatch, pause and flip-policy tests on the mock HAL

mod common;

use common::*;
use mhv_core::{DomainId, RunState};

/// Expire the running slice on the ME CPU and dispatch again
fn tick(node: &Node) -> DomainId {
    node.hv.hal().advance_time(node.hv.config().me_slice_ns);
    node.hv.timer_tick(1);
    node.hv.do_softirq(1);
    node.hv.current(1)
}

#[test]
fn test_flip_alternates_agency_and_me() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let me = spawn_me(&n, 0x51, 0x01, &a);

    n.hv.do_softirq(1);
    let mut seen = vec![n.hv.current(1)];
    for _ in 0..6 {
        seen.push(tick(&n));
    }
    for pair in seen.windows(2) {
        assert_ne!(pair[0], pair[1], "flip repeated a side: {:?}", seen);
    }
    assert!(seen.contains(&DomainId::AGENCY_RT));
    assert!(seen.contains(&me));
    assert!(n.hv.check_invariants().is_empty());
}

#[test]
fn test_agency_runs_alone_without_mes() {
    let n = node(1, 0x4000_0000);
    n.hv.do_softirq(1);
    for _ in 0..3 {
        assert_eq!(tick(&n), DomainId::AGENCY_RT);
    }
    assert!(n.hv.check_invariants().is_empty());
}

#[test]
fn test_yield_hands_cpu_over() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let b = agent(&n, 0x52, 0x02);
    let first = spawn_me(&n, 0x51, 0x01, &a);
    let second = spawn_me(&n, 0x52, 0x02, &b);

    n.hv.do_softirq(1);
    while n.hv.current(1) != first {
        n.hv.do_yield(1);
    }
    n.hv.do_yield(1);
    assert_eq!(n.hv.current(1), DomainId::AGENCY_RT);
    n.hv.do_yield(1);
    assert_eq!(n.hv.current(1), second);

    let first = n.hv.domain(first).unwrap();
    assert_eq!(first.runstate(), RunState::Runnable);
    assert!(!first.is_running());
}

#[test]
fn test_n_pauses_need_n_unpauses() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let id = spawn_me(&n, 0x51, 0x01, &a);
    let dom = n.hv.domain(id).unwrap();

    let tokens: Vec<_> = (0..3).map(|_| n.hv.pause(id).unwrap()).collect();
    assert_eq!(dom.pause.count(), 3);
    assert_eq!(dom.runstate(), RunState::Offline);

    let mut readmitted = Vec::new();
    for token in tokens {
        readmitted.push(n.hv.unpause(id, token).unwrap());
        n.hv.do_softirq(1);
        assert!(n.hv.check_invariants().is_empty());
    }
    assert_eq!(readmitted, [false, false, true]);
    assert!(!dom.pause.is_paused());
    assert_ne!(dom.runstate(), RunState::Offline);
}

#[test]
fn test_paused_running_domain_leaves_cpu() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let id = spawn_me(&n, 0x51, 0x01, &a);

    n.hv.do_softirq(1);
    while n.hv.current(1) != id {
        tick(&n);
    }
    let token = n.hv.pause(id).unwrap();
    assert!(n.hv.softirq_pending(1));
    n.hv.do_softirq(1);
    assert_ne!(n.hv.current(1), id);
    assert!(!n.hv.domain(id).unwrap().is_running());

    n.hv.unpause(id, token).unwrap();
    assert!(n.hv.check_invariants().is_empty());
}

#[test]
fn test_context_switches_recorded() {
    let n = node(1, 0x4000_0000);
    n.hv.do_softirq(1);
    let switches = n.hv.hal().context_switches();
    assert_eq!(
        switches.last(),
        Some(&(1, DomainId::IDLE.0, DomainId::AGENCY_RT.0))
    );
}

#[test]
fn test_pause_churn_against_dispatch_keeps_invariants() {
    const ROUNDS: usize = 200;
    const OPS: usize = 100;

    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let me = spawn_me(&n, 0x51, 0x01, &a);
    n.hv.do_softirq(1);

    for round in 0..ROUNDS {
        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..OPS {
                    let token = n.hv.pause(me).unwrap();
                    n.hv.unpause(me, token).unwrap();
                }
            });
            for i in 0..OPS {
                if i % 8 == 0 {
                    n.hv.hal().advance_time(n.hv.config().me_slice_ns);
                    n.hv.timer_tick(1);
                }
                n.hv.schedule(1);
                std::thread::yield_now();
            }
        });
        n.hv.do_softirq(1);
        let violations = n.hv.check_invariants();
        assert!(violations.is_empty(), "round {}: {:?}", round, violations);
    }

    assert_eq!(n.hv.domain(me).unwrap().pause.count(), 0);
    while n.hv.current(1) != me {
        tick(&n);
    }
    assert_eq!(n.hv.domain(me).unwrap().runstate(), RunState::Running);
}
