//! Event-channel tests: pairing, close, VIRQs and concurrent delivery

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use common::*;
use mhv_abi::virq;
use mhv_core::{DomainFlags, DomainId, EvtchnState, RunState};

fn pair(n: &Node, me: DomainId) -> (u16, u16) {
    let ap = n.hv.evtchn_alloc_unbound(DomainId::AGENCY, me).unwrap();
    let mp = n.hv.evtchn_bind_interdomain(me, DomainId::AGENCY, ap).unwrap();
    (ap, mp)
}

#[test]
fn test_bind_pairs_both_ends() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let me = spawn_me(&n, 0x51, 0x01, &a);
    let (ap, mp) = pair(&n, me);

    assert_eq!(
        n.hv.evtchn_status(DomainId::AGENCY, ap).unwrap().state,
        EvtchnState::Interdomain {
            remote: me,
            remote_port: mp
        }
    );
    assert_eq!(
        n.hv.evtchn_status(me, mp).unwrap().state,
        EvtchnState::Interdomain {
            remote: DomainId::AGENCY,
            remote_port: ap
        }
    );
    assert!(n.hv.check_invariants().is_empty());
}

#[test]
fn test_close_demotes_peer_to_unbound() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let me = spawn_me(&n, 0x51, 0x01, &a);
    let (ap, mp) = pair(&n, me);

    n.hv.evtchn_close(me, mp).unwrap();
    assert_eq!(n.hv.evtchn_status(me, mp).unwrap().state, EvtchnState::Free);
    assert_eq!(
        n.hv.evtchn_status(DomainId::AGENCY, ap).unwrap().state,
        EvtchnState::Unbound { remote: me }
    );

    // The demoted end can be paired again
    let again = n.hv.evtchn_bind_interdomain(me, DomainId::AGENCY, ap).unwrap();
    assert_eq!(
        n.hv.evtchn_status(me, again).unwrap().state,
        EvtchnState::Interdomain {
            remote: DomainId::AGENCY,
            remote_port: ap
        }
    );
    assert!(n.hv.check_invariants().is_empty());
}

#[test]
#[should_panic(expected = "violates protocol")]
fn test_third_domain_cannot_bind() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let b = agent(&n, 0x52, 0x02);
    let me = spawn_me(&n, 0x51, 0x01, &a);
    let other = spawn_me(&n, 0x52, 0x02, &b);
    let ap = n.hv.evtchn_alloc_unbound(DomainId::AGENCY, me).unwrap();
    let _ = n.hv.evtchn_bind_interdomain(other, DomainId::AGENCY, ap);
}

#[test]
#[should_panic(expected = "violates protocol")]
fn test_second_virq_bind_is_fatal() {
    let n = node(1, 0x4000_0000);
    n.hv.evtchn_bind_virq(DomainId::AGENCY, virq::DOM_EXC).unwrap();
    let _ = n.hv.evtchn_bind_virq(DomainId::AGENCY, virq::DOM_EXC);
}

#[test]
fn test_destroy_notifies_agency() {
    let n = node(1, 0x4000_0000);
    let port = n.hv.evtchn_bind_virq(DomainId::AGENCY, virq::DOM_EXC).unwrap();
    let a = agent(&n, 0x51, 0x01);
    a.set_accept_kill(true);
    let me = spawn_me(&n, 0x51, 0x01, &a);
    let (ap, _) = pair(&n, me);

    n.hv.kill_domain(me).unwrap();
    assert!(n.hv.domain(me).is_err());
    assert!(n.hv.evtchn_status(DomainId::AGENCY, port).unwrap().pending);
    assert_eq!(
        n.hv.evtchn_status(DomainId::AGENCY, ap).unwrap().state,
        EvtchnState::Unbound { remote: me }
    );
    assert!(n.hv.check_invariants().is_empty());
}

#[test]
fn test_blocked_domain_woken_by_send() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let me = spawn_me(&n, 0x51, 0x01, &a);
    let (ap, mp) = pair(&n, me);

    n.hv.do_softirq(1);
    while n.hv.current(1) != me {
        n.hv.do_yield(1);
    }
    n.hv.do_block(1);
    let dom = n.hv.domain(me).unwrap();
    assert_eq!(dom.runstate(), RunState::Blocked);

    n.hv.evtchn_send(DomainId::AGENCY, ap).unwrap();
    assert!(!dom.flags().contains(DomainFlags::BLOCKED));
    assert_eq!(dom.runstate(), RunState::Runnable);

    let mut got = Vec::new();
    assert_eq!(n.hv.deliver(&dom, |p| got.push(p)), 1);
    assert_eq!(got, [mp]);
}

#[test]
fn test_masked_port_delivered_after_unmask() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let me = spawn_me(&n, 0x51, 0x01, &a);
    let (ap, mp) = pair(&n, me);
    let dom = n.hv.domain(me).unwrap();

    dom.shared.set_mask(mp);
    n.hv.evtchn_send(DomainId::AGENCY, ap).unwrap();
    assert_eq!(n.hv.deliver(&dom, |_| {}), 0);

    n.hv.evtchn_unmask(me, mp).unwrap();
    let mut got = Vec::new();
    n.hv.deliver(&dom, |p| got.push(p));
    assert_eq!(got, [mp]);
}

#[test]
fn test_upcall_delivers_every_send_once() {
    const N: usize = 64;
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let me = spawn_me(&n, 0x51, 0x01, &a);
    let dom = n.hv.domain(me).unwrap();

    // Distinct ports: repeated sends on one port coalesce
    let ports: Vec<(u16, u16)> = (0..N).map(|_| pair(&n, me)).collect();
    let expected: BTreeSet<u16> = ports.iter().map(|(_, mp)| *mp).collect();
    let done = AtomicBool::new(false);

    let delivered = std::thread::scope(|s| {
        s.spawn(|| {
            for (ap, _) in &ports {
                n.hv.evtchn_send(DomainId::AGENCY, *ap).unwrap();
                std::thread::yield_now();
            }
            done.store(true, Ordering::SeqCst);
        });

        let mut delivered = Vec::new();
        loop {
            let finished = done.load(Ordering::SeqCst);
            n.hv.deliver(&dom, |p| delivered.push(p));
            if finished && !dom.shared.upcall_pending() {
                break;
            }
            std::thread::yield_now();
        }
        delivered
    });

    assert_eq!(delivered.len(), N);
    let unique: BTreeSet<u16> = delivered.iter().copied().collect();
    assert_eq!(unique, expected);
}
