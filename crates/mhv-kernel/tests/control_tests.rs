//! Control-surface tests: injection, audit trail and raw decoding

mod common;

use common::*;
use mhv_abi::{control, status};
use mhv_axiom::SysEventType;
use mhv_core::image::devdesc_value;
use mhv_core::{DomainId, DomcallFrame, MeImage, MeState};
use mhv_hal::ConfigStore;
use mhv_kernel::{ControlOp, ControlOut};

#[test]
fn test_inject_places_patched_image() {
    let n = node(1, 0x4000_0000);
    let bytes = image(0x51, 0x01);
    let reply = n.hv.control(DomainId::AGENCY, ControlOp::InjectImage { image: &bytes });
    let ControlOut::Slot(id) = reply.out else {
        panic!("inject failed: {}", reply.status);
    };

    let img = MeImage::parse(&bytes).unwrap();
    let layout = img.layout();
    let base = n.hv.config().slot_layout(id).unwrap().base;

    let kernel = n.memory.read(base, img.kernel.len()).unwrap();
    assert_eq!(kernel, img.kernel);

    let desc = n
        .memory
        .read(base + layout.devdesc, (layout.initdata - layout.devdesc) as usize)
        .unwrap();
    assert_eq!(devdesc_value(&desc, "domid"), Some(format!("{}", id.0).as_bytes()));
    assert_eq!(
        devdesc_value(&desc, "entry"),
        Some(format!("{:#x}", base).as_bytes())
    );
    assert_eq!(devdesc_value(&desc, "spid"), Some(&b"0x51"[..]));

    let init = n.memory.read(base + layout.initdata, 4).unwrap();
    assert_eq!(init, b"init");

    assert_eq!(
        n.store.read(&format!("domain/{}/me/name", id.0)),
        Some("me-51".to_string())
    );
    assert_eq!(n.hv.me_state(id), MeState::Booting);
    assert!(n.hv.domain(id).unwrap().is_runnable());
    assert_eq!(n.memory.live_mappings(), 0);
}

#[test]
fn test_inject_rejects_bad_container() {
    let n = node(1, 0x4000_0000);
    let mut bytes = image(0x51, 0x01);
    bytes[0] ^= 0xFF;
    let before = n.hv.registry().dump();
    let reply = n.hv.control(DomainId::AGENCY, ControlOp::InjectImage { image: &bytes });
    assert_eq!(reply.status, status::EINVAL);
    assert_eq!(n.hv.registry().dump(), before);
}

#[test]
fn test_inject_needs_a_large_enough_slot() {
    let n = node(1, 0x4000_0000);
    let bytes = MeImage::build(SLOT_SIZE * 2, b"k", b"spid=1\n", None);
    let reply = n.hv.control(DomainId::AGENCY, ControlOp::InjectImage { image: &bytes });
    assert_eq!(reply.status, status::ENOSPC);
}

#[test]
fn test_audit_trail_pairs_requests_and_responses() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let id = spawn_me(&n, 0x51, 0x01, &a);

    n.hv.control(DomainId::AGENCY, ControlOp::Pause { id });
    n.hv.control(DomainId::AGENCY, ControlOp::Pause { id });
    n.hv.control(DomainId::AGENCY, ControlOp::Unpause { id });

    n.hv.with_syslog(|log| {
        let ops: Vec<_> = log
            .events()
            .filter_map(|e| match e.event_type {
                SysEventType::Request { op, .. } => Some(op),
                _ => None,
            })
            .collect();
        assert_eq!(ops, [control::PAUSE, control::PAUSE, control::UNPAUSE]);

        let statuses: Vec<_> = log
            .events()
            .filter_map(|e| match e.event_type {
                SysEventType::Response { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, [status::OK, status::EPERM, status::OK]);
    });
    assert!(n.hv.domain(id).unwrap().is_runnable());
}

#[test]
fn test_list_and_state_ops() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let b = agent(&n, 0x52, 0x02);
    let first = spawn_me(&n, 0x51, 0x01, &a);
    let second = spawn_me(&n, 0x52, 0x02, &b);

    let reply = n.hv.control(
        DomainId::AGENCY,
        ControlOp::SetMeState {
            id: second,
            state: MeState::Dormant as u8,
        },
    );
    assert!(reply.is_ok());

    let ControlOut::MeList(list) = n.hv.control(DomainId::AGENCY, ControlOp::ListMe).out else {
        panic!("expected a list");
    };
    assert_eq!(list, [(first, MeState::Living), (second, MeState::Dormant)]);

    let reply = n.hv.control(DomainId::AGENCY, ControlOp::KillDomain { id: first });
    assert_eq!(reply.status, status::EACCES);
    assert_eq!(n.hv.me_state(first), MeState::Living);
}

#[test]
fn test_raw_send_domcall() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0xBEEF, 0x01);
    let id = spawn_me(&n, 0x51, 0x01, &a);

    let frame = DomcallFrame {
        me_state: MeState::Living as u8,
        ..DomcallFrame::default()
    }
    .encode();
    let reply = n.hv.control_raw(
        DomainId::AGENCY,
        control::SEND_DOMCALL,
        [id.0 as u64, mhv_abi::domcall::SYNC_DESCRIPTOR as u64, 0, 0],
        &frame,
    );
    let ControlOut::Domcall { rc, frame } = reply.out else {
        panic!("domcall failed: {}", reply.status);
    };
    assert_eq!(rc, status::OK);
    assert_eq!(frame.spid, 0xBEEF);
    assert_eq!(n.hv.me_state(id), MeState::Living);

    let reply = n.hv.control_raw(
        DomainId::AGENCY,
        control::SEND_DOMCALL,
        [id.0 as u64, 0x99, 0, 0],
        &frame.encode(),
    );
    assert_eq!(reply.status, status::EINVAL);
}

#[test]
fn test_migration_through_control() {
    let src = node(0xA, 0x5000_0000);
    let dst = node(0xB, 0x4000_0000);
    let a = agent(&dst, 0x51, 0x01);
    let id = spawn_me(&src, 0x51, 0x01, &a);
    register(&dst, src.hv.domain(id).unwrap().callback().unwrap().entry, &a);

    let ControlOut::Snapshot(stream) = src.hv.control(DomainId::AGENCY, ControlOp::ReadSnapshot { id }).out else {
        panic!("save failed");
    };
    let ControlOut::Restored(restored) = dst
        .hv
        .control(DomainId::AGENCY, ControlOp::WriteSnapshot { stream: &stream })
        .out
    else {
        panic!("restore failed");
    };
    assert!(src
        .hv
        .control(DomainId::AGENCY, ControlOp::EndMigration { id, delivered: true })
        .is_ok());
    assert!(matches!(
        dst.hv.control(DomainId::AGENCY, ControlOp::Activate { id: restored.id }).out,
        ControlOut::Activated(mhv_kernel::Activation::Resumed)
    ));
    assert_eq!(src.hv.me_state(id), MeState::Dead);
}

#[test]
fn test_set_me_state_refuses_backward_edge() {
    let n = node(1, 0x4000_0000);
    let a = agent(&n, 0x51, 0x01);
    let id = spawn_me(&n, 0x51, 0x01, &a);

    let reply = n.hv.control(
        DomainId::AGENCY,
        ControlOp::SetMeState {
            id,
            state: MeState::Booting as u8,
        },
    );
    assert_eq!(reply.status, status::EPERM);
    assert_eq!(n.hv.me_state(id), MeState::Living);

    // A guest asking for it through a domain-call is ignored too
    let frame = DomcallFrame::default().encode();
    let reply = n.hv.control_raw(
        DomainId::AGENCY,
        control::SEND_DOMCALL,
        [id.0 as u64, mhv_abi::domcall::SYNC_DESCRIPTOR as u64, 0, 0],
        &frame,
    );
    assert!(reply.is_ok());
    assert_eq!(n.hv.me_state(id), MeState::Living);
    assert!(n.hv.hal().has_log_containing("ignored Living -> Booting"));
}
