//! Privileged control surface
//!
//! The agency's control process drives the hypervisor through a fixed set
//! of operations. Each call is recorded in the `SysLog` before it runs and
//! its status after, whatever the outcome:
//!
//! ```text
//! control(caller, op) ─▶ log_request ─▶ privilege check ─▶ dispatch
//!                                                             │
//!                      ControlReply ◀─ log_response ◀─────────┘
//! ```
//!
//! A failed operation returns a negative status and leaves every domain as
//! it found it.

use alloc::vec::Vec;
use mhv_abi::{control as op, status};
use mhv_core::{
    DomainDesc, DomainId, DomainKind, DomcallCommand, DomcallFrame, GuestError, MeState, PauseFlags,
};
use mhv_hal::HAL;

use crate::{Activation, HvError, Hypervisor, Propagation, RestoredDomain};

/// A control request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlOp<'a> {
    /// Create a domain, paused by the controller (CREATE_DOMAIN 0x01)
    CreateDomain { id: DomainId },
    /// First free ME slot of at least `size` bytes (GET_FREE_SLOT 0x02)
    GetFreeSlot { size: u64 },
    /// Freeze and serialise an ME (READ_SNAPSHOT 0x03)
    ReadSnapshot { id: DomainId },
    /// Rebuild a domain from a snapshot stream (WRITE_SNAPSHOT 0x04)
    WriteSnapshot { stream: &'a [u8] },
    /// Ask an ME to kill itself (KILL_DOMAIN 0x05)
    KillDomain { id: DomainId },
    /// GET_ME_STATE 0x06
    GetMeState { id: DomainId },
    /// SET_ME_STATE 0x07
    SetMeState { id: DomainId, state: u8 },
    /// GET_DOMAIN_DESC 0x08
    GetDomainDesc { id: DomainId },
    /// Invoke a domain-call with a caller-supplied record (SEND_DOMCALL 0x09)
    SendDomcall {
        id: DomainId,
        cmd: u32,
        frame: DomcallFrame,
    },
    /// Boot a new ME from an image container (INJECT_IMAGE 0x0A)
    InjectImage { image: &'a [u8] },
    /// Release the controller's pause (UNPAUSE 0x0B)
    Unpause { id: DomainId },
    /// Take the controller's pause (PAUSE 0x0C)
    Pause { id: DomainId },
    /// LIST_ME 0x0D
    ListMe,
    /// ACTIVATE 0x0E
    Activate { id: DomainId },
    /// END_MIGRATION 0x0F
    EndMigration { id: DomainId, delivered: bool },
    /// PREPARE_PROPAGATION 0x10
    PreparePropagation { id: DomainId },
}

impl<'a> ControlOp<'a> {
    /// Operation number
    pub fn number(&self) -> u32 {
        match self {
            ControlOp::CreateDomain { .. } => op::CREATE_DOMAIN,
            ControlOp::GetFreeSlot { .. } => op::GET_FREE_SLOT,
            ControlOp::ReadSnapshot { .. } => op::READ_SNAPSHOT,
            ControlOp::WriteSnapshot { .. } => op::WRITE_SNAPSHOT,
            ControlOp::KillDomain { .. } => op::KILL_DOMAIN,
            ControlOp::GetMeState { .. } => op::GET_ME_STATE,
            ControlOp::SetMeState { .. } => op::SET_ME_STATE,
            ControlOp::GetDomainDesc { .. } => op::GET_DOMAIN_DESC,
            ControlOp::SendDomcall { .. } => op::SEND_DOMCALL,
            ControlOp::InjectImage { .. } => op::INJECT_IMAGE,
            ControlOp::Unpause { .. } => op::UNPAUSE,
            ControlOp::Pause { .. } => op::PAUSE,
            ControlOp::ListMe => op::LIST_ME,
            ControlOp::Activate { .. } => op::ACTIVATE,
            ControlOp::EndMigration { .. } => op::END_MIGRATION,
            ControlOp::PreparePropagation { .. } => op::PREPARE_PROPAGATION,
        }
    }

    /// Fixed-layout argument words, as recorded in the audit log.
    ///
    /// Byte payloads are recorded by length only.
    pub fn args(&self) -> [u64; 4] {
        match *self {
            ControlOp::CreateDomain { id }
            | ControlOp::ReadSnapshot { id }
            | ControlOp::KillDomain { id }
            | ControlOp::GetMeState { id }
            | ControlOp::GetDomainDesc { id }
            | ControlOp::Unpause { id }
            | ControlOp::Pause { id }
            | ControlOp::Activate { id }
            | ControlOp::PreparePropagation { id } => [id.0 as u64, 0, 0, 0],
            ControlOp::GetFreeSlot { size } => [size, 0, 0, 0],
            ControlOp::WriteSnapshot { stream } => [stream.len() as u64, 0, 0, 0],
            ControlOp::InjectImage { image } => [image.len() as u64, 0, 0, 0],
            ControlOp::SetMeState { id, state } => [id.0 as u64, state as u64, 0, 0],
            ControlOp::SendDomcall { id, cmd, .. } => [id.0 as u64, cmd as u64, 0, 0],
            ControlOp::EndMigration { id, delivered } => [id.0 as u64, delivered as u64, 0, 0],
            ControlOp::ListMe => [0; 4],
        }
    }

    /// Decode a request from its number, argument words and payload.
    ///
    /// `SendDomcall` carries its argument record in `payload`; the
    /// snapshot and image operations carry their stream there.
    pub fn from_raw(number: u32, args: [u64; 4], payload: &'a [u8]) -> Option<Self> {
        let id = u16::try_from(args[0]).ok().map(DomainId);
        let op = match number {
            op::CREATE_DOMAIN => ControlOp::CreateDomain { id: id? },
            op::GET_FREE_SLOT => ControlOp::GetFreeSlot { size: args[0] },
            op::READ_SNAPSHOT => ControlOp::ReadSnapshot { id: id? },
            op::WRITE_SNAPSHOT => ControlOp::WriteSnapshot { stream: payload },
            op::KILL_DOMAIN => ControlOp::KillDomain { id: id? },
            op::GET_ME_STATE => ControlOp::GetMeState { id: id? },
            op::SET_ME_STATE => ControlOp::SetMeState {
                id: id?,
                state: u8::try_from(args[1]).ok()?,
            },
            op::GET_DOMAIN_DESC => ControlOp::GetDomainDesc { id: id? },
            op::SEND_DOMCALL => ControlOp::SendDomcall {
                id: id?,
                cmd: u32::try_from(args[1]).ok()?,
                frame: DomcallFrame::decode(payload)?,
            },
            op::INJECT_IMAGE => ControlOp::InjectImage { image: payload },
            op::UNPAUSE => ControlOp::Unpause { id: id? },
            op::PAUSE => ControlOp::Pause { id: id? },
            op::LIST_ME => ControlOp::ListMe,
            op::ACTIVATE => ControlOp::Activate { id: id? },
            op::END_MIGRATION => ControlOp::EndMigration {
                id: id?,
                delivered: args[1] != 0,
            },
            op::PREPARE_PROPAGATION => ControlOp::PreparePropagation { id: id? },
            _ => return None,
        };
        Some(op)
    }
}

/// Out-parameters of a successful request
#[derive(Debug)]
pub enum ControlOut {
    None,
    Slot(DomainId),
    Snapshot(Vec<u8>),
    Restored(RestoredDomain),
    MeState(MeState),
    Desc(DomainDesc),
    Domcall { rc: i64, frame: DomcallFrame },
    MeList(Vec<(DomainId, MeState)>),
    Activated(Activation),
    Propagation(Propagation),
}

/// Status plus out-parameters
#[derive(Debug)]
pub struct ControlReply {
    /// `status::OK` or a negative code
    pub status: i64,
    pub out: ControlOut,
}

impl ControlReply {
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }
}

impl<H: HAL> Hypervisor<H> {
    /// Run one control request on behalf of `caller`.
    ///
    /// Only the agency domains may call. Request and status are audited
    /// either way.
    pub fn control(&self, caller: DomainId, request: ControlOp<'_>) -> ControlReply {
        let req_id = self.syslog.lock().log_request(
            caller.0,
            request.number(),
            request.args(),
            self.hal.now_nanos(),
        );

        let privileged = caller.is_slot()
            && matches!(
                DomainKind::for_slot(caller),
                DomainKind::Agency | DomainKind::AgencyRt
            );
        let result = if privileged {
            self.dispatch(request)
        } else {
            Err(HvError::PermissionDenied)
        };

        let reply = match result {
            Ok(out) => ControlReply {
                status: status::OK,
                out,
            },
            Err(e) => {
                self.hal.debug_write(&alloc::format!(
                    "[control] op {:#04x} from {} failed: {:?}",
                    request.number(),
                    caller,
                    e
                ));
                ControlReply {
                    status: e.status(),
                    out: ControlOut::None,
                }
            }
        };

        self.syslog
            .lock()
            .log_response(caller.0, req_id, reply.status, self.hal.now_nanos());
        reply
    }

    /// Decode and run a raw request
    pub fn control_raw(
        &self,
        caller: DomainId,
        number: u32,
        args: [u64; 4],
        payload: &[u8],
    ) -> ControlReply {
        match ControlOp::from_raw(number, args, payload) {
            Some(request) => self.control(caller, request),
            None => {
                let mut log = self.syslog.lock();
                let ts = self.hal.now_nanos();
                let req_id = log.log_request(caller.0, number, args, ts);
                log.log_response(caller.0, req_id, status::EINVAL, ts);
                ControlReply {
                    status: HvError::BadArgument.status(),
                    out: ControlOut::None,
                }
            }
        }
    }

    fn dispatch(&self, request: ControlOp<'_>) -> Result<ControlOut, HvError> {
        match request {
            ControlOp::CreateDomain { id } => {
                self.create_domain(id)?;
                Ok(ControlOut::None)
            }
            ControlOp::GetFreeSlot { size } => self.get_free_slot(size).map(ControlOut::Slot),
            ControlOp::ReadSnapshot { id } => self.save_domain(id).map(ControlOut::Snapshot),
            ControlOp::WriteSnapshot { stream } => {
                self.restore_domain(stream).map(ControlOut::Restored)
            }
            ControlOp::KillDomain { id } => {
                self.kill_domain(id)?;
                Ok(ControlOut::None)
            }
            ControlOp::GetMeState { id } => {
                let dom = self.domain(id)?;
                Ok(ControlOut::MeState(dom.me_state()))
            }
            ControlOp::SetMeState { id, state } => {
                let state = MeState::from_u8(state).ok_or(HvError::BadArgument)?;
                self.set_me_state(id, state).map(ControlOut::MeState)
            }
            ControlOp::GetDomainDesc { id } => Ok(ControlOut::Desc(self.domain(id)?.describe())),
            ControlOp::SendDomcall { id, cmd, mut frame } => {
                let cmd = DomcallCommand::from_code(cmd).ok_or(HvError::BadArgument)?;
                let dom = self.domain(id)?;
                let rc = self.domain_call_irqsave(id, cmd, &mut frame)?;
                // The raw code goes back to the caller; only a success commits
                let requested = GuestError::check(rc)
                    .ok()
                    .and_then(|()| MeState::from_u8(frame.me_state));
                if let Some(state) = requested {
                    if self.commit_me_state(&dom, state).is_final() {
                        self.teardown(&dom);
                    }
                }
                Ok(ControlOut::Domcall { rc, frame })
            }
            ControlOp::InjectImage { image } => self.inject_image(image).map(ControlOut::Slot),
            ControlOp::Unpause { id } => {
                self.unpause_controller(id)?;
                Ok(ControlOut::None)
            }
            ControlOp::Pause { id } => {
                let dom = self.domain(id)?;
                if dom.is_dying() || dom.pause.flags().contains(PauseFlags::CONTROLLER) {
                    return Err(HvError::InvalidState);
                }
                self.pause_by(id, PauseFlags::CONTROLLER)?;
                Ok(ControlOut::None)
            }
            ControlOp::ListMe => Ok(ControlOut::MeList(
                self.registry
                    .domains()
                    .iter()
                    .filter(|d| d.kind == DomainKind::Me && !d.is_dying())
                    .map(|d| (d.id, d.me_state()))
                    .collect(),
            )),
            ControlOp::Activate { id } => self.activate_migrated(id).map(ControlOut::Activated),
            ControlOp::EndMigration { id, delivered } => {
                if delivered {
                    self.finalize_migration(id)?;
                } else {
                    self.abort_migration(id)?;
                }
                Ok(ControlOut::None)
            }
            ControlOp::PreparePropagation { id } => {
                self.prepare_propagation(id).map(ControlOut::Propagation)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mhv_axiom::SysEventType;
    use mhv_core::HvConfig;
    use mhv_hal::TestHal;

    fn hv() -> Hypervisor<TestHal> {
        let hv = Hypervisor::new(TestHal::new(), HvConfig::default()).unwrap();
        hv.boot_agency().unwrap();
        hv
    }

    #[test]
    fn test_me_caller_denied_and_audited() {
        let hv = hv();
        hv.create_domain(DomainId(2)).unwrap();
        let reply = hv.control(DomainId(2), ControlOp::GetFreeSlot { size: 0x1000 });
        assert_eq!(reply.status, status::EPERM);
        assert_eq!(hv.with_syslog(|log| log.len()), 2);
    }

    #[test]
    fn test_free_slot_then_create() {
        let hv = hv();
        let reply = hv.control(DomainId::AGENCY, ControlOp::GetFreeSlot { size: 0x1000 });
        let ControlOut::Slot(id) = reply.out else {
            panic!("expected a slot, got {:?}", reply.out);
        };
        assert_eq!(id, DomainId(2));

        assert!(hv.control(DomainId::AGENCY, ControlOp::CreateDomain { id }).is_ok());
        let reply = hv.control(DomainId::AGENCY, ControlOp::GetDomainDesc { id });
        let ControlOut::Desc(desc) = reply.out else {
            panic!("expected a descriptor");
        };
        assert_eq!(desc.pause_count, 1);
        assert!(desc.pause_flags.contains(PauseFlags::CONTROLLER));
    }

    #[test]
    fn test_failure_has_no_side_effect() {
        let hv = hv();
        hv.create_domain(DomainId(2)).unwrap();
        let before = hv.registry().dump();

        // Already paused by the controller
        let reply = hv.control(DomainId::AGENCY, ControlOp::Pause { id: DomainId(2) });
        assert!(reply.status < 0);
        let reply = hv.control(
            DomainId::AGENCY,
            ControlOp::SetMeState {
                id: DomainId(2),
                state: 0xEE,
            },
        );
        assert_eq!(reply.status, status::EINVAL);
        assert_eq!(hv.registry().dump(), before);
    }

    #[test]
    fn test_every_call_logged_with_status() {
        let hv = hv();
        hv.control(DomainId::AGENCY, ControlOp::GetMeState { id: DomainId(5) });
        hv.control(DomainId::AGENCY, ControlOp::ListMe);
        hv.with_syslog(|log| {
            let events: Vec<_> = log.events().collect();
            assert_eq!(events.len(), 4);
            assert!(matches!(
                events[1].event_type,
                SysEventType::Response { status: s, .. } if s == status::ENOENT
            ));
            assert!(matches!(
                events[3].event_type,
                SysEventType::Response { status: 0, .. }
            ));
        });
    }

    #[test]
    fn test_from_raw() {
        assert_eq!(
            ControlOp::from_raw(op::SET_ME_STATE, [3, 1, 0, 0], &[]),
            Some(ControlOp::SetMeState {
                id: DomainId(3),
                state: 1
            })
        );
        assert_eq!(ControlOp::from_raw(op::KILL_DOMAIN, [1 << 20, 0, 0, 0], &[]), None);
        assert_eq!(ControlOp::from_raw(0xFF, [0; 4], &[]), None);
        let op = ControlOp::EndMigration {
            id: DomainId(4),
            delivered: true,
        };
        assert_eq!(ControlOp::from_raw(op.number(), op.args(), &[]), Some(op));
    }

    #[test]
    fn test_unknown_op_audited() {
        let hv = hv();
        let reply = hv.control_raw(DomainId::AGENCY, 0x7F, [0; 4], &[]);
        assert_eq!(reply.status, status::EINVAL);
        assert_eq!(hv.with_syslog(|log| log.len()), 2);
    }
}
