//! Guest-side ME agent
//!
//! An ME registers [`MeAgent::handle`] as its domain-call entry. The agent
//! decodes the argument record, decides, and writes the ME state it wants
//! back into the record; the hypervisor commits it afterwards.
//!
//! | Command | Decision |
//! |---------|----------|
//! | `PreActivate` | `Killed` if this host was visited before, otherwise remember it |
//! | `PrePropagate` | `Killed` once the purpose is achieved (veto) |
//! | `Cooperate` | initiator leaves its payload on the cooperation page, target reads it |
//! | `Kill` | `Killed` if kills are accepted |
//! | `PostActivate` | `Living` |
//! | `GetState` | the state the ME wants, if any |
//! | `SyncDescriptor` | SPID and capability vector |
//!
//! Cooperation page layout: `[len: u32 LE][payload: len]`.
//!
//! Failures are reported as the status code of a [`GuestError`].

#![no_std]
extern crate alloc;

use alloc::vec::Vec;
use mhv_abi::{status, PAGE_SIZE, SPAD_CAPS_SIZE};
pub use mhv_core::GuestError;
use mhv_core::{CoopRole, DomcallCommand, DomcallFrame, MeState};
use spin::Mutex;

/// Access to physical pages from guest context
pub trait PageAccess: Send + Sync {
    /// Fill `buf` from the start of page `pfn`
    fn read_page(&self, pfn: u64, buf: &mut [u8]) -> bool;
    /// Write `data` at the start of page `pfn`
    fn write_page(&self, pfn: u64, data: &[u8]) -> bool;
}

/// Largest payload that fits on the cooperation page
pub const MAX_PAYLOAD: usize = PAGE_SIZE - 4;

#[derive(Debug, Default)]
struct AgentState {
    spid: u64,
    caps: [u8; SPAD_CAPS_SIZE],
    visited: Vec<u64>,
    purpose_achieved: bool,
    accept_kill: bool,
    payload: Vec<u8>,
    received: Vec<Vec<u8>>,
    wanted: Option<MeState>,
}

/// The decision logic of one ME
pub struct MeAgent<P: PageAccess> {
    pages: P,
    state: Mutex<AgentState>,
}

impl<P: PageAccess> MeAgent<P> {
    pub fn new(pages: P, spid: u64, caps: [u8; SPAD_CAPS_SIZE]) -> Self {
        Self {
            pages,
            state: Mutex::new(AgentState {
                spid,
                caps,
                ..AgentState::default()
            }),
        }
    }

    /// Data the ME hands to peers it cooperates with
    pub fn set_payload(&self, payload: &[u8]) {
        self.state.lock().payload = payload.to_vec();
    }

    /// Veto further propagation from now on
    pub fn set_purpose_achieved(&self, achieved: bool) {
        self.state.lock().purpose_achieved = achieved;
    }

    pub fn set_accept_kill(&self, accept: bool) {
        self.state.lock().accept_kill = accept;
    }

    /// State reported on the next `GetState`
    pub fn want_state(&self, state: MeState) {
        self.state.lock().wanted = Some(state);
    }

    /// Hosts this ME has been activated on, oldest first
    pub fn visited(&self) -> Vec<u64> {
        self.state.lock().visited.clone()
    }

    /// Payloads read from initiators as a cooperation target
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.state.lock().received.clone()
    }

    /// Domain-call entry point: `record` is the encoded [`DomcallFrame`].
    ///
    /// Returns `status::OK` or the code of the [`GuestError`] hit.
    pub fn handle(&self, cmd: u32, record: &mut [u8]) -> i64 {
        match self.dispatch(cmd, record) {
            Ok(()) => status::OK,
            Err(e) => e.status(),
        }
    }

    fn dispatch(&self, cmd: u32, record: &mut [u8]) -> Result<(), GuestError> {
        let cmd = DomcallCommand::from_code(cmd).ok_or(GuestError::UnknownCommand)?;
        let mut frame = DomcallFrame::decode(record).ok_or(GuestError::BadRecord)?;

        let mut st = self.state.lock();
        let result = match cmd {
            DomcallCommand::PreActivate => {
                if st.visited.contains(&frame.host_id) {
                    frame.me_state = MeState::Killed as u8;
                } else {
                    st.visited.push(frame.host_id);
                }
                Ok(())
            }
            DomcallCommand::PrePropagate => {
                if st.purpose_achieved {
                    frame.me_state = MeState::Killed as u8;
                }
                Ok(())
            }
            DomcallCommand::Cooperate => self.cooperate(&mut st, &frame),
            DomcallCommand::Kill => {
                if st.accept_kill {
                    frame.me_state = MeState::Killed as u8;
                }
                Ok(())
            }
            DomcallCommand::PostActivate => {
                frame.me_state = MeState::Living as u8;
                Ok(())
            }
            DomcallCommand::GetState => {
                if let Some(s) = st.wanted.take() {
                    frame.me_state = s as u8;
                }
                Ok(())
            }
            DomcallCommand::SyncDescriptor => {
                frame.spid = st.spid;
                frame.caps = st.caps;
                Ok(())
            }
            DomcallCommand::PreSuspend | DomcallCommand::PreResume => Ok(()),
        };
        drop(st);

        let encoded = frame.encode();
        let n = encoded.len().min(record.len());
        record[..n].copy_from_slice(&encoded[..n]);
        result
    }

    fn cooperate(&self, st: &mut AgentState, frame: &DomcallFrame) -> Result<(), GuestError> {
        match frame.role.ok_or(GuestError::BadRecord)? {
            CoopRole::Initiator => {
                let len = st.payload.len().min(MAX_PAYLOAD);
                let mut page = Vec::with_capacity(4 + len);
                page.extend_from_slice(&(len as u32).to_le_bytes());
                page.extend_from_slice(&st.payload[..len]);
                if !self.pages.write_page(frame.pfn, &page) {
                    return Err(GuestError::PageAccess);
                }
            }
            CoopRole::Target => {
                let mut header = [0u8; 4];
                if !self.pages.read_page(frame.pfn, &mut header) {
                    return Err(GuestError::PageAccess);
                }
                let len = (u32::from_le_bytes(header) as usize).min(MAX_PAYLOAD);
                let mut page = alloc::vec![0u8; 4 + len];
                if !self.pages.read_page(frame.pfn, &mut page) {
                    return Err(GuestError::PageAccess);
                }
                st.received.push(page.split_off(4));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    #[derive(Default)]
    struct Pages(Mutex<BTreeMap<u64, Vec<u8>>>);

    impl PageAccess for Pages {
        fn read_page(&self, pfn: u64, buf: &mut [u8]) -> bool {
            let pages = self.0.lock();
            let Some(page) = pages.get(&pfn) else {
                return false;
            };
            let n = buf.len().min(page.len());
            buf[..n].copy_from_slice(&page[..n]);
            true
        }

        fn write_page(&self, pfn: u64, data: &[u8]) -> bool {
            self.0.lock().insert(pfn, data.to_vec());
            true
        }
    }

    fn call(agent: &MeAgent<Pages>, cmd: DomcallCommand, frame: DomcallFrame) -> (i64, DomcallFrame) {
        let mut record = frame.encode();
        let rc = agent.handle(cmd.code(), &mut record);
        (rc, DomcallFrame::decode(&record).unwrap())
    }

    fn migrating_on(host: u64) -> DomcallFrame {
        DomcallFrame {
            host_id: host,
            me_state: MeState::Migrating as u8,
            ..DomcallFrame::default()
        }
    }

    #[test]
    fn test_second_visit_kills() {
        let agent = MeAgent::new(Pages::default(), 1, [0; SPAD_CAPS_SIZE]);
        let (_, f) = call(&agent, DomcallCommand::PreActivate, migrating_on(0xA));
        assert_eq!(f.me_state, MeState::Migrating as u8);
        let (_, f) = call(&agent, DomcallCommand::PreActivate, migrating_on(0xB));
        assert_eq!(f.me_state, MeState::Migrating as u8);
        let (_, f) = call(&agent, DomcallCommand::PreActivate, migrating_on(0xA));
        assert_eq!(f.me_state, MeState::Killed as u8);
        assert_eq!(agent.visited(), [0xA, 0xB]);
    }

    #[test]
    fn test_propagation_veto() {
        let agent = MeAgent::new(Pages::default(), 1, [0; SPAD_CAPS_SIZE]);
        let (_, f) = call(&agent, DomcallCommand::PrePropagate, migrating_on(1));
        assert_eq!(f.me_state, MeState::Migrating as u8);
        agent.set_purpose_achieved(true);
        let (_, f) = call(&agent, DomcallCommand::PrePropagate, migrating_on(1));
        assert_eq!(f.me_state, MeState::Killed as u8);
    }

    #[test]
    fn test_kill_refused_by_default() {
        let agent = MeAgent::new(Pages::default(), 1, [0; SPAD_CAPS_SIZE]);
        let living = DomcallFrame {
            me_state: MeState::Living as u8,
            ..DomcallFrame::default()
        };
        let (_, f) = call(&agent, DomcallCommand::Kill, living);
        assert_eq!(f.me_state, MeState::Living as u8);
        agent.set_accept_kill(true);
        let (_, f) = call(&agent, DomcallCommand::Kill, living);
        assert_eq!(f.me_state, MeState::Killed as u8);
    }

    #[test]
    fn test_cooperation_through_page() {
        let initiator = MeAgent::new(Pages::default(), 1, [0; SPAD_CAPS_SIZE]);
        initiator.set_payload(b"route table");
        let frame = DomcallFrame {
            role: Some(CoopRole::Initiator),
            pfn: 0x40,
            ..DomcallFrame::default()
        };
        assert_eq!(call(&initiator, DomcallCommand::Cooperate, frame).0, status::OK);

        // Same backing pages as seen by the target
        let pages = Pages(Mutex::new(initiator.pages.0.lock().clone()));
        let target = MeAgent::new(pages, 2, [0; SPAD_CAPS_SIZE]);
        let frame = DomcallFrame {
            role: Some(CoopRole::Target),
            pfn: 0x40,
            ..DomcallFrame::default()
        };
        assert_eq!(call(&target, DomcallCommand::Cooperate, frame).0, status::OK);
        assert_eq!(target.received(), [b"route table".to_vec()]);
    }

    #[test]
    fn test_cooperation_failures_reported() {
        let target = MeAgent::new(Pages::default(), 2, [0; SPAD_CAPS_SIZE]);
        let frame = DomcallFrame {
            role: Some(CoopRole::Target),
            pfn: 0x41,
            ..DomcallFrame::default()
        };
        let (rc, _) = call(&target, DomcallCommand::Cooperate, frame);
        assert_eq!(GuestError::check(rc), Err(GuestError::PageAccess));
        assert!(target.received().is_empty());

        let (rc, _) = call(&target, DomcallCommand::Cooperate, DomcallFrame::default());
        assert_eq!(GuestError::check(rc), Err(GuestError::BadRecord));
    }

    #[test]
    fn test_descriptor_and_unknown_command() {
        let mut caps = [0u8; SPAD_CAPS_SIZE];
        caps[0] = 0x11;
        let agent = MeAgent::new(Pages::default(), 0xBEEF, caps);
        let (_, f) = call(&agent, DomcallCommand::SyncDescriptor, DomcallFrame::default());
        assert_eq!(f.spid, 0xBEEF);
        assert_eq!(f.caps, caps);

        let mut record = DomcallFrame::default().encode();
        assert_eq!(agent.handle(0xFF, &mut record), status::ENOSYS);
        assert_eq!(agent.handle(DomcallCommand::GetState.code(), &mut [0u8; 4]), status::EINVAL);
    }
}
