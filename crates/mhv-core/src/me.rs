//! Mobile Entity lifecycle and the domain-call argument record
//!
//! ME state is requested by the guest (it writes the state byte of its own
//! shared page from inside a domain-call) and committed by the hypervisor at
//! synchronisation points. [`MeState::can_commit`] encodes which requests
//! the hypervisor honours.

use mhv_abi::{domcall, me_state, status, SPAD_CAPS_SIZE};
use serde::{Deserialize, Serialize};

use crate::types::DomainId;
use crate::wire::{Reader, Writer};

/// ME lifecycle state, ordered roughly by time
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MeState {
    Booting = me_state::BOOTING,
    Living = me_state::LIVING,
    Suspended = me_state::SUSPENDED,
    Migrating = me_state::MIGRATING,
    Dormant = me_state::DORMANT,
    Killed = me_state::KILLED,
    Terminated = me_state::TERMINATED,
    /// Synthetic: reported for an empty slot, never stored
    Dead = me_state::DEAD,
}

impl MeState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            me_state::BOOTING => Some(Self::Booting),
            me_state::LIVING => Some(Self::Living),
            me_state::SUSPENDED => Some(Self::Suspended),
            me_state::MIGRATING => Some(Self::Migrating),
            me_state::DORMANT => Some(Self::Dormant),
            me_state::KILLED => Some(Self::Killed),
            me_state::TERMINATED => Some(Self::Terminated),
            me_state::DEAD => Some(Self::Dead),
            _ => None,
        }
    }

    /// Whether the hypervisor may commit `self -> to`.
    ///
    /// Nothing goes back to `Booting`, `Killed` and `Terminated` are
    /// one-way and `Dead` is never stored. Any edge not listed is refused.
    pub fn can_commit(self, to: MeState) -> bool {
        use MeState::*;
        if self == to {
            return to != Dead;
        }
        matches!(
            (self, to),
            (Booting, Living | Killed | Terminated)
                | (Living, Suspended | Migrating | Dormant | Killed | Terminated)
                | (Suspended, Living | Migrating | Dormant | Killed | Terminated)
                | (Migrating, Living | Suspended | Dormant | Killed | Terminated)
                | (Dormant, Living | Migrating | Killed | Terminated)
                | (Killed, Terminated)
        )
    }

    /// The domain is on its way out and must be torn down
    pub fn is_final(self) -> bool {
        matches!(self, MeState::Killed | MeState::Terminated | MeState::Dead)
    }
}

// ============================================================================
// Guest return codes
// ============================================================================

/// Failure a guest reports through its domain-call return code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestError {
    /// Command code the guest does not implement
    UnknownCommand,
    /// Argument record undecodable or inconsistent
    BadRecord,
    /// Cooperation page could not be read or written
    PageAccess,
    /// Any other non-zero code
    Other(i64),
}

impl GuestError {
    pub fn status(&self) -> i64 {
        match self {
            GuestError::UnknownCommand => status::ENOSYS,
            GuestError::BadRecord => status::EINVAL,
            GuestError::PageAccess => status::EFAULT,
            GuestError::Other(rc) => *rc,
        }
    }

    /// Split a domain-call return code into success or the guest's error.
    pub fn check(rc: i64) -> Result<(), GuestError> {
        match rc {
            status::OK => Ok(()),
            status::ENOSYS => Err(GuestError::UnknownCommand),
            status::EINVAL => Err(GuestError::BadRecord),
            status::EFAULT => Err(GuestError::PageAccess),
            other => Err(GuestError::Other(other)),
        }
    }
}

/// Cooperation role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoopRole {
    Initiator,
    Target,
}

impl CoopRole {
    fn code(role: Option<CoopRole>) -> u32 {
        match role {
            None => domcall::ROLE_NONE,
            Some(CoopRole::Initiator) => domcall::ROLE_INITIATOR,
            Some(CoopRole::Target) => domcall::ROLE_TARGET,
        }
    }

    fn from_code(v: u32) -> Option<Option<CoopRole>> {
        match v {
            domcall::ROLE_NONE => Some(None),
            domcall::ROLE_INITIATOR => Some(Some(CoopRole::Initiator)),
            domcall::ROLE_TARGET => Some(Some(CoopRole::Target)),
            _ => None,
        }
    }
}

/// Domain-call commands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomcallCommand {
    PrePropagate,
    PreActivate,
    Cooperate,
    PreSuspend,
    PreResume,
    PostActivate,
    Kill,
    GetState,
    SyncDescriptor,
}

impl DomcallCommand {
    pub fn code(self) -> u32 {
        match self {
            Self::PrePropagate => domcall::PRE_PROPAGATE,
            Self::PreActivate => domcall::PRE_ACTIVATE,
            Self::Cooperate => domcall::COOPERATE,
            Self::PreSuspend => domcall::PRE_SUSPEND,
            Self::PreResume => domcall::PRE_RESUME,
            Self::PostActivate => domcall::POST_ACTIVATE,
            Self::Kill => domcall::KILL,
            Self::GetState => domcall::GET_STATE,
            Self::SyncDescriptor => domcall::SYNC_DESCRIPTOR,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            domcall::PRE_PROPAGATE => Self::PrePropagate,
            domcall::PRE_ACTIVATE => Self::PreActivate,
            domcall::COOPERATE => Self::Cooperate,
            domcall::PRE_SUSPEND => Self::PreSuspend,
            domcall::PRE_RESUME => Self::PreResume,
            domcall::POST_ACTIVATE => Self::PostActivate,
            domcall::KILL => Self::Kill,
            domcall::GET_STATE => Self::GetState,
            domcall::SYNC_DESCRIPTOR => Self::SyncDescriptor,
            _ => return None,
        })
    }
}

/// Fixed-layout argument record passed to every domain-call.
///
/// | Offset | Field |
/// |--------|-------|
/// | 0 | `host_id: u64` |
/// | 8 | `pfn: u64` |
/// | 16 | `peer_spid: u64` |
/// | 24 | `spid: u64` |
/// | 32 | `peer_caps: [u8; 16]` |
/// | 48 | `caps: [u8; 16]` |
/// | 64 | `role: u32` |
/// | 68 | `flags: u32` |
/// | 72 | `peer: u16` |
/// | 74 | `me_state: u8` |
/// | 75 | padding to 80 |
///
/// `spid`, `caps` and `me_state` are in/out: the guest reports its own
/// values through them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DomcallFrame {
    pub host_id: u64,
    pub pfn: u64,
    pub peer_spid: u64,
    pub spid: u64,
    pub peer_caps: [u8; SPAD_CAPS_SIZE],
    pub caps: [u8; SPAD_CAPS_SIZE],
    pub role: Option<CoopRole>,
    pub flags: u32,
    pub peer: Option<DomainId>,
    pub me_state: u8,
}

const NO_PEER: u16 = 0xFFFF;

impl DomcallFrame {
    pub fn encode(&self) -> [u8; domcall::FRAME_LEN] {
        let mut w = Writer::with_capacity(domcall::FRAME_LEN);
        w.u64(self.host_id);
        w.u64(self.pfn);
        w.u64(self.peer_spid);
        w.u64(self.spid);
        w.bytes(&self.peer_caps);
        w.bytes(&self.caps);
        w.u32(CoopRole::code(self.role));
        w.u32(self.flags);
        w.u16(self.peer.map_or(NO_PEER, |d| d.0));
        w.u8(self.me_state);
        w.pad(domcall::FRAME_LEN - w.len());
        let mut out = [0u8; domcall::FRAME_LEN];
        out.copy_from_slice(&w.into_vec());
        out
    }

    /// Parse a record; `None` if short or carrying an unknown role.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes);
        let host_id = r.u64()?;
        let pfn = r.u64()?;
        let peer_spid = r.u64()?;
        let spid = r.u64()?;
        let peer_caps = r.array()?;
        let caps = r.array()?;
        let role = CoopRole::from_code(r.u32()?)?;
        let flags = r.u32()?;
        let peer = match r.u16()? {
            NO_PEER => None,
            id => Some(DomainId(id)),
        };
        let me_state = r.u8()?;
        r.skip(domcall::FRAME_LEN - 75)?;
        Some(Self {
            host_id,
            pfn,
            peer_spid,
            spid,
            peer_caps,
            caps,
            role,
            flags,
            peer,
            me_state,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
