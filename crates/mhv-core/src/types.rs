//! Core hypervisor types
//!
//! Plain data shared by every layer. Nothing here depends on the HAL.

use mhv_abi::{domid, MAX_DOMAINS, SPAD_CAPS_SIZE};
use serde::{Deserialize, Serialize};

/// Event-channel port number (index into a domain's channel table)
pub type Port = u16;

/// Virtual interrupt line number
pub type Virq = u16;

/// Domain identifier: the slot index in the registry, stable for the
/// domain's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u16);

impl DomainId {
    pub const AGENCY: DomainId = DomainId(domid::AGENCY);
    pub const AGENCY_RT: DomainId = DomainId(domid::AGENCY_RT);
    pub const IDLE: DomainId = DomainId(domid::IDLE);

    /// Registry slot index
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this identifier names a registry slot (idle does not)
    pub fn is_slot(self) -> bool {
        self.index() < MAX_DOMAINS
    }

    /// Whether this slot is reserved for Mobile Entities
    pub fn is_me(self) -> bool {
        self.is_slot() && self.0 >= domid::ME_FIRST
    }
}

impl core::fmt::Display for DomainId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if *self == Self::IDLE {
            write!(f, "d[IDLE]")
        } else {
            write!(f, "d{}", self.0)
        }
    }
}

/// Scheduler-visible state of a domain.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Currently executing on its CPU
    Running = 0,
    /// Eligible and waiting for the dispatcher
    Runnable = 1,
    /// Waiting for an event
    Blocked = 2,
    /// Paused, down or migrating
    Offline = 3,
}

impl RunState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Running),
            1 => Some(Self::Runnable),
            2 => Some(Self::Blocked),
            3 => Some(Self::Offline),
            _ => None,
        }
    }
}

/// What a domain is for.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainKind {
    /// Privileged, owns hardware
    Agency = 0,
    /// Agency companion pinned on the ME CPU
    AgencyRt = 1,
    /// Mobile Entity
    Me = 2,
    /// Per-CPU idle loop
    Idle = 3,
}

impl DomainKind {
    /// Kind implied by a registry slot
    pub fn for_slot(id: DomainId) -> Self {
        match id.0 {
            domid::AGENCY => Self::Agency,
            domid::AGENCY_RT => Self::AgencyRt,
            domid::IDLE => Self::Idle,
            _ => Self::Me,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Agency),
            1 => Some(Self::AgencyRt),
            2 => Some(Self::Me),
            3 => Some(Self::Idle),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Pending-operation flags of a domain.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DomainFlags: u32 {
        /// Waiting for an event
        const BLOCKED   = 1 << 0;
        /// Not brought up yet
        const DOWN      = 1 << 1;
        /// Teardown in progress
        const DYING     = 1 << 2;
        /// Polling a port set
        const POLLING   = 1 << 3;
        /// Frozen for, or arrived by, migration and not yet activated
        const MIGRATING = 1 << 4;
    }
}

impl DomainFlags {
    /// Flags that keep a domain out of the runnable set
    pub const NOT_RUNNABLE: DomainFlags = DomainFlags::BLOCKED
        .union(DomainFlags::DOWN)
        .union(DomainFlags::DYING)
        .union(DomainFlags::MIGRATING);
}

bitflags::bitflags! {
    /// Attributed pause reasons. Each flag holds at most one pause reference.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PauseFlags: u32 {
        /// Paused by the control surface (also the creation pause)
        const CONTROLLER = 1 << 0;
        /// Paused for migration capture
        const MIGRATION  = 1 << 1;
        /// Paused for a cooperation round
        const COOP       = 1 << 2;
    }
}

/// Number of words in a saved CPU register frame
pub const CPU_REG_WORDS: usize = 34;

/// Number of words in the exception frame at the top of a hypervisor stack
pub const EXC_FRAME_WORDS: usize = 36;

/// Saved guest CPU registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuRegs {
    /// General-purpose registers x0..x30
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl Default for CpuRegs {
    fn default() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
        }
    }
}

impl CpuRegs {
    pub fn to_words(&self) -> [u64; CPU_REG_WORDS] {
        let mut out = [0u64; CPU_REG_WORDS];
        out[..31].copy_from_slice(&self.x);
        out[31] = self.sp;
        out[32] = self.pc;
        out[33] = self.pstate;
        out
    }

    pub fn from_words(words: &[u64; CPU_REG_WORDS]) -> Self {
        let mut x = [0u64; 31];
        x.copy_from_slice(&words[..31]);
        Self {
            x,
            sp: words[31],
            pc: words[32],
            pstate: words[33],
        }
    }
}

/// Exception frame pushed at the top of the hypervisor stack when a domain
/// traps. Opaque to the core; it is captured and spliced back verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionFrame(pub [u64; EXC_FRAME_WORDS]);

impl Default for ExceptionFrame {
    fn default() -> Self {
        Self([0; EXC_FRAME_WORDS])
    }
}

/// Physical memory region owned by a domain
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRegion {
    pub base: u64,
    pub size: u64,
}

impl MemRegion {
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, phys: u64, len: u64) -> bool {
        phys >= self.base && phys.checked_add(len).is_some_and(|e| e <= self.end())
    }
}

/// ME-specific descriptor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeDescriptor {
    /// Stable service/package identifier
    pub spid: u64,
    /// Opaque cooperation-capability vector
    pub caps: [u8; SPAD_CAPS_SIZE],
}

impl MeDescriptor {
    /// Whether two MEs should be paired for a cooperation round
    pub fn matches(&self, other: &MeDescriptor) -> bool {
        if self.spid != 0 && self.spid == other.spid {
            return true;
        }
        self.caps
            .iter()
            .zip(other.caps.iter())
            .any(|(a, b)| a & b != 0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_id_classes() {
        assert!(!DomainId::AGENCY.is_me());
        assert!(!DomainId::AGENCY_RT.is_me());
        assert!(DomainId(2).is_me());
        assert!(!DomainId::IDLE.is_slot());
        assert_eq!(DomainKind::for_slot(DomainId(5)), DomainKind::Me);
        assert_eq!(DomainKind::for_slot(DomainId::IDLE), DomainKind::Idle);
    }

    #[test]
    fn test_cpu_regs_words() {
        let mut regs = CpuRegs::default();
        regs.x[7] = 0x77;
        regs.pc = 0x8000_0000;
        let back = CpuRegs::from_words(&regs.to_words());
        assert_eq!(back, regs);
    }

    #[test]
    fn test_descriptor_matching() {
        let mut a = MeDescriptor::default();
        let mut b = MeDescriptor::default();
        assert!(!a.matches(&b));

        a.caps[3] = 0b0100;
        b.caps[3] = 0b0110;
        assert!(a.matches(&b));

        b.caps[3] = 0;
        a.spid = 42;
        b.spid = 42;
        assert!(a.matches(&b));
    }

    #[test]
    fn test_region_contains() {
        let r = MemRegion::new(0x1000, 0x2000);
        assert!(r.contains(0x1000, 0x2000));
        assert!(!r.contains(0x2000, 0x2000));
        assert!(!r.contains(0x0, 0x10));
    }
}
