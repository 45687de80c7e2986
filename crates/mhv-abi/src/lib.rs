//! Protocol constants for the mhv hypervisor
//!
//! This crate is the **single source of truth** for every number that crosses
//! a boundary of the hypervisor core:
//! - **Control operations** (agency control process → hypervisor)
//! - **Domain-call commands** (hypervisor → guest callback entry)
//! - **Status codes** returned through the control surface
//! - **VIRQ numbers** and table sizes
//! - **Wire constants** for migration snapshots and ME image containers
//!
//! Both ends of a migration must agree on these values independently, so
//! nothing here may be renumbered once released.
//!
//! # Domain slot allocation
//!
//! | Slot | Domain |
//! |------|--------|
//! | 0 | Agency (owns hardware, runs the control process) |
//! | 1 | Agency-RT companion pinned on the ME CPU |
//! | 2..MAX_DOMAINS | Mobile Entity (ME) slots |
//! | 0x7FFF | Per-CPU idle domain (never in the registry) |

#![no_std]

// =============================================================================
// Limits
// =============================================================================

/// Number of slots in the domain registry.
pub const MAX_DOMAINS: usize = 8;

/// Number of event-channel ports per domain.
pub const NR_EVTCHN: usize = 128;

/// Number of 64-bit words in a pending/mask bit vector.
pub const EVTCHN_WORDS: usize = NR_EVTCHN / 64;

/// Number of virtual interrupt lines per domain.
pub const NR_VIRQS: usize = 16;

/// Size of the opaque cooperation-capability vector carried by an ME.
pub const SPAD_CAPS_SIZE: usize = 16;

/// Size of a per-domain hypervisor stack.
pub const HV_STACK_SIZE: usize = 16 * 1024;

/// Page size used for region alignment and cooperation pages.
pub const PAGE_SIZE: usize = 4096;

// =============================================================================
// Domain identifiers
// =============================================================================

pub mod domid {
    /// The privileged agency domain
    pub const AGENCY: u16 = 0;
    /// The agency-RT companion on the ME CPU
    pub const AGENCY_RT: u16 = 1;
    /// First slot usable by a Mobile Entity
    pub const ME_FIRST: u16 = 2;
    /// Idle domain identifier (one instance per CPU)
    pub const IDLE: u16 = 0x7FFF;
}

// =============================================================================
// Virtual interrupts
// =============================================================================

pub mod virq {
    /// Periodic timer tick
    pub const TIMER: u16 = 0;
    /// Debug key / diagnostic request
    pub const DEBUG: u16 = 1;
    /// Hypervisor console output available
    pub const CONSOLE: u16 = 2;
    /// A domain changed ME state or was destroyed (agency only)
    pub const DOM_EXC: u16 = 3;
    /// Deferred domain-call completion
    pub const DOMCALL: u16 = 4;
}

// =============================================================================
// Control surface (agency control process → hypervisor)
// =============================================================================

/// Control operation numbers.
///
/// | Range | Category |
/// |-------|----------|
/// | 0x01-0x02 | Domain creation |
/// | 0x03-0x04 | Snapshot transfer |
/// | 0x05-0x09 | ME management |
/// | 0x0A-0x0D | Injection and pause control |
/// | 0x0E-0x10 | Migration completion |
pub mod control {
    pub const CREATE_DOMAIN: u32 = 0x01;
    pub const GET_FREE_SLOT: u32 = 0x02;
    pub const READ_SNAPSHOT: u32 = 0x03;
    pub const WRITE_SNAPSHOT: u32 = 0x04;
    pub const KILL_DOMAIN: u32 = 0x05;
    pub const GET_ME_STATE: u32 = 0x06;
    pub const SET_ME_STATE: u32 = 0x07;
    pub const GET_DOMAIN_DESC: u32 = 0x08;
    pub const SEND_DOMCALL: u32 = 0x09;
    pub const INJECT_IMAGE: u32 = 0x0A;
    pub const UNPAUSE: u32 = 0x0B;
    pub const PAUSE: u32 = 0x0C;
    pub const LIST_ME: u32 = 0x0D;
    /// Activate a restored domain
    pub const ACTIVATE: u32 = 0x0E;
    /// Report the transfer outcome of a saved domain (arg1: delivered)
    pub const END_MIGRATION: u32 = 0x0F;
    /// Ask a domain whether it may be sent on
    pub const PREPARE_PROPAGATION: u32 = 0x10;
}

// =============================================================================
// Domain-call commands (hypervisor → guest callback)
// =============================================================================

pub mod domcall {
    /// Domain is about to be sent elsewhere; may veto
    pub const PRE_PROPAGATE: u32 = 1;
    /// Domain just arrived, frontends not yet reconnected
    pub const PRE_ACTIVATE: u32 = 2;
    /// Exchange data with a resident/arriving ME
    pub const COOPERATE: u32 = 3;
    /// Quiesce frontends before migration
    pub const PRE_SUSPEND: u32 = 4;
    /// Reconnect frontends after migration
    pub const PRE_RESUME: u32 = 5;
    /// Domain confirmed to stay on this node
    pub const POST_ACTIVATE: u32 = 6;
    /// Request that the domain agree to be destroyed
    pub const KILL: u32 = 7;
    /// Query the guest's own view of its ME state
    pub const GET_STATE: u32 = 8;
    /// Guest pushes its SPID and capability vector
    pub const SYNC_DESCRIPTOR: u32 = 9;

    /// Size of the fixed-layout argument record passed to every command
    pub const FRAME_LEN: usize = 80;

    /// Role values carried in the argument record of `COOPERATE`
    pub const ROLE_NONE: u32 = 0;
    pub const ROLE_INITIATOR: u32 = 1;
    pub const ROLE_TARGET: u32 = 2;
}

// =============================================================================
// Status codes
// =============================================================================

/// Status codes returned through the control surface (negative = error).
pub mod status {
    pub const OK: i64 = 0;
    pub const EPERM: i64 = -1;
    pub const ENOENT: i64 = -2;
    pub const EAGAIN: i64 = -11;
    pub const ENOMEM: i64 = -12;
    pub const EACCES: i64 = -13;
    pub const EFAULT: i64 = -14;
    pub const EBUSY: i64 = -16;
    pub const EINVAL: i64 = -22;
    pub const ENOSPC: i64 = -28;
    pub const ENOSYS: i64 = -38;
}

// =============================================================================
// ME lifecycle state values (shared page and control surface encoding)
// =============================================================================

pub mod me_state {
    pub const BOOTING: u8 = 0;
    pub const LIVING: u8 = 1;
    pub const SUSPENDED: u8 = 2;
    pub const MIGRATING: u8 = 3;
    pub const DORMANT: u8 = 4;
    pub const KILLED: u8 = 5;
    pub const TERMINATED: u8 = 6;
    pub const DEAD: u8 = 7;
}

// =============================================================================
// Softirq numbers
// =============================================================================

pub mod softirq {
    /// Run the per-CPU dispatcher
    pub const SCHEDULE: u32 = 0;
    /// Drain the deferred domain-call queue
    pub const DOMCALL: u32 = 1;
}

// =============================================================================
// Wire formats
// =============================================================================

/// Migration snapshot stream constants.
///
/// Layout: `[ctx_len: u64][context record: ctx_len bytes][memory image]`
pub mod snapshot {
    /// Signature stamped into the shared-state page of every captured context
    pub const SIGNATURE: [u8; 16] = *b"MHV-DOMCTX-SIG\0\0";
    /// Context record version
    pub const VERSION: u32 = 1;
    /// Size of the leading length header
    pub const HEADER_LEN: usize = 8;
    /// Most pause references a context may carry
    pub const MAX_PAUSE_COUNT: u32 = 1024;
}

/// ME image container constants.
///
/// Layout: `[magic: 8][version: u32][count: u32]` followed by `count`
/// sections of `[tag: u32][len: u32][bytes: len]`.
pub mod image {
    pub const MAGIC: [u8; 8] = *b"MHVIMG\0\0";
    pub const VERSION: u32 = 1;
    /// u64 memory size required by the ME
    pub const TAG_MEMSIZE: u32 = 1;
    /// Code image, loaded at the start of the region
    pub const TAG_KERNEL: u32 = 2;
    /// Device description (`key=value` lines)
    pub const TAG_DEVDESC: u32 = 3;
    /// Optional initial data blob
    pub const TAG_INITDATA: u32 = 4;
}
