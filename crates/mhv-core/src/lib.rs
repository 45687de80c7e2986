//! mhv Core - Domain, Event-Channel and Snapshot State
//!
//! This crate contains the **HAL-free** half of the hypervisor: every data
//! structure the runtime in `mhv-kernel` manipulates, and every rule those
//! structures must obey. Nothing here touches an address space, a timer or
//! a real CPU; the runtime supplies those through its HAL.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        mhv-core                             │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐   ┌─────────────┐ │
//! │   │   Registry    │    │   evtchn      │   │  sched      │ │
//! │   │  [Domain; N]  │───▶│  bind/close/  │   │  Agency /   │ │
//! │   │  PauseCount   │    │  send/upcall  │   │  Flip       │ │
//! │   └───────────────┘    └───────────────┘   └─────────────┘ │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐   ┌─────────────┐ │
//! │   │  snapshot     │    │   image       │   │ invariants  │ │
//! │   │  dom_context  │    │   MHVIMG      │   │  checker    │ │
//! │   └───────────────┘    └───────────────┘   └─────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      mhv-kernel                             │
//! │   - per-CPU dispatch, softirqs, domain-call                 │
//! │   - migration save/restore, ME cooperation, injection       │
//! │   - control surface + SysLog audit trail                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Identifiers, run states, flags, register frames
//! - `config` - `HvConfig` and the per-slot memory layout
//! - `pause` - Reference-counted pause with readmission capability
//! - `shared` - Shared-state page (pending/mask vectors, upcall flag)
//! - `evtchn` - Event-channel tables and cross-domain operations
//! - `upcall` - The pending-event delivery loop
//! - `domain` - The domain control block
//! - `registry` - The global slot table
//! - `sched` - Scheduling policies
//! - `me` - ME lifecycle and the domain-call argument record
//! - `snapshot` - `dom_context` capture format
//! - `image` - ME image container and device-description patching
//! - `invariants` - Runtime-checkable invariants
//! - `loom_tests` - Model-checked sender/delivery races (with `loom` feature)

#![no_std]
#![deny(unsafe_code)]
extern crate alloc;

pub mod config;
pub mod domain;
pub mod evtchn;
pub mod image;
pub mod invariants;
pub mod me;
pub mod pause;
pub mod registry;
pub mod sched;
pub mod shared;
pub mod snapshot;
pub mod types;
pub mod upcall;
mod sync;
mod wire;

#[cfg(any(test, feature = "loom"))]
mod loom_tests;

pub use config::{ConfigError, HvConfig, MeSlotLayout};
pub use domain::{Callback, Domain, DomainDesc};
pub use evtchn::{EvtchnError, EvtchnState, EvtchnStatus, EvtchnTable};
pub use image::{ImageError, MeImage};
pub use invariants::{check_all_invariants, InvariantViolation};
pub use me::{CoopRole, DomcallCommand, DomcallFrame, GuestError, MeState};
pub use pause::{PauseCount, PauseToken, Readmit};
pub use registry::{Registry, RegistryError};
pub use sched::{AgencyPolicy, FlipPolicy, Pick, Policy, PolicyKind, SchedPolicy};
pub use shared::{SharedImage, SharedInfo};
pub use snapshot::{DomContext, SnapshotError};
pub use types::{
    CpuRegs, DomainFlags, DomainId, DomainKind, ExceptionFrame, MeDescriptor, MemRegion,
    PauseFlags, Port, RunState, Virq, CPU_REG_WORDS, EXC_FRAME_WORDS,
};
pub use upcall::deliver_events;
