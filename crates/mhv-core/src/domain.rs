//! Domain control block
//!
//! Owned exclusively by the [`Registry`](crate::registry::Registry) (behind
//! an `Arc` so the runtime can work on a domain without holding the registry
//! lock). The hypervisor stack and the event-channel table are owned by the
//! entry and released when the last reference drops after `destroy`.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use mhv_abi::HV_STACK_SIZE;
use mhv_unsafe_primitives::HvStack;
use serde::{Deserialize, Serialize};
use spin::Mutex;

use crate::evtchn::EvtchnTable;
use crate::me::MeState;
use crate::pause::PauseCount;
use crate::sched::PolicyKind;
use crate::shared::SharedInfo;
use crate::types::{
    CpuRegs, DomainFlags, DomainId, DomainKind, ExceptionFrame, MeDescriptor, MemRegion,
    PauseFlags, RunState, EXC_FRAME_WORDS,
};

/// Domain-call entry published by a domain at boot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    /// Guest virtual address of the entry point
    pub entry: u64,
    /// Root of the address space the entry lives in
    pub address_space: u64,
}

/// Descriptor returned by the control surface
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainDesc {
    pub id: DomainId,
    pub kind: DomainKind,
    pub cpu: usize,
    pub runstate: RunState,
    pub pause_count: u32,
    pub pause_flags: PauseFlags,
    pub flags: DomainFlags,
    pub me_state: MeState,
    pub spid: u64,
    pub region: MemRegion,
}

/// The unit of scheduling and isolation.
#[derive(Debug)]
pub struct Domain {
    pub id: DomainId,
    pub kind: DomainKind,
    /// CPU the domain is pinned to
    pub cpu: usize,
    /// Policy of the pinned CPU
    pub policy: PolicyKind,
    pub region: MemRegion,

    runstate: AtomicU8,
    is_running: AtomicBool,
    flags: AtomicU32,

    pub pause: PauseCount,
    pub evtchn: Mutex<EvtchnTable>,
    pub shared: SharedInfo,
    pub regs: Mutex<CpuRegs>,
    pub stack: Mutex<HvStack>,
    pub desc: Mutex<MeDescriptor>,
    callback: Mutex<Option<Callback>>,
}

impl Domain {
    /// A freshly created domain: paused by the controller, offline, down.
    ///
    /// Returns `None` if the hypervisor stack cannot be allocated.
    pub fn new(id: DomainId, cpu: usize, policy: PolicyKind, region: MemRegion) -> Option<Self> {
        Some(Self {
            id,
            kind: DomainKind::for_slot(id),
            cpu,
            policy,
            region,
            runstate: AtomicU8::new(RunState::Offline as u8),
            is_running: AtomicBool::new(false),
            flags: AtomicU32::new(DomainFlags::DOWN.bits()),
            pause: PauseCount::paused_by_controller(),
            evtchn: Mutex::new(EvtchnTable::new()),
            shared: SharedInfo::new(),
            regs: Mutex::new(CpuRegs::default()),
            stack: Mutex::new(HvStack::new(HV_STACK_SIZE)?),
            desc: Mutex::new(MeDescriptor::default()),
            callback: Mutex::new(None),
        })
    }

    /// The per-CPU idle domain: never paused, never in the registry.
    pub fn new_idle(cpu: usize) -> Option<Self> {
        Some(Self {
            id: DomainId::IDLE,
            kind: DomainKind::Idle,
            cpu,
            policy: PolicyKind::Agency,
            region: MemRegion::default(),
            runstate: AtomicU8::new(RunState::Runnable as u8),
            is_running: AtomicBool::new(false),
            flags: AtomicU32::new(0),
            pause: PauseCount::new(),
            evtchn: Mutex::new(EvtchnTable::new()),
            shared: SharedInfo::new(),
            regs: Mutex::new(CpuRegs::default()),
            stack: Mutex::new(HvStack::new(HV_STACK_SIZE)?),
            desc: Mutex::new(MeDescriptor::default()),
            callback: Mutex::new(None),
        })
    }

    /// Rebuild a domain from restored parts, keeping it frozen: offline,
    /// migrating, with the captured pause counter.
    pub fn restored(
        id: DomainId,
        cpu: usize,
        policy: PolicyKind,
        region: MemRegion,
        pause: PauseCount,
        stack: HvStack,
    ) -> Self {
        Self {
            id,
            kind: DomainKind::for_slot(id),
            cpu,
            policy,
            region,
            runstate: AtomicU8::new(RunState::Offline as u8),
            is_running: AtomicBool::new(false),
            flags: AtomicU32::new(DomainFlags::MIGRATING.bits()),
            pause,
            evtchn: Mutex::new(EvtchnTable::new()),
            shared: SharedInfo::new(),
            regs: Mutex::new(CpuRegs::default()),
            stack: Mutex::new(stack),
            desc: Mutex::new(MeDescriptor::default()),
            callback: Mutex::new(None),
        }
    }

    // === Run state ===

    pub fn runstate(&self) -> RunState {
        RunState::from_u8(self.runstate.load(Ordering::Acquire)).unwrap_or(RunState::Offline)
    }

    /// Move from `from` to `to`. A different prior state is fatal.
    pub fn transition(&self, from: RunState, to: RunState) {
        if let Err(actual) = self.runstate.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "sched: {} runstate {:?} -> {:?}, found {:?}",
                self.id,
                from,
                to,
                RunState::from_u8(actual)
            );
        }
    }

    /// Move to `Runnable` if currently blocked or offline.
    ///
    /// Returns `false` if the domain was already runnable or running.
    pub fn try_make_runnable(&self) -> bool {
        for from in [RunState::Blocked, RunState::Offline] {
            if self
                .runstate
                .compare_exchange(
                    from as u8,
                    RunState::Runnable as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Run state a descheduled domain should land in
    pub fn descheduled_state(&self) -> RunState {
        if self.is_runnable() {
            RunState::Runnable
        } else if self.flags() == DomainFlags::BLOCKED && !self.pause.is_paused() {
            RunState::Blocked
        } else {
            RunState::Offline
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::Release);
    }

    // === Flags ===

    pub fn flags(&self) -> DomainFlags {
        DomainFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Set flags, returning the previous value
    pub fn set_flags(&self, f: DomainFlags) -> DomainFlags {
        DomainFlags::from_bits_truncate(self.flags.fetch_or(f.bits(), Ordering::AcqRel))
    }

    /// Clear flags, returning the previous value
    pub fn clear_flags(&self, f: DomainFlags) -> DomainFlags {
        DomainFlags::from_bits_truncate(self.flags.fetch_and(!f.bits(), Ordering::AcqRel))
    }

    pub fn is_dying(&self) -> bool {
        self.flags().contains(DomainFlags::DYING)
    }

    /// Eligible for the scheduler: unpaused and no blocking flag set.
    pub fn is_runnable(&self) -> bool {
        !self.pause.is_paused() && !self.flags().intersects(DomainFlags::NOT_RUNNABLE)
    }

    // === ME state ===

    pub fn me_state(&self) -> MeState {
        MeState::from_u8(self.shared.me_state()).unwrap_or(MeState::Dead)
    }

    pub fn set_me_state(&self, state: MeState) {
        self.shared.set_me_state(state as u8);
    }

    // === Domain-call entry ===

    pub fn register_callback(&self, entry: u64, address_space: u64) {
        *self.callback.lock() = Some(Callback {
            entry,
            address_space,
        });
    }

    pub fn callback(&self) -> Option<Callback> {
        *self.callback.lock()
    }

    // === Exception frame ===

    pub fn exception_frame(&self) -> ExceptionFrame {
        let stack = self.stack.lock();
        let mut frame = ExceptionFrame::default();
        frame.0.copy_from_slice(stack.frame(EXC_FRAME_WORDS));
        frame
    }

    /// Write `frame` at the top of the hypervisor stack
    pub fn set_exception_frame(&self, frame: &ExceptionFrame) {
        let spliced = self.stack.lock().splice_frame(&frame.0);
        assert!(spliced, "{}: exception frame larger than stack", self.id);
    }

    pub fn describe(&self) -> DomainDesc {
        DomainDesc {
            id: self.id,
            kind: self.kind,
            cpu: self.cpu,
            runstate: self.runstate(),
            pause_count: self.pause.count(),
            pause_flags: self.pause.flags(),
            flags: self.flags(),
            me_state: self.me_state(),
            spid: self.desc.lock().spid,
            region: self.region,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn me(id: u16) -> Domain {
        Domain::new(DomainId(id), 1, PolicyKind::Flip, MemRegion::default()).unwrap()
    }

    #[test]
    fn test_new_domain_is_frozen() {
        let d = me(2);
        assert_eq!(d.runstate(), RunState::Offline);
        assert!(d.flags().contains(DomainFlags::DOWN));
        assert_eq!(d.pause.count(), 1);
        assert_eq!(d.pause.flags(), PauseFlags::CONTROLLER);
        assert!(!d.is_runnable());
        assert_eq!(d.me_state(), MeState::Booting);
    }

    #[test]
    fn test_runnable_requires_unpause_and_flags() {
        let d = me(2);
        let _ = d.pause.unpause_by(PauseFlags::CONTROLLER);
        assert!(!d.is_runnable());
        d.clear_flags(DomainFlags::DOWN);
        assert!(d.is_runnable());
        d.set_flags(DomainFlags::BLOCKED);
        assert!(!d.is_runnable());
        assert_eq!(d.descheduled_state(), RunState::Blocked);
    }

    #[test]
    fn test_transition_checked() {
        let d = me(3);
        d.transition(RunState::Offline, RunState::Runnable);
        d.transition(RunState::Runnable, RunState::Running);
        assert_eq!(d.runstate(), RunState::Running);
        assert!(!d.try_make_runnable());
    }

    #[test]
    #[should_panic(expected = "runstate Running -> Blocked")]
    fn test_bad_transition_is_fatal() {
        let d = me(3);
        d.transition(RunState::Running, RunState::Blocked);
    }

    #[test]
    fn test_exception_frame_roundtrip() {
        let d = me(4);
        let mut frame = ExceptionFrame::default();
        frame.0[0] = 0xdead;
        frame.0[EXC_FRAME_WORDS - 1] = 0xbeef;
        d.set_exception_frame(&frame);
        assert_eq!(d.exception_frame(), frame);
    }

    #[test]
    fn test_idle_is_runnable() {
        let idle = Domain::new_idle(0).unwrap();
        assert_eq!(idle.kind, DomainKind::Idle);
        assert!(idle.is_runnable());
    }
}
