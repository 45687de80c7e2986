//! mhv Kernel - HAL-Integrated Hypervisor Runtime
//!
//! This crate drives the pure state of `mhv-core` through a [`HAL`]:
//! - Per-CPU dispatch, sleep/wake and softirqs
//! - Event-channel operations with wakeups
//! - Domain-calls into guest context
//! - Migration save/restore and ME cooperation
//! - Image injection
//! - The privileged control surface, audited in a `SysLog`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Hypervisor<H: HAL>                      │
//! │                                                             │
//! │  control() ──▶ SysLog (request) ──▶ operation ──▶ SysLog    │
//! │                                        │          (status)  │
//! │           ┌────────────────┬───────────┼──────────────┐     │
//! │           ▼                ▼           ▼              ▼     │
//! │     ┌──────────┐    ┌──────────┐ ┌──────────┐  ┌─────────┐  │
//! │     │ sched    │    │ evtchn   │ │ domcall  │  │migration│  │
//! │     │ per-CPU  │◀───│ send/    │ │ guard +  │◀─│ coop    │  │
//! │     │ dispatch │    │ deliver  │ │ invoke   │  │ inject  │  │
//! │     └──────────┘    └──────────┘ └──────────┘  └─────────┘  │
//! │           │                │           │              │     │
//! │           └────────────────┴─────┬─────┴──────────────┘     │
//! │                                  ▼                          │
//! │                       mhv-core Registry                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock order: per-CPU scheduling lock, then per-domain channel locks in
//! ascending domain id. The registry lock is never held across either.

#![no_std]
#![deny(unsafe_code)]
extern crate alloc;

mod control;
mod coop;
mod domcall;
mod error;
mod evtchn;
mod inject;
mod mapper;
mod migration;
mod sched;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::AtomicU32;
use mhv_abi::domid;
use mhv_axiom::SysLog;
use mhv_core::{
    check_all_invariants, Domain, DomainFlags, DomainId, DomainKind, HvConfig,
    InvariantViolation, MeState, MemRegion, PauseFlags, PauseToken, Policy, Readmit, RunState,
    SchedPolicy,
};
use mhv_hal::{ConfigStore, HAL};
use spin::Mutex;

pub use control::{ControlOp, ControlOut, ControlReply};
pub use coop::CoopPair;
pub use domcall::AddressSpaceGuard;
pub use error::HvError;
pub use migration::{Activation, Propagation, RestoredDomain};

// Re-export HAL types
pub use mhv_hal::{HalError, HAL as HalTrait};

use domcall::DeferredCall;
use sched::CpuSched;

/// The hypervisor runtime.
pub struct Hypervisor<H: HAL> {
    hal: H,
    config: HvConfig,
    registry: mhv_core::Registry,
    /// Per-CPU dispatcher state, indexed by CPU
    cpus: Vec<Mutex<CpuSched>>,
    /// Per-CPU pending softirq bits
    softirqs: Vec<AtomicU32>,
    /// Domain-calls deferred to `DOMCALL` softirq context
    deferred: Mutex<VecDeque<DeferredCall>>,
    syslog: Mutex<SysLog>,
    store: Option<Arc<dyn ConfigStore>>,
}

impl<H: HAL> Hypervisor<H> {
    /// Bring up the runtime: one idle domain and one policy per CPU.
    pub fn new(hal: H, config: HvConfig) -> Result<Self, HvError> {
        config.validate()?;
        let mut cpus = Vec::with_capacity(config.nr_cpus);
        for cpu in 0..config.nr_cpus {
            let idle = Arc::new(Domain::new_idle(cpu).ok_or(HvError::NoMemory)?);
            idle.transition(RunState::Runnable, RunState::Running);
            idle.set_running(true);
            cpus.push(Mutex::new(CpuSched::new(
                Policy::for_cpu(cpu, &config),
                idle,
            )));
        }
        let softirqs = (0..config.nr_cpus).map(|_| AtomicU32::new(0)).collect();
        hal.debug_write(&alloc::format!(
            "[hv] up: {} CPUs, agency on {}, MEs on {}, host {:#x}",
            config.nr_cpus,
            config.agency_cpu,
            config.me_cpu,
            config.host_id
        ));
        Ok(Self {
            hal,
            config,
            registry: mhv_core::Registry::new(),
            cpus,
            softirqs,
            deferred: Mutex::new(VecDeque::new()),
            syslog: Mutex::new(SysLog::new()),
            store: None,
        })
    }

    /// Attach the configuration-store collaborator
    pub fn with_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Create and start the agency and agency-RT domains.
    pub fn boot_agency(&self) -> Result<(), HvError> {
        for id in [DomainId::AGENCY, DomainId::AGENCY_RT] {
            self.create_domain(id)?;
            self.unpause_controller(id)?;
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &HvConfig {
        &self.config
    }

    pub fn registry(&self) -> &mhv_core::Registry {
        &self.registry
    }

    pub fn domain(&self, id: DomainId) -> Result<Arc<Domain>, HvError> {
        self.registry.get(id).ok_or(HvError::NoSuchDomain(id))
    }

    /// Read access to the audit trail
    pub fn with_syslog<R>(&self, f: impl FnOnce(&SysLog) -> R) -> R {
        f(&self.syslog.lock())
    }

    // ========================================================================
    // Domain creation
    // ========================================================================

    /// Create a domain in slot `id`, paused by the controller.
    ///
    /// ME slots get the region of their configured layout; the agency
    /// domains own no region.
    pub fn create_domain(&self, id: DomainId) -> Result<Arc<Domain>, HvError> {
        let region = self
            .config
            .slot_layout(id)
            .map(|l| l.region())
            .unwrap_or_default();
        self.create_domain_in(id, region)
    }

    pub(crate) fn create_domain_in(
        &self,
        id: DomainId,
        region: MemRegion,
    ) -> Result<Arc<Domain>, HvError> {
        if !id.is_slot() {
            return Err(HvError::BadSlot);
        }
        let cpu = self.config.cpu_for(id);
        let irq = self.hal.local_irq_save();
        let result = {
            let mut cs = self.cpus[cpu].lock();
            self.registry
                .create_with_policy(id, cpu, cs.policy.kind(), region)
                .map(|dom| {
                    cs.policy.add(dom.id, dom.kind);
                    dom
                })
        };
        self.hal.local_irq_restore(irq);
        let dom = result?;
        self.hal.debug_write(&alloc::format!(
            "[hv] created {} ({:?}) on CPU {}, region {:#x}+{:#x}",
            id,
            dom.kind,
            cpu,
            region.base,
            region.size
        ));
        Ok(dom)
    }

    /// First free ME slot whose layout can hold `size` bytes
    pub fn get_free_slot(&self, size: u64) -> Result<DomainId, HvError> {
        self.registry
            .first_free(domid::ME_FIRST..mhv_abi::MAX_DOMAINS as u16, |id| {
                self.config
                    .slot_layout(id)
                    .is_some_and(|l| l.size >= size)
            })
            .ok_or(HvError::NoFreeSlot)
    }

    // ========================================================================
    // Pause control
    // ========================================================================

    /// Take the pause reference attributed to `flag` and get the domain
    /// off its CPU asynchronously.
    pub fn pause_by(&self, id: DomainId, flag: PauseFlags) -> Result<bool, HvError> {
        let dom = self.domain(id)?;
        let taken = dom.pause.pause_by(flag);
        self.sleep_nosync(&dom);
        Ok(taken)
    }

    /// Return the pause reference attributed to `flag`.
    ///
    /// Returns whether the domain was readmitted.
    pub fn unpause_by(&self, id: DomainId, flag: PauseFlags) -> Result<bool, HvError> {
        let dom = self.domain(id)?;
        match dom.pause.unpause_by(flag) {
            Some(readmit) => {
                self.readmit(&dom, readmit);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release the controller's pause. Fails if the controller holds none.
    pub fn unpause_controller(&self, id: DomainId) -> Result<(), HvError> {
        let dom = self.domain(id)?;
        if !dom.pause.flags().contains(PauseFlags::CONTROLLER) {
            return Err(HvError::InvalidState);
        }
        self.unpause_by(id, PauseFlags::CONTROLLER).map(|_| ())
    }

    /// Take an anonymous pause reference.
    pub fn pause(&self, id: DomainId) -> Result<PauseToken, HvError> {
        let dom = self.domain(id)?;
        let token = dom.pause.pause();
        self.sleep_nosync(&dom);
        Ok(token)
    }

    /// Return an anonymous pause reference taken with [`pause`](Self::pause)
    /// or handed out by a restore.
    pub fn unpause(&self, id: DomainId, token: PauseToken) -> Result<bool, HvError> {
        let dom = self.domain(id)?;
        match dom.pause.unpause(token) {
            Some(readmit) => {
                self.readmit(&dom, readmit);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Consume a readmission capability: finish a pending destroy, or make
    /// the domain eligible again.
    pub(crate) fn readmit(&self, dom: &Arc<Domain>, _readmit: Readmit) {
        if dom.is_dying() {
            self.complete_destroy(dom);
            return;
        }
        self.wake_clearing(dom, DomainFlags::DOWN);
    }

    // ========================================================================
    // ME state
    // ========================================================================

    /// Commit `to` as the ME state of `dom` if the lifecycle allows it.
    ///
    /// Returns the state in force afterwards.
    pub(crate) fn commit_me_state(&self, dom: &Domain, to: MeState) -> MeState {
        let from = dom.me_state();
        if from == to {
            return from;
        }
        if !from.can_commit(to) {
            self.hal.debug_write(&alloc::format!(
                "[me] {} ignored {:?} -> {:?}",
                dom.id,
                from,
                to
            ));
            return from;
        }
        dom.set_me_state(to);
        self.syslog.lock().log_transition(
            dom.id.0,
            from as u8,
            to as u8,
            self.hal.now_nanos(),
        );
        self.hal.debug_write(&alloc::format!(
            "[me] {} {:?} -> {:?}",
            dom.id,
            from,
            to
        ));
        self.publish(dom.id, "state", me_state_name(to));
        to
    }

    /// ME state of a slot; `Dead` when the slot is empty
    pub fn me_state(&self, id: DomainId) -> MeState {
        self.registry
            .get(id)
            .map_or(MeState::Dead, |d| d.me_state())
    }

    /// Set the ME state on behalf of the controller.
    pub fn set_me_state(&self, id: DomainId, state: MeState) -> Result<MeState, HvError> {
        let dom = self.domain(id)?;
        if dom.kind != DomainKind::Me {
            return Err(HvError::InvalidState);
        }
        if !dom.me_state().can_commit(state) {
            return Err(HvError::InvalidState);
        }
        let now = self.commit_me_state(&dom, state);
        if now.is_final() {
            self.teardown(&dom);
        }
        Ok(now)
    }

    // ========================================================================
    // Configuration store
    // ========================================================================

    /// Write `domain/<id>/me/<key>` if a store is attached
    pub(crate) fn publish(&self, id: DomainId, key: &str, value: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let path = alloc::format!("domain/{}/me/{}", id.0, key);
        if let Err(e) = store.write(&path, value) {
            self.hal
                .debug_write(&alloc::format!("[store] write {} failed: {:?}", path, e));
        }
    }

    /// Read `domain/<id>/me/<key>` if a store is attached
    pub(crate) fn lookup(&self, id: DomainId, key: &str) -> Option<String> {
        let store = self.store.as_ref()?;
        store.read(&alloc::format!("domain/{}/me/{}", id.0, key))
    }

    pub(crate) fn unpublish(&self, id: DomainId) {
        let Some(store) = &self.store else {
            return;
        };
        let path = alloc::format!("domain/{}", id.0);
        match store.remove(&path) {
            // Nothing published is fine
            Ok(()) | Err(HalError::NoSuchKey) => {}
            Err(e) => self
                .hal
                .debug_write(&alloc::format!("[store] remove {} failed: {:?}", path, e)),
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Check registry invariants plus the dispatcher's own: each CPU's
    /// current domain is the only one running there.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = check_all_invariants(&self.registry);
        for (cpu, cs) in self.cpus.iter().enumerate() {
            let current = cs.lock().current;
            for dom in self.registry.domains().iter().filter(|d| d.cpu == cpu) {
                let running = dom.runstate() == RunState::Running || dom.is_running();
                if running != (dom.id == current) {
                    violations.push(InvariantViolation {
                        invariant: "single_running",
                        description: alloc::format!(
                            "CPU {} current {} but {} is {:?} (running {})",
                            cpu,
                            current,
                            dom.id,
                            dom.runstate(),
                            dom.is_running()
                        ),
                    });
                }
            }
        }
        violations
    }

    /// Write the state of every domain and CPU to the debug console.
    pub fn dump(&self) {
        for (cpu, cs) in self.cpus.iter().enumerate() {
            let cs = cs.lock();
            self.hal.debug_write(&alloc::format!(
                "[dump] CPU {}: current {} policy {} schedules {}",
                cpu,
                cs.current,
                cs.policy.name(),
                cs.schedule_count
            ));
        }
        for (id, desc, table) in self.registry.dump() {
            self.hal.debug_write(&alloc::format!(
                "[dump] {} {:?} {:?} pause {} {:?} flags {:?} me {:?}",
                id,
                desc.kind,
                desc.runstate,
                desc.pause_count,
                desc.pause_flags,
                desc.flags,
                desc.me_state
            ));
            for (port, state) in table.bound() {
                self.hal
                    .debug_write(&alloc::format!("[dump]   port {}: {:?}", port, state));
            }
        }
    }
}

pub(crate) fn me_state_name(state: MeState) -> &'static str {
    match state {
        MeState::Booting => "booting",
        MeState::Living => "living",
        MeState::Suspended => "suspended",
        MeState::Migrating => "migrating",
        MeState::Dormant => "dormant",
        MeState::Killed => "killed",
        MeState::Terminated => "terminated",
        MeState::Dead => "dead",
    }
}
