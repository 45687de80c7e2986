//! Per-CPU dispatch
//!
//! Every run-state transition of a domain happens under the scheduling
//! lock of the CPU it is pinned to, so the dispatcher, `sleep_nosync` and
//! `wake` never race each other on the same domain.
//!
//! ```text
//!            schedule()                  yield / sleep / block
//!   Runnable ───────────▶ Running ───────────────────────────▶ Runnable
//!      ▲                                                      | Blocked
//!      │            wake() (unpaused, unflagged)              | Offline
//!      └──────────────────────────────────────────────────────┘
//! ```

use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use mhv_abi::softirq;
use mhv_core::{Domain, DomainFlags, DomainId, Policy, RunState, SchedPolicy};
use mhv_hal::HAL;

use crate::Hypervisor;

/// Dispatcher state of one CPU
pub(crate) struct CpuSched {
    pub(crate) current: DomainId,
    pub(crate) policy: Policy,
    pub(crate) idle: Arc<Domain>,
    /// Deadline of the running slice, if the policy set one
    pub(crate) slice_deadline: Option<u64>,
    pub(crate) schedule_count: u64,
}

impl CpuSched {
    pub(crate) fn new(policy: Policy, idle: Arc<Domain>) -> Self {
        Self {
            current: idle.id,
            policy,
            idle,
            slice_deadline: None,
            schedule_count: 0,
        }
    }
}

impl<H: HAL> Hypervisor<H> {
    fn resolve(&self, cs: &CpuSched, id: DomainId) -> Option<Arc<Domain>> {
        if id == DomainId::IDLE {
            Some(cs.idle.clone())
        } else {
            self.registry.get(id)
        }
    }

    /// Domain currently dispatched on `cpu`
    pub fn current(&self, cpu: usize) -> DomainId {
        self.cpus[cpu].lock().current
    }

    /// Number of dispatch decisions taken on `cpu`
    pub fn schedule_count(&self, cpu: usize) -> u64 {
        self.cpus[cpu].lock().schedule_count
    }

    /// Run the dispatcher on `cpu`.
    ///
    /// The policy picks under the CPU lock, both run states are updated,
    /// the lock is released, and only then is the previous domain's
    /// running flag cleared and the context switched.
    pub fn schedule(&self, cpu: usize) {
        let irq = self.hal.local_irq_save();
        let mut cs = self.cpus[cpu].lock();
        cs.schedule_count += 1;

        let prev_id = cs.current;
        let registry = &self.registry;
        // The pause count drops outside this lock, so a domain can read as
        // runnable while still Offline until its wake lands here.
        let pick = cs.policy.pick_next(&|id: DomainId| {
            registry.get(id).is_some_and(|d| {
                d.cpu == cpu
                    && d.is_runnable()
                    && (id == prev_id || d.runstate() == RunState::Runnable)
            })
        });

        let next = pick
            .next
            .and_then(|id| self.registry.get(id))
            .unwrap_or_else(|| cs.idle.clone());

        cs.slice_deadline = pick.slice_ns.map(|s| self.hal.now_nanos().saturating_add(s));
        if let Some(deadline) = cs.slice_deadline {
            self.hal.set_timer(cpu, deadline);
        }

        if next.id == prev_id {
            drop(cs);
            self.hal.local_irq_restore(irq);
            return;
        }

        let prev = self.resolve(&cs, prev_id);
        if let Some(prev) = &prev {
            prev.transition(RunState::Running, prev.descheduled_state());
        }
        next.transition(RunState::Runnable, RunState::Running);
        next.set_running(true);
        cs.current = next.id;
        drop(cs);

        if let Some(prev) = prev {
            prev.set_running(false);
        }
        self.hal.context_switch(cpu, prev_id.0, next.id.0);
        self.hal.local_irq_restore(irq);
    }

    /// The current domain of `cpu` gives up the CPU voluntarily.
    pub fn do_yield(&self, cpu: usize) {
        let irq = self.hal.local_irq_save();
        {
            let mut cs = self.cpus[cpu].lock();
            let current = cs.current;
            cs.policy.yield_(current);
        }
        self.hal.local_irq_restore(irq);
        self.schedule(cpu);
    }

    /// The current domain of `cpu` blocks until an event arrives.
    ///
    /// Returns immediately if an upcall is already pending.
    pub fn do_block(&self, cpu: usize) {
        let current = self.current(cpu);
        let Some(dom) = self.registry.get(current) else {
            return;
        };
        dom.set_flags(DomainFlags::BLOCKED);
        if dom.shared.upcall_pending() {
            dom.clear_flags(DomainFlags::BLOCKED);
            return;
        }
        self.schedule(cpu);
    }

    /// Take a domain off its CPU without waiting.
    ///
    /// Callers first make the domain ineligible (pause or flag). A
    /// runnable domain is moved to its descheduled state at once; a
    /// running one gets a reschedule raised on its CPU.
    pub fn sleep_nosync(&self, dom: &Domain) {
        let irq = self.hal.local_irq_save();
        let running = {
            let _cs = self.cpus[dom.cpu].lock();
            match dom.runstate() {
                RunState::Runnable => {
                    let to = dom.descheduled_state();
                    if to != RunState::Runnable {
                        dom.transition(RunState::Runnable, to);
                    }
                    false
                }
                RunState::Running => true,
                RunState::Blocked | RunState::Offline => false,
            }
        };
        self.hal.local_irq_restore(irq);
        if running {
            self.raise_softirq(dom.cpu, softirq::SCHEDULE);
        }
    }

    /// Take a domain off its CPU and wait until it has stopped running.
    ///
    /// When the domain's CPU is the calling CPU, pending softirqs are run
    /// in the loop; otherwise the loop relaxes until the remote CPU has
    /// switched away.
    pub fn sleep_sync(&self, dom: &Domain) {
        self.sleep_nosync(dom);
        while dom.is_running() {
            if dom.cpu == self.hal.current_cpu() {
                self.do_softirq(dom.cpu);
            } else {
                self.hal.cpu_relax();
            }
        }
    }

    /// Make a domain eligible again if nothing holds it back.
    pub fn wake(&self, dom: &Domain) {
        self.wake_clearing(dom, DomainFlags::empty());
    }

    /// Clear `flags` and wake, both under the domain's CPU lock.
    pub(crate) fn wake_clearing(&self, dom: &Domain, flags: DomainFlags) {
        let irq = self.hal.local_irq_save();
        let woken = {
            let mut cs = self.cpus[dom.cpu].lock();
            dom.clear_flags(flags);
            let woken = dom.is_runnable() && dom.try_make_runnable();
            if woken {
                cs.policy.wake(dom.id);
            }
            woken
        };
        self.hal.local_irq_restore(irq);
        if woken {
            self.raise_softirq(dom.cpu, softirq::SCHEDULE);
        }
    }

    /// Clear a blocked domain's wait and wake it.
    pub(crate) fn unblock(&self, dom: &Domain) {
        if dom.clear_flags(DomainFlags::BLOCKED).contains(DomainFlags::BLOCKED) {
            self.wake(dom);
        }
    }

    // ========================================================================
    // Softirqs and timer
    // ========================================================================

    pub fn raise_softirq(&self, cpu: usize, nr: u32) {
        self.softirqs[cpu].fetch_or(1 << nr, Ordering::AcqRel);
        if cpu != self.hal.current_cpu() {
            self.hal.send_ipi(cpu);
        }
    }

    pub fn softirq_pending(&self, cpu: usize) -> bool {
        self.softirqs[cpu].load(Ordering::Acquire) != 0
    }

    /// Run every softirq pending on `cpu` until none is left.
    pub fn do_softirq(&self, cpu: usize) {
        loop {
            let pending = self.softirqs[cpu].swap(0, Ordering::AcqRel);
            if pending == 0 {
                return;
            }
            if pending & (1 << softirq::DOMCALL) != 0 {
                self.run_deferred_domcalls();
            }
            if pending & (1 << softirq::SCHEDULE) != 0 {
                self.schedule(cpu);
            }
        }
    }

    /// Timer interrupt on `cpu`: deliver the timer VIRQ to the running
    /// domain and reschedule once its slice has expired.
    pub fn timer_tick(&self, cpu: usize) {
        let now = self.hal.now_nanos();
        let (current, expired) = {
            let mut cs = self.cpus[cpu].lock();
            let expired = cs.slice_deadline.is_some_and(|d| now >= d);
            if expired {
                cs.slice_deadline = None;
            }
            (cs.current, expired)
        };
        if let Some(dom) = self.registry.get(current) {
            if mhv_core::evtchn::send_virq(&dom, mhv_abi::virq::TIMER) {
                self.unblock(&dom);
            }
        }
        if expired {
            self.raise_softirq(cpu, softirq::SCHEDULE);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mhv_core::HvConfig;
    use mhv_hal::TestHal;

    fn hv() -> Hypervisor<TestHal> {
        let hv = Hypervisor::new(TestHal::new(), HvConfig::default()).unwrap();
        hv.boot_agency().unwrap();
        hv
    }

    #[test]
    fn test_idle_runs_at_boot() {
        let hv = Hypervisor::new(TestHal::new(), HvConfig::default()).unwrap();
        assert_eq!(hv.current(0), DomainId::IDLE);
        assert_eq!(hv.current(1), DomainId::IDLE);
    }

    #[test]
    fn test_agency_dispatched_on_its_cpu() {
        let hv = hv();
        hv.do_softirq(0);
        assert_eq!(hv.current(0), DomainId::AGENCY);
        let agency = hv.domain(DomainId::AGENCY).unwrap();
        assert_eq!(agency.runstate(), RunState::Running);
        assert!(agency.is_running());
        assert!(hv.check_invariants().is_empty());
    }

    #[test]
    fn test_released_but_not_yet_woken_is_not_dispatched() {
        let hv = hv();
        hv.do_softirq(0);
        let agency = hv.domain(DomainId::AGENCY).unwrap();
        let token = hv.pause(DomainId::AGENCY).unwrap();
        hv.do_softirq(0);
        assert_eq!(hv.current(0), DomainId::IDLE);
        assert_eq!(agency.runstate(), RunState::Offline);

        // Count back to zero, wake still in flight
        let readmit = agency.pause.unpause(token).unwrap();
        assert!(agency.is_runnable());
        hv.schedule(0);
        assert_eq!(hv.current(0), DomainId::IDLE);
        assert_eq!(agency.runstate(), RunState::Offline);

        hv.readmit(&agency, readmit);
        hv.do_softirq(0);
        assert_eq!(hv.current(0), DomainId::AGENCY);
        assert!(hv.check_invariants().is_empty());
    }

    #[test]
    fn test_raise_softirq_sets_bit() {
        let hv = hv();
        hv.do_softirq(1);
        assert!(!hv.softirq_pending(1));
        hv.raise_softirq(1, softirq::SCHEDULE);
        assert!(hv.softirq_pending(1));
        hv.do_softirq(1);
        assert!(!hv.softirq_pending(1));
    }

    #[test]
    fn test_slice_expiry_reschedules() {
        let hv = hv();
        hv.do_softirq(1);
        assert_eq!(hv.current(1), DomainId::AGENCY_RT);
        hv.timer_tick(1);
        assert!(!hv.softirq_pending(1));
        hv.hal().advance(hv.config().agency_slice_ns);
        hv.timer_tick(1);
        assert!(hv.softirq_pending(1));
    }
}
