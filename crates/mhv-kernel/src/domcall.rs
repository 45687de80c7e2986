//! Domain-calls
//!
//! A domain-call runs the callback a domain published at boot, inside that
//! domain's address space, with local interrupts disabled throughout:
//!
//! ```text
//! irqs off ─▶ AddressSpaceGuard::enter(root) ─▶ invoke_guest ─▶ guard drop
//!                                                                (restore)
//! ```
//!
//! The guard restores the caller's address space on every exit path,
//! including a panic unwinding out of the guest invocation.
//!
//! The guest reports the ME state it wants in the argument record. The
//! request is committed by the caller at a synchronisation point, never
//! from inside the call.

use mhv_abi::{softirq, virq};
use mhv_core::{Domain, DomainId, DomcallCommand, DomcallFrame, GuestError, MeState};
use mhv_hal::{HalError, HAL};

use crate::{HvError, Hypervisor};

/// Switches to a guest address space and switches back when dropped.
#[must_use = "the previous address space is restored when the guard drops"]
pub struct AddressSpaceGuard<'h, H: HAL> {
    hal: &'h H,
    saved: u64,
}

impl<'h, H: HAL> AddressSpaceGuard<'h, H> {
    pub fn enter(hal: &'h H, root: u64) -> Self {
        let saved = hal.current_address_space();
        hal.switch_address_space(root);
        Self { hal, saved }
    }

    /// Address space that will be restored
    pub fn saved(&self) -> u64 {
        self.saved
    }
}

impl<H: HAL> Drop for AddressSpaceGuard<'_, H> {
    fn drop(&mut self) {
        self.hal.switch_address_space(self.saved);
    }
}

/// A domain-call queued for softirq context
pub(crate) struct DeferredCall {
    pub(crate) target: DomainId,
    pub(crate) cmd: DomcallCommand,
    pub(crate) frame: DomcallFrame,
}

impl<H: HAL> Hypervisor<H> {
    /// Argument record pre-filled with the domain's own view
    pub(crate) fn frame_for(&self, dom: &Domain) -> DomcallFrame {
        let desc = *dom.desc.lock();
        DomcallFrame {
            host_id: self.config.host_id,
            spid: desc.spid,
            caps: desc.caps,
            me_state: dom.me_state() as u8,
            ..DomcallFrame::default()
        }
    }

    /// Invoke `cmd` in `target`. Local interrupts must already be off.
    ///
    /// On return `frame` holds the record as the guest left it.
    pub fn domain_call(
        &self,
        target: DomainId,
        cmd: DomcallCommand,
        frame: &mut DomcallFrame,
    ) -> Result<i64, HvError> {
        assert!(
            self.hal.irqs_disabled(),
            "domcall: {:?} to {} with interrupts enabled",
            cmd,
            target
        );
        let dom = self.domain(target)?;
        let callback = dom.callback().ok_or(HvError::NotRegistered(target))?;

        let mut record = frame.encode();
        let rc = {
            let _guard = AddressSpaceGuard::enter(&self.hal, callback.address_space);
            self.hal.invoke_guest(callback.entry, cmd.code(), &mut record)?
        };
        *frame = DomcallFrame::decode(&record).ok_or(HvError::Hal(HalError::GuestFault))?;

        self.hal.debug_write(&alloc::format!(
            "[domcall] {:?} -> {} rc {} state {}",
            cmd,
            target,
            rc,
            frame.me_state
        ));
        Ok(rc)
    }

    /// [`domain_call`](Self::domain_call) bracketed by interrupt save and
    /// restore, for callers running with interrupts on.
    pub fn domain_call_irqsave(
        &self,
        target: DomainId,
        cmd: DomcallCommand,
        frame: &mut DomcallFrame,
    ) -> Result<i64, HvError> {
        let irq = self.hal.local_irq_save();
        let rc = self.domain_call(target, cmd, frame);
        self.hal.local_irq_restore(irq);
        rc
    }

    /// Call `dom` with its own record and return the state it asked for.
    ///
    /// A non-zero return code is the guest's error; its record is ignored.
    pub(crate) fn ask(&self, dom: &Domain, cmd: DomcallCommand) -> Result<Option<MeState>, HvError> {
        let mut frame = self.frame_for(dom);
        let rc = self.domain_call_irqsave(dom.id, cmd, &mut frame)?;
        GuestError::check(rc)?;
        Ok(MeState::from_u8(frame.me_state))
    }

    /// Queue a domain-call for the `DOMCALL` softirq of the calling CPU.
    pub fn queue_domcall(&self, target: DomainId, cmd: DomcallCommand, frame: DomcallFrame) {
        self.deferred.lock().push_back(DeferredCall { target, cmd, frame });
        self.raise_softirq(self.hal.current_cpu(), softirq::DOMCALL);
    }

    /// Number of queued domain-calls not yet run
    pub fn deferred_domcalls(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Drain the deferred queue, committing each requested state and
    /// notifying the agency.
    pub(crate) fn run_deferred_domcalls(&self) {
        loop {
            // Pop under the lock, call without it
            let Some(mut call) = self.deferred.lock().pop_front() else {
                return;
            };
            let Some(dom) = self.registry.get(call.target) else {
                continue;
            };
            if dom.is_dying() {
                continue;
            }
            let done = self
                .domain_call_irqsave(call.target, call.cmd, &mut call.frame)
                .and_then(|rc| GuestError::check(rc).map_err(HvError::from));
            match done {
                Ok(()) => {
                    if let Some(state) = MeState::from_u8(call.frame.me_state) {
                        let now = self.commit_me_state(&dom, state);
                        if now.is_final() {
                            self.teardown(&dom);
                        }
                    }
                }
                Err(e) => self.hal.debug_write(&alloc::format!(
                    "[domcall] deferred {:?} to {} failed: {:?}",
                    call.cmd,
                    call.target,
                    e
                )),
            }
            if let Err(e) = self.send_virq(DomainId::AGENCY, virq::DOMCALL) {
                self.hal.debug_write(&alloc::format!(
                    "[domcall] completion notice for {} not delivered: {:?}",
                    call.target,
                    e
                ));
            }
        }
    }

    /// Ask the guest for its SPID and capability vector and publish them.
    pub fn sync_descriptor(&self, id: DomainId) -> Result<(), HvError> {
        let dom = self.domain(id)?;
        let mut frame = self.frame_for(&dom);
        self.domain_call_irqsave(id, DomcallCommand::SyncDescriptor, &mut frame)?;
        {
            let mut desc = dom.desc.lock();
            desc.spid = frame.spid;
            desc.caps = frame.caps;
        }
        self.publish(id, "spid", &alloc::format!("{:#x}", frame.spid));
        self.publish(id, "caps", &hex(&frame.caps));
        Ok(())
    }

    /// Ask the guest for its state and commit it.
    pub fn sync_me_state(&self, id: DomainId) -> Result<MeState, HvError> {
        let dom = self.domain(id)?;
        let requested = self
            .ask(&dom, DomcallCommand::GetState)?
            .ok_or(HvError::Hal(HalError::GuestFault))?;
        let now = self.commit_me_state(&dom, requested);
        if now.is_final() {
            self.teardown(&dom);
        }
        Ok(now)
    }
}

pub(crate) fn hex(bytes: &[u8]) -> alloc::string::String {
    use core::fmt::Write;
    let mut s = alloc::string::String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}
