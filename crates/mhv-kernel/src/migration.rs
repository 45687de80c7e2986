//! Migration, propagation and teardown
//!
//! # Source side
//!
//! ```text
//! save_domain:  pre-suspend ─▶ pause(MIGRATION) ─▶ sleep_sync ─▶ MIGRATING
//!               ─▶ capture ─▶ [len][context][memory]
//! then either   finalize_migration (delivered)  or  abort_migration
//! ```
//!
//! # Destination side
//!
//! ```text
//! restore_domain:   decode + validate everything ─▶ free slot ─▶ memory
//!                   ─▶ domain entry ─▶ rebind agency ports ─▶ insert
//!                   ─▶ controller unpause (still MIGRATING, not eligible)
//! activate_migrated: pre-resume ─▶ pre-activate ─▶ cooperation
//!                   ─▶ resume + post-activate (deferred)   or  teardown
//! ```
//!
//! The pause state carried by a snapshot is the domain's state as seen by
//! everyone but the migration itself: the migration's own reference is
//! left out on capture and the MIGRATING flag is re-applied on restore.

use alloc::sync::Arc;
use alloc::vec::Vec;
use mhv_abi::{virq, HV_STACK_SIZE};
use mhv_core::evtchn::EvtchnState;
use mhv_core::{
    DomContext, Domain, DomainFlags, DomainId, DomainKind, DomcallCommand, MeState, MemRegion,
    PauseCount, PauseFlags, PauseToken, SchedPolicy,
};
use mhv_hal::HAL;
use mhv_unsafe_primitives::HvStack;

use crate::{HvError, Hypervisor};

/// A domain rebuilt from a snapshot.
#[derive(Debug)]
#[must_use = "anonymous pause references must be returned with Hypervisor::unpause"]
pub struct RestoredDomain {
    /// Slot the domain now occupies
    pub id: DomainId,
    /// Slot it occupied on the source node
    pub source_id: DomainId,
    /// Anonymous pause references that travelled with the snapshot
    pub tokens: Vec<PauseToken>,
}

/// Outcome of activating an arrived domain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Activation {
    /// The domain stays and has been resumed
    Resumed,
    /// The domain killed itself (cycle or cooperation) and was torn down
    Killed,
}

/// Outcome of asking a domain whether it may be sent on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Propagation {
    Proceed,
    /// The domain declined and was torn down
    Vetoed,
}

impl<H: HAL> Hypervisor<H> {
    // ========================================================================
    // Source side
    // ========================================================================

    /// Freeze an ME and serialise it.
    ///
    /// The domain stays frozen on this node until
    /// [`finalize_migration`](Self::finalize_migration) or
    /// [`abort_migration`](Self::abort_migration).
    pub fn save_domain(&self, id: DomainId) -> Result<Vec<u8>, HvError> {
        let dom = self.domain(id)?;
        if dom.kind != DomainKind::Me
            || dom.is_dying()
            || dom.flags().contains(DomainFlags::MIGRATING)
        {
            return Err(HvError::InvalidState);
        }

        // Frontends quiesce while the guest can still run
        self.ask(&dom, DomcallCommand::PreSuspend)?;

        if !dom.pause.pause_by(PauseFlags::MIGRATION) {
            return Err(HvError::InvalidState);
        }
        self.sleep_sync(&dom);
        dom.set_flags(DomainFlags::MIGRATING);
        self.commit_me_state(&dom, MeState::Migrating);

        let memory = match self.read_phys(dom.region.base, dom.region.size as usize) {
            Ok(m) => m,
            Err(e) => {
                self.abort_migration(id)?;
                return Err(e);
            }
        };

        let mut ctx = DomContext::capture(&dom);
        ctx.pause_count -= 1;
        ctx.pause_flags.remove(PauseFlags::MIGRATION);
        ctx.flags.remove(DomainFlags::MIGRATING);

        self.hal.debug_write(&alloc::format!(
            "[migration] saved {}: {} bytes of memory, pause {}",
            id,
            memory.len(),
            ctx.pause_count
        ));
        Ok(ctx.encode_stream(&memory))
    }

    /// The snapshot reached its destination: drop the local copy.
    pub fn finalize_migration(&self, id: DomainId) -> Result<(), HvError> {
        let dom = self.domain(id)?;
        if !dom.flags().contains(DomainFlags::MIGRATING) {
            return Err(HvError::InvalidState);
        }
        self.hal
            .debug_write(&alloc::format!("[migration] {} left this node", id));
        self.commit_me_state(&dom, MeState::Terminated);
        self.teardown(&dom);
        Ok(())
    }

    /// The transfer failed: resume the local copy.
    pub fn abort_migration(&self, id: DomainId) -> Result<(), HvError> {
        let dom = self.domain(id)?;
        if !dom.clear_flags(DomainFlags::MIGRATING).contains(DomainFlags::MIGRATING) {
            return Err(HvError::InvalidState);
        }
        self.commit_me_state(&dom, MeState::Living);
        if let Err(e) = self.ask(&dom, DomcallCommand::PreResume) {
            self.hal.debug_write(&alloc::format!(
                "[migration] {} pre-resume after abort failed: {:?}",
                id,
                e
            ));
        }
        if let Some(readmit) = dom.pause.unpause_by(PauseFlags::MIGRATION) {
            self.readmit(&dom, readmit);
        }
        self.hal
            .debug_write(&alloc::format!("[migration] {} resumed locally", id));
        Ok(())
    }

    // ========================================================================
    // Destination side
    // ========================================================================

    /// Rebuild a domain from a snapshot stream.
    ///
    /// The whole stream is validated and a slot found before anything in
    /// the registry changes; a malformed stream leaves it untouched. The
    /// domain is admitted but stays ineligible until
    /// [`activate_migrated`](Self::activate_migrated).
    pub fn restore_domain(&self, bytes: &[u8]) -> Result<RestoredDomain, HvError> {
        let (ctx, memory) = DomContext::decode_stream(bytes).map_err(|e| {
            self.hal
                .debug_write(&alloc::format!("[migration] rejected snapshot: {:?}", e));
            HvError::from(e)
        })?;

        let id = self.get_free_slot(ctx.region_size)?;
        let layout = *self.config.slot_layout(id).ok_or(HvError::NoFreeSlot)?;
        let region = MemRegion::new(layout.base, ctx.region_size);

        let mut stack = HvStack::new(HV_STACK_SIZE).ok_or(HvError::NoMemory)?;
        if !stack.splice_frame(&ctx.exc_frame.0) {
            return Err(HvError::NoMemory);
        }
        self.write_phys(region.base, memory)?;

        let cpu = self.config.cpu_for(id);
        let policy = self.cpus[cpu].lock().policy.kind();
        let (pause, tokens) = PauseCount::restore(ctx.pause_count, ctx.pause_flags);
        let dom = Domain::restored(id, cpu, policy, region, pause, stack);
        dom.set_flags(ctx.flags);
        dom.shared.load(&ctx.shared);
        *dom.regs.lock() = ctx.regs;
        *dom.desc.lock() = ctx.desc;
        if let Some(entry) = ctx.callback_entry {
            dom.register_callback(entry, layout.root);
        }

        // Channels to the source's agency domains wait for the local ones;
        // channels to other MEs lost their peer.
        let mut table = ctx.evtchn.clone();
        let mut rebind = Vec::new();
        for (port, state) in ctx.evtchn.bound() {
            if let EvtchnState::Interdomain { remote, .. } = state {
                if matches!(DomainKind::for_slot(remote), DomainKind::Agency | DomainKind::AgencyRt) {
                    table.set(port, EvtchnState::Unbound { remote });
                    rebind.push((port, remote));
                } else {
                    table.set(port, EvtchnState::Free);
                    dom.shared.reset_port(port);
                }
            }
        }
        *dom.evtchn.lock() = table;

        let held = dom.pause.pause_by(PauseFlags::CONTROLLER);
        let dom = Arc::new(dom);
        {
            let irq = self.hal.local_irq_save();
            let mut cs = self.cpus[cpu].lock();
            let inserted = self.registry.insert(dom.clone());
            if inserted.is_ok() {
                cs.policy.add(id, dom.kind);
            }
            drop(cs);
            self.hal.local_irq_restore(irq);
            inserted?;
        }

        let rebound = self.rebind_agency_ports(&dom, &rebind);
        self.hal.debug_write(&alloc::format!(
            "[migration] restored {} from source {} ({} of {} agency ports rebound)",
            id,
            ctx.domid,
            rebound,
            rebind.len()
        ));
        self.publish(id, "spid", &alloc::format!("{:#x}", ctx.desc.spid));
        self.publish(id, "state", crate::me_state_name(dom.me_state()));

        if held {
            if let Some(readmit) = dom.pause.unpause_by(PauseFlags::CONTROLLER) {
                self.readmit(&dom, readmit);
            }
        }
        Ok(RestoredDomain {
            id,
            source_id: ctx.domid,
            tokens,
        })
    }

    /// Pair each preserved port with the next port the local agency domain
    /// left unbound for this slot, in ascending order on both sides.
    fn rebind_agency_ports(&self, dom: &Domain, ports: &[(u16, DomainId)]) -> usize {
        let mut rebound = 0;
        for &(port, remote) in ports {
            let Some(agency) = self.registry.get(remote) else {
                continue;
            };
            let waiting = agency
                .evtchn
                .lock()
                .bound()
                .find(|(_, s)| *s == EvtchnState::Unbound { remote: dom.id })
                .map(|(p, _)| p);
            let Some(remote_port) = waiting else {
                continue;
            };
            let r = mhv_core::evtchn::bind_existing_interdomain(
                &self.registry,
                dom.id,
                port,
                remote,
                remote_port,
            );
            if let Err(e) = r {
                panic!(
                    "migration: rebind {}:{} to {}:{} failed: {:?}",
                    dom.id, port, remote, remote_port, e
                );
            }
            rebound += 1;
        }
        rebound
    }

    /// Decide whether an arrived domain stays.
    ///
    /// Runs pre-resume, pre-activate with this node's identity, and a
    /// cooperation round. A domain that ends up killed is torn down;
    /// otherwise it is resumed and post-activate is queued.
    pub fn activate_migrated(&self, id: DomainId) -> Result<Activation, HvError> {
        let dom = self.domain(id)?;
        if !dom.flags().contains(DomainFlags::MIGRATING) || dom.is_dying() {
            return Err(HvError::InvalidState);
        }

        self.ask(&dom, DomcallCommand::PreResume)?;
        if let Some(requested) = self.ask(&dom, DomcallCommand::PreActivate)? {
            if self.commit_me_state(&dom, requested).is_final() {
                self.hal.debug_write(&alloc::format!(
                    "[migration] {} refused host {:#x}",
                    id,
                    self.config.host_id
                ));
                self.teardown(&dom);
                return Ok(Activation::Killed);
            }
        }

        self.cooperate(&dom)?;
        if dom.me_state().is_final() {
            self.teardown(&dom);
            return Ok(Activation::Killed);
        }

        dom.clear_flags(DomainFlags::MIGRATING);
        if dom.shared.upcall_pending() {
            dom.clear_flags(DomainFlags::BLOCKED);
        }
        self.wake(&dom);
        let frame = self.frame_for(&dom);
        self.queue_domcall(id, DomcallCommand::PostActivate, frame);
        self.hal
            .debug_write(&alloc::format!("[migration] {} activated", id));
        Ok(Activation::Resumed)
    }

    // ========================================================================
    // Propagation and kill
    // ========================================================================

    /// Ask a domain whether it may be sent on.
    pub fn prepare_propagation(&self, id: DomainId) -> Result<Propagation, HvError> {
        let dom = self.domain(id)?;
        if dom.kind != DomainKind::Me || dom.is_dying() {
            return Err(HvError::InvalidState);
        }
        if let Some(requested) = self.ask(&dom, DomcallCommand::PrePropagate)? {
            if self.commit_me_state(&dom, requested).is_final() {
                self.hal
                    .debug_write(&alloc::format!("[migration] {} vetoed propagation", id));
                self.teardown(&dom);
                return Ok(Propagation::Vetoed);
            }
        }
        Ok(Propagation::Proceed)
    }

    /// Ask a domain to agree to its destruction.
    ///
    /// The domain is torn down only if it moved itself to `killed`.
    pub fn kill_domain(&self, id: DomainId) -> Result<(), HvError> {
        let dom = self.domain(id)?;
        if dom.kind != DomainKind::Me {
            return Err(HvError::InvalidState);
        }
        if dom.is_dying() {
            return Ok(());
        }
        let requested = self.ask(&dom, DomcallCommand::Kill)?;
        let now = match requested {
            Some(s) => self.commit_me_state(&dom, s),
            None => dom.me_state(),
        };
        if now != MeState::Killed && now != MeState::Terminated {
            self.hal
                .debug_write(&alloc::format!("[migration] {} refused kill", id));
            return Err(HvError::Refused);
        }
        self.teardown(&dom);
        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Unconditional teardown: stop the domain, close its channels, drop
    /// it from its policy and release the attributed pauses. The entry is
    /// destroyed once the last pause reference is gone.
    pub(crate) fn teardown(&self, dom: &Arc<Domain>) {
        if dom.set_flags(DomainFlags::DYING).contains(DomainFlags::DYING) {
            return;
        }
        // Keeps the count above zero until the attributed pauses go below
        dom.pause.pause_by(PauseFlags::CONTROLLER);
        self.sleep_sync(dom);
        mhv_core::evtchn::close_all(&self.registry, dom.id);
        {
            let irq = self.hal.local_irq_save();
            self.cpus[dom.cpu].lock().policy.remove(dom.id);
            self.hal.local_irq_restore(irq);
        }
        self.hal.debug_write(&alloc::format!(
            "[migration] tearing down {} (pause {})",
            dom.id,
            dom.pause.count()
        ));
        for flag in [PauseFlags::COOP, PauseFlags::MIGRATION, PauseFlags::CONTROLLER] {
            if let Some(readmit) = dom.pause.unpause_by(flag) {
                self.readmit(dom, readmit);
            }
        }
    }

    /// Final step of teardown, reached through the last readmission.
    pub(crate) fn complete_destroy(&self, dom: &Arc<Domain>) {
        let gone = self.registry.destroy(dom.id);
        self.unpublish(gone.id);
        self.hal
            .debug_write(&alloc::format!("[hv] destroyed {}", gone.id));
        if gone.id != DomainId::AGENCY {
            if let Err(e) = self.send_virq(DomainId::AGENCY, virq::DOM_EXC) {
                self.hal.debug_write(&alloc::format!(
                    "[hv] DOM_EXC for {} not delivered: {:?}",
                    gone.id,
                    e
                ));
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
