//! Event-channel runtime
//!
//! Thin layer over `mhv_core::evtchn` that turns protocol violations into
//! panics, reports exhaustion as `HvError::NoFreePort`, and wakes a
//! blocked receiver after a send.

use mhv_core::evtchn::{self as core_evtchn, EvtchnError, EvtchnStatus};
use mhv_core::{deliver_events, Domain, DomainId, Port, Virq};
use mhv_hal::HAL;

use crate::{HvError, Hypervisor};

impl<H: HAL> Hypervisor<H> {
    fn evtchn_result<T>(&self, op: &str, id: DomainId, r: Result<T, EvtchnError>) -> Result<T, HvError> {
        match r {
            Ok(v) => Ok(v),
            Err(EvtchnError::NoFreePort) => Err(HvError::NoFreePort),
            Err(e) => {
                self.hal
                    .debug_write(&alloc::format!("[evtchn] {} by {}: {:?}", op, id, e));
                panic!("evtchn: {} by {} violates protocol: {:?}", op, id, e);
            }
        }
    }

    /// Reserve a port of `id` awaiting `remote`.
    ///
    /// `remote` need not exist yet: the agency pre-allocates ports for a
    /// slot that a restore is about to fill.
    pub fn evtchn_alloc_unbound(&self, id: DomainId, remote: DomainId) -> Result<Port, HvError> {
        let dom = self.domain(id)?;
        let r = core_evtchn::alloc_unbound(&dom, remote);
        self.evtchn_result("alloc_unbound", id, r)
    }

    /// Complete the pairing with `remote`'s unbound `remote_port`.
    ///
    /// Binding a port that is not unbound towards `local` is fatal.
    pub fn evtchn_bind_interdomain(
        &self,
        local: DomainId,
        remote: DomainId,
        remote_port: Port,
    ) -> Result<Port, HvError> {
        let r = core_evtchn::bind_interdomain(&self.registry, local, remote, remote_port);
        let port = self.evtchn_result("bind_interdomain", local, r)?;
        self.hal.debug_write(&alloc::format!(
            "[evtchn] {}:{} <-> {}:{}",
            local,
            port,
            remote,
            remote_port
        ));
        Ok(port)
    }

    /// Bind a new port of `id` to `virq`. A second bind is fatal.
    pub fn evtchn_bind_virq(&self, id: DomainId, virq: Virq) -> Result<Port, HvError> {
        let dom = self.domain(id)?;
        let r = core_evtchn::bind_virq(&dom, virq);
        self.evtchn_result("bind_virq", id, r)
    }

    pub fn evtchn_close(&self, id: DomainId, port: Port) -> Result<(), HvError> {
        self.domain(id)?;
        core_evtchn::close(&self.registry, id, port);
        Ok(())
    }

    /// Signal the peer of interdomain `port`. Sending on any other kind of
    /// port is fatal.
    pub fn evtchn_send(&self, id: DomainId, port: Port) -> Result<(), HvError> {
        self.domain(id)?;
        if let Some(peer) = core_evtchn::send(&self.registry, id, port) {
            if let Some(peer) = self.registry.get(peer) {
                self.unblock(&peer);
            }
        }
        Ok(())
    }

    /// Raise `virq` on `id`; dropped if the domain has not bound it.
    pub fn send_virq(&self, id: DomainId, virq: Virq) -> Result<(), HvError> {
        let dom = self.domain(id)?;
        if core_evtchn::send_virq(&dom, virq) {
            self.unblock(&dom);
        }
        Ok(())
    }

    pub fn evtchn_status(&self, id: DomainId, port: Port) -> Result<EvtchnStatus, HvError> {
        let dom = self.domain(id)?;
        Ok(core_evtchn::status(&dom, port))
    }

    pub fn evtchn_unmask(&self, id: DomainId, port: Port) -> Result<(), HvError> {
        let dom = self.domain(id)?;
        if core_evtchn::unmask(&dom, port) {
            self.unblock(&dom);
        }
        Ok(())
    }

    /// Run the upcall loop of `dom` with local interrupts disabled.
    ///
    /// Returns the number of events handed to `handler`.
    pub fn deliver<F: FnMut(Port)>(&self, dom: &Domain, handler: F) -> usize {
        let irq = self.hal.local_irq_save();
        let n = deliver_events(&dom.shared, handler);
        self.hal.local_irq_restore(irq);
        n
    }
}
