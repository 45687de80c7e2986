//! Global domain registry
//!
//! An arena of `MAX_DOMAINS` slots indexed by [`DomainId`]. Create and
//! destroy are the only writers. A slot is reused only after `destroy` has
//! removed the previous occupant.

use alloc::sync::Arc;
use alloc::vec::Vec;
use mhv_abi::MAX_DOMAINS;
use spin::RwLock;

use crate::domain::{Domain, DomainDesc};
use crate::evtchn::EvtchnTable;
use crate::sched::PolicyKind;
use crate::types::{DomainId, MemRegion};

/// Registry errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Identifier does not name a slot
    BadSlot,
    /// Slot already occupied
    SlotBusy,
    /// Hypervisor stack could not be allocated
    NoMemory,
}

pub struct Registry {
    slots: RwLock<[Option<Arc<Domain>>; MAX_DOMAINS]>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(core::array::from_fn(|_| None)),
        }
    }

    /// Create a domain in `id`, pinned to `cpu`.
    ///
    /// The policy is chosen by the caller from the CPU the domain is pinned
    /// to; the domain starts paused by the controller.
    pub fn create_with_policy(
        &self,
        id: DomainId,
        cpu: usize,
        policy: PolicyKind,
        region: MemRegion,
    ) -> Result<Arc<Domain>, RegistryError> {
        if !id.is_slot() {
            return Err(RegistryError::BadSlot);
        }
        if self.slots.read()[id.index()].is_some() {
            return Err(RegistryError::SlotBusy);
        }
        let dom = Arc::new(Domain::new(id, cpu, policy, region).ok_or(RegistryError::NoMemory)?);
        self.insert(dom.clone())?;
        Ok(dom)
    }

    /// Create with the policy implied by the domain's kind
    pub fn create(&self, id: DomainId, cpu: usize, region: MemRegion) -> Result<Arc<Domain>, RegistryError> {
        let policy = if id == DomainId::AGENCY {
            PolicyKind::Agency
        } else {
            PolicyKind::Flip
        };
        self.create_with_policy(id, cpu, policy, region)
    }

    /// Install a fully built domain (restore path).
    pub fn insert(&self, dom: Arc<Domain>) -> Result<(), RegistryError> {
        if !dom.id.is_slot() {
            return Err(RegistryError::BadSlot);
        }
        let mut slots = self.slots.write();
        let slot = &mut slots[dom.id.index()];
        if slot.is_some() {
            return Err(RegistryError::SlotBusy);
        }
        *slot = Some(dom);
        Ok(())
    }

    pub fn get(&self, id: DomainId) -> Option<Arc<Domain>> {
        if !id.is_slot() {
            return None;
        }
        self.slots.read()[id.index()].clone()
    }

    pub fn contains(&self, id: DomainId) -> bool {
        id.is_slot() && self.slots.read()[id.index()].is_some()
    }

    /// Remove a domain whose teardown has drained.
    ///
    /// Requires `DYING`, a zero pause count and the domain off-CPU; anything
    /// else is fatal.
    pub fn destroy(&self, id: DomainId) -> Arc<Domain> {
        let mut slots = self.slots.write();
        let Some(dom) = slots.get_mut(id.index()).and_then(Option::take) else {
            panic!("registry: destroy of empty slot {}", id);
        };
        if !dom.is_dying() || dom.pause.is_paused() || dom.is_running() {
            let flags = dom.flags();
            let count = dom.pause.count();
            slots[id.index()] = Some(dom);
            panic!(
                "registry: destroy of {} not drained (flags {:?}, pause {})",
                id, flags, count
            );
        }
        dom
    }

    /// All occupied slots, in slot order
    pub fn domains(&self) -> Vec<Arc<Domain>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    /// First free slot in `range` satisfying `fits`
    pub fn first_free(
        &self,
        range: core::ops::Range<u16>,
        mut fits: impl FnMut(DomainId) -> bool,
    ) -> Option<DomainId> {
        let slots = self.slots.read();
        range
            .map(DomainId)
            .filter(|id| id.is_slot())
            .find(|id| slots[id.index()].is_none() && fits(*id))
    }

    /// Full observable state of every slot, used to prove an operation
    /// left the registry untouched.
    pub fn dump(&self) -> Vec<(DomainId, DomainDesc, EvtchnTable)> {
        self.domains()
            .iter()
            .map(|d| (d.id, d.describe(), d.evtchn.lock().clone()))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
