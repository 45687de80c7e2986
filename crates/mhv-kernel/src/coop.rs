//! ME cooperation
//!
//! When an ME arrives, every resident ME whose descriptor matches it is
//! paired with it. The arriving ME is the initiator; it is told the page
//! frame of its own cooperation page, and the target is told the same
//! frame so it can read what the initiator left there. The hypervisor
//! never copies the payload.
//!
//! State changes the guests request during the round are collected and
//! committed only after every pair has been called.

use alloc::sync::Arc;
use alloc::vec::Vec;
use mhv_abi::PAGE_SIZE;
use mhv_core::{
    CoopRole, Domain, DomainFlags, DomainId, DomainKind, DomcallCommand, GuestError, MeDescriptor,
    MeState,
};
use mhv_hal::HAL;

use crate::{HvError, Hypervisor};

/// One initiator/target pairing of a round
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoopPair {
    pub initiator: DomainId,
    pub target: DomainId,
    /// Page frame of the initiator's cooperation page
    pub pfn: u64,
}

impl<H: HAL> Hypervisor<H> {
    /// Descriptor used for matching; capability overrides in the
    /// configuration store take precedence over the domain's own.
    fn coop_descriptor(&self, dom: &Domain) -> MeDescriptor {
        let mut desc = *dom.desc.lock();
        if let Some(hex) = self.lookup(dom.id, "caps") {
            for (i, pair) in hex.as_bytes().chunks(2).take(desc.caps.len()).enumerate() {
                if let Some(b) = core::str::from_utf8(pair)
                    .ok()
                    .and_then(|p| u8::from_str_radix(p, 16).ok())
                {
                    desc.caps[i] = b;
                }
            }
        }
        desc
    }

    /// Page frame of `dom`'s cooperation page
    pub fn coop_pfn(&self, dom: &Domain) -> u64 {
        (dom.region.base + self.config.coop_page_offset) / PAGE_SIZE as u64
    }

    /// Resident MEs that could cooperate with `arriving`
    fn coop_candidates(&self, arriving: &Domain) -> Vec<Arc<Domain>> {
        let mine = self.coop_descriptor(arriving);
        self.registry
            .domains()
            .into_iter()
            .filter(|d| {
                d.id != arriving.id
                    && d.kind == DomainKind::Me
                    && !d.is_dying()
                    && !d.flags().contains(DomainFlags::MIGRATING)
                    && !d.me_state().is_final()
                    && self.coop_descriptor(d).matches(&mine)
            })
            .collect()
    }

    /// Run one cooperation round for `arriving` and commit the outcome.
    ///
    /// A resident that fails its call is skipped; a failure of the
    /// arriving domain aborts the round before anything is committed.
    pub fn cooperate(&self, arriving: &Arc<Domain>) -> Result<Vec<CoopPair>, HvError> {
        let mine = self.coop_descriptor(arriving);
        let pfn = self.coop_pfn(arriving);
        let mut pairs = Vec::new();
        let mut requests: Vec<(Arc<Domain>, MeState)> = Vec::new();

        for peer in self.coop_candidates(arriving) {
            let theirs = self.coop_descriptor(&peer);

            let mut frame = self.frame_for(arriving);
            frame.role = Some(CoopRole::Initiator);
            frame.peer = Some(peer.id);
            frame.peer_spid = theirs.spid;
            frame.peer_caps = theirs.caps;
            frame.pfn = pfn;
            let rc = self.domain_call_irqsave(arriving.id, DomcallCommand::Cooperate, &mut frame)?;
            GuestError::check(rc)?;
            if let Some(s) = MeState::from_u8(frame.me_state) {
                requests.push((arriving.clone(), s));
            }

            let mut frame = self.frame_for(&peer);
            frame.role = Some(CoopRole::Target);
            frame.peer = Some(arriving.id);
            frame.peer_spid = mine.spid;
            frame.peer_caps = mine.caps;
            frame.pfn = pfn;
            let answered = self
                .domain_call_irqsave(peer.id, DomcallCommand::Cooperate, &mut frame)
                .and_then(|rc| GuestError::check(rc).map_err(HvError::from));
            match answered {
                Ok(()) => {
                    if let Some(s) = MeState::from_u8(frame.me_state) {
                        requests.push((peer.clone(), s));
                    }
                }
                Err(e) => {
                    self.hal.debug_write(&alloc::format!(
                        "[coop] {} skipped as target of {}: {:?}",
                        peer.id,
                        arriving.id,
                        e
                    ));
                    continue;
                }
            }

            self.hal.debug_write(&alloc::format!(
                "[coop] {} -> {} via pfn {:#x}",
                arriving.id,
                peer.id,
                pfn
            ));
            pairs.push(CoopPair {
                initiator: arriving.id,
                target: peer.id,
                pfn,
            });
        }

        // Round over: commit, last request per domain wins
        for (i, (dom, state)) in requests.iter().enumerate() {
            if requests[i + 1..].iter().any(|(d, _)| d.id == dom.id) {
                continue;
            }
            let now = self.commit_me_state(dom, *state);
            if now.is_final() && dom.id != arriving.id {
                self.teardown(dom);
            }
        }
        Ok(pairs)
    }
}
