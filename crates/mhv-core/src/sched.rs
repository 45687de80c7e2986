//! Scheduling policies
//!
//! A policy only decides *who* runs next on one CPU; run-state bookkeeping,
//! locking and the context switch belong to the dispatcher in `mhv-kernel`.
//! Eligibility is supplied by the dispatcher as a predicate so policies
//! never look at pause counts or flags themselves.
//!
//! Two policies exist:
//! - [`AgencyPolicy`]: one fixed domain, no time slice
//! - [`FlipPolicy`]: alternate between the agency side and the next
//!   eligible ME, with configurable slices for each side

use alloc::collections::VecDeque;
use serde::{Deserialize, Serialize};

use crate::config::HvConfig;
use crate::types::{DomainId, DomainKind};

/// Which policy a CPU runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    Agency,
    Flip,
}

/// Result of a pick
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pick {
    /// Domain to run, `None` for idle
    pub next: Option<DomainId>,
    /// Slice before the timer forces the next pick
    pub slice_ns: Option<u64>,
}

impl Pick {
    pub const IDLE: Pick = Pick {
        next: None,
        slice_ns: None,
    };
}

/// Scheduling policy hooks
pub trait SchedPolicy {
    fn name(&self) -> &'static str;

    /// Domain joins this CPU
    fn add(&mut self, id: DomainId, kind: DomainKind);

    /// Domain leaves this CPU for good
    fn remove(&mut self, id: DomainId);

    /// Domain became eligible
    fn wake(&mut self, id: DomainId);

    /// Domain voluntarily gave up the CPU
    fn yield_(&mut self, id: DomainId);

    /// Choose the next domain among those for which `eligible` holds
    fn pick_next(&mut self, eligible: &dyn Fn(DomainId) -> bool) -> Pick;
}

// ============================================================================
// Fixed agency policy
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct AgencyPolicy {
    domain: Option<DomainId>,
}

impl SchedPolicy for AgencyPolicy {
    fn name(&self) -> &'static str {
        "agency"
    }

    fn add(&mut self, id: DomainId, _kind: DomainKind) {
        assert!(
            self.domain.is_none() || self.domain == Some(id),
            "sched: agency CPU already owned by {:?}, adding {}",
            self.domain,
            id
        );
        self.domain = Some(id);
    }

    fn remove(&mut self, id: DomainId) {
        if self.domain == Some(id) {
            self.domain = None;
        }
    }

    fn wake(&mut self, _id: DomainId) {}

    fn yield_(&mut self, _id: DomainId) {}

    fn pick_next(&mut self, eligible: &dyn Fn(DomainId) -> bool) -> Pick {
        match self.domain {
            Some(id) if eligible(id) => Pick {
                next: Some(id),
                slice_ns: None,
            },
            _ => Pick::IDLE,
        }
    }
}

// ============================================================================
// Flip policy
// ============================================================================

/// Alternates CPU ownership between the agency side and the ME set.
///
/// MEs are kept in a rotation: the one picked, or the one that yields, goes
/// to the tail. Either side is skipped when it has nothing eligible.
#[derive(Clone, Debug)]
pub struct FlipPolicy {
    agency: Option<DomainId>,
    mes: VecDeque<DomainId>,
    last_was_agency: bool,
    agency_slice_ns: u64,
    me_slice_ns: u64,
}

impl FlipPolicy {
    pub fn new(agency_slice_ns: u64, me_slice_ns: u64) -> Self {
        Self {
            agency: None,
            mes: VecDeque::new(),
            last_was_agency: false,
            agency_slice_ns,
            me_slice_ns,
        }
    }

    /// Current ME rotation, head first
    pub fn rotation(&self) -> impl Iterator<Item = DomainId> + '_ {
        self.mes.iter().copied()
    }

    fn to_tail(&mut self, id: DomainId) {
        if let Some(pos) = self.mes.iter().position(|d| *d == id) {
            self.mes.remove(pos);
            self.mes.push_back(id);
        }
    }

    fn pick_agency(&mut self, eligible: &dyn Fn(DomainId) -> bool) -> Option<Pick> {
        let id = self.agency.filter(|id| eligible(*id))?;
        self.last_was_agency = true;
        Some(Pick {
            next: Some(id),
            slice_ns: Some(self.agency_slice_ns),
        })
    }

    fn pick_me(&mut self, eligible: &dyn Fn(DomainId) -> bool) -> Option<Pick> {
        let id = self.mes.iter().copied().find(|id| eligible(*id))?;
        self.to_tail(id);
        self.last_was_agency = false;
        Some(Pick {
            next: Some(id),
            slice_ns: Some(self.me_slice_ns),
        })
    }
}

impl SchedPolicy for FlipPolicy {
    fn name(&self) -> &'static str {
        "flip"
    }

    fn add(&mut self, id: DomainId, kind: DomainKind) {
        match kind {
            DomainKind::Me => {
                if !self.mes.contains(&id) {
                    self.mes.push_back(id);
                }
            }
            DomainKind::Agency | DomainKind::AgencyRt => self.agency = Some(id),
            DomainKind::Idle => {}
        }
    }

    fn remove(&mut self, id: DomainId) {
        if self.agency == Some(id) {
            self.agency = None;
        }
        self.mes.retain(|d| *d != id);
    }

    fn wake(&mut self, _id: DomainId) {}

    fn yield_(&mut self, id: DomainId) {
        if self.agency == Some(id) {
            self.last_was_agency = true;
        } else {
            self.to_tail(id);
        }
    }

    fn pick_next(&mut self, eligible: &dyn Fn(DomainId) -> bool) -> Pick {
        let pick = if self.last_was_agency {
            self.pick_me(eligible).or_else(|| self.pick_agency(eligible))
        } else {
            self.pick_agency(eligible).or_else(|| self.pick_me(eligible))
        };
        pick.unwrap_or(Pick::IDLE)
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// The per-CPU policy, one of the two closed variants
#[derive(Clone, Debug)]
pub enum Policy {
    Agency(AgencyPolicy),
    Flip(FlipPolicy),
}

impl Policy {
    /// Initialise the policy for `cpu`
    pub fn for_cpu(cpu: usize, config: &HvConfig) -> Self {
        if cpu == config.agency_cpu {
            Policy::Agency(AgencyPolicy::default())
        } else {
            Policy::Flip(FlipPolicy::new(config.agency_slice_ns, config.me_slice_ns))
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Policy::Agency(_) => PolicyKind::Agency,
            Policy::Flip(_) => PolicyKind::Flip,
        }
    }

    fn inner(&mut self) -> &mut dyn SchedPolicy {
        match self {
            Policy::Agency(p) => p,
            Policy::Flip(p) => p,
        }
    }
}

impl SchedPolicy for Policy {
    fn name(&self) -> &'static str {
        match self {
            Policy::Agency(p) => p.name(),
            Policy::Flip(p) => p.name(),
        }
    }

    fn add(&mut self, id: DomainId, kind: DomainKind) {
        self.inner().add(id, kind)
    }

    fn remove(&mut self, id: DomainId) {
        self.inner().remove(id)
    }

    fn wake(&mut self, id: DomainId) {
        self.inner().wake(id)
    }

    fn yield_(&mut self, id: DomainId) {
        self.inner().yield_(id)
    }

    fn pick_next(&mut self, eligible: &dyn Fn(DomainId) -> bool) -> Pick {
        self.inner().pick_next(eligible)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    const RT: DomainId = DomainId::AGENCY_RT;

    fn all(_: DomainId) -> bool {
        true
    }

    fn flip_with(mes: &[u16]) -> FlipPolicy {
        let mut p = FlipPolicy::new(3_000, 7_000);
        p.add(RT, DomainKind::AgencyRt);
        for &m in mes {
            p.add(DomainId(m), DomainKind::Me);
        }
        p
    }

    #[test]
    fn test_flip_alternates_agency_and_me() {
        let mut p = flip_with(&[2]);
        let seq: Vec<_> = (0..6).map(|_| p.pick_next(&all).next.unwrap()).collect();
        assert_eq!(seq, [RT, DomainId(2), RT, DomainId(2), RT, DomainId(2)]);
    }

    #[test]
    fn test_flip_slices_per_side() {
        let mut p = flip_with(&[2]);
        assert_eq!(p.pick_next(&all).slice_ns, Some(3_000));
        assert_eq!(p.pick_next(&all).slice_ns, Some(7_000));
    }

    #[test]
    fn test_flip_rotates_mes() {
        let mut p = flip_with(&[2, 3]);
        let mes: Vec<_> = (0..8)
            .map(|_| p.pick_next(&all).next.unwrap())
            .filter(|d| *d != RT)
            .collect();
        assert_eq!(mes, [DomainId(2), DomainId(3), DomainId(2), DomainId(3)]);
    }

    #[test]
    fn test_yield_goes_to_tail() {
        let mut p = flip_with(&[2, 3, 4]);
        p.yield_(DomainId(2));
        assert_eq!(
            p.rotation().collect::<Vec<_>>(),
            [DomainId(3), DomainId(4), DomainId(2)]
        );
        // Agency first, then the new head
        assert_eq!(p.pick_next(&all).next, Some(RT));
        assert_eq!(p.pick_next(&all).next, Some(DomainId(3)));
    }

    #[test]
    fn test_agency_yield_hands_over_to_me() {
        let mut p = flip_with(&[2]);
        p.yield_(RT);
        assert_eq!(p.pick_next(&all).next, Some(DomainId(2)));
    }

    #[test]
    fn test_flip_skips_ineligible() {
        let mut p = flip_with(&[2, 3]);
        let only_three = |id: DomainId| id == DomainId(3);
        assert_eq!(p.pick_next(&only_three).next, Some(DomainId(3)));
        assert_eq!(p.pick_next(&only_three).next, Some(DomainId(3)));
        assert_eq!(p.pick_next(&|_: DomainId| false), Pick::IDLE);
    }

    #[test]
    fn test_agency_policy_fixed() {
        let mut p = AgencyPolicy::default();
        assert_eq!(p.pick_next(&all), Pick::IDLE);
        p.add(DomainId::AGENCY, DomainKind::Agency);
        assert_eq!(p.pick_next(&all).next, Some(DomainId::AGENCY));
        assert_eq!(p.pick_next(&all).slice_ns, None);
        assert_eq!(p.pick_next(&|_: DomainId| false), Pick::IDLE);
    }

    #[test]
    fn test_policy_for_cpu() {
        let cfg = HvConfig::default();
        assert_eq!(Policy::for_cpu(cfg.agency_cpu, &cfg).kind(), PolicyKind::Agency);
        assert_eq!(Policy::for_cpu(cfg.me_cpu, &cfg).name(), "flip");
    }
}
