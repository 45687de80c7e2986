//! Runtime-checkable invariants
//!
//! Used by tests after every scenario, and by the runtime's debug dump.
//! They hold whenever no hypervisor operation is in flight.
//!
//! # Invariants
//!
//! 1. **Pairing symmetry**: every interdomain port's peer exists and points
//!    back at it
//! 2. **VIRQ map consistency**: the VIRQ map and the `Virq` ports agree
//! 3. **Pause accounting**: the pause count covers every attributed flag
//! 4. **Runnable consistency**: a domain is `Runnable` iff eligible, and
//!    `Blocked` only while flagged blocked
//! 5. **Dying gate**: a dying domain is never runnable or running
//! 6. **Slot identity**: each slot holds the domain of that id, never idle

use alloc::string::String;
use alloc::vec::Vec;

use crate::evtchn::EvtchnState;
use crate::registry::Registry;
use crate::types::{DomainFlags, DomainId, DomainKind, RunState};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

fn violation(invariant: &'static str, description: String) -> InvariantViolation {
    InvariantViolation {
        invariant,
        description,
    }
}

/// Check all invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(reg: &Registry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_pairing_symmetry(reg));
    violations.extend(check_virq_map(reg));
    violations.extend(check_pause_accounting(reg));
    violations.extend(check_runnable_consistency(reg));
    violations.extend(check_slot_identity(reg));

    violations
}

/// Invariant 1
fn check_pairing_symmetry(reg: &Registry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for dom in reg.domains() {
        let table = dom.evtchn.lock().clone();
        for (port, state) in table.bound() {
            let EvtchnState::Interdomain {
                remote,
                remote_port,
            } = state
            else {
                continue;
            };
            let Some(peer) = reg.get(remote) else {
                violations.push(violation(
                    "pairing_symmetry",
                    alloc::format!("{}:{} points at missing {}", dom.id, port, remote),
                ));
                continue;
            };
            let back = peer.evtchn.lock().state(remote_port);
            let expected = EvtchnState::Interdomain {
                remote: dom.id,
                remote_port: port,
            };
            if back != expected {
                violations.push(violation(
                    "pairing_symmetry",
                    alloc::format!(
                        "{}:{} -> {}:{} but peer is {:?}",
                        dom.id,
                        port,
                        remote,
                        remote_port,
                        back
                    ),
                ));
            }
        }
    }

    violations
}

/// Invariant 2
fn check_virq_map(reg: &Registry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for dom in reg.domains() {
        let table = dom.evtchn.lock().clone();
        for (virq, port) in table.virq_map().iter().enumerate() {
            if let Some(p) = port {
                if table.state(*p) != (EvtchnState::Virq { virq: virq as u16 }) {
                    violations.push(violation(
                        "virq_map",
                        alloc::format!("{} virq {} maps to port {} in another state", dom.id, virq, p),
                    ));
                }
            }
        }
        for (port, state) in table.bound() {
            if let EvtchnState::Virq { virq } = state {
                if table.virq_port(virq) != Some(port) {
                    violations.push(violation(
                        "virq_map",
                        alloc::format!("{} port {} bound to unmapped virq {}", dom.id, port, virq),
                    ));
                }
            }
        }
    }

    violations
}

/// Invariant 3
fn check_pause_accounting(reg: &Registry) -> Vec<InvariantViolation> {
    reg.domains()
        .iter()
        .filter(|d| d.pause.count() < d.pause.flags().bits().count_ones())
        .map(|d| {
            violation(
                "pause_accounting",
                alloc::format!(
                    "{} pause count {} below flags {:?}",
                    d.id,
                    d.pause.count(),
                    d.pause.flags()
                ),
            )
        })
        .collect()
}

/// Invariants 4 and 5
fn check_runnable_consistency(reg: &Registry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for dom in reg.domains() {
        let rs = dom.runstate();
        let eligible = dom.is_runnable();
        let bad = match rs {
            RunState::Runnable => !eligible,
            RunState::Offline => eligible,
            RunState::Blocked => !dom.flags().contains(DomainFlags::BLOCKED),
            RunState::Running => false,
        };
        if bad {
            violations.push(violation(
                "runnable_consistency",
                alloc::format!(
                    "{} is {:?} with pause {} flags {:?}",
                    dom.id,
                    rs,
                    dom.pause.count(),
                    dom.flags()
                ),
            ));
        }
        if dom.is_dying() && matches!(rs, RunState::Runnable | RunState::Running) {
            violations.push(violation(
                "dying_gate",
                alloc::format!("{} is dying but {:?}", dom.id, rs),
            ));
        }
    }

    violations
}

/// Invariant 6
fn check_slot_identity(reg: &Registry) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (slot, dom) in (0..mhv_abi::MAX_DOMAINS as u16)
        .filter_map(|i| reg.get(DomainId(i)).map(|d| (i, d)))
    {
        if dom.id.0 != slot || dom.kind == DomainKind::Idle {
            violations.push(violation(
                "slot_identity",
                alloc::format!("slot {} holds {} ({:?})", slot, dom.id, dom.kind),
            ));
        }
    }

    violations
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evtchn;
    use crate::types::{MemRegion, PauseFlags};

    #[test]
    fn test_fresh_registry_is_clean() {
        let reg = Registry::new();
        reg.create(DomainId(0), 0, MemRegion::default()).unwrap();
        reg.create(DomainId(2), 1, MemRegion::default()).unwrap();
        assert!(check_all_invariants(&reg).is_empty());
    }

    #[test]
    fn test_detects_one_sided_pair() {
        let reg = Registry::new();
        reg.create(DomainId(0), 0, MemRegion::default()).unwrap();
        let me = reg.create(DomainId(2), 1, MemRegion::default()).unwrap();
        me.evtchn.lock().set(
            3,
            EvtchnState::Interdomain {
                remote: DomainId(0),
                remote_port: 9,
            },
        );
        let v = check_all_invariants(&reg);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].invariant, "pairing_symmetry");
    }

    #[test]
    fn test_paired_channels_are_clean() {
        let reg = Registry::new();
        let a = reg.create(DomainId(0), 0, MemRegion::default()).unwrap();
        reg.create(DomainId(2), 1, MemRegion::default()).unwrap();
        let up = evtchn::alloc_unbound(&a, DomainId(2)).unwrap();
        let bp = evtchn::bind_interdomain(&reg, DomainId(2), DomainId(0), up).unwrap();
        assert!(check_all_invariants(&reg).is_empty());
        evtchn::close(&reg, DomainId(0), up);
        assert!(check_all_invariants(&reg).is_empty());
        assert_eq!(
            reg.get(DomainId(2)).unwrap().evtchn.lock().state(bp),
            EvtchnState::Unbound {
                remote: DomainId(0)
            }
        );
    }

    #[test]
    fn test_detects_runnable_while_paused() {
        let reg = Registry::new();
        let d = reg.create(DomainId(3), 1, MemRegion::default()).unwrap();
        d.transition(RunState::Offline, RunState::Runnable);
        let v = check_all_invariants(&reg);
        assert!(v.iter().any(|v| v.invariant == "runnable_consistency"));

        let _ = d.pause.unpause_by(PauseFlags::CONTROLLER);
        d.clear_flags(DomainFlags::DOWN);
        assert!(check_all_invariants(&reg).is_empty());
    }
}
