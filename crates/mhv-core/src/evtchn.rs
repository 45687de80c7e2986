//! Event channels
//!
//! Each domain owns a fixed table of ports. A port is in exactly one
//! [`EvtchnState`]. Interdomain pairs refer to each other by
//! `(DomainId, Port)` key only; the peer is looked up in the [`Registry`]
//! on every use, so a torn-down slot can never leave a stale reference.
//!
//! # Locking
//!
//! Each table sits behind its domain's `evtchn` lock. Operations that touch
//! two tables take both locks lower domain identity first.
//!
//! # Failure semantics
//!
//! Exhaustion is reported as [`EvtchnError::NoFreePort`]. Binding against a
//! port in an incompatible state returns [`EvtchnError::Incompatible`]
//! without touching either table; the runtime treats that as fatal. Sending
//! on a port that is not interdomain panics here.

use mhv_abi::{NR_EVTCHN, NR_VIRQS};
use spin::MutexGuard;

use crate::domain::Domain;
use crate::registry::Registry;
use crate::types::{DomainId, Port, Virq};

/// State of one port
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EvtchnState {
    #[default]
    Free,
    /// Not allocatable (port 0)
    Reserved,
    /// Waiting for `remote` to bind
    Unbound { remote: DomainId },
    /// Paired with `(remote, remote_port)`
    Interdomain { remote: DomainId, remote_port: Port },
    /// Bound to a local virtual interrupt
    Virq { virq: Virq },
}

/// Event-channel errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvtchnError {
    /// No free port in the table
    NoFreePort,
    /// The named port is not in a state that permits the operation
    Incompatible { domain: DomainId, port: Port },
    /// The named domain is not in the registry
    NoSuchDomain(DomainId),
}

/// Read-only view of one port
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvtchnStatus {
    pub port: Port,
    pub state: EvtchnState,
    pub pending: bool,
    pub masked: bool,
}

/// Per-domain port table plus the VIRQ-to-port map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvtchnTable {
    ports: [EvtchnState; NR_EVTCHN],
    virqs: [Option<Port>; NR_VIRQS],
}

impl Default for EvtchnTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EvtchnTable {
    /// All ports free except the reserved port 0
    pub fn new() -> Self {
        let mut ports = [EvtchnState::Free; NR_EVTCHN];
        ports[0] = EvtchnState::Reserved;
        Self {
            ports,
            virqs: [None; NR_VIRQS],
        }
    }

    pub fn state(&self, port: Port) -> EvtchnState {
        match self.ports.get(port as usize) {
            Some(s) => *s,
            None => panic!("evtchn: port {} out of range", port),
        }
    }

    /// Set a port's state, keeping the VIRQ map in step.
    pub fn set(&mut self, port: Port, state: EvtchnState) {
        if let EvtchnState::Virq { virq } = self.state(port) {
            self.virqs[virq as usize] = None;
        }
        if let EvtchnState::Virq { virq } = state {
            self.virqs[virq as usize] = Some(port);
        }
        self.ports[port as usize] = state;
    }

    /// Lowest free port
    pub fn find_free(&self) -> Result<Port, EvtchnError> {
        self.ports
            .iter()
            .position(|s| *s == EvtchnState::Free)
            .map(|p| p as Port)
            .ok_or(EvtchnError::NoFreePort)
    }

    pub fn virq_port(&self, virq: Virq) -> Option<Port> {
        self.virqs.get(virq as usize).copied().flatten()
    }

    pub fn ports(&self) -> &[EvtchnState; NR_EVTCHN] {
        &self.ports
    }

    pub fn virq_map(&self) -> &[Option<Port>; NR_VIRQS] {
        &self.virqs
    }

    /// Rebuild a table from captured parts (used by restore).
    pub fn from_parts(ports: [EvtchnState; NR_EVTCHN], virqs: [Option<Port>; NR_VIRQS]) -> Self {
        Self { ports, virqs }
    }

    /// Iterate over `(port, state)` of ports that are not free
    pub fn bound(&self) -> impl Iterator<Item = (Port, EvtchnState)> + '_ {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, s)| !matches!(s, EvtchnState::Free | EvtchnState::Reserved))
            .map(|(p, s)| (p as Port, *s))
    }
}

/// Lock two distinct domains' tables, lower identity first.
fn lock_pair<'a>(
    a: &'a Domain,
    b: &'a Domain,
) -> (MutexGuard<'a, EvtchnTable>, MutexGuard<'a, EvtchnTable>) {
    assert!(a.id != b.id, "evtchn: {} paired with itself", a.id);
    if a.id < b.id {
        let ga = a.evtchn.lock();
        let gb = b.evtchn.lock();
        (ga, gb)
    } else {
        let gb = b.evtchn.lock();
        let ga = a.evtchn.lock();
        (ga, gb)
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Reserve a local port awaiting `remote`.
pub fn alloc_unbound(dom: &Domain, remote: DomainId) -> Result<Port, EvtchnError> {
    let mut table = dom.evtchn.lock();
    let port = table.find_free()?;
    table.set(port, EvtchnState::Unbound { remote });
    Ok(port)
}

/// Consume `remote`'s unbound `remote_port` and pair it with a new local
/// port of `local`.
pub fn bind_interdomain(
    reg: &Registry,
    local: DomainId,
    remote: DomainId,
    remote_port: Port,
) -> Result<Port, EvtchnError> {
    let ldom = reg.get(local).ok_or(EvtchnError::NoSuchDomain(local))?;
    let rdom = reg.get(remote).ok_or(EvtchnError::NoSuchDomain(remote))?;
    if local == remote {
        return Err(EvtchnError::Incompatible {
            domain: remote,
            port: remote_port,
        });
    }

    let (mut lt, mut rt) = lock_pair(&ldom, &rdom);
    if rt.state(remote_port) != (EvtchnState::Unbound { remote: local }) {
        return Err(EvtchnError::Incompatible {
            domain: remote,
            port: remote_port,
        });
    }
    let port = lt.find_free()?;
    lt.set(
        port,
        EvtchnState::Interdomain {
            remote,
            remote_port,
        },
    );
    rt.set(
        remote_port,
        EvtchnState::Interdomain {
            remote: local,
            remote_port: port,
        },
    );
    Ok(port)
}

/// Pair an existing local port with `remote`'s unbound port.
///
/// The local port number is preserved; only its peer changes. The local
/// port must be free or unbound towards `remote`.
pub fn bind_existing_interdomain(
    reg: &Registry,
    local: DomainId,
    local_port: Port,
    remote: DomainId,
    remote_port: Port,
) -> Result<(), EvtchnError> {
    let ldom = reg.get(local).ok_or(EvtchnError::NoSuchDomain(local))?;
    let rdom = reg.get(remote).ok_or(EvtchnError::NoSuchDomain(remote))?;
    if local == remote {
        return Err(EvtchnError::Incompatible {
            domain: local,
            port: local_port,
        });
    }

    let (mut lt, mut rt) = lock_pair(&ldom, &rdom);
    match lt.state(local_port) {
        EvtchnState::Free => {}
        EvtchnState::Unbound { remote: r } if r == remote => {}
        _ => {
            return Err(EvtchnError::Incompatible {
                domain: local,
                port: local_port,
            })
        }
    }
    if rt.state(remote_port) != (EvtchnState::Unbound { remote: local }) {
        return Err(EvtchnError::Incompatible {
            domain: remote,
            port: remote_port,
        });
    }
    lt.set(
        local_port,
        EvtchnState::Interdomain {
            remote,
            remote_port,
        },
    );
    rt.set(
        remote_port,
        EvtchnState::Interdomain {
            remote: local,
            remote_port: local_port,
        },
    );
    Ok(())
}

/// Bind a new local port to `virq`.
///
/// Panics if the VIRQ is out of range or already bound.
pub fn bind_virq(dom: &Domain, virq: Virq) -> Result<Port, EvtchnError> {
    assert!((virq as usize) < NR_VIRQS, "evtchn: virq {} out of range", virq);
    let mut table = dom.evtchn.lock();
    if let Some(port) = table.virq_port(virq) {
        panic!(
            "evtchn: virq {} of {} already bound to port {}",
            virq, dom.id, port
        );
    }
    let port = table.find_free()?;
    table.set(port, EvtchnState::Virq { virq });
    Ok(port)
}

/// Tear down one end of a channel. Idempotent on free ports.
///
/// Closing an interdomain port demotes the peer to `Unbound` towards the
/// closer.
pub fn close(reg: &Registry, dom_id: DomainId, port: Port) {
    let Some(dom) = reg.get(dom_id) else {
        panic!("evtchn: close on missing {}", dom_id);
    };

    loop {
        let seen = dom.evtchn.lock().state(port);
        match seen {
            EvtchnState::Free | EvtchnState::Reserved => return,
            EvtchnState::Unbound { .. } | EvtchnState::Virq { .. } => {
                let mut table = dom.evtchn.lock();
                if table.state(port) != seen {
                    continue;
                }
                table.set(port, EvtchnState::Free);
                dom.shared.reset_port(port);
                return;
            }
            EvtchnState::Interdomain {
                remote,
                remote_port,
            } => {
                let Some(peer) = reg.get(remote) else {
                    panic!(
                        "evtchn: {} port {} has dangling peer {}:{}",
                        dom_id, port, remote, remote_port
                    );
                };
                let (mut lt, mut rt) = lock_pair(&dom, &peer);
                if lt.state(port) != seen {
                    continue;
                }
                let back = rt.state(remote_port);
                assert_eq!(
                    back,
                    EvtchnState::Interdomain {
                        remote: dom_id,
                        remote_port: port
                    },
                    "evtchn: {}:{} and {}:{} disagree",
                    dom_id,
                    port,
                    remote,
                    remote_port
                );
                rt.set(remote_port, EvtchnState::Unbound { remote: dom_id });
                lt.set(port, EvtchnState::Free);
                dom.shared.reset_port(port);
                return;
            }
        }
    }
}

/// Close every port of a domain (teardown).
pub fn close_all(reg: &Registry, dom_id: DomainId) {
    for port in 1..NR_EVTCHN as Port {
        close(reg, dom_id, port);
    }
}

/// Mark the peer of interdomain `port` pending.
///
/// Returns the peer to kick if the event was newly raised on an unmasked
/// port. Panics if `port` is not interdomain.
pub fn send(reg: &Registry, dom_id: DomainId, port: Port) -> Option<DomainId> {
    let Some(dom) = reg.get(dom_id) else {
        panic!("evtchn: send from missing {}", dom_id);
    };
    let table = dom.evtchn.lock();
    let EvtchnState::Interdomain {
        remote,
        remote_port,
    } = table.state(port)
    else {
        panic!(
            "evtchn: send on {}:{} in state {:?}",
            dom_id,
            port,
            table.state(port)
        );
    };
    let Some(peer) = reg.get(remote) else {
        panic!(
            "evtchn: {} port {} has dangling peer {}:{}",
            dom_id, port, remote, remote_port
        );
    };
    peer.shared.mark_pending(remote_port).then_some(remote)
}

/// Raise `virq` on `dom`. Returns whether the domain should be kicked;
/// an unbound VIRQ is dropped.
pub fn send_virq(dom: &Domain, virq: Virq) -> bool {
    let table = dom.evtchn.lock();
    match table.virq_port(virq) {
        Some(port) => dom.shared.mark_pending(port),
        None => false,
    }
}

pub fn status(dom: &Domain, port: Port) -> EvtchnStatus {
    let state = dom.evtchn.lock().state(port);
    EvtchnStatus {
        port,
        state,
        pending: dom.shared.is_pending(port),
        masked: dom.shared.is_masked(port),
    }
}

/// Unmask `port`; returns whether a pending event was re-raised.
pub fn unmask(dom: &Domain, port: Port) -> bool {
    let _table = dom.evtchn.lock();
    dom.shared.unmask(port)
}

// ============================================================================
// Tests
// ============================================================================
