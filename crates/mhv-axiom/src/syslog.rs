//! System Event Log (SysLog)
//!
//! Records control-surface requests and responses, and the ME state
//! transitions the hypervisor commits, for audit.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::{CallerId, EventId};

/// A single audited event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SysEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Domain that issued the request, or the subject of a transition
    pub caller: CallerId,
    /// Timestamp (nanos since boot)
    pub timestamp: u64,
    /// What happened
    pub event_type: SysEventType,
}

/// Type of audited event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SysEventType {
    /// Control operation received
    Request {
        /// Control operation number (`mhv_abi::control`)
        op: u32,
        /// Fixed-layout argument words
        args: [u64; 4],
    },
    /// Control operation completed
    Response {
        /// ID of the request this responds to
        request_id: EventId,
        /// Status returned to the caller (negative = error)
        status: i64,
    },
    /// ME state committed by the hypervisor
    Transition {
        /// Previous `mhv_abi::me_state` value
        from: u8,
        /// New `mhv_abi::me_state` value
        to: u8,
    },
}

/// Maximum number of events kept in memory
pub const MAX_SYSLOG_EVENTS: usize = 4096;

/// Bounded, append-only event log. Oldest events are dropped first.
pub struct SysLog {
    events: VecDeque<SysEvent>,
    next_id: EventId,
}

impl SysLog {
    /// Create a new empty SysLog.
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 0,
        }
    }

    fn push(&mut self, caller: CallerId, timestamp: u64, event_type: SysEventType) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        self.events.push_back(SysEvent {
            id,
            caller,
            timestamp,
            event_type,
        });
        while self.events.len() > MAX_SYSLOG_EVENTS {
            self.events.pop_front();
        }
        id
    }

    /// Log a control request.
    ///
    /// Returns the event ID for correlating with the response.
    pub fn log_request(&mut self, caller: CallerId, op: u32, args: [u64; 4], timestamp: u64) -> EventId {
        self.push(caller, timestamp, SysEventType::Request { op, args })
    }

    /// Log a control response.
    pub fn log_response(&mut self, caller: CallerId, request_id: EventId, status: i64, timestamp: u64) {
        self.push(caller, timestamp, SysEventType::Response { request_id, status });
    }

    /// Log an ME state commit for `domain`.
    pub fn log_transition(&mut self, domain: CallerId, from: u8, to: u8, timestamp: u64) {
        self.push(domain, timestamp, SysEventType::Transition { from, to });
    }

    /// Iterate over retained events, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &SysEvent> {
        self.events.iter()
    }

    /// Get the most recent N events, newest first.
    pub fn get_recent(&self, count: usize) -> Vec<&SysEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// Get all transitions recorded for `domain`, oldest first.
    pub fn transitions_of(&self, domain: CallerId) -> Vec<(u8, u8)> {
        self.events
            .iter()
            .filter(|e| e.caller == domain)
            .filter_map(|e| match e.event_type {
                SysEventType::Transition { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Next event ID to be assigned.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }
}

impl Default for SysLog {
    fn default() -> Self {
        Self::new()
    }
}
