//! Audit trail for the mhv hypervisor
//!
//! Every privileged control operation enters the hypervisor through a single
//! gateway, which records the request before executing it and the status
//! after. ME lifecycle commits made by the hypervisor are recorded in the
//! same log so an operator can reconstruct why a domain disappeared.

#![no_std]
extern crate alloc;

pub mod syslog;

pub use syslog::{SysEvent, SysEventType, SysLog, MAX_SYSLOG_EVENTS};

/// Monotonic event identifier
pub type EventId = u64;

/// Identity of the caller (a domain slot)
pub type CallerId = u16;
