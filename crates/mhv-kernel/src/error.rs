//! Runtime errors
//!
//! Only recoverable conditions are errors: resource exhaustion, malformed
//! external data and cooperative refusal. Protocol violations panic where
//! they are detected.

use mhv_abi::status;
use mhv_core::{ConfigError, DomainId, GuestError, ImageError, RegistryError, SnapshotError};
use mhv_hal::HalError;
use mhv_unsafe_primitives::MapError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HvError {
    /// No domain occupies the slot
    NoSuchDomain(DomainId),
    /// Identifier does not name a usable slot
    BadSlot,
    /// No free ME slot large enough
    NoFreeSlot,
    /// Requested slot is occupied
    SlotBusy,
    /// Hypervisor stack or table allocation failed
    NoMemory,
    /// No free event-channel port
    NoFreePort,
    /// Boot configuration rejected
    Config(ConfigError),
    /// Malformed migration stream
    Snapshot(SnapshotError),
    /// Malformed ME image container
    Image(ImageError),
    /// Collaborator failure
    Hal(HalError),
    /// The domain declined (kill, propagation)
    Refused,
    /// The guest failed the domain-call it was given
    Guest(GuestError),
    /// The domain never published a domain-call entry
    NotRegistered(DomainId),
    /// The domain is not in a state that allows the operation
    InvalidState,
    /// Caller may not use the control surface
    PermissionDenied,
    /// Unknown operation or undecodable argument
    BadArgument,
}

impl HvError {
    /// Negative status code reported through the control surface
    pub fn status(&self) -> i64 {
        match self {
            HvError::NoSuchDomain(_) => status::ENOENT,
            HvError::BadSlot => status::EINVAL,
            HvError::NoFreeSlot => status::ENOSPC,
            HvError::SlotBusy => status::EBUSY,
            HvError::NoMemory => status::ENOMEM,
            HvError::NoFreePort => status::EAGAIN,
            HvError::Config(_) => status::EINVAL,
            HvError::Snapshot(_) => status::EINVAL,
            HvError::Image(_) => status::EINVAL,
            HvError::Hal(HalError::GuestFault) => status::EACCES,
            HvError::Hal(_) => status::EINVAL,
            HvError::Refused => status::EACCES,
            HvError::Guest(GuestError::Other(_)) => status::EINVAL,
            HvError::Guest(e) => e.status(),
            HvError::NotRegistered(_) => status::ENOSYS,
            HvError::InvalidState => status::EPERM,
            HvError::PermissionDenied => status::EPERM,
            HvError::BadArgument => status::EINVAL,
        }
    }
}

impl From<RegistryError> for HvError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::BadSlot => HvError::BadSlot,
            RegistryError::SlotBusy => HvError::SlotBusy,
            RegistryError::NoMemory => HvError::NoMemory,
        }
    }
}

impl From<ConfigError> for HvError {
    fn from(e: ConfigError) -> Self {
        HvError::Config(e)
    }
}

impl From<SnapshotError> for HvError {
    fn from(e: SnapshotError) -> Self {
        HvError::Snapshot(e)
    }
}

impl From<ImageError> for HvError {
    fn from(e: ImageError) -> Self {
        HvError::Image(e)
    }
}

impl From<GuestError> for HvError {
    fn from(e: GuestError) -> Self {
        HvError::Guest(e)
    }
}

impl From<HalError> for HvError {
    fn from(e: HalError) -> Self {
        HvError::Hal(e)
    }
}

impl From<MapError> for HvError {
    fn from(_: MapError) -> Self {
        HvError::Hal(HalError::BadAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_negative() {
        let all = [
            HvError::NoSuchDomain(DomainId(3)),
            HvError::BadSlot,
            HvError::NoFreeSlot,
            HvError::SlotBusy,
            HvError::NoMemory,
            HvError::NoFreePort,
            HvError::Snapshot(SnapshotError::BadSignature),
            HvError::Image(ImageError::BadMagic),
            HvError::Hal(HalError::NoEntry),
            HvError::Refused,
            HvError::Guest(GuestError::PageAccess),
            HvError::Guest(GuestError::Other(5)),
            HvError::NotRegistered(DomainId(2)),
            HvError::InvalidState,
            HvError::PermissionDenied,
        ];
        assert!(all.iter().all(|e| e.status() < 0));
    }

    #[test]
    fn test_exhaustion_is_distinguished() {
        assert_eq!(HvError::NoFreeSlot.status(), status::ENOSPC);
        assert_eq!(HvError::NoFreePort.status(), status::EAGAIN);
        assert_eq!(HvError::from(RegistryError::SlotBusy), HvError::SlotBusy);
    }
}
