//! Hypervisor configuration
//!
//! Boot-time parameters handed to the runtime by the platform loader.
//! Compile-time limits live in `mhv-abi`.

use alloc::vec::Vec;
use mhv_abi::{domid, MAX_DOMAINS, PAGE_SIZE};
use serde::{Deserialize, Serialize};

use crate::types::{DomainId, MemRegion};

/// Memory assigned to one ME slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeSlotLayout {
    /// Physical base of the slot's region
    pub base: u64,
    /// Region size in bytes
    pub size: u64,
    /// Root of the address space prepared for this slot
    pub root: u64,
}

impl MeSlotLayout {
    pub fn region(&self) -> MemRegion {
        MemRegion::new(self.base, self.size)
    }
}

/// Runtime configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HvConfig {
    /// Number of physical CPUs managed
    pub nr_cpus: usize,
    /// CPU running the agency under the fixed policy
    pub agency_cpu: usize,
    /// CPU shared by agency-RT and the MEs under the flip policy
    pub me_cpu: usize,
    /// Flip-policy slice granted to the agency side
    pub agency_slice_ns: u64,
    /// Flip-policy slice granted to the ME side
    pub me_slice_ns: u64,
    /// Identifier of this node within the fleet
    pub host_id: u64,
    /// Memory layout of ME slots, indexed from `ME_FIRST`
    pub me_slots: Vec<MeSlotLayout>,
    /// Offset of the cooperation page inside an ME region
    pub coop_page_offset: u64,
}

impl Default for HvConfig {
    fn default() -> Self {
        let me_slots = (0..(MAX_DOMAINS - domid::ME_FIRST as usize) as u64)
            .map(|i| MeSlotLayout {
                base: 0x4000_0000 + i * 0x0100_0000,
                size: 0x0100_0000,
                root: 0x1000_0000 + i * PAGE_SIZE as u64,
            })
            .collect();
        Self {
            nr_cpus: 2,
            agency_cpu: 0,
            me_cpu: 1,
            agency_slice_ns: 10_000_000,
            me_slice_ns: 10_000_000,
            host_id: 0,
            me_slots,
            coop_page_offset: 0x00FF_F000,
        }
    }
}

/// Configuration validation errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A CPU index is out of range, or agency and ME share a CPU
    BadCpu,
    /// A flip slice of zero would starve the other side
    ZeroSlice,
    /// More ME slot layouts than ME slots
    TooManySlots,
    /// Slot region not page aligned or overlapping another slot
    BadLayout,
    /// Cooperation page does not fit in the smallest slot
    BadCoopPage,
}

impl HvConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agency_cpu >= self.nr_cpus
            || self.me_cpu >= self.nr_cpus
            || self.agency_cpu == self.me_cpu
        {
            return Err(ConfigError::BadCpu);
        }
        if self.agency_slice_ns == 0 || self.me_slice_ns == 0 {
            return Err(ConfigError::ZeroSlice);
        }
        if self.me_slots.len() > MAX_DOMAINS - domid::ME_FIRST as usize {
            return Err(ConfigError::TooManySlots);
        }
        let page = PAGE_SIZE as u64;
        for (i, a) in self.me_slots.iter().enumerate() {
            if a.base % page != 0 || a.size % page != 0 || a.size == 0 {
                return Err(ConfigError::BadLayout);
            }
            let overlaps = self.me_slots[i + 1..]
                .iter()
                .any(|b| a.base < b.base + b.size && b.base < a.base + a.size);
            if overlaps {
                return Err(ConfigError::BadLayout);
            }
            if self.coop_page_offset % page != 0 || self.coop_page_offset + page > a.size {
                return Err(ConfigError::BadCoopPage);
            }
        }
        Ok(())
    }

    /// Layout of an ME slot, if configured
    pub fn slot_layout(&self, id: DomainId) -> Option<&MeSlotLayout> {
        if !id.is_me() {
            return None;
        }
        self.me_slots.get(id.index() - domid::ME_FIRST as usize)
    }

    /// CPU an ordinary domain of this slot is pinned to
    pub fn cpu_for(&self, id: DomainId) -> usize {
        if id == DomainId::AGENCY {
            self.agency_cpu
        } else {
            self.me_cpu
        }
    }
}
