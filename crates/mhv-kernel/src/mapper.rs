//! Physical memory access through the HAL
//!
//! Every copy into or out of a domain region goes through a scoped
//! [`PhysWindow`], so a failed copy never leaves a mapping behind.

use alloc::vec::Vec;
use mhv_hal::HAL;
use mhv_unsafe_primitives::{MapError, PhysMapper, PhysWindow};

use crate::{HvError, Hypervisor};

/// Adapts a HAL to the mapper interface of `PhysWindow`
pub(crate) struct HalMapper<'h, H: HAL>(pub &'h H);

impl<H: HAL> PhysMapper for HalMapper<'_, H> {
    fn map(&self, phys: u64, len: usize) -> Result<*mut u8, MapError> {
        self.0.map_phys(phys, len).map_err(|_| MapError::Unbacked)
    }

    fn unmap(&self, virt: *mut u8, len: usize) {
        self.0.unmap_phys(virt, len)
    }
}

impl<H: HAL> Hypervisor<H> {
    /// Copy `len` bytes out of physical memory
    pub(crate) fn read_phys(&self, phys: u64, len: usize) -> Result<Vec<u8>, HvError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mapper = HalMapper(&self.hal);
        let window = PhysWindow::map(&mapper, phys, len)?;
        Ok(window.as_slice().to_vec())
    }

    /// Copy `data` into physical memory
    pub(crate) fn write_phys(&self, phys: u64, data: &[u8]) -> Result<(), HvError> {
        if data.is_empty() {
            return Ok(());
        }
        let mapper = HalMapper(&self.hal);
        let mut window = PhysWindow::map(&mapper, phys, data.len())?;
        window.write_at(0, data)?;
        Ok(())
    }
}
