//! First boot of an ME from an image container
//!
//! ```text
//! parse ─▶ free slot ─▶ patch devdesc ─▶ zero region + copy pieces
//!       ─▶ domain entry ─▶ publish ─▶ controller unpause
//! ```
//!
//! Parsing, slot selection and patching all happen before memory or the
//! registry is touched, so a bad container changes nothing.

use mhv_core::image::{devdesc_value, patch_devdesc, BootParams};
use mhv_core::{DomainId, ImageError, MeImage, MemRegion};
use mhv_hal::HAL;
use mhv_unsafe_primitives::PhysWindow;

use crate::domcall::hex;
use crate::mapper::HalMapper;
use crate::{HvError, Hypervisor};

impl<H: HAL> Hypervisor<H> {
    /// Boot a new ME from `bytes` and make it eligible to run.
    pub fn inject_image(&self, bytes: &[u8]) -> Result<DomainId, HvError> {
        let img = MeImage::parse(bytes).map_err(|e| {
            self.hal
                .debug_write(&alloc::format!("[inject] rejected image: {:?}", e));
            HvError::from(e)
        })?;
        let id = self.get_free_slot(img.mem_size)?;
        let slot = *self.config.slot_layout(id).ok_or(HvError::NoFreeSlot)?;
        let region = MemRegion::new(slot.base, img.mem_size);
        let layout = img.layout();

        let params = BootParams {
            domid: id,
            mem_base: region.base,
            mem_size: region.size,
            initdata_start: img.initdata.map_or(0, |_| region.base + layout.initdata),
            initdata_size: img.initdata.map_or(0, |d| d.len() as u64),
            entry: region.base + layout.kernel,
        };
        let devdesc = patch_devdesc(img.devdesc, &params);
        if layout.devdesc + devdesc.len() as u64 > layout.initdata {
            return Err(HvError::Image(ImageError::TooLarge));
        }

        {
            let mapper = HalMapper(&self.hal);
            let mut window = PhysWindow::map(&mapper, region.base, region.size as usize)?;
            window.zero();
            window.write_at(layout.kernel as usize, img.kernel)?;
            window.write_at(layout.devdesc as usize, &devdesc)?;
            if let Some(initdata) = img.initdata {
                window.write_at(layout.initdata as usize, initdata)?;
            }
        }

        let dom = self.create_domain_in(id, region)?;
        let desc = img.descriptor();
        *dom.desc.lock() = desc;
        dom.register_callback(params.entry, slot.root);

        self.publish(id, "spid", &alloc::format!("{:#x}", desc.spid));
        self.publish(id, "caps", &hex(&desc.caps));
        self.publish(id, "state", crate::me_state_name(dom.me_state()));
        if let Some(name) = devdesc_value(&devdesc, "name").and_then(|n| core::str::from_utf8(n).ok()) {
            self.publish(id, "name", name);
        }

        self.hal.debug_write(&alloc::format!(
            "[inject] {} booted: {} bytes kernel, entry {:#x}, spid {:#x}",
            id,
            img.kernel.len(),
            params.entry,
            desc.spid
        ));
        self.unpause_controller(id)?;
        Ok(id)
    }
}
