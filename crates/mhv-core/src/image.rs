//! ME image container and device-description patching
//!
//! Container layout:
//!
//! ```text
//! [magic: 8]["version": u32][count: u32]
//! count x [tag: u32][len: u32][bytes: len]
//! ```
//!
//! Tags are listed in `mhv_abi::image`. `MEMSIZE` and `KERNEL` and
//! `DEVDESC` are required, `INITDATA` is optional, unknown tags are skipped.
//!
//! Pieces are placed in the ME region as follows, each page aligned:
//!
//! ```text
//! base ─▶ [kernel][devdesc][initdata] ... free ...
//! ```

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use mhv_abi::{image, PAGE_SIZE, SPAD_CAPS_SIZE};

use crate::types::{DomainId, MeDescriptor};
use crate::wire::{Reader, Writer};

/// Malformed image container
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageError {
    /// Magic or version not recognised
    BadMagic,
    /// Section or header runs past the end
    Truncated,
    /// A required section is absent
    MissingSection,
    /// A section appears twice
    DuplicateSection,
    /// Pieces do not fit in the declared memory size
    TooLarge,
}

/// A parsed image, borrowing from the container
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeImage<'a> {
    pub mem_size: u64,
    pub kernel: &'a [u8],
    pub devdesc: &'a [u8],
    pub initdata: Option<&'a [u8]>,
}

/// Offsets of each piece inside the region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageLayout {
    pub kernel: u64,
    pub devdesc: u64,
    pub initdata: u64,
    /// First byte past the last piece
    pub end: u64,
}

/// Boot parameters written into the device description
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootParams {
    pub domid: DomainId,
    pub mem_base: u64,
    pub mem_size: u64,
    pub initdata_start: u64,
    pub initdata_size: u64,
    pub entry: u64,
}

fn page_align(v: u64) -> u64 {
    let page = PAGE_SIZE as u64;
    v.div_ceil(page) * page
}

impl<'a> MeImage<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ImageError> {
        let mut r = Reader::new(bytes);
        let magic: [u8; 8] = r.array().ok_or(ImageError::Truncated)?;
        if magic != image::MAGIC {
            return Err(ImageError::BadMagic);
        }
        if r.u32().ok_or(ImageError::Truncated)? != image::VERSION {
            return Err(ImageError::BadMagic);
        }
        let count = r.u32().ok_or(ImageError::Truncated)?;

        let mut mem_size = None;
        let mut kernel = None;
        let mut devdesc = None;
        let mut initdata = None;
        for _ in 0..count {
            let tag = r.u32().ok_or(ImageError::Truncated)?;
            let len = r.u32().ok_or(ImageError::Truncated)? as usize;
            let body = r.take(len).ok_or(ImageError::Truncated)?;
            let slot = match tag {
                image::TAG_MEMSIZE => {
                    let v = body
                        .get(..8)
                        .and_then(|b| b.try_into().ok())
                        .map(u64::from_le_bytes)
                        .ok_or(ImageError::Truncated)?;
                    if mem_size.replace(v).is_some() {
                        return Err(ImageError::DuplicateSection);
                    }
                    continue;
                }
                image::TAG_KERNEL => &mut kernel,
                image::TAG_DEVDESC => &mut devdesc,
                image::TAG_INITDATA => &mut initdata,
                _ => continue,
            };
            if slot.replace(body).is_some() {
                return Err(ImageError::DuplicateSection);
            }
        }

        let img = Self {
            mem_size: mem_size.ok_or(ImageError::MissingSection)?,
            kernel: kernel.ok_or(ImageError::MissingSection)?,
            devdesc: devdesc.ok_or(ImageError::MissingSection)?,
            initdata,
        };
        if img.layout().end > img.mem_size {
            return Err(ImageError::TooLarge);
        }
        Ok(img)
    }

    /// Where each piece goes, relative to the region base.
    ///
    /// The device description is sized for its patched form, which may grow
    /// by a few lines.
    pub fn layout(&self) -> ImageLayout {
        let kernel = 0;
        let devdesc = page_align(self.kernel.len() as u64);
        let initdata = devdesc + page_align(self.devdesc.len() as u64 + DEVDESC_SLACK);
        let end = initdata + self.initdata.map_or(0, |d| d.len() as u64);
        ImageLayout {
            kernel,
            devdesc,
            initdata,
            end,
        }
    }

    /// ME descriptor declared by the device description
    pub fn descriptor(&self) -> MeDescriptor {
        parse_descriptor(self.devdesc)
    }

    /// Build a container (agency-side tooling and tests).
    pub fn build(mem_size: u64, kernel: &[u8], devdesc: &[u8], initdata: Option<&[u8]>) -> Vec<u8> {
        let mut w = Writer::with_capacity(64 + kernel.len() + devdesc.len());
        w.bytes(&image::MAGIC);
        w.u32(image::VERSION);
        w.u32(3 + initdata.is_some() as u32);
        w.u32(image::TAG_MEMSIZE);
        w.u32(8);
        w.u64(mem_size);
        for (tag, body) in [(image::TAG_KERNEL, kernel), (image::TAG_DEVDESC, devdesc)]
            .into_iter()
            .chain(initdata.map(|d| (image::TAG_INITDATA, d)))
        {
            w.u32(tag);
            w.u32(body.len() as u32);
            w.bytes(body);
        }
        w.into_vec()
    }
}

/// Room reserved for keys appended by [`patch_devdesc`]
const DEVDESC_SLACK: u64 = 256;

const PATCHED_KEYS: [&str; 6] = [
    "domid",
    "mem.base",
    "mem.size",
    "initdata.start",
    "initdata.size",
    "entry",
];

fn split_line(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let eq = line.iter().position(|b| *b == b'=')?;
    Some((line[..eq].trim_ascii(), line[eq + 1..].trim_ascii()))
}

/// Value of `key` in a `key=value` description
pub fn devdesc_value<'d>(desc: &'d [u8], key: &str) -> Option<&'d [u8]> {
    desc.split(|b| *b == b'\n')
        .filter_map(split_line)
        .find(|(k, _)| *k == key.as_bytes())
        .map(|(_, v)| v)
}

fn parse_u64(v: &[u8]) -> Option<u64> {
    let s = core::str::from_utf8(v).ok()?;
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// Read `spid` and the hex `caps` vector from a description. Missing or
/// malformed values read as zero.
pub fn parse_descriptor(desc: &[u8]) -> MeDescriptor {
    let spid = devdesc_value(desc, "spid").and_then(parse_u64).unwrap_or(0);
    let mut caps = [0u8; SPAD_CAPS_SIZE];
    if let Some(hex) = devdesc_value(desc, "caps") {
        for (i, pair) in hex.chunks(2).take(SPAD_CAPS_SIZE).enumerate() {
            caps[i] = core::str::from_utf8(pair)
                .ok()
                .and_then(|p| u8::from_str_radix(p, 16).ok())
                .unwrap_or(0);
        }
    }
    MeDescriptor { spid, caps }
}

/// Rewrite the boot-parameter keys of a description for its destination.
///
/// Lines carrying a patched key are replaced; missing keys are appended;
/// every other line is kept verbatim.
pub fn patch_devdesc(desc: &[u8], params: &BootParams) -> Vec<u8> {
    let values: [String; 6] = [
        format!("{}", params.domid.0),
        format!("{:#x}", params.mem_base),
        format!("{:#x}", params.mem_size),
        format!("{:#x}", params.initdata_start),
        format!("{:#x}", params.initdata_size),
        format!("{:#x}", params.entry),
    ];
    let mut seen = [false; 6];
    let mut out = Vec::with_capacity(desc.len() + DEVDESC_SLACK as usize);

    for line in desc.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let key_idx = split_line(line)
            .and_then(|(k, _)| PATCHED_KEYS.iter().position(|p| p.as_bytes() == k));
        match key_idx {
            Some(i) => {
                out.extend_from_slice(format!("{}={}\n", PATCHED_KEYS[i], values[i]).as_bytes());
                seen[i] = true;
            }
            None => {
                out.extend_from_slice(line);
                out.push(b'\n');
            }
        }
    }
    for i in 0..PATCHED_KEYS.len() {
        if !seen[i] {
            out.extend_from_slice(format!("{}={}\n", PATCHED_KEYS[i], values[i]).as_bytes());
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
