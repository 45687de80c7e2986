//! Scoped windows onto physical memory
//!
//! Migration restore, image injection and cooperation all need to read or
//! write a physical range that is not part of the hypervisor's own heap.
//! [`PhysWindow`] maps such a range through a [`PhysMapper`], exposes it as a
//! byte slice for the lifetime of the window, and unmaps it on drop.
//!
//! # Safety Invariants
//!
//! 1. **Validity**: a mapper only returns pointers valid for `len` bytes
//!    until the matching `unmap`
//! 2. **Exclusivity**: a window is the only Rust reference to its range;
//!    callers never create two windows over the same bytes at once
//! 3. **Single unmap**: the window unmaps exactly once, in `Drop`

use core::ptr::NonNull;

/// Errors returned while mapping or accessing a window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Zero-length mapping requested
    Empty,
    /// The mapper could not back the range
    Unbacked,
    /// Offset/length falls outside the window
    OutOfRange,
}

/// Something that can map physical ranges into the active address space.
///
/// Implemented by the runtime on top of its HAL.
pub trait PhysMapper {
    /// Map `len` bytes starting at physical address `phys`
    fn map(&self, phys: u64, len: usize) -> Result<*mut u8, MapError>;

    /// Unmap a range previously returned by `map`
    fn unmap(&self, virt: *mut u8, len: usize);
}

/// A mapped physical range, unmapped when dropped.
pub struct PhysWindow<'m, M: PhysMapper + ?Sized> {
    mapper: &'m M,
    ptr: NonNull<u8>,
    len: usize,
    phys: u64,
}

impl<'m, M: PhysMapper + ?Sized> PhysWindow<'m, M> {
    /// Map `len` bytes at `phys`.
    pub fn map(mapper: &'m M, phys: u64, len: usize) -> Result<Self, MapError> {
        if len == 0 {
            return Err(MapError::Empty);
        }
        let raw = mapper.map(phys, len)?;
        let ptr = NonNull::new(raw).ok_or(MapError::Unbacked)?;
        Ok(Self {
            mapper,
            ptr,
            len,
            phys,
        })
    }

    /// Physical address of the first byte
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Length of the window in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window is empty (never true for a mapped window)
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapper guarantees `ptr` is valid for `len` bytes until
        // unmap, which only happens in Drop; `&self` prevents a concurrent
        // mutable borrow through this window.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutably borrow the mapped bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: same validity argument as `as_slice`; `&mut self` makes
        // this the only live reference into the window.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy `data` into the window at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), MapError> {
        let end = offset.checked_add(data.len()).ok_or(MapError::OutOfRange)?;
        if end > self.len {
            return Err(MapError::OutOfRange);
        }
        self.as_mut_slice()[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy bytes out of the window starting at `offset`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), MapError> {
        let end = offset.checked_add(buf.len()).ok_or(MapError::OutOfRange)?;
        if end > self.len {
            return Err(MapError::OutOfRange);
        }
        buf.copy_from_slice(&self.as_slice()[offset..end]);
        Ok(())
    }

    /// Fill the whole window with zeroes.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl<M: PhysMapper + ?Sized> Drop for PhysWindow<'_, M> {
    fn drop(&mut self) {
        self.mapper.unmap(self.ptr.as_ptr(), self.len);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};

    /// Physical memory starting at 0x1000, backed by a Vec
    struct VecMapper {
        mem: RefCell<Vec<u8>>,
        unmaps: Cell<usize>,
    }

    impl VecMapper {
        const BASE: u64 = 0x1000;

        fn new(size: usize) -> Self {
            Self {
                mem: RefCell::new(vec![0u8; size]),
                unmaps: Cell::new(0),
            }
        }
    }

    impl PhysMapper for VecMapper {
        fn map(&self, phys: u64, len: usize) -> Result<*mut u8, MapError> {
            let mut mem = self.mem.borrow_mut();
            let off = phys.checked_sub(Self::BASE).ok_or(MapError::Unbacked)? as usize;
            if off + len > mem.len() {
                return Err(MapError::Unbacked);
            }
            Ok(mem[off..].as_mut_ptr())
        }

        fn unmap(&self, _virt: *mut u8, _len: usize) {
            self.unmaps.set(self.unmaps.get() + 1);
        }
    }

    #[test]
    fn test_window_write_then_read() {
        let mapper = VecMapper::new(256);
        {
            let mut w = PhysWindow::map(&mapper, 0x1010, 32).unwrap();
            w.write_at(4, &[1, 2, 3]).unwrap();
            let mut out = [0u8; 3];
            w.read_at(4, &mut out).unwrap();
            assert_eq!(out, [1, 2, 3]);
        }
        assert_eq!(mapper.mem.borrow()[0x14..0x17], [1, 2, 3]);
        assert_eq!(mapper.unmaps.get(), 1);
    }

    #[test]
    fn test_window_rejects_out_of_range() {
        let mapper = VecMapper::new(64);
        let mut w = PhysWindow::map(&mapper, 0x1000, 16).unwrap();
        assert_eq!(w.write_at(15, &[0, 0]), Err(MapError::OutOfRange));
        assert_eq!(w.write_at(usize::MAX, &[0]), Err(MapError::OutOfRange));
    }

    #[test]
    fn test_window_unbacked_and_empty() {
        let mapper = VecMapper::new(64);
        assert!(matches!(
            PhysWindow::map(&mapper, 0x0, 16),
            Err(MapError::Unbacked)
        ));
        assert!(matches!(
            PhysWindow::map(&mapper, 0x1000, 0),
            Err(MapError::Empty)
        ));
        assert_eq!(mapper.unmaps.get(), 0);
    }

    #[test]
    fn test_window_zero() {
        let mapper = VecMapper::new(64);
        mapper.mem.borrow_mut().fill(0xAA);
        let mut w = PhysWindow::map(&mapper, 0x1008, 8).unwrap();
        w.zero();
        drop(w);
        let mem = mapper.mem.borrow();
        assert_eq!(mem[7], 0xAA);
        assert!(mem[8..16].iter().all(|&b| b == 0));
        assert_eq!(mem[16], 0xAA);
    }
}
