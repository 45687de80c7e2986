//! Per-domain hypervisor stacks
//!
//! Every domain owns a page-aligned hypervisor stack. When a domain traps,
//! its exception frame is pushed at the very top of that stack; migration
//! restore recreates the stack on the destination node and splices the saved
//! frame back into the same position so that the exception-return path
//! resumes the guest exactly where it was frozen.
//!
//! # Safety Invariants
//!
//! 1. **Ownership**: the allocation is owned by exactly one `HvStack` and
//!    freed once, in `Drop`
//! 2. **Alignment**: the base is page aligned and the size is a multiple of 8
//! 3. **Bounds**: frame accesses are clamped to the allocation

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;

const STACK_ALIGN: usize = 4096;

/// A page-aligned hypervisor stack.
pub struct HvStack {
    base: NonNull<u64>,
    words: usize,
}

// SAFETY: HvStack owns its allocation exclusively; moving it to another
// CPU moves that ownership. All mutation requires `&mut self`.
unsafe impl Send for HvStack {}

// SAFETY: shared references only permit reads of the allocation.
unsafe impl Sync for HvStack {}

impl HvStack {
    /// Allocate a zeroed stack of `size` bytes.
    ///
    /// Returns `None` if `size` is zero, not a multiple of 8, or the
    /// allocator is exhausted.
    pub fn new(size: usize) -> Option<Self> {
        if size == 0 || size % 8 != 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, STACK_ALIGN).ok()?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) } as *mut u64;
        let base = NonNull::new(raw)?;
        Some(Self {
            base,
            words: size / 8,
        })
    }

    /// Size of the stack in bytes
    pub fn size(&self) -> usize {
        self.words * 8
    }

    /// Address one past the highest byte of the stack
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.size()
    }

    /// Stack pointer value at which a frame of `frame_words` words starts
    pub fn frame_pointer(&self, frame_words: usize) -> usize {
        self.top() - frame_words.min(self.words) * 8
    }

    fn as_slice(&self) -> &[u64] {
        // SAFETY: base is valid for `words` u64s for the life of self.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.words) }
    }

    fn as_mut_slice(&mut self) -> &mut [u64] {
        // SAFETY: as above; `&mut self` guarantees exclusive access.
        unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), self.words) }
    }

    /// Copy `frame` into the topmost words of the stack.
    ///
    /// Returns `false` if the frame does not fit.
    pub fn splice_frame(&mut self, frame: &[u64]) -> bool {
        if frame.len() > self.words {
            return false;
        }
        let start = self.words - frame.len();
        self.as_mut_slice()[start..].copy_from_slice(frame);
        true
    }

    /// Borrow the topmost `n` words (the exception frame).
    pub fn frame(&self, n: usize) -> &[u64] {
        let n = n.min(self.words);
        &self.as_slice()[self.words - n..]
    }
}

impl Drop for HvStack {
    fn drop(&mut self) {
        // The layout was validated in `new`, so this cannot fail.
        if let Ok(layout) = Layout::from_size_align(self.size(), STACK_ALIGN) {
            // SAFETY: base was allocated with exactly this layout in `new`
            // and ownership guarantees this is the only free.
            unsafe { dealloc(self.base.as_ptr() as *mut u8, layout) };
        }
    }
}

impl core::fmt::Debug for HvStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HvStack")
            .field("top", &self.top())
            .field("size", &self.size())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
