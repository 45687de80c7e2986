//! Shared-state page
//!
//! The pending-event vector, the per-port mask vector, the upcall-pending
//! flag and the ME state byte live in memory shared between the hypervisor
//! and the domain. Both sides mutate them concurrently, so every mutation is
//! a single-word atomic read-modify-write.
//!
//! Ordering rules:
//!
//! - A sender sets the port's pending bit **before** raising the upcall flag,
//!   and the delivery loop re-checks the flag after draining.
//! - "Set pending, then read mask" on the sender and "clear mask, then read
//!   pending" on the receiver are a store-buffering pair. Each side puts a
//!   `fence(SeqCst)` between its write and its read, so at least one of them
//!   observes the other and the event is re-raised.
//! - The upcall flag is only ever raised with a read-modify-write, which
//!   keeps the release sequences of concurrent senders intact.

use crate::sync::{fence, AtomicBool, AtomicU64, AtomicU8, Ordering};
use mhv_abi::{me_state, EVTCHN_WORDS, NR_EVTCHN};

use crate::types::Port;

#[inline]
fn split(port: Port) -> (usize, u64) {
    let p = port as usize;
    assert!(p < NR_EVTCHN, "port {} out of range", port);
    (p / 64, 1u64 << (p % 64))
}

/// Live shared-state page of one domain.
#[derive(Debug)]
pub struct SharedInfo {
    pending: [AtomicU64; EVTCHN_WORDS],
    mask: [AtomicU64; EVTCHN_WORDS],
    upcall_pending: AtomicBool,
    me_state: AtomicU8,
}

impl Default for SharedInfo {
    fn default() -> Self {
        Self {
            pending: core::array::from_fn(|_| AtomicU64::new(0)),
            mask: core::array::from_fn(|_| AtomicU64::new(0)),
            upcall_pending: AtomicBool::new(false),
            me_state: AtomicU8::new(me_state::BOOTING),
        }
    }
}

impl SharedInfo {
    pub fn new() -> Self {
        Self::default()
    }

    // === Sender side ===

    /// Mark `port` pending and raise the upcall flag.
    ///
    /// Returns `true` when the bit was newly set on an unmasked port, i.e.
    /// when the domain should be kicked.
    pub fn mark_pending(&self, port: Port) -> bool {
        let (w, bit) = split(port);
        if self.pending[w].fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return false;
        }
        fence(Ordering::SeqCst);
        if self.mask[w].load(Ordering::Acquire) & bit != 0 {
            return false;
        }
        self.raise_upcall();
        true
    }

    /// Clear the mask of `port`, re-raising the upcall if it is pending.
    pub fn unmask(&self, port: Port) -> bool {
        let (w, bit) = split(port);
        self.mask[w].fetch_and(!bit, Ordering::AcqRel);
        fence(Ordering::SeqCst);
        if self.pending[w].load(Ordering::Acquire) & bit != 0 {
            self.raise_upcall();
            return true;
        }
        false
    }

    // === Receiver side ===

    /// Take and clear the upcall flag.
    pub fn take_upcall(&self) -> bool {
        self.upcall_pending.swap(false, Ordering::AcqRel)
    }

    pub fn raise_upcall(&self) {
        self.upcall_pending.swap(true, Ordering::AcqRel);
    }

    pub fn upcall_pending(&self) -> bool {
        self.upcall_pending.load(Ordering::Acquire)
    }

    /// Pending and unmasked bits of word `w`
    pub fn deliverable_word(&self, w: usize) -> u64 {
        self.pending[w].load(Ordering::Acquire) & !self.mask[w].load(Ordering::Acquire)
    }

    /// Atomically clear `port`'s pending bit, returning whether it was set.
    pub fn test_and_clear_pending(&self, port: Port) -> bool {
        let (w, bit) = split(port);
        self.pending[w].fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    pub fn is_pending(&self, port: Port) -> bool {
        let (w, bit) = split(port);
        self.pending[w].load(Ordering::Acquire) & bit != 0
    }

    pub fn is_masked(&self, port: Port) -> bool {
        let (w, bit) = split(port);
        self.mask[w].load(Ordering::Acquire) & bit != 0
    }

    pub fn set_mask(&self, port: Port) {
        let (w, bit) = split(port);
        self.mask[w].fetch_or(bit, Ordering::AcqRel);
    }

    /// Drop any pending/mask state of a port being closed.
    pub fn reset_port(&self, port: Port) {
        let (w, bit) = split(port);
        self.pending[w].fetch_and(!bit, Ordering::AcqRel);
        self.mask[w].fetch_and(!bit, Ordering::AcqRel);
    }

    // === ME state byte ===

    pub fn me_state(&self) -> u8 {
        self.me_state.load(Ordering::Acquire)
    }

    pub fn set_me_state(&self, state: u8) {
        self.me_state.store(state, Ordering::Release);
    }

    // === Capture ===

    /// Copy the page. The signature is left blank; capture stamps it.
    pub fn image(&self) -> SharedImage {
        SharedImage {
            pending: core::array::from_fn(|w| self.pending[w].load(Ordering::Acquire)),
            mask: core::array::from_fn(|w| self.mask[w].load(Ordering::Acquire)),
            upcall_pending: self.upcall_pending.load(Ordering::Acquire),
            me_state: self.me_state.load(Ordering::Acquire),
            signature: [0; 16],
        }
    }

    /// Overwrite the page wholesale from a captured image.
    pub fn load(&self, image: &SharedImage) {
        for w in 0..EVTCHN_WORDS {
            self.pending[w].store(image.pending[w], Ordering::Release);
            self.mask[w].store(image.mask[w], Ordering::Release);
        }
        self.me_state.store(image.me_state, Ordering::Release);
        self.upcall_pending
            .store(image.upcall_pending, Ordering::Release);
    }
}

/// Plain copy of a shared-state page, as carried in a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SharedImage {
    pub pending: [u64; EVTCHN_WORDS],
    pub mask: [u64; EVTCHN_WORDS],
    pub upcall_pending: bool,
    pub me_state: u8,
    pub signature: [u8; 16],
}
