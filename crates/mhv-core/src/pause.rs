//! Reference-counted pause
//!
//! A domain is eligible to run only while its pause count is zero. Every
//! pause hands back a [`PauseToken`] that must be returned to `unpause`;
//! the token is not `Clone`, so one pause can be undone exactly once. The
//! decrement that reaches zero yields a [`Readmit`], the only value the
//! scheduler's readmission path accepts, so a domain cannot be woken
//! without a matching unpause.
//!
//! Attributed pauses (`pause_by` / `unpause_by`) keep their token inside
//! the counter, one per [`PauseFlags`] bit, and are idempotent per flag.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::types::PauseFlags;

/// Proof of one outstanding pause reference.
#[must_use = "dropping a PauseToken leaks a pause reference"]
#[derive(Debug)]
pub struct PauseToken {
    _private: (),
}

/// Capability to readmit a domain whose pause count just reached zero.
#[must_use = "a Readmit must be handed to the scheduler"]
#[derive(Debug)]
pub struct Readmit {
    _private: (),
}

/// Atomic pause counter plus attributed-pause flags.
#[derive(Debug, Default)]
pub struct PauseCount {
    count: AtomicU32,
    flags: AtomicU32,
}

impl PauseCount {
    /// An unpaused counter
    pub fn new() -> Self {
        Self::default()
    }

    /// The creation state: one pause held by the controller
    pub fn paused_by_controller() -> Self {
        Self {
            count: AtomicU32::new(1),
            flags: AtomicU32::new(PauseFlags::CONTROLLER.bits()),
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> PauseFlags {
        PauseFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_paused(&self) -> bool {
        self.count() != 0
    }

    /// Take an anonymous pause reference.
    pub fn pause(&self) -> PauseToken {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        assert!(prev != u32::MAX, "pause count overflow");
        PauseToken { _private: () }
    }

    /// Return an anonymous pause reference.
    pub fn unpause(&self, token: PauseToken) -> Option<Readmit> {
        let PauseToken { .. } = token;
        self.release()
    }

    /// Take the pause reference attributed to `flag`.
    ///
    /// Returns `false` if that flag already holds one.
    pub fn pause_by(&self, flag: PauseFlags) -> bool {
        let prev = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        if prev & flag.bits() != 0 {
            return false;
        }
        self.count.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Return the pause reference attributed to `flag`, if held.
    pub fn unpause_by(&self, flag: PauseFlags) -> Option<Readmit> {
        let prev = self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        if prev & flag.bits() == 0 {
            return None;
        }
        self.release()
    }

    fn release(&self) -> Option<Readmit> {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "unpause of a domain that is not paused");
        (prev == 1).then_some(Readmit { _private: () })
    }

    /// Rebuild a counter captured elsewhere.
    ///
    /// Attributed references are restored into the flags; the remaining
    /// anonymous references are returned as tokens for whoever resumes
    /// responsibility for them.
    pub fn restore(count: u32, flags: PauseFlags) -> (Self, Vec<PauseToken>) {
        let attributed = flags.bits().count_ones();
        assert!(
            count >= attributed,
            "pause count {} below attributed references {}",
            count,
            attributed
        );
        let tokens = (attributed..count)
            .map(|_| PauseToken { _private: () })
            .collect();
        (
            Self {
                count: AtomicU32::new(count),
                flags: AtomicU32::new(flags.bits()),
            },
            tokens,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
