//! Atomics of the shared-state page
//!
//! Under the `loom` feature the page is built from loom's atomics so the
//! model checker can drive the real sender and delivery code.

#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicU8, Ordering};

#[cfg(not(feature = "loom"))]
pub(crate) use core::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicU8, Ordering};
