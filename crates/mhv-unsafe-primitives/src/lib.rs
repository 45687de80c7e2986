//! mhv Unsafe Primitives - Consolidated Unsafe Code TCB
//!
//! This crate contains ALL unsafe code of the hypervisor core, consolidated
//! into a single auditable location. Every other crate uses
//! `#![deny(unsafe_code)]`.
//!
//! # Module Organization
//!
//! - `phys` - Scoped windows onto mapped physical memory
//! - `stack` - Page-aligned hypervisor stacks with a spliceable exception frame
//!
//! # Verification
//!
//! Unit tests cover bounds and lifetime behaviour of each wrapper. The
//! lock-free shared-state page is model-checked in `mhv-core` (`loom`
//! feature).

#![no_std]

extern crate alloc;

pub mod phys;
pub mod stack;

pub use phys::{MapError, PhysMapper, PhysWindow};
pub use stack::HvStack;
