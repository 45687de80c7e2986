//! Hardware Abstraction Layer trait for the mhv hypervisor
//!
//! The hypervisor core never touches page tables, interrupt controllers or
//! CPU registers directly. Everything platform-specific is reached through
//! the [`HAL`] trait defined here, which lets the same core run on:
//!
//! - **Bare metal**: real MMU switches, GIC/APIC interrupt masking, `wfe` relax
//! - **Host tests**: `mhv-hal-mock`, which simulates physical memory and
//!   records every address-space switch and context switch
//!
//! The configuration-store collaborator is a separate trait, [`ConfigStore`],
//! because it is backed by the agency's key-value service rather than by
//! hardware.

#![no_std]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

/// Saved local interrupt state, returned by [`HAL::local_irq_save`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqState {
    /// Whether interrupts were enabled before the save
    pub was_enabled: bool,
}

/// Hardware Abstraction Layer trait
///
/// Implementations provide platform-specific functionality for:
/// - Address-space switching and physical memory mapping
/// - Invoking guest-resident code (domain-call entry points)
/// - Local interrupt masking and cross-CPU kicks
/// - Low-level context switch and per-CPU timers
/// - Time and debug output
///
/// Address spaces are identified by the physical address of their root
/// page table; the core treats them as opaque `u64` handles.
pub trait HAL: Send + Sync + 'static {
    // === Address spaces ===

    /// Root of the address space currently active on this CPU
    fn current_address_space(&self) -> u64;

    /// Atomically switch the active address space on this CPU
    fn switch_address_space(&self, root: u64);

    /// Map a physical range into the currently active address space
    ///
    /// # Returns
    /// * `Ok(ptr)` - Virtual address of the first mapped byte
    /// * `Err(HalError::BadAddress)` - Range is not backed by RAM
    fn map_phys(&self, phys: u64, len: usize) -> Result<*mut u8, HalError>;

    /// Remove a mapping created by [`HAL::map_phys`]
    fn unmap_phys(&self, virt: *mut u8, len: usize);

    // === Guest invocation ===

    /// Call a guest-resident entry point with the current address space
    ///
    /// `args` is an in/out fixed-layout record; the guest may rewrite it.
    ///
    /// # Returns
    /// * `Ok(rc)` - Return code produced by the guest
    /// * `Err(HalError::NoEntry)` - Nothing executable at `entry`
    fn invoke_guest(&self, entry: u64, cmd: u32, args: &mut [u8]) -> Result<i64, HalError>;

    // === Interrupts ===

    /// Disable local interrupts and return the previous state
    fn local_irq_save(&self) -> IrqState;

    /// Restore local interrupts to a state returned by `local_irq_save`
    fn local_irq_restore(&self, state: IrqState);

    /// Whether local interrupts are currently disabled
    fn irqs_disabled(&self) -> bool;

    /// Index of the CPU executing the caller
    fn current_cpu(&self) -> usize;

    /// Hint the CPU that the caller is spinning
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }

    /// Kick a remote CPU so that it processes pending softirqs
    fn send_ipi(&self, _cpu: usize) {
        // Default: no-op, the target notices on its next tick
    }

    // === Scheduling ===

    /// Perform the low-level switch from `prev` to `next` on `cpu`
    ///
    /// Called with interrupts disabled and after the scheduling lock has
    /// been released.
    fn context_switch(&self, cpu: usize, prev: u16, next: u16);

    /// Program the one-shot scheduling timer of `cpu`
    fn set_timer(&self, cpu: usize, deadline_ns: u64);

    // === Time & Debug ===

    /// Get current time in nanoseconds (monotonic)
    fn now_nanos(&self) -> u64;

    /// Write a debug message to the hypervisor console
    fn debug_write(&self, msg: &str);
}

/// HAL errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Physical range not backed by memory
    BadAddress,
    /// No guest code registered at the requested entry
    NoEntry,
    /// Guest faulted while executing a callback
    GuestFault,
    /// Operation not supported on this platform
    NotSupported,
    /// Key not present in the configuration store
    NoSuchKey,
}

/// Watch registration handle returned by [`ConfigStore::watch`]
pub type WatchId = u32;

/// Hierarchical string key-value store owned by the agency
///
/// Keys are `/`-separated paths such as `domain/3/me/state`. The core only
/// needs read, write and watch; replication and watch delivery belong to
/// the store implementation.
pub trait ConfigStore: Send + Sync {
    /// Read the value stored at `key`
    fn read(&self, key: &str) -> Option<String>;

    /// Write `value` at `key`, firing any watch registered on a prefix of it
    fn write(&self, key: &str, value: &str) -> Result<(), HalError>;

    /// Remove `key` and everything below it
    fn remove(&self, key: &str) -> Result<(), HalError>;

    /// Register a watch on `prefix`
    fn watch(&self, prefix: &str) -> WatchId;

    /// Drain fired watch events as `(watch, key)` pairs
    fn take_watch_events(&self) -> Vec<(WatchId, String)>;
}

/// A minimal test HAL for unit testing
///
/// Single CPU, interrupts tracked in an atomic, no guest code and no
/// physical memory. Suitable for tests that only exercise scheduling and
/// event channels.
#[derive(Default)]
pub struct TestHal {
    time: core::sync::atomic::AtomicU64,
    irqs_off: core::sync::atomic::AtomicBool,
    address_space: core::sync::atomic::AtomicU64,
}

impl TestHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance simulated time
    pub fn advance(&self, nanos: u64) {
        self.time
            .fetch_add(nanos, core::sync::atomic::Ordering::SeqCst);
    }
}

impl HAL for TestHal {
    fn current_address_space(&self) -> u64 {
        self.address_space.load(core::sync::atomic::Ordering::SeqCst)
    }

    fn switch_address_space(&self, root: u64) {
        self.address_space
            .store(root, core::sync::atomic::Ordering::SeqCst);
    }

    fn map_phys(&self, _phys: u64, _len: usize) -> Result<*mut u8, HalError> {
        Err(HalError::NotSupported)
    }

    fn unmap_phys(&self, _virt: *mut u8, _len: usize) {}

    fn invoke_guest(&self, _entry: u64, _cmd: u32, _args: &mut [u8]) -> Result<i64, HalError> {
        Err(HalError::NoEntry)
    }

    fn local_irq_save(&self) -> IrqState {
        let was_off = self
            .irqs_off
            .swap(true, core::sync::atomic::Ordering::SeqCst);
        IrqState {
            was_enabled: !was_off,
        }
    }

    fn local_irq_restore(&self, state: IrqState) {
        self.irqs_off
            .store(!state.was_enabled, core::sync::atomic::Ordering::SeqCst);
    }

    fn irqs_disabled(&self) -> bool {
        self.irqs_off.load(core::sync::atomic::Ordering::SeqCst)
    }

    fn current_cpu(&self) -> usize {
        0
    }

    fn context_switch(&self, _cpu: usize, _prev: u16, _next: u16) {}

    fn set_timer(&self, _cpu: usize, _deadline_ns: u64) {}

    fn now_nanos(&self) -> u64 {
        self.time.load(core::sync::atomic::Ordering::SeqCst)
    }

    fn debug_write(&self, _msg: &str) {
        // No-op for tests
    }
}
