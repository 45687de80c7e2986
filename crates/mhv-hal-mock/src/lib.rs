//! Mock HAL implementation for testing the mhv hypervisor
//!
//! This provides a mock implementation of the HAL trait that can be used
//! for testing the hypervisor core without hardware:
//!
//! - **Physical memory**: RAM banks registered with [`MockHal::add_ram`],
//!   shared through [`MockMemory`] so guest callbacks can reach it too
//! - **Address spaces**: the active root plus a log of every switch
//! - **Guest code**: closures registered per entry address, invoked by
//!   `invoke_guest` with the address space that was active at the time
//! - **Scheduling**: recorded context switches, timers and IPIs
//! - **Configuration store**: [`MockConfigStore`], a `BTreeMap` with watches

#![no_std]
extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use mhv_hal::{ConfigStore, HalError, IrqState, WatchId, HAL};
use spin::Mutex;

/// A registered guest callback: `(cmd, args) -> rc`
pub type GuestFn = Arc<dyn Fn(u32, &mut [u8]) -> i64 + Send + Sync>;

// ============================================================================
// Simulated physical memory
// ============================================================================

struct Bank {
    base: u64,
    bytes: Box<[u8]>,
}

impl Bank {
    fn covers(&self, phys: u64, len: usize) -> bool {
        phys >= self.base
            && phys
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.base + self.bytes.len() as u64)
    }
}

/// Simulated RAM, shared between the HAL and guest callbacks.
#[derive(Default)]
pub struct MockMemory {
    banks: Mutex<Vec<Bank>>,
    live_mappings: AtomicUsize,
}

impl MockMemory {
    /// Back `[base, base + size)` with zeroed memory
    pub fn add_ram(&self, base: u64, size: usize) {
        self.banks.lock().push(Bank {
            base,
            bytes: vec![0u8; size].into_boxed_slice(),
        });
    }

    /// Copy bytes out of simulated RAM
    pub fn read(&self, phys: u64, len: usize) -> Result<Vec<u8>, HalError> {
        let banks = self.banks.lock();
        let bank = banks
            .iter()
            .find(|b| b.covers(phys, len))
            .ok_or(HalError::BadAddress)?;
        let off = (phys - bank.base) as usize;
        Ok(bank.bytes[off..off + len].to_vec())
    }

    /// Copy bytes into simulated RAM
    pub fn write(&self, phys: u64, data: &[u8]) -> Result<(), HalError> {
        let mut banks = self.banks.lock();
        let bank = banks
            .iter_mut()
            .find(|b| b.covers(phys, data.len()))
            .ok_or(HalError::BadAddress)?;
        let off = (phys - bank.base) as usize;
        bank.bytes[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn map(&self, phys: u64, len: usize) -> Result<*mut u8, HalError> {
        let mut banks = self.banks.lock();
        let bank = banks
            .iter_mut()
            .find(|b| b.covers(phys, len))
            .ok_or(HalError::BadAddress)?;
        let off = (phys - bank.base) as usize;
        self.live_mappings.fetch_add(1, Ordering::SeqCst);
        Ok(bank.bytes.as_mut_ptr().wrapping_add(off))
    }

    /// Number of mappings not yet unmapped
    pub fn live_mappings(&self) -> usize {
        self.live_mappings.load(Ordering::SeqCst)
    }
}

// ============================================================================
// MockHal
// ============================================================================

/// One `invoke_guest` call as observed by the mock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub entry: u64,
    pub cmd: u32,
    /// Address space active while the guest ran
    pub address_space: u64,
    /// Whether local interrupts were disabled during the call
    pub irqs_disabled: bool,
}

/// Mock HAL for unit and integration testing
pub struct MockHal {
    /// Simulated time in nanoseconds
    time: AtomicU64,
    /// CPU reported by `current_cpu`
    cpu: AtomicUsize,
    irqs_off: AtomicBool,
    address_space: AtomicU64,
    memory: Arc<MockMemory>,
    guests: Mutex<BTreeMap<u64, GuestFn>>,

    /// Captured debug messages
    debug_log: Mutex<Vec<String>>,
    switch_log: Mutex<Vec<u64>>,
    invocations: Mutex<Vec<Invocation>>,
    context_switches: Mutex<Vec<(usize, u16, u16)>>,
    timers: Mutex<Vec<(usize, u64)>>,
    ipis: Mutex<Vec<usize>>,
}

impl MockHal {
    /// Create a new mock HAL
    pub fn new() -> Self {
        Self::with_time(0)
    }

    /// Create a mock HAL with a specific starting time
    pub fn with_time(nanos: u64) -> Self {
        Self {
            time: AtomicU64::new(nanos),
            cpu: AtomicUsize::new(0),
            irqs_off: AtomicBool::new(false),
            address_space: AtomicU64::new(0),
            memory: Arc::new(MockMemory::default()),
            guests: Mutex::new(BTreeMap::new()),
            debug_log: Mutex::new(Vec::new()),
            switch_log: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            context_switches: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            ipis: Mutex::new(Vec::new()),
        }
    }

    /// Advance the simulated time by the given duration
    pub fn advance_time(&self, nanos: u64) {
        self.time.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Pretend subsequent calls run on `cpu`
    pub fn set_current_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    /// Shared handle on simulated RAM
    pub fn memory(&self) -> Arc<MockMemory> {
        self.memory.clone()
    }

    /// Back `[base, base + size)` with zeroed memory
    pub fn add_ram(&self, base: u64, size: usize) {
        self.memory.add_ram(base, size);
    }

    /// Register guest code at `entry`
    pub fn register_guest<F>(&self, entry: u64, f: F)
    where
        F: Fn(u32, &mut [u8]) -> i64 + Send + Sync + 'static,
    {
        self.guests.lock().insert(entry, Arc::new(f));
    }

    /// Get all captured debug messages
    pub fn get_debug_log(&self) -> Vec<String> {
        self.debug_log.lock().clone()
    }

    /// Check if a specific message was logged
    pub fn has_log_containing(&self, substr: &str) -> bool {
        self.debug_log.lock().iter().any(|msg| msg.contains(substr))
    }

    /// Every address-space root switched to, in order
    pub fn address_space_switches(&self) -> Vec<u64> {
        self.switch_log.lock().clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    /// `(cpu, prev, next)` of every context switch
    pub fn context_switches(&self) -> Vec<(usize, u16, u16)> {
        self.context_switches.lock().clone()
    }

    /// `(cpu, deadline)` of every timer programmed
    pub fn timers(&self) -> Vec<(usize, u64)> {
        self.timers.lock().clone()
    }

    pub fn ipis(&self) -> Vec<usize> {
        self.ipis.lock().clone()
    }
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl HAL for MockHal {
    fn current_address_space(&self) -> u64 {
        self.address_space.load(Ordering::SeqCst)
    }

    fn switch_address_space(&self, root: u64) {
        self.address_space.store(root, Ordering::SeqCst);
        self.switch_log.lock().push(root);
    }

    fn map_phys(&self, phys: u64, len: usize) -> Result<*mut u8, HalError> {
        self.memory.map(phys, len)
    }

    fn unmap_phys(&self, _virt: *mut u8, _len: usize) {
        self.memory.live_mappings.fetch_sub(1, Ordering::SeqCst);
    }

    fn invoke_guest(&self, entry: u64, cmd: u32, args: &mut [u8]) -> Result<i64, HalError> {
        // Clone out so the guest may call back into the HAL
        let guest = self
            .guests
            .lock()
            .get(&entry)
            .cloned()
            .ok_or(HalError::NoEntry)?;
        self.invocations.lock().push(Invocation {
            entry,
            cmd,
            address_space: self.current_address_space(),
            irqs_disabled: self.irqs_disabled(),
        });
        Ok(guest(cmd, args))
    }

    fn local_irq_save(&self) -> IrqState {
        let was_off = self.irqs_off.swap(true, Ordering::SeqCst);
        IrqState {
            was_enabled: !was_off,
        }
    }

    fn local_irq_restore(&self, state: IrqState) {
        self.irqs_off.store(!state.was_enabled, Ordering::SeqCst);
    }

    fn irqs_disabled(&self) -> bool {
        self.irqs_off.load(Ordering::SeqCst)
    }

    fn current_cpu(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    fn send_ipi(&self, cpu: usize) {
        self.ipis.lock().push(cpu);
    }

    fn context_switch(&self, cpu: usize, prev: u16, next: u16) {
        self.context_switches.lock().push((cpu, prev, next));
    }

    fn set_timer(&self, cpu: usize, deadline_ns: u64) {
        self.timers.lock().push((cpu, deadline_ns));
    }

    fn now_nanos(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.lock().push(String::from(msg));
    }
}

// ============================================================================
// MockConfigStore
// ============================================================================

/// In-memory configuration store with prefix watches
#[derive(Default)]
pub struct MockConfigStore {
    entries: Mutex<BTreeMap<String, String>>,
    watches: Mutex<Vec<(WatchId, String)>>,
    events: Mutex<Vec<(WatchId, String)>>,
    next_watch: AtomicU32,
}

impl MockConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently stored, in order
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    fn fire(&self, key: &str) {
        let fired: Vec<_> = self
            .watches
            .lock()
            .iter()
            .filter(|(_, prefix)| key.starts_with(prefix.as_str()))
            .map(|(id, _)| (*id, key.to_string()))
            .collect();
        self.events.lock().extend(fired);
    }
}

impl ConfigStore for MockConfigStore {
    fn read(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn write(&self, key: &str, value: &str) -> Result<(), HalError> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        self.fire(key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), HalError> {
        let removed: Vec<String> = {
            let mut entries = self.entries.lock();
            let doomed: Vec<String> = entries
                .keys()
                .filter(|k| *k == key || k.starts_with(&alloc::format!("{}/", key)))
                .cloned()
                .collect();
            for k in &doomed {
                entries.remove(k);
            }
            doomed
        };
        if removed.is_empty() {
            return Err(HalError::NoSuchKey);
        }
        for k in &removed {
            self.fire(k);
        }
        Ok(())
    }

    fn watch(&self, prefix: &str) -> WatchId {
        let id = self.next_watch.fetch_add(1, Ordering::SeqCst);
        self.watches.lock().push((id, prefix.to_string()));
        id
    }

    fn take_watch_events(&self) -> Vec<(WatchId, String)> {
        core::mem::take(&mut *self.events.lock())
    }
}
