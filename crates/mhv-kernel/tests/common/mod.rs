//! Shared fixtures: a two-CPU node on the mock HAL with a small slot
//! layout, and helpers that boot MEs driven by `mhv_guest::MeAgent`.

#![allow(dead_code)]

use std::sync::Arc;

use mhv_abi::{PAGE_SIZE, SPAD_CAPS_SIZE};
use mhv_core::{DomainId, HvConfig, MeImage, MeSlotLayout, MeState};
use mhv_guest::{MeAgent, PageAccess};
use mhv_hal_mock::{MockConfigStore, MockHal, MockMemory};
use mhv_kernel::{Activation, Hypervisor};

pub const SLOT_SIZE: u64 = 0x10000;
pub const NR_SLOTS: u64 = 6;
pub const ME_MEM: u64 = 0x8000;

/// Config with 64 KiB slots starting at `ram_base`
pub fn config(host_id: u64, ram_base: u64) -> HvConfig {
    HvConfig {
        nr_cpus: 2,
        agency_cpu: 0,
        me_cpu: 1,
        agency_slice_ns: 1_000_000,
        me_slice_ns: 1_000_000,
        host_id,
        me_slots: (0..NR_SLOTS)
            .map(|i| MeSlotLayout {
                base: ram_base + i * SLOT_SIZE,
                size: SLOT_SIZE,
                root: 0x1000_0000 + i * PAGE_SIZE as u64,
            })
            .collect(),
        coop_page_offset: 0xF000,
    }
}

pub struct Node {
    pub hv: Hypervisor<MockHal>,
    pub store: Arc<MockConfigStore>,
    pub memory: Arc<MockMemory>,
}

/// A booted node whose calls run on the ME CPU
pub fn node(host_id: u64, ram_base: u64) -> Node {
    let hal = MockHal::new();
    hal.add_ram(ram_base, (NR_SLOTS * SLOT_SIZE) as usize);
    hal.set_current_cpu(1);
    let memory = hal.memory();
    let store = Arc::new(MockConfigStore::new());
    let hv = Hypervisor::new(hal, config(host_id, ram_base))
        .unwrap()
        .with_store(store.clone());
    hv.boot_agency().unwrap();
    Node { hv, store, memory }
}

/// Guest view of a node's RAM
pub struct MemPages(pub Arc<MockMemory>);

impl PageAccess for MemPages {
    fn read_page(&self, pfn: u64, buf: &mut [u8]) -> bool {
        match self.0.read(pfn * PAGE_SIZE as u64, buf.len()) {
            Ok(bytes) => {
                buf.copy_from_slice(&bytes);
                true
            }
            Err(_) => false,
        }
    }

    fn write_page(&self, pfn: u64, data: &[u8]) -> bool {
        self.0.write(pfn * PAGE_SIZE as u64, data).is_ok()
    }
}

pub type Agent = Arc<MeAgent<MemPages>>;

pub fn agent(node: &Node, spid: u64, caps0: u8) -> Agent {
    let mut caps = [0u8; SPAD_CAPS_SIZE];
    caps[0] = caps0;
    Arc::new(MeAgent::new(MemPages(node.memory.clone()), spid, caps))
}

/// Register `agent` as guest code at `entry` on `node`
pub fn register(node: &Node, entry: u64, agent: &Agent) {
    let agent = agent.clone();
    node.hv
        .hal()
        .register_guest(entry, move |cmd, record| agent.handle(cmd, record));
}

pub fn image(spid: u64, caps0: u8) -> Vec<u8> {
    let devdesc = format!("name=me-{:x}\nspid={:#x}\ncaps={:02x}\n", spid, spid, caps0);
    MeImage::build(ME_MEM, b"\x90\x90\xf4kernel", devdesc.as_bytes(), Some(b"init"))
}

/// Inject an ME driven by `agent` and bring it to `Living`
pub fn spawn_me(node: &Node, spid: u64, caps0: u8, agent: &Agent) -> DomainId {
    let slot = node.hv.get_free_slot(ME_MEM).unwrap();
    let entry = node.hv.config().slot_layout(slot).unwrap().base;
    register(node, entry, agent);
    let id = node.hv.inject_image(&image(spid, caps0)).unwrap();
    assert_eq!(id, slot);
    node.hv.set_me_state(id, MeState::Living).unwrap();
    id
}

/// Move an ME from `src` to `dst` and run its post-activate.
///
/// `agent` must already be registered on `dst` at the ME's entry.
pub fn migrate(src: &Node, dst: &Node, id: DomainId) -> (DomainId, Activation) {
    let stream = src.hv.save_domain(id).unwrap();
    let restored = dst.hv.restore_domain(&stream).unwrap();
    assert!(restored.tokens.is_empty());
    src.hv.finalize_migration(id).unwrap();
    let activation = dst.hv.activate_migrated(restored.id).unwrap();
    dst.hv.do_softirq(1);
    (restored.id, activation)
}
