//! Shared setup: the space is a process singleton, so every test file
//! funnels through one guarded `init`.
#![allow(dead_code)]

use std::sync::Once;

use gas_heap::layout::SUPERPAGE_SIZE;

pub const BASE_ADDR: usize = 0x6100_0000_0000;
pub const SUPERPAGES_PER_NODE: usize = 64;
pub const NODE_COUNT: usize = 2;

/// Start of the remote node's interval, for cross-node checks.
pub const REMOTE_INTERVAL: usize = BASE_ADDR + SUPERPAGES_PER_NODE * SUPERPAGE_SIZE;

pub fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        gas_heap::init(gas_heap::GasConfig {
            base_addr: BASE_ADDR,
            node_count: NODE_COUNT,
            node_id: 0,
            superpages_per_node: SUPERPAGES_PER_NODE,
        })
        .expect("reserve the global address space");
    });
}
