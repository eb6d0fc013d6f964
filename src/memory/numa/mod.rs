/*!
 * NUMA Support
 * Topology discovery and node-local allocation
 */

mod allocator;
mod topology;

pub use allocator::{NodeUsage, NumaAllocator};
pub use topology::{
    parse_cpu_list, parse_node_mem_total, set_thread_node, thread_node, NodeInfo, NumaTopology,
};
