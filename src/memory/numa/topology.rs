/*!
 * NUMA Topology
 * Node and CPU discovery with a simulated single-node fallback
 */

use crate::core::types::NodeId;
use serde::Serialize;
use std::cell::Cell;
use std::sync::{Arc, OnceLock};
use tracing::info;

/// One memory/CPU locality domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub cpus: Vec<usize>,
    /// Installed memory, when the platform reports it
    pub memory_bytes: Option<u64>,
}

/// Discovered (or simulated) NUMA layout of the machine
#[derive(Debug, Clone, Serialize)]
pub struct NumaTopology {
    nodes: Vec<NodeInfo>,
    #[serde(skip)]
    cpu_to_node: Vec<Option<NodeId>>,
    simulated: bool,
}

static GLOBAL_TOPOLOGY: OnceLock<Arc<NumaTopology>> = OnceLock::new();

thread_local! {
    /// Node the calling thread asked to allocate from
    static PREFERRED_NODE: Cell<Option<NodeId>> = const { Cell::new(None) };
}

/// Pin the calling thread's NUMA preference, or clear it with `None`.
///
/// Overrides CPU-based detection; useful for worker threads that know their
/// placement and for exercising multi-node paths on single-node machines.
pub fn set_thread_node(node: Option<NodeId>) {
    PREFERRED_NODE.with(|preferred| preferred.set(node));
}

/// Current preference set by [`set_thread_node`]
pub fn thread_node() -> Option<NodeId> {
    PREFERRED_NODE.with(Cell::get)
}

impl NumaTopology {
    /// Process-wide topology, detected once on first use
    pub fn global() -> Arc<NumaTopology> {
        Arc::clone(GLOBAL_TOPOLOGY.get_or_init(|| {
            let topology = Self::detect();
            info!(
                nodes = topology.node_count(),
                simulated = topology.is_simulated(),
                "NUMA topology initialized"
            );
            Arc::new(topology)
        }))
    }

    /// Read the platform topology, falling back to one simulated node
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Some(nodes) = sysfs::read_nodes(std::path::Path::new(sysfs::NODE_ROOT)) {
                if !nodes.is_empty() {
                    return Self::from_nodes(nodes, false);
                }
            }
        }
        Self::single_node()
    }

    /// One simulated node owning every CPU
    pub fn single_node() -> Self {
        Self::simulated(1)
    }

    /// `node_count` simulated nodes with CPUs dealt round-robin
    pub fn simulated(node_count: usize) -> Self {
        let node_count = node_count.max(1);
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let mut nodes: Vec<NodeInfo> = (0..node_count)
            .map(|id| NodeInfo {
                id: id as NodeId,
                cpus: Vec::new(),
                memory_bytes: None,
            })
            .collect();
        for cpu in 0..cpus {
            nodes[cpu % node_count].cpus.push(cpu);
        }
        Self::from_nodes(nodes, true)
    }

    pub fn from_nodes(mut nodes: Vec<NodeInfo>, simulated: bool) -> Self {
        nodes.sort_by_key(|node| node.id);
        let max_cpu = nodes
            .iter()
            .flat_map(|node| node.cpus.iter().copied())
            .max()
            .map_or(0, |cpu| cpu + 1);
        let mut cpu_to_node = vec![None; max_cpu];
        for node in &nodes {
            for &cpu in &node.cpus {
                cpu_to_node[cpu] = Some(node.id);
            }
        }
        Self {
            nodes,
            cpu_to_node,
            simulated,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id).collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// True when NUMA is unavailable and the layout is synthetic
    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    pub fn node_of_cpu(&self, cpu: usize) -> Option<NodeId> {
        self.cpu_to_node.get(cpu).copied().flatten()
    }

    /// Local node of the calling thread.
    ///
    /// Resolution order: the thread's pinned preference, the node of the CPU
    /// it is running on, then the first node.
    pub fn current_node(&self) -> NodeId {
        if let Some(node) = thread_node().filter(|&id| self.node(id).is_some()) {
            return node;
        }
        current_cpu()
            .and_then(|cpu| self.node_of_cpu(cpu))
            .unwrap_or_else(|| self.nodes.first().map_or(0, |node| node.id))
    }
}

#[cfg(target_os = "linux")]
fn current_cpu() -> Option<usize> {
    nix::sched::sched_getcpu().ok()
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> Option<usize> {
    None
}

/// Parse a kernel CPU list such as `0-3,8,10-11`
pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let range = (start.trim().parse::<usize>(), end.trim().parse::<usize>());
                if let (Ok(start), Ok(end)) = range {
                    cpus.extend(start..=end);
                }
            }
            None => {
                if let Ok(cpu) = part.trim().parse::<usize>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

/// Extract `MemTotal` in bytes from a per-node meminfo file
pub fn parse_node_mem_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let (_, rest) = line.split_once("MemTotal:")?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

#[cfg(target_os = "linux")]
mod sysfs {
    use super::{parse_cpu_list, parse_node_mem_total, NodeInfo};
    use crate::core::types::NodeId;
    use std::fs;
    use std::path::Path;

    pub const NODE_ROOT: &str = "/sys/devices/system/node";

    pub fn read_nodes(root: &Path) -> Option<Vec<NodeInfo>> {
        let mut nodes = Vec::new();
        for entry in fs::read_dir(root).ok()?.flatten() {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("node"))
                .and_then(|n| n.parse::<NodeId>().ok())
            else {
                continue;
            };
            let dir = entry.path();
            let cpus = fs::read_to_string(dir.join("cpulist"))
                .map(|list| parse_cpu_list(&list))
                .unwrap_or_default();
            let memory_bytes = fs::read_to_string(dir.join("meminfo"))
                .ok()
                .and_then(|info| parse_node_mem_total(&info));
            nodes.push(NodeInfo {
                id,
                cpus,
                memory_bytes,
            });
        }
        Some(nodes)
    }
}
