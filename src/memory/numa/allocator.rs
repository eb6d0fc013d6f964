/*!
 * NUMA-Aware Allocator
 * One heap per topology node, local node first
 */

use super::topology::NumaTopology;
use crate::core::errors::{MemoryError, MemoryResult};
use crate::core::types::{Address, NodeId, Size};
use crate::memory::allocators::FreeListAllocator;
use crate::memory::traits::BlockAllocator;
use crate::memory::types::AllocatorUsage;
use serde::Serialize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct NodeHeap {
    id: NodeId,
    heap: FreeListAllocator,
    local_allocations: AtomicU64,
    /// Served on behalf of a thread whose local node was exhausted
    remote_allocations: AtomicU64,
}

/// Per-node usage snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeUsage {
    pub node: NodeId,
    pub capacity: Size,
    pub used: Size,
    pub utilization: f64,
    pub local_allocations: u64,
    pub remote_allocations: u64,
}

/// Allocator with one backing heap per NUMA node.
///
/// Memory is placed by first touch: the heap for a node is only ever
/// handed to threads resolving to that node unless it runs dry.
pub struct NumaAllocator {
    topology: Arc<NumaTopology>,
    nodes: Vec<NodeHeap>,
    cross_node_fallbacks: AtomicU64,
}

impl NumaAllocator {
    pub fn new(topology: Arc<NumaTopology>, per_node_capacity: Size) -> MemoryResult<Self> {
        let nodes = topology
            .node_ids()
            .into_iter()
            .map(|id| {
                Ok(NodeHeap {
                    id,
                    heap: FreeListAllocator::new(per_node_capacity)?,
                    local_allocations: AtomicU64::new(0),
                    remote_allocations: AtomicU64::new(0),
                })
            })
            .collect::<MemoryResult<Vec<_>>>()?;
        Ok(Self {
            topology,
            nodes,
            cross_node_fallbacks: AtomicU64::new(0),
        })
    }

    /// Allocate from the calling thread's node, then from the others in id order
    pub fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        self.allocate_preferring(self.topology.current_node(), size, align)
    }

    pub fn allocate_preferring(
        &self,
        preferred: NodeId,
        size: Size,
        align: usize,
    ) -> Option<NonNull<u8>> {
        if let Some(node) = self.nodes.iter().find(|node| node.id == preferred) {
            if let Some(ptr) = node.heap.allocate(size, align) {
                node.local_allocations.fetch_add(1, Ordering::Relaxed);
                return Some(ptr);
            }
        }

        let ptr = self
            .nodes
            .iter()
            .filter(|node| node.id != preferred)
            .find_map(|node| {
                let ptr = node.heap.allocate(size, align)?;
                node.remote_allocations.fetch_add(1, Ordering::Relaxed);
                Some(ptr)
            })?;
        self.cross_node_fallbacks.fetch_add(1, Ordering::Relaxed);
        Some(ptr)
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let address = ptr.as_ptr() as Address;
        match self.nodes.iter().find(|node| node.heap.owns(address)) {
            Some(node) => node.heap.deallocate(ptr),
            None => Err(MemoryError::ForeignPointer {
                address,
                owner: "NUMA allocator",
            }),
        }
    }

    pub fn owns(&self, address: Address) -> bool {
        self.nodes.iter().any(|node| node.heap.owns(address))
    }

    /// Node whose heap holds `address`
    pub fn node_of(&self, address: Address) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|node| node.heap.owns(address))
            .map(|node| node.id)
    }

    pub fn node_usage(&self) -> Vec<NodeUsage> {
        self.nodes
            .iter()
            .map(|node| {
                let usage = BlockAllocator::usage(&node.heap);
                NodeUsage {
                    node: node.id,
                    capacity: usage.capacity,
                    used: usage.used,
                    utilization: usage.utilization(),
                    local_allocations: node.local_allocations.load(Ordering::Relaxed),
                    remote_allocations: node.remote_allocations.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    pub fn cross_node_fallbacks(&self) -> u64 {
        self.cross_node_fallbacks.load(Ordering::Relaxed)
    }

    pub fn coalesce(&self) -> usize {
        self.nodes.iter().map(|node| node.heap.coalesce()).sum()
    }

    pub fn topology(&self) -> &Arc<NumaTopology> {
        &self.topology
    }
}

impl BlockAllocator for NumaAllocator {
    fn allocate(&self, size: Size, align: usize) -> Option<NonNull<u8>> {
        NumaAllocator::allocate(self, size, align)
    }

    fn deallocate(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        NumaAllocator::deallocate(self, ptr)
    }

    fn owns(&self, address: Address) -> bool {
        NumaAllocator::owns(self, address)
    }

    fn usage(&self) -> AllocatorUsage {
        self.nodes
            .iter()
            .fold(AllocatorUsage::default(), |mut total, node| {
                let usage = BlockAllocator::usage(&node.heap);
                total.capacity += usage.capacity;
                total.used += usage.used;
                total.live_blocks += usage.live_blocks;
                total
            })
    }
}
