/*!
 * Allocator Strategies
 * Independent allocators, each owning its backing storage
 */

mod free_list;
mod linear;
mod lockfree;
mod object_pool;
mod region;
mod segregated;
mod system;
mod thread_local;

pub use free_list::FreeListAllocator;
pub use linear::{LinearAllocator, MAX_LINEAR_CAPACITY};
pub use lockfree::LockFreeAllocator;
pub use object_pool::{ObjectPool, SlabPool};
pub use region::Region;
pub use segregated::{size_class_index, DynamicPool, SegregatedPools};
pub use system::SystemAllocator;
pub use thread_local::ThreadLocalAllocator;
