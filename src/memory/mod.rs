/*!
 * Shared-Memory Heap
 *
 * Heap allocator whose every allocation lives inside a named shared-memory
 * mapping, so an external controller process can map the same regions and
 * inspect or rewrite this heap while the host runs.
 *
 * Module layout, leaf first:
 * - [`list`]: arena-backed, address-ordered list substrate shared by every
 *   descriptor
 * - [`block`] / [`object`]: the two descriptor kinds, allocation units and
 *   mapped regions
 * - [`shm`]: the OS boundary (backing file, mappings, page protection)
 * - [`manager`]: best-fit orchestration, growth, coalescing, diagnostics
 */

mod block;
mod list;
mod object;
mod shm;

pub mod manager;
pub mod traits;
pub mod types;

pub use manager::MemoryManager;
pub use traits::{Allocator, MemoryInspect};
pub use types::{
    AllocFlags, BlockRecord, BlockState, MemoryError, MemoryResult, MemoryStats, ObjectRecord,
    Protection, BLOCK_HEADER_SIZE, DEFAULT_ALIGNMENT, DEFAULT_ALLOCATION_GRANULARITY,
    MIN_FRAGMENT_BYTES, OBJECT_HEADER_SIZE,
};
