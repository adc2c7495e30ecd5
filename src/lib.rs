/*!
 * shmheap
 * Shared-memory heap allocator for an injected diagnostic library
 */

pub mod core;
pub mod memory;

// Re-exports
pub use memory::{
    AllocFlags, Allocator, BlockRecord, BlockState, MemoryError, MemoryInspect, MemoryManager,
    MemoryResult, MemoryStats, ObjectRecord, Protection,
};
