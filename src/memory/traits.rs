/*!
 * Memory Traits
 * Seams between the allocator and its consumers
 */

use super::types::*;
use crate::core::types::Size;
use std::ptr::NonNull;

/// Allocation interface consumed by the interception layer that redirects
/// the injected library's own heap calls.
pub trait Allocator: Send + Sync {
    /// Allocate `bytes` usable bytes aligned to `align` (0 for default).
    fn allocate(&self, bytes: Size, flags: AllocFlags, align: Size) -> MemoryResult<NonNull<u8>>;

    /// Resize a live allocation, preserving content up to min(old, new).
    fn reallocate(
        &self,
        address: NonNull<u8>,
        bytes: Size,
        flags: AllocFlags,
    ) -> MemoryResult<NonNull<u8>>;

    /// Free a live allocation.
    fn deallocate(&self, address: NonNull<u8>) -> MemoryResult<()>;

    /// Usable bytes of a live allocation.
    fn size_of_allocation(&self, address: NonNull<u8>) -> MemoryResult<Size>;
}

/// Read-only introspection consumed by operator tooling and the snapshot
/// subsystem.
pub trait MemoryInspect: Send + Sync {
    /// Heap-wide counters.
    fn stats(&self) -> MemoryStats;

    /// Every object with its blocks, in address order.
    fn allocation_table(&self) -> Vec<ObjectRecord>;

    /// Human-readable listing of the allocation table.
    fn dump_allocation_table(&self) -> String;

    /// Verify structural invariants; panics on violation.
    fn check_allocation_table(&self);
}
