/*!
 * Memory Management
 *
 * Best-fit heap allocator over named shared-memory mappings.
 *
 * ## Why shared memory
 *
 * Every allocation lives inside an OS-backed shared-memory object, so an
 * external controller process can map the same regions and read or write
 * this heap directly: live inspection and cheap snapshot/restore of the
 * whole allocator state.
 *
 * ## Why best fit
 *
 * New objects can only be mapped in large granularity-sized steps (64 KiB
 * by default), far coarser than a page. Small requests must therefore pack
 * into existing objects: the allocator scans every free block across every
 * object and picks the smallest one that fits, ties broken toward low
 * addresses to keep them dense and coalescing effective.
 *
 * ## Features
 *
 * - **Block splitting**: oversized free blocks are split; remainders too
 *   small to host a header stay inside the block as slack
 * - **Coalescing**: freed blocks merge with address-adjacent free
 *   neighbors, at most one merge in each direction
 * - **Object reclaim**: an object whose whole range becomes free is
 *   unmapped and its backing-file range returned to the OS
 * - **In-place realloc**: shrink without moving; grow by absorbing a free
 *   following neighbor; relocation only as a last resort
 * - **Diagnostics**: a dump of the full allocation table and an invariant
 *   checker that panics on corrupted metadata
 */

mod allocator;
mod diagnostics;

use crate::core::sync::SpinLock;
use crate::core::types::Size;
use crate::memory::block::BlockDescription;
use crate::memory::list::{Arena, Handle};
use crate::memory::object::ObjectDescription;
use crate::memory::shm::ShmFile;
use crate::memory::traits::{Allocator, MemoryInspect};
use crate::memory::types::{
    AllocFlags, MemoryError, MemoryResult, MemoryStats, ObjectRecord,
    DEFAULT_ALIGNMENT, DEFAULT_ALLOCATION_GRANULARITY,
};
use log::{info, warn};
use std::os::fd::RawFd;
use std::ptr::NonNull;

/// Process-wide allocator over named shared-memory mappings.
///
/// Construct one instance explicitly, call [`init`](Self::init) once (it is
/// idempotent), then hand the manager to whatever boundary needs
/// allocation services. Every entry point serializes through one busy-wait
/// spin flag; see [`SpinLock`] for the reentrancy caveat.
pub struct MemoryManager {
    state: SpinLock<ManagerState>,
}

pub(super) struct ManagerState {
    pub(super) shm: Option<ShmFile>,
    pub(super) objects_arena: Arena<ObjectDescription>,
    pub(super) blocks_arena: Arena<BlockDescription>,
    /// Head of the offset-ordered list of live objects.
    pub(super) objects: Option<Handle>,
    pub(super) allocation_granularity: Size,
    pub(super) global_align: Size,
    pub(super) name: String,
    pub(super) initialized: bool,
}

// SAFETY: the mapping base pointers inside the descriptors refer to
// process-wide shared mappings, not to anything thread-local; the spin lock
// serializes all access.
unsafe impl Send for ManagerState {}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            state: SpinLock::new(ManagerState {
                shm: None,
                objects_arena: Arena::new(),
                blocks_arena: Arena::new(),
                objects: None,
                allocation_granularity: DEFAULT_ALLOCATION_GRANULARITY,
                global_align: DEFAULT_ALIGNMENT,
                name: "shmheap".to_string(),
                initialized: false,
            }),
        }
    }

    /// Name for the backing shared-memory file. Takes effect at `init`.
    pub fn with_name(self, name: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.name = name.to_string();
        }
        self
    }

    /// Override the allocation granularity (useful for testing). Rounded
    /// up to a page multiple at `init`.
    pub fn with_granularity(self, granularity: Size) -> Self {
        {
            let mut state = self.state.lock();
            state.allocation_granularity = granularity;
        }
        self
    }

    /// One-time setup: create the backing file and fix the granularity and
    /// alignment policy. Idempotent; must run before any allocation entry
    /// point (they fail with [`MemoryError::NotInitialized`] otherwise).
    pub fn init(&self) -> MemoryResult<()> {
        let mut state = self.state.lock();
        if state.initialized {
            return Ok(());
        }

        let shm = ShmFile::create(&state.name)?;
        let page = shm.page_size();
        state.allocation_granularity = state
            .allocation_granularity
            .max(page)
            .next_multiple_of(page);

        info!(
            "Memory manager initialized: backing fd {}, allocation granularity {} bytes, global alignment {}",
            shm.raw_fd(),
            state.allocation_granularity,
            state.global_align
        );

        state.shm = Some(shm);
        state.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Descriptor of the backing file. Stays valid for the manager's
    /// lifetime; an external controller reopens it (for example through
    /// `/proc/<pid>/fd/<fd>`) and maps the `(offset, bytes)` ranges from
    /// [`allocation_table`](Self::allocation_table).
    pub fn backing_fd(&self) -> MemoryResult<RawFd> {
        let state = self.state.lock();
        state
            .shm
            .as_ref()
            .map(ShmFile::raw_fd)
            .ok_or(MemoryError::NotInitialized)
    }

    /// Current logical size of the backing file.
    pub fn backing_size(&self) -> MemoryResult<Size> {
        let state = self.state.lock();
        state
            .shm
            .as_ref()
            .map(ShmFile::len)
            .ok_or(MemoryError::NotInitialized)
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerState {
    pub(super) fn shm(&self) -> &ShmFile {
        self.shm.as_ref().expect("allocator initialized")
    }

    pub(super) fn shm_mut(&mut self) -> &mut ShmFile {
        self.shm.as_mut().expect("allocator initialized")
    }

    pub(super) fn page_size(&self) -> Size {
        self.shm().page_size()
    }
}

impl Drop for ManagerState {
    fn drop(&mut self) {
        let Some(shm) = self.shm.as_ref() else { return };
        let mut cursor = self.objects;
        while let Some(handle) = cursor {
            let object = &self.objects_arena[handle];
            if let Err(e) = shm.unmap(object.base, object.link.bytes) {
                warn!(
                    "Failed to unmap object at 0x{:x} on teardown: {}",
                    object.link.address, e
                );
            }
            cursor = object.link.next;
        }
    }
}

// Trait interfaces
impl Allocator for MemoryManager {
    fn allocate(&self, bytes: Size, flags: AllocFlags, align: Size) -> MemoryResult<NonNull<u8>> {
        MemoryManager::allocate(self, bytes, flags, align)
    }

    fn reallocate(
        &self,
        address: NonNull<u8>,
        bytes: Size,
        flags: AllocFlags,
    ) -> MemoryResult<NonNull<u8>> {
        MemoryManager::reallocate(self, address, bytes, flags)
    }

    fn deallocate(&self, address: NonNull<u8>) -> MemoryResult<()> {
        MemoryManager::deallocate(self, address)
    }

    fn size_of_allocation(&self, address: NonNull<u8>) -> MemoryResult<Size> {
        MemoryManager::size_of_allocation(self, address)
    }
}

impl MemoryInspect for MemoryManager {
    fn stats(&self) -> MemoryStats {
        MemoryManager::stats(self)
    }

    fn allocation_table(&self) -> Vec<ObjectRecord> {
        MemoryManager::allocation_table(self)
    }

    fn dump_allocation_table(&self) -> String {
        MemoryManager::dump_allocation_table(self)
    }

    fn check_allocation_table(&self) {
        MemoryManager::check_allocation_table(self)
    }
}
