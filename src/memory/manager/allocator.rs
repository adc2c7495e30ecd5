/*!
 * Allocation Paths
 * Best-fit search, carving, growth, coalescing, reallocation
 */

use super::{ManagerState, MemoryManager};
use crate::core::types::Size;
use crate::memory::block::{BlockDescription, BlockStamp};
use crate::memory::list::{delta_align, insert_sorted, unlink, Handle};
use crate::memory::object::{ObjectDescription, ObjectStamp};
use crate::memory::types::{
    AllocFlags, BlockState, MemoryError, MemoryResult, Protection, BLOCK_HEADER_SIZE,
    MIN_FRAGMENT_BYTES, OBJECT_HEADER_SIZE,
};
use log::{debug, info, warn};
use std::ptr::{self, NonNull};

/// Header plus alignment padding a block starting at `address` needs
/// before its usable range can begin on an `align` boundary.
fn block_overhead(address: usize, align: Size) -> Size {
    BLOCK_HEADER_SIZE + delta_align(address + BLOCK_HEADER_SIZE, align)
}

impl MemoryManager {
    /// Allocate `bytes` usable bytes aligned to `align` (0 means the
    /// default alignment). Returns the address past the block header.
    pub fn allocate(&self, bytes: Size, flags: AllocFlags, align: Size) -> MemoryResult<NonNull<u8>> {
        flags.validate()?;
        if bytes == 0 {
            return Err(MemoryError::InvalidSize(0));
        }
        if align != 0 && !align.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment(align));
        }

        let mut state = self.state.lock();
        if !state.initialized {
            return Err(MemoryError::NotInitialized);
        }
        if align > state.page_size() {
            // Mapping bases are only page-aligned, so nothing beyond the
            // page size can be honored in every address space.
            return Err(MemoryError::InvalidAlignment(align));
        }

        let block = state.allocate_unlocked(bytes, flags, align)?;
        Ok(state.usable_ptr(block))
    }

    /// Resize a live allocation, preserving content up to the smaller of
    /// the old and new sizes. Fails without touching the block when
    /// `no_move` is set and the block cannot be resized in place.
    pub fn reallocate(
        &self,
        address: NonNull<u8>,
        bytes: Size,
        flags: AllocFlags,
    ) -> MemoryResult<NonNull<u8>> {
        flags.validate()?;
        if bytes == 0 {
            return Err(MemoryError::InvalidSize(0));
        }

        let mut state = self.state.lock();
        if !state.initialized {
            return Err(MemoryError::NotInitialized);
        }

        let block = state
            .find_block(address)
            .ok_or(MemoryError::InvalidAddress(address.as_ptr() as usize))?;
        let block = state.reallocate_unlocked(block, bytes, flags)?;
        Ok(state.usable_ptr(block))
    }

    /// Free a live allocation, coalescing with free neighbors and
    /// releasing the owning object once it is entirely free.
    pub fn deallocate(&self, address: NonNull<u8>) -> MemoryResult<()> {
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(MemoryError::NotInitialized);
        }

        match state.find_block(address) {
            Some(block) => {
                state.deallocate_unlocked(block);
                Ok(())
            }
            None => {
                warn!(
                    "Attempted to deallocate invalid or already freed address 0x{:x}",
                    address.as_ptr() as usize
                );
                Err(MemoryError::InvalidAddress(address.as_ptr() as usize))
            }
        }
    }

    /// Usable bytes of a live allocation: block size minus its header.
    pub fn size_of_allocation(&self, address: NonNull<u8>) -> MemoryResult<Size> {
        let state = self.state.lock();
        if !state.initialized {
            return Err(MemoryError::NotInitialized);
        }
        state
            .find_block(address)
            .map(|block| state.blocks_arena[block].usable_bytes())
            .ok_or(MemoryError::InvalidAddress(address.as_ptr() as usize))
    }
}

impl ManagerState {
    fn effective_align(&self, align: Size) -> Size {
        align.max(self.global_align)
    }

    /// Process-local pointer to a block's usable range.
    pub(super) fn usable_ptr(&self, block: Handle) -> NonNull<u8> {
        let b = &self.blocks_arena[block];
        self.objects_arena[b.owner].ptr_at(b.usable_address())
    }

    fn block_ptr(&self, block: Handle) -> NonNull<u8> {
        let b = &self.blocks_arena[block];
        self.objects_arena[b.owner].ptr_at(b.link.address)
    }

    pub(super) fn allocate_unlocked(
        &mut self,
        bytes: Size,
        flags: AllocFlags,
        align: Size,
    ) -> MemoryResult<Handle> {
        let align = self.effective_align(align);
        let candidate = match self.find_best_fit(bytes, align) {
            Some(handle) => handle,
            None => self.grow(bytes, align)?,
        };
        let block = self.carve(candidate, bytes, align);
        self.stamp_block(block);

        if flags.zero_init {
            let usable = self.blocks_arena[block].usable_bytes();
            let ptr = self.usable_ptr(block);
            // SAFETY: the usable range lies inside the owning mapping and
            // its pages are still read/write at this point.
            unsafe { ptr::write_bytes(ptr.as_ptr(), 0, usable) };
        }

        let prot = Protection::from_flags(flags);
        if !prot.is_default() {
            if let Err(e) = self.apply_protection(block, prot) {
                self.deallocate_unlocked(block);
                return Err(e);
            }
        }

        let b = &self.blocks_arena[block];
        debug!(
            "Allocated {} usable bytes at offset 0x{:x} ({} byte block, align {})",
            b.usable_bytes(),
            b.usable_address(),
            b.link.bytes,
            align
        );
        Ok(block)
    }

    /// Scan every free block of every object for the smallest one that can
    /// host `bytes` after header and alignment padding. Ties go to the
    /// lowest address because the scan runs in ascending address order and
    /// only a strictly smaller candidate replaces the current best.
    fn find_best_fit(&self, bytes: Size, align: Size) -> Option<Handle> {
        let mut best: Option<(Handle, Size)> = None;
        let mut object = self.objects;
        while let Some(oh) = object {
            let o = &self.objects_arena[oh];
            let mut cursor = o.blocks;
            while let Some(bh) = cursor {
                let b = &self.blocks_arena[bh];
                if b.is_free() {
                    let fits = block_overhead(b.link.address, align)
                        .checked_add(bytes)
                        .map_or(false, |needed| b.link.bytes >= needed);
                    if fits && best.map_or(true, |(_, size)| b.link.bytes < size) {
                        best = Some((bh, b.link.bytes));
                    }
                }
                cursor = b.link.next;
            }
            object = o.link.next;
        }
        best.map(|(handle, _)| handle)
    }

    /// Growth path: extend the backing file by a granularity multiple, map
    /// a fresh object and seed it with one free block covering its usable
    /// range.
    fn grow(&mut self, bytes: Size, align: Size) -> MemoryResult<Handle> {
        let worst = OBJECT_HEADER_SIZE
            .checked_add(BLOCK_HEADER_SIZE)
            .and_then(|v| v.checked_add(align - 1))
            .and_then(|v| v.checked_add(bytes))
            .ok_or(MemoryError::InvalidSize(bytes))?;
        let granularity = self.allocation_granularity;
        let size = worst
            .max(granularity)
            .checked_next_multiple_of(granularity)
            .ok_or(MemoryError::InvalidSize(bytes))?;

        let shm = self.shm_mut();
        let offset = shm.extend(size)?;
        let base = match shm.map(offset, size) {
            Ok(base) => base,
            Err(e) => {
                // roll the extension back so objects keep covering the file
                let _ = shm.truncate(offset);
                return Err(e);
            }
        };
        // SAFETY: base points at a fresh read/write mapping of `size` >=
        // OBJECT_HEADER_SIZE bytes, page-aligned.
        unsafe { ObjectStamp::write(base.as_ptr(), size) };

        let object = self
            .objects_arena
            .insert(ObjectDescription::new(offset, size, base));
        insert_sorted(&mut self.objects_arena, &mut self.objects, object);

        let block = self.blocks_arena.insert(BlockDescription::free(
            offset + OBJECT_HEADER_SIZE,
            size - OBJECT_HEADER_SIZE,
            object,
        ));
        insert_sorted(
            &mut self.blocks_arena,
            &mut self.objects_arena[object].blocks,
            block,
        );

        info!(
            "Mapped new shared object at offset 0x{:x} ({} bytes)",
            offset, size
        );
        Ok(block)
    }

    /// Turn a free block into a used one sized for the request. The
    /// remainder becomes a new free block when it could still host a
    /// header; otherwise the whole candidate is consumed.
    fn carve(&mut self, block: Handle, bytes: Size, align: Size) -> Handle {
        let (address, total, owner) = {
            let b = &self.blocks_arena[block];
            (b.link.address, b.link.bytes, b.owner)
        };
        let header = block_overhead(address, align);
        let needed = header + bytes;

        if total - needed >= MIN_FRAGMENT_BYTES {
            let free = self.blocks_arena.insert(BlockDescription::free(
                address + needed,
                total - needed,
                owner,
            ));
            insert_sorted(
                &mut self.blocks_arena,
                &mut self.objects_arena[owner].blocks,
                free,
            );
            self.blocks_arena[block].link.bytes = needed;
        }

        let b = &mut self.blocks_arena[block];
        b.state = BlockState::Used;
        b.header_size = header;
        block
    }

    fn stamp_block(&self, block: Handle) {
        let b = &self.blocks_arena[block];
        let header = self.objects_arena[b.owner].ptr_at(b.usable_address() - BLOCK_HEADER_SIZE);
        // SAFETY: the header slot precedes the usable range inside the
        // owning mapping, is 16-aligned and writable at stamp time.
        unsafe { BlockStamp::write(header.as_ptr(), b.usable_bytes()) };
    }

    /// Find the used block whose usable range starts at `address`.
    pub(super) fn find_block(&self, address: NonNull<u8>) -> Option<Handle> {
        let mut object = self.objects;
        while let Some(oh) = object {
            let o = &self.objects_arena[oh];
            if let Some(offset) = o.offset_of(address) {
                let mut cursor = o.blocks;
                while let Some(bh) = cursor {
                    let b = &self.blocks_arena[bh];
                    if b.state == BlockState::Used && b.usable_address() == offset {
                        self.verify_stamp(bh, address);
                        return Some(bh);
                    }
                    cursor = b.link.next;
                }
                return None;
            }
            object = o.link.next;
        }
        None
    }

    /// Cross-check a found block's on-heap header against its descriptor.
    /// Disagreement means the table no longer describes the heap, and
    /// continuing would write through stale metadata.
    fn verify_stamp(&self, block: Handle, usable: NonNull<u8>) {
        let b = &self.blocks_arena[block];
        // SAFETY: the header precedes the usable range inside the mapping
        // and every protection we grant keeps it readable.
        let stamp = unsafe { BlockStamp::read(usable.as_ptr().sub(BLOCK_HEADER_SIZE)) };
        if !stamp.matches(b.usable_bytes()) {
            panic!(
                "allocation table corrupted: block at 0x{:x} carries header magic 0x{:x} / usable {} but its descriptor says usable {}",
                b.usable_address(),
                stamp.magic,
                stamp.usable,
                b.usable_bytes()
            );
        }
    }

    fn apply_protection(&mut self, block: Handle, prot: Protection) -> MemoryResult<()> {
        if self.blocks_arena[block].prot == prot {
            return Ok(());
        }
        let ptr = self.block_ptr(block);
        let bytes = self.blocks_arena[block].link.bytes;
        self.shm().protect(ptr, bytes, prot)?;
        self.blocks_arena[block].prot = prot;
        Ok(())
    }

    pub(super) fn deallocate_unlocked(&mut self, block: Handle) {
        let owner = self.blocks_arena[block].owner;

        // make the pages reusable before the descriptor forgets they were
        // ever protected differently
        if !self.blocks_arena[block].prot.is_default() {
            if let Err(e) = self.apply_protection(block, Protection::READ_WRITE) {
                warn!("Failed to restore protection on freed block: {}", e);
            }
        }

        {
            let b = &mut self.blocks_arena[block];
            debug!(
                "Deallocated block at offset 0x{:x} ({} bytes)",
                b.link.address, b.link.bytes
            );
            b.state = BlockState::Free;
            b.header_size = 0;
        }

        let mut block = block;
        if let Some(prev) = self.blocks_arena[block].link.prev {
            if self.blocks_arena[prev].is_free() {
                let bytes = self.blocks_arena[block].link.bytes;
                self.blocks_arena[prev].link.bytes += bytes;
                unlink(
                    &mut self.blocks_arena,
                    &mut self.objects_arena[owner].blocks,
                    block,
                );
                self.blocks_arena.remove(block);
                block = prev;
            }
        }
        if let Some(next) = self.blocks_arena[block].link.next {
            if self.blocks_arena[next].is_free() {
                let bytes = self.blocks_arena[next].link.bytes;
                self.blocks_arena[block].link.bytes += bytes;
                unlink(
                    &mut self.blocks_arena,
                    &mut self.objects_arena[owner].blocks,
                    next,
                );
                self.blocks_arena.remove(next);
            }
        }

        self.release_object_if_empty(owner);
    }

    /// Unmap an object once a single free block spans its whole usable
    /// range, and return its file region to the OS.
    fn release_object_if_empty(&mut self, object: Handle) {
        let sole = {
            let o = &self.objects_arena[object];
            let Some(first) = o.blocks else { return };
            let b = &self.blocks_arena[first];
            let spans_object = b.is_free()
                && b.link.next.is_none()
                && b.link.address == o.link.address + OBJECT_HEADER_SIZE
                && b.link.end() == o.link.end();
            if !spans_object {
                return;
            }
            first
        };

        unlink(
            &mut self.blocks_arena,
            &mut self.objects_arena[object].blocks,
            sole,
        );
        self.blocks_arena.remove(sole);
        unlink(&mut self.objects_arena, &mut self.objects, object);
        let o = self.objects_arena.remove(object);

        let shm = self.shm_mut();
        if let Err(e) = shm.unmap(o.base, o.link.bytes) {
            warn!("Failed to unmap object at 0x{:x}: {}", o.link.address, e);
        }
        shm.punch(o.link.address, o.link.bytes);

        info!(
            "Released shared object at offset 0x{:x} ({} bytes)",
            o.link.address, o.link.bytes
        );
    }

    pub(super) fn reallocate_unlocked(
        &mut self,
        block: Handle,
        bytes: Size,
        flags: AllocFlags,
    ) -> MemoryResult<Handle> {
        let capacity = self.blocks_arena[block].usable_bytes();
        let old_prot = self.blocks_arena[block].prot;
        let new_prot = Protection::from_flags(flags);

        if bytes <= capacity || self.can_absorb_next(block, bytes) {
            // in-place paths rewrite the header, so lift any stricter
            // protection first
            if !old_prot.is_default() {
                self.apply_protection(block, Protection::READ_WRITE)?;
            }
            if bytes <= capacity {
                self.shrink_in_place(block, bytes);
            } else {
                self.absorb_next(block, bytes, flags.zero_init);
            }
            self.stamp_block(block);
            if !new_prot.is_default() {
                self.apply_protection(block, new_prot)?;
            }
            debug!(
                "Resized block in place to {} usable bytes at offset 0x{:x}",
                self.blocks_arena[block].usable_bytes(),
                self.blocks_arena[block].usable_address()
            );
            return Ok(block);
        }

        if flags.no_move {
            return Err(MemoryError::CannotResizeInPlace(
                self.usable_ptr(block).as_ptr() as usize,
            ));
        }

        // relocate: carve the new block with protection deferred so the
        // copy can land, then protect, then free the old block
        let unprotected = AllocFlags {
            readonly: false,
            execute: false,
            ..flags
        };
        let new_block = self.allocate_unlocked(bytes, unprotected, 0)?;
        let src = self.usable_ptr(block);
        let dst = self.usable_ptr(new_block);
        // SAFETY: two distinct live blocks never overlap; `capacity` bytes
        // are in-bounds on both sides and the source stays readable under
        // every protection we grant.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), capacity.min(bytes)) };
        self.deallocate_unlocked(block);
        if !new_prot.is_default() {
            self.apply_protection(new_block, new_prot)?;
        }

        let b = &self.blocks_arena[new_block];
        debug!(
            "Relocated block to offset 0x{:x} ({} usable bytes)",
            b.usable_address(),
            b.usable_bytes()
        );
        Ok(new_block)
    }

    fn can_absorb_next(&self, block: Handle, bytes: Size) -> bool {
        let b = &self.blocks_arena[block];
        let Some(next) = b.link.next else {
            return false;
        };
        let n = &self.blocks_arena[next];
        n.is_free() && b.usable_bytes() + n.link.bytes >= bytes
    }

    /// Merge the following free block in, then give back whatever exceeds
    /// the request.
    fn absorb_next(&mut self, block: Handle, bytes: Size, zero_init: bool) {
        let owner = self.blocks_arena[block].owner;
        let old_usable = self.blocks_arena[block].usable_bytes();
        let next = self.blocks_arena[block]
            .link
            .next
            .expect("absorbable neighbor");
        let next_bytes = self.blocks_arena[next].link.bytes;
        self.blocks_arena[block].link.bytes += next_bytes;
        unlink(
            &mut self.blocks_arena,
            &mut self.objects_arena[owner].blocks,
            next,
        );
        self.blocks_arena.remove(next);

        self.shrink_in_place(block, bytes);

        if zero_init {
            let usable = self.blocks_arena[block].usable_bytes();
            let ptr = self.usable_ptr(block);
            // SAFETY: the grown tail lies inside the owning mapping and is
            // writable here; `old_usable <= usable`.
            unsafe { ptr::write_bytes(ptr.as_ptr().add(old_usable), 0, usable - old_usable) };
        }
    }

    /// Shrink a used block to `bytes` usable bytes. The excess either
    /// extends a following free block, becomes a new free block, or stays
    /// inside as slack when it is too small to host a header.
    fn shrink_in_place(&mut self, block: Handle, bytes: Size) {
        let owner = self.blocks_arena[block].owner;
        let (address, header, total, next) = {
            let b = &self.blocks_arena[block];
            (b.link.address, b.header_size, b.link.bytes, b.link.next)
        };
        let needed = header + bytes;
        let excess = total - needed;
        if excess == 0 {
            return;
        }

        match next {
            Some(next) if self.blocks_arena[next].is_free() => {
                self.blocks_arena[block].link.bytes = needed;
                let n = &mut self.blocks_arena[next];
                n.link.address -= excess;
                n.link.bytes += excess;
            }
            _ if excess >= MIN_FRAGMENT_BYTES => {
                self.blocks_arena[block].link.bytes = needed;
                let free = self
                    .blocks_arena
                    .insert(BlockDescription::free(address + needed, excess, owner));
                insert_sorted(
                    &mut self.blocks_arena,
                    &mut self.objects_arena[owner].blocks,
                    free,
                );
            }
            _ => {} // slack stays inside the block
        }
    }
}
