/*!
 * Allocation Table Diagnostics
 * Read-only dumps, statistics and the structural invariant checker
 */

use super::{ManagerState, MemoryManager};
use crate::memory::block::BlockStamp;
use crate::memory::list::Handle;
use crate::memory::object::ObjectStamp;
use crate::memory::types::{
    BlockRecord, BlockState, MemoryStats, ObjectRecord, BLOCK_HEADER_SIZE, OBJECT_HEADER_SIZE,
};
use log::debug;
use std::fmt::Write;

/// Structural corruption is never recoverable: stale or overlapping block
/// headers would let later writes land on live data.
macro_rules! corrupt {
    ($($arg:tt)*) => {
        panic!("allocation table corrupted: {}", format_args!($($arg)*))
    };
}

impl MemoryManager {
    /// Heap-wide counters; zeroed before `init`.
    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats_unlocked()
    }

    /// Machine-readable allocation table: every object with its blocks.
    /// The `(offset, bytes)` of each object against [`backing_fd`] is what
    /// an external controller maps to inspect this heap.
    ///
    /// [`backing_fd`]: MemoryManager::backing_fd
    pub fn allocation_table(&self) -> Vec<ObjectRecord> {
        self.state.lock().table_unlocked()
    }

    /// Human-readable listing of every object and block.
    pub fn dump_allocation_table(&self) -> String {
        let listing = self.state.lock().dump_unlocked();
        debug!("{}", listing);
        listing
    }

    /// Verify every structural invariant of the allocation table: address
    /// ordering, exact coverage with no gaps or overlaps, no two adjacent
    /// free blocks, totals matching object sizes, header stamps agreeing
    /// with descriptors. Panics with diagnostic context on violation.
    pub fn check_allocation_table(&self) {
        self.state.lock().check_unlocked()
    }
}

impl ManagerState {
    pub(super) fn stats_unlocked(&self) -> MemoryStats {
        let mut stats = MemoryStats {
            backing_size: self.shm.as_ref().map_or(0, |shm| shm.len()),
            ..MemoryStats::default()
        };

        let mut object = self.objects;
        while let Some(oh) = object {
            let o = &self.objects_arena[oh];
            stats.mapped_objects += 1;
            let mut cursor = o.blocks;
            while let Some(bh) = cursor {
                let b = &self.blocks_arena[bh];
                match b.state {
                    BlockState::Used => {
                        stats.used_blocks += 1;
                        stats.used_bytes += b.link.bytes;
                    }
                    BlockState::Free => {
                        stats.free_blocks += 1;
                        stats.free_bytes += b.link.bytes;
                    }
                }
                cursor = b.link.next;
            }
            object = o.link.next;
        }
        stats
    }

    pub(super) fn table_unlocked(&self) -> Vec<ObjectRecord> {
        let mut table = Vec::new();
        let mut object = self.objects;
        while let Some(oh) = object {
            let o = &self.objects_arena[oh];
            let mut blocks = Vec::new();
            let mut cursor = o.blocks;
            while let Some(bh) = cursor {
                let b = &self.blocks_arena[bh];
                blocks.push(BlockRecord {
                    offset: b.link.address,
                    bytes: b.link.bytes,
                    state: b.state,
                    header_size: b.header_size,
                    protection: b.prot,
                });
                cursor = b.link.next;
            }
            table.push(ObjectRecord {
                offset: o.link.address,
                bytes: o.link.bytes,
                blocks,
            });
            object = o.link.next;
        }
        table
    }

    pub(super) fn dump_unlocked(&self) -> String {
        let mut out = String::new();
        match &self.shm {
            Some(shm) => {
                let _ = writeln!(
                    out,
                    "shared heap: fd {}, {} bytes backing, granularity {}",
                    shm.raw_fd(),
                    shm.len(),
                    self.allocation_granularity
                );
            }
            None => {
                let _ = writeln!(out, "shared heap: uninitialized");
                return out;
            }
        }

        let mut object = self.objects;
        while let Some(oh) = object {
            let o = &self.objects_arena[oh];
            let _ = writeln!(
                out,
                "object 0x{:08x} +{} bytes",
                o.link.address, o.link.bytes
            );
            let mut cursor = o.blocks;
            while let Some(bh) = cursor {
                let b = &self.blocks_arena[bh];
                let _ = writeln!(
                    out,
                    "  block 0x{:08x} {:>10} bytes {} header {:>3} {}",
                    b.link.address, b.link.bytes, b.state, b.header_size, b.prot
                );
                cursor = b.link.next;
            }
            object = o.link.next;
        }
        out
    }

    pub(super) fn check_unlocked(&self) {
        let mut object_count = 0usize;
        let mut block_count = 0usize;

        let mut prev_object_end = 0usize;
        let mut object = self.objects;
        while let Some(oh) = object {
            let Some(o) = self.objects_arena.get(oh) else {
                corrupt!("object list carries dangling handle {}", oh);
            };
            object_count += 1;

            if o.link.address < prev_object_end {
                corrupt!(
                    "object at 0x{:x} overlaps or disorders its predecessor ending at 0x{:x}",
                    o.link.address,
                    prev_object_end
                );
            }
            if o.link.bytes == 0 || o.link.bytes % self.allocation_granularity != 0 {
                corrupt!(
                    "object at 0x{:x} has size {} which is not a granularity multiple",
                    o.link.address,
                    o.link.bytes
                );
            }
            // SAFETY: the object header sits at the base of a live mapping
            // and stays readable.
            let stamp = unsafe { ObjectStamp::read(o.base.as_ptr()) };
            if !stamp.matches(o.link.bytes) {
                corrupt!(
                    "object at 0x{:x} carries header magic 0x{:x} / bytes {} but its descriptor says {}",
                    o.link.address,
                    stamp.magic,
                    stamp.bytes,
                    o.link.bytes
                );
            }

            self.check_object_blocks(oh, &mut block_count);

            prev_object_end = o.link.end();
            object = o.link.next;
        }

        if object_count != self.objects_arena.len() {
            corrupt!(
                "object list carries {} descriptors but the arena holds {}",
                object_count,
                self.objects_arena.len()
            );
        }
        if block_count != self.blocks_arena.len() {
            corrupt!(
                "block lists carry {} descriptors but the arena holds {}",
                block_count,
                self.blocks_arena.len()
            );
        }
    }

    fn check_object_blocks(&self, object: Handle, block_count: &mut usize) {
        let o = &self.objects_arena[object];
        let usable_start = o.link.address + OBJECT_HEADER_SIZE;

        let Some(first) = o.blocks else {
            corrupt!("object at 0x{:x} has no blocks", o.link.address);
        };
        if self.blocks_arena[first].link.address != usable_start {
            corrupt!(
                "object at 0x{:x}: first block starts at 0x{:x} instead of 0x{:x}",
                o.link.address,
                self.blocks_arena[first].link.address,
                usable_start
            );
        }

        let mut total = 0usize;
        let mut prev: Option<Handle> = None;
        let mut prev_free = false;
        let mut cursor = o.blocks;
        while let Some(bh) = cursor {
            let Some(b) = self.blocks_arena.get(bh) else {
                corrupt!(
                    "block list of object at 0x{:x} carries dangling handle {}",
                    o.link.address,
                    bh
                );
            };
            *block_count += 1;

            if b.owner != object {
                corrupt!(
                    "block at 0x{:x} back-references the wrong object",
                    b.link.address
                );
            }
            if b.link.prev != prev {
                corrupt!("block at 0x{:x} has a broken back link", b.link.address);
            }
            if let Some(prev) = prev {
                let expected = self.blocks_arena[prev].link.end();
                if b.link.address != expected {
                    corrupt!(
                        "block at 0x{:x} leaves a gap or overlap after 0x{:x}",
                        b.link.address,
                        expected
                    );
                }
            }

            match b.state {
                BlockState::Free => {
                    if prev_free {
                        corrupt!(
                            "adjacent free blocks left unmerged at 0x{:x}",
                            b.link.address
                        );
                    }
                    if b.header_size != 0 {
                        corrupt!(
                            "free block at 0x{:x} claims a {} byte header",
                            b.link.address,
                            b.header_size
                        );
                    }
                    prev_free = true;
                }
                BlockState::Used => {
                    if b.header_size < BLOCK_HEADER_SIZE || b.header_size >= b.link.bytes {
                        corrupt!(
                            "used block at 0x{:x} has inconsistent header size {}",
                            b.link.address,
                            b.header_size
                        );
                    }
                    let header = o.ptr_at(b.usable_address() - BLOCK_HEADER_SIZE);
                    // SAFETY: the header precedes the usable range inside
                    // the mapping and every protection we grant keeps it
                    // readable.
                    let stamp = unsafe { BlockStamp::read(header.as_ptr()) };
                    if !stamp.matches(b.usable_bytes()) {
                        corrupt!(
                            "used block at 0x{:x} carries header magic 0x{:x} / usable {} but its descriptor says {}",
                            b.link.address,
                            stamp.magic,
                            stamp.usable,
                            b.usable_bytes()
                        );
                    }
                    prev_free = false;
                }
            }

            total += b.link.bytes;
            prev = Some(bh);
            cursor = b.link.next;
        }

        let last = prev.expect("non-empty block list");
        if self.blocks_arena[last].link.end() != o.link.end() {
            corrupt!(
                "object at 0x{:x}: blocks end at 0x{:x} instead of 0x{:x}",
                o.link.address,
                self.blocks_arena[last].link.end(),
                o.link.end()
            );
        }
        if total + OBJECT_HEADER_SIZE != o.link.bytes {
            corrupt!(
                "object at 0x{:x}: block total {} plus header does not match object size {}",
                o.link.address,
                total,
                o.link.bytes
            );
        }
    }
}
