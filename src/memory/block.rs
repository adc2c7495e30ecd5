/*!
 * Block Descriptor
 * One allocation unit (used or free) inside a mapped object
 */

use crate::core::types::{Address, Size};
use crate::memory::list::{Handle, Linked, ListNode};
use crate::memory::types::{BlockState, Protection};
use std::ptr;

/// Magic stamped into the header of every used block.
pub(crate) const BLOCK_MAGIC: u64 = u64::from_le_bytes(*b"SHMBLOCK");

/// One allocation unit carved out of an object's mapped range.
///
/// `header_size` counts the bookkeeping and alignment padding that precede
/// the address handed to the caller; it is part of the block's `bytes`.
/// `owner` ties the block back to its object so the full chain can be
/// walked from either side.
#[derive(Debug)]
pub(crate) struct BlockDescription {
    pub link: ListNode,
    pub state: BlockState,
    pub header_size: Size,
    pub prot: Protection,
    pub owner: Handle,
}

impl BlockDescription {
    /// A free block covering `[address, address + bytes)`.
    pub fn free(address: Address, bytes: Size, owner: Handle) -> Self {
        Self {
            link: ListNode::new(address, bytes),
            state: BlockState::Free,
            header_size: 0,
            prot: Protection::READ_WRITE,
            owner,
        }
    }

    pub fn is_free(&self) -> bool {
        self.state == BlockState::Free
    }

    /// Offset of the first byte handed to the caller.
    pub fn usable_address(&self) -> Address {
        self.link.address + self.header_size
    }

    /// Bytes available to the caller: block size minus bookkeeping.
    pub fn usable_bytes(&self) -> Size {
        self.link.bytes - self.header_size
    }
}

impl Linked for BlockDescription {
    fn node(&self) -> &ListNode {
        &self.link
    }

    fn node_mut(&mut self) -> &mut ListNode {
        &mut self.link
    }
}

/// On-heap header written into the first bytes of every used block, sized
/// to [`BLOCK_HEADER_SIZE`](crate::memory::types::BLOCK_HEADER_SIZE).
/// Diagnostics cross-check it against the descriptor arena; a mismatch
/// means the table and the heap disagree.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockStamp {
    pub magic: u64,
    pub usable: u64,
}

impl BlockStamp {
    /// Write a stamp at `header`, the first byte of the block header.
    ///
    /// # Safety
    /// `header` must point at least 16 writable bytes inside a live
    /// mapping, 8-byte aligned.
    pub unsafe fn write(header: *mut u8, usable: Size) {
        let stamp = BlockStamp {
            magic: BLOCK_MAGIC,
            usable: usable as u64,
        };
        ptr::write(header as *mut BlockStamp, stamp);
    }

    /// Read the stamp at `header`.
    ///
    /// # Safety
    /// `header` must point at least 16 readable bytes inside a live
    /// mapping, 8-byte aligned.
    pub unsafe fn read(header: *const u8) -> BlockStamp {
        ptr::read(header as *const BlockStamp)
    }

    pub fn matches(&self, usable: Size) -> bool {
        self.magic == BLOCK_MAGIC && self.usable == usable as u64
    }
}
