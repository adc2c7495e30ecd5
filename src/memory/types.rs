/*!
 * Memory Types
 * Common types for the shared-memory heap
 */

use crate::core::types::{Address, Size};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use thiserror::Error;

/// Memory operation result
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory errors
#[derive(Error, Debug, Clone)]
pub enum MemoryError {
    #[error("allocator not initialized")]
    NotInitialized,

    #[error("invalid allocation size: {0}")]
    InvalidSize(Size),

    #[error("invalid alignment: {0} (must be a power of two)")]
    InvalidAlignment(Size),

    #[error("conflicting allocation flags: {0}")]
    InvalidFlags(&'static str),

    #[error("address 0x{0:x} is not the start of a live allocation")]
    InvalidAddress(usize),

    #[error("block at 0x{0:x} cannot be resized in place")]
    CannotResizeInPlace(usize),

    #[error("shared memory {op} failed: {source}")]
    ShmFailure {
        op: &'static str,
        #[source]
        source: nix::Error,
    },
}

/// Default minimum size increment for a new shared object's mapping.
///
/// Chosen to be much larger than a page so that mapping overhead is
/// amortized over many small allocations, which is exactly why the
/// allocator packs multiple blocks per object.
pub const DEFAULT_ALLOCATION_GRANULARITY: Size = 64 * 1024;

/// Alignment guaranteed to every allocation regardless of what was asked.
pub const DEFAULT_ALIGNMENT: Size = 16;

/// Bytes of bookkeeping at the start of every mapped object.
pub const OBJECT_HEADER_SIZE: Size = 16;

/// Bytes of bookkeeping preceding the usable range of a used block.
pub const BLOCK_HEADER_SIZE: Size = 16;

/// Smallest leftover worth turning into a standalone free block.
/// Anything smaller stays inside the used block as slack.
pub const MIN_FRAGMENT_BYTES: Size = BLOCK_HEADER_SIZE + DEFAULT_ALIGNMENT;

/// Block state inside a mapped object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Used,
    Free,
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockState::Used => write!(f, "USED"),
            BlockState::Free => write!(f, "FREE"),
        }
    }
}

/// Allocation request flags.
///
/// `write`/`readonly`/`execute` select the page protection of the new
/// block, `zero_init` clears the usable range, `no_move` is honored by
/// `reallocate` only and makes it fail instead of relocating the block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocFlags {
    pub write: bool,
    pub readonly: bool,
    pub execute: bool,
    pub zero_init: bool,
    pub no_move: bool,
}

impl AllocFlags {
    pub const NONE: Self = Self {
        write: false,
        readonly: false,
        execute: false,
        zero_init: false,
        no_move: false,
    };

    pub const WRITE: Self = Self {
        write: true,
        readonly: false,
        execute: false,
        zero_init: false,
        no_move: false,
    };

    pub const READONLY: Self = Self {
        write: false,
        readonly: true,
        execute: false,
        zero_init: false,
        no_move: false,
    };

    pub const EXECUTE: Self = Self {
        write: false,
        readonly: false,
        execute: true,
        zero_init: false,
        no_move: false,
    };

    pub const ZERO_INIT: Self = Self {
        write: false,
        readonly: false,
        execute: false,
        zero_init: true,
        no_move: false,
    };

    pub const NO_MOVE: Self = Self {
        write: false,
        readonly: false,
        execute: false,
        zero_init: false,
        no_move: true,
    };

    /// Reject combinations that cannot be expressed as one page protection.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.readonly && self.write {
            return Err(MemoryError::InvalidFlags("READONLY combined with WRITE"));
        }
        if self.readonly && self.execute {
            return Err(MemoryError::InvalidFlags("READONLY combined with EXECUTE"));
        }
        Ok(())
    }
}

impl BitOr for AllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            write: self.write || rhs.write,
            readonly: self.readonly || rhs.readonly,
            execute: self.execute || rhs.execute,
            zero_init: self.zero_init || rhs.zero_init,
            no_move: self.no_move || rhs.no_move,
        }
    }
}

/// Page protection applied to a block's containing pages.
///
/// Protection changes always cover whole pages, so blocks sharing a page
/// cannot carry different protections; callers that mix protections within
/// one page get page-granular results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Protection {
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        exec: false,
    };

    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
        exec: false,
    };

    pub const READ_EXECUTE: Self = Self {
        read: true,
        write: false,
        exec: true,
    };

    /// Derive the protection an allocation request asks for.
    pub fn from_flags(flags: AllocFlags) -> Self {
        if flags.execute {
            Self {
                read: true,
                write: flags.write,
                exec: true,
            }
        } else if flags.readonly {
            Self::READ_ONLY
        } else {
            Self::READ_WRITE
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::READ_WRITE
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.exec { 'x' } else { '-' }
        )
    }
}

/// Heap-wide statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub backing_size: Size,
    pub mapped_objects: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: Size,
    pub free_bytes: Size,
}

/// One block row of the allocation table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BlockRecord {
    pub offset: Address,
    pub bytes: Size,
    pub state: BlockState,
    pub header_size: Size,
    pub protection: Protection,
}

/// One object row of the allocation table, with its blocks.
///
/// `(offset, bytes)` against the backing file descriptor is the contract an
/// external controller uses to map the same region.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ObjectRecord {
    pub offset: Address,
    pub bytes: Size,
    pub blocks: Vec<BlockRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_union_combines_bits() {
        let flags = AllocFlags::WRITE | AllocFlags::ZERO_INIT;
        assert!(flags.write);
        assert!(flags.zero_init);
        assert!(!flags.readonly);
    }

    #[test]
    fn conflicting_flags_are_rejected() {
        assert!((AllocFlags::READONLY | AllocFlags::WRITE).validate().is_err());
        assert!((AllocFlags::READONLY | AllocFlags::EXECUTE).validate().is_err());
        assert!((AllocFlags::WRITE | AllocFlags::EXECUTE).validate().is_ok());
    }

    #[test]
    fn protection_derivation() {
        assert_eq!(
            Protection::from_flags(AllocFlags::NONE),
            Protection::READ_WRITE
        );
        assert_eq!(
            Protection::from_flags(AllocFlags::READONLY),
            Protection::READ_ONLY
        );
        assert_eq!(
            Protection::from_flags(AllocFlags::EXECUTE),
            Protection::READ_EXECUTE
        );
        let rwx = Protection::from_flags(AllocFlags::WRITE | AllocFlags::EXECUTE);
        assert!(rwx.read && rwx.write && rwx.exec);
    }
}
