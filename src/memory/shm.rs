/*!
 * Shared-Memory Backing
 * Named backing file, per-object mappings, page protection
 */

use crate::core::types::{Address, Size};
use crate::memory::list::align_up;
use crate::memory::types::{MemoryError, MemoryResult, Protection};
use log::warn;
use nix::fcntl::{fallocate, FallocateFlags};
use nix::libc::off_t;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use std::ffi::{c_void, CString};
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

fn prot_flags(prot: Protection) -> ProtFlags {
    let mut flags = ProtFlags::PROT_NONE;
    if prot.read {
        flags |= ProtFlags::PROT_READ;
    }
    if prot.write {
        flags |= ProtFlags::PROT_WRITE;
    }
    if prot.exec {
        flags |= ProtFlags::PROT_EXEC;
    }
    flags
}

/// The named backing file behind every mapped object.
///
/// The file grows in granularity-sized steps as objects are created; each
/// object is a `MAP_SHARED` view of one `(offset, bytes)` range. An
/// external controller that opens the same file (for instance through
/// `/proc/<pid>/fd/<fd>`) maps the identical bytes.
#[derive(Debug)]
pub(crate) struct ShmFile {
    fd: OwnedFd,
    len: Size,
    page_size: Size,
}

impl ShmFile {
    /// Create the backing file under `name`.
    pub fn create(name: &str) -> MemoryResult<Self> {
        let c_name = CString::new(name).map_err(|_| MemoryError::ShmFailure {
            op: "memfd_create",
            source: nix::Error::EINVAL,
        })?;
        let fd = memfd_create(c_name.as_c_str(), MemFdCreateFlag::MFD_CLOEXEC).map_err(|e| {
            MemoryError::ShmFailure {
                op: "memfd_create",
                source: e,
            }
        })?;
        Ok(Self {
            fd,
            len: 0,
            page_size: page_size::get(),
        })
    }

    pub fn len(&self) -> Size {
        self.len
    }

    pub fn page_size(&self) -> Size {
        self.page_size
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Grow the file by `bytes`, returning the offset of the new region.
    pub fn extend(&mut self, bytes: Size) -> MemoryResult<Address> {
        let offset = self.len;
        let new_len = offset + bytes;
        ftruncate(&self.fd, new_len as off_t).map_err(|e| MemoryError::ShmFailure {
            op: "ftruncate",
            source: e,
        })?;
        self.len = new_len;
        Ok(offset)
    }

    /// Shrink the file back to `len`; used to roll back a failed growth.
    pub fn truncate(&mut self, len: Size) -> MemoryResult<()> {
        ftruncate(&self.fd, len as off_t).map_err(|e| MemoryError::ShmFailure {
            op: "ftruncate",
            source: e,
        })?;
        self.len = len;
        Ok(())
    }

    /// Map `[offset, offset + bytes)` of the file read/write, shared.
    pub fn map(&self, offset: Address, bytes: Size) -> MemoryResult<NonNull<u8>> {
        let length = NonZeroUsize::new(bytes).ok_or(MemoryError::InvalidSize(0))?;
        // SAFETY: fresh view of our own file; offset and length stay within
        // the extended range, offset is page-aligned by construction.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.fd,
                offset as off_t,
            )
        }
        .map_err(|e| MemoryError::ShmFailure {
            op: "mmap",
            source: e,
        })?;
        Ok(ptr.cast::<u8>())
    }

    /// Release one object's mapping.
    pub fn unmap(&self, base: NonNull<u8>, bytes: Size) -> MemoryResult<()> {
        // SAFETY: `base`/`bytes` describe exactly one mapping produced by
        // `map`, which is page-aligned.
        unsafe { munmap(base.cast::<c_void>(), bytes) }.map_err(|e| MemoryError::ShmFailure {
            op: "munmap",
            source: e,
        })
    }

    /// Apply `prot` to the pages containing `[addr, addr + bytes)`.
    ///
    /// Protection is page-granular: the range is widened to whole pages,
    /// so neighboring blocks on a shared page are affected too.
    pub fn protect(&self, addr: NonNull<u8>, bytes: Size, prot: Protection) -> MemoryResult<()> {
        let start = addr.as_ptr() as usize & !(self.page_size - 1);
        let end = align_up(addr.as_ptr() as usize + bytes, self.page_size);
        // SAFETY: the widened range stays inside the mapping the caller's
        // block lives in; start is page-aligned.
        unsafe {
            mprotect(
                NonNull::new_unchecked(start as *mut c_void),
                end - start,
                prot_flags(prot),
            )
        }
        .map_err(|e| MemoryError::ShmFailure {
            op: "mprotect",
            source: e,
        })
    }

    /// Return an unmapped object's range to the OS, best effort: the tail
    /// region is truncated away, interior regions get a hole punched.
    pub fn punch(&mut self, offset: Address, bytes: Size) {
        if offset + bytes == self.len {
            match ftruncate(&self.fd, offset as off_t) {
                Ok(()) => {
                    self.len = offset;
                    return;
                }
                Err(e) => warn!("Failed to shrink backing file to {}: {}", offset, e),
            }
        }
        if let Err(e) = fallocate(
            self.fd.as_raw_fd(),
            FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
            offset as off_t,
            bytes as off_t,
        ) {
            warn!(
                "Failed to punch hole at 0x{:x} (+{}) in backing file: {}",
                offset, bytes, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_grows_logical_size() {
        let mut shm = ShmFile::create("shm-extend-test").unwrap();
        assert_eq!(shm.len(), 0);

        let first = shm.extend(64 * 1024).unwrap();
        let second = shm.extend(64 * 1024).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 64 * 1024);
        assert_eq!(shm.len(), 128 * 1024);
    }

    #[test]
    fn two_views_of_one_offset_share_bytes() {
        let mut shm = ShmFile::create("shm-view-test").unwrap();
        let offset = shm.extend(64 * 1024).unwrap();

        let a = shm.map(offset, 64 * 1024).unwrap();
        let b = shm.map(offset, 64 * 1024).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());

        // SAFETY: both views cover the mapped range just created.
        unsafe {
            a.as_ptr().add(100).write(0xAB);
            assert_eq!(b.as_ptr().add(100).read(), 0xAB);
        }

        shm.unmap(a, 64 * 1024).unwrap();
        shm.unmap(b, 64 * 1024).unwrap();
    }

    #[test]
    fn punched_tail_shrinks_file() {
        let mut shm = ShmFile::create("shm-punch-test").unwrap();
        let offset = shm.extend(64 * 1024).unwrap();
        shm.punch(offset, 64 * 1024);
        assert_eq!(shm.len(), 0);
    }
}
