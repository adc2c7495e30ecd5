/*!
 * Core Types
 * Common types used across the allocator
 */

/// Byte offset within the shared heap's backing file.
///
/// Descriptors address their regions in this file-offset space rather than
/// in process virtual addresses: offsets mean the same thing in every
/// process that maps the backing file, which is what makes the allocation
/// table useful to an external controller.
pub type Address = usize;

/// Size type for memory operations
pub type Size = usize;
