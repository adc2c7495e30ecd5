/*!
 * Core Primitives
 * Types and synchronization shared by the allocator modules
 */

pub mod sync;
pub mod types;

pub use sync::{SpinGuard, SpinLock};
