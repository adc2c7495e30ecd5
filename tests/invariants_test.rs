/*!
 * Invariant Property Tests
 * Random operation sequences keep the allocation table sound
 */

use proptest::prelude::*;
use shmheap::{AllocFlags, MemoryManager};
use std::ptr::NonNull;

#[derive(Debug, Clone)]
struct Live {
    address: usize,
    len: usize,
    tag: u8,
}

fn ptr(address: usize) -> NonNull<u8> {
    NonNull::new(address as *mut u8).unwrap()
}

unsafe fn fill(address: usize, len: usize, tag: u8) {
    std::ptr::write_bytes(address as *mut u8, tag, len);
}

unsafe fn holds(address: usize, len: usize, tag: u8) -> bool {
    std::slice::from_raw_parts(address as *const u8, len)
        .iter()
        .all(|&b| b == tag)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Drive the allocator with arbitrary allocate/reallocate/deallocate
    /// sequences; after every step the structural checker must pass and
    /// the content of every live allocation must survive untouched.
    #[test]
    fn random_op_sequences_preserve_invariants(
        ops in prop::collection::vec((0u8..3, 1usize..2048), 1..48),
    ) {
        let manager = MemoryManager::new()
            .with_name("shmheap-proptest")
            .with_granularity(4096);
        manager.init().unwrap();

        let mut live: Vec<Live> = Vec::new();
        let mut next_tag = 1u8;

        for (op, size) in ops {
            match op {
                0 => {
                    let p = manager.allocate(size, AllocFlags::WRITE, 0).unwrap();
                    let tag = next_tag;
                    next_tag = next_tag.wrapping_add(1).max(1);
                    unsafe { fill(p.as_ptr() as usize, size, tag) };
                    live.push(Live { address: p.as_ptr() as usize, len: size, tag });
                }
                1 if !live.is_empty() => {
                    let entry = live.remove(size % live.len());
                    let ok = unsafe { holds(entry.address, entry.len, entry.tag) };
                    prop_assert!(ok);
                    manager.deallocate(ptr(entry.address)).unwrap();
                }
                2 if !live.is_empty() => {
                    let index = size % live.len();
                    let entry = live[index].clone();
                    let preserved = entry.len.min(size);
                    let p = manager
                        .reallocate(ptr(entry.address), size, AllocFlags::WRITE)
                        .unwrap();
                    let ok = unsafe { holds(p.as_ptr() as usize, preserved, entry.tag) };
                    prop_assert!(ok);
                    unsafe { fill(p.as_ptr() as usize, size, entry.tag) };
                    live[index] = Live { address: p.as_ptr() as usize, len: size, ..entry };
                }
                _ => {}
            }
            manager.check_allocation_table();
        }

        // Every other live allocation kept its bytes through the churn.
        for entry in &live {
            let ok = unsafe { holds(entry.address, entry.len, entry.tag) };
            prop_assert!(ok);
        }

        for entry in live {
            manager.deallocate(ptr(entry.address)).unwrap();
        }
        manager.check_allocation_table();
        prop_assert_eq!(manager.stats().mapped_objects, 0);
    }
}
