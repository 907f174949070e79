//! Property-based tests for segment allocator correctness
//!
//! Uses proptest to verify allocator invariants hold across many random
//! scenarios.

use bundlestore::{SegmentAllocator, SegmentId};
use proptest::prelude::*;
use std::collections::HashSet;

proptest! {
    #[test]
    fn prop_chains_never_overlap(
        chain_sizes in prop::collection::vec(1usize..64, 1..20)
    ) {
        let alloc = SegmentAllocator::new(4096);
        let mut seen = HashSet::new();
        let mut chains = Vec::new();

        for &count in &chain_sizes {
            let chain = alloc.allocate_chain(count).unwrap();
            prop_assert_eq!(chain.len(), count);
            for &id in &chain {
                prop_assert!(seen.insert(id), "segment {} allocated twice", id);
            }
            chains.push(chain);
        }

        let total: usize = chain_sizes.iter().sum();
        prop_assert_eq!(alloc.free_count(), 4096 - total as u64);

        for chain in &chains {
            alloc.free_chain(chain).unwrap();
        }
        prop_assert_eq!(alloc.free_count(), 4096);
    }

    #[test]
    fn prop_snapshot_round_trip(count in 1usize..500) {
        let alloc = SegmentAllocator::new(1024);
        let before = alloc.snapshot();

        let chain = alloc.allocate_chain(count).unwrap();
        prop_assert!(!alloc.equals_snapshot(&before));

        alloc.free_chain(&chain).unwrap();
        prop_assert!(alloc.equals_snapshot(&before));
    }

    #[test]
    fn prop_freed_holes_refill_lowest_first(
        holes in prop::collection::hash_set(0u32..256, 1..32)
    ) {
        let alloc = SegmentAllocator::new(256);
        alloc.allocate_chain(256).unwrap();

        let mut freed: Vec<SegmentId> = holes.iter().map(|&id| id as SegmentId).collect();
        alloc.free_chain(&freed).unwrap();
        freed.sort_unstable();

        // Refilling picks exactly the freed ids, in ascending order.
        let refilled = alloc.allocate_chain(freed.len()).unwrap();
        prop_assert_eq!(refilled, freed);
    }

    #[test]
    fn prop_interleaved_alloc_free_conserves_capacity(
        ops in prop::collection::vec((1usize..32, any::<bool>()), 1..40)
    ) {
        let capacity = 2048u64;
        let alloc = SegmentAllocator::new(capacity);
        let mut live: Vec<Vec<SegmentId>> = Vec::new();
        let mut live_segments = 0u64;

        for (count, free_oldest) in ops {
            if free_oldest && !live.is_empty() {
                let chain = live.remove(0);
                live_segments -= chain.len() as u64;
                alloc.free_chain(&chain).unwrap();
            }
            let chain = alloc.allocate_chain(count).unwrap();
            live_segments += count as u64;
            live.push(chain);
            prop_assert_eq!(alloc.free_count(), capacity - live_segments);
        }
    }
}
