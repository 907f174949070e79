//! Free-segment tracking over the engine's full capacity.
//!
//! A multi-level summary tree with fan-out 64: the deepest level is the
//! raw free bitmap (one bit per segment, 1 = free), and each interior
//! word has bit `k` set iff child subtree `k` still has a free segment.
//! Allocation descends by lowest set bit, so segments are handed out
//! lowest-numbered-first: sequential disk locality after a fresh start,
//! and a deterministic layout for restore to verify against.
//!
//! The tree is at most six levels deep for a billion segments, so the
//! single mutex guarding it is held only for short, bounded walks.

use crate::error::{Result, StoreError};
use crate::segment::SegmentId;
use parking_lot::Mutex;

/// Fan-out of every tree level (bits per summary word).
const FAN_OUT: usize = 64;

struct SummaryTree {
    /// Root-first; the last level is the leaf bitmap.
    levels: Vec<Vec<u64>>,
    capacity: u64,
    free_count: u64,
}

impl SummaryTree {
    fn new(capacity: u64) -> Self {
        let leaf_words = capacity.div_ceil(FAN_OUT as u64).max(1) as usize;

        // Leaf bitmap: every in-range segment starts free; bits past the
        // capacity stay zero so they can never be allocated.
        let mut leaf = vec![0u64; leaf_words];
        for (i, word) in leaf.iter_mut().enumerate() {
            let base = i as u64 * FAN_OUT as u64;
            if base >= capacity {
                break;
            }
            let bits = (capacity - base).min(FAN_OUT as u64);
            *word = if bits == FAN_OUT as u64 {
                u64::MAX
            } else {
                (1u64 << bits) - 1
            };
        }

        // Summaries, bottom-up: one bit per child word.
        let mut stack = vec![leaf];
        loop {
            let parent = {
                let child = &stack[stack.len() - 1];
                if child.len() <= 1 {
                    break;
                }
                let mut words = vec![0u64; child.len().div_ceil(FAN_OUT)];
                for (ci, &cw) in child.iter().enumerate() {
                    if cw != 0 {
                        words[ci / FAN_OUT] |= 1u64 << (ci % FAN_OUT);
                    }
                }
                words
            };
            stack.push(parent);
        }
        stack.reverse();

        SummaryTree {
            levels: stack,
            capacity,
            free_count: capacity,
        }
    }

    /// Lowest-numbered free segment, or `None` when full.
    fn find_lowest_free(&self) -> Option<u64> {
        let mut index = 0usize;
        for level in &self.levels {
            let word = level[index];
            if word == 0 {
                return None;
            }
            index = index * FAN_OUT + word.trailing_zeros() as usize;
        }
        Some(index as u64)
    }

    fn is_free(&self, id: u64) -> bool {
        if id >= self.capacity {
            return false;
        }
        let leaf = &self.levels[self.levels.len() - 1];
        leaf[(id / 64) as usize] & (1u64 << (id % 64)) != 0
    }

    /// Clear the leaf bit, propagating upward only while a word drains
    /// to zero (the parent summary bit must drop too).
    fn mark_allocated(&mut self, id: u64) {
        let mut word_index = (id / 64) as usize;
        let mut bit = (id % 64) as u32;
        for level in self.levels.iter_mut().rev() {
            let word = &mut level[word_index];
            *word &= !(1u64 << bit);
            if *word != 0 {
                return;
            }
            bit = (word_index % FAN_OUT) as u32;
            word_index /= FAN_OUT;
        }
    }

    /// Set the leaf bit, propagating upward only on the
    /// all-full -> has-free transition.
    fn mark_free(&mut self, id: u64) {
        let mut word_index = (id / 64) as usize;
        let mut bit = (id % 64) as u32;
        for level in self.levels.iter_mut().rev() {
            let word = &mut level[word_index];
            let was_zero = *word == 0;
            *word |= 1u64 << bit;
            if !was_zero {
                return;
            }
            bit = (word_index % FAN_OUT) as u32;
            word_index /= FAN_OUT;
        }
    }
}

/// Thread-safe free-segment allocator.
///
/// `allocate_chain` and `free_chain` may be called from any thread.
/// `is_free` and `allocate_specific` exist for the single-threaded
/// restore pass; `snapshot`/`equals_snapshot` for test verification.
pub struct SegmentAllocator {
    tree: Mutex<SummaryTree>,
    capacity: u64,
}

impl SegmentAllocator {
    pub fn new(capacity: u64) -> Self {
        SegmentAllocator {
            tree: Mutex::new(SummaryTree::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn free_count(&self) -> u64 {
        self.tree.lock().free_count
    }

    /// Allocate `count` distinct segments, lowest-numbered first.
    ///
    /// Fails with [`StoreError::OutOfSpace`] without mutating anything
    /// when fewer than `count` segments are free.
    pub fn allocate_chain(&self, count: usize) -> Result<Vec<SegmentId>> {
        let mut tree = self.tree.lock();
        if (count as u64) > tree.free_count {
            return Err(StoreError::OutOfSpace);
        }
        let mut chain = Vec::with_capacity(count);
        for _ in 0..count {
            let id = tree.find_lowest_free().ok_or(StoreError::OutOfSpace)?;
            tree.mark_allocated(id);
            chain.push(id as SegmentId);
        }
        tree.free_count -= count as u64;
        Ok(chain)
    }

    /// Release every segment of a chain.
    ///
    /// Freeing an id that is already free or out of range is a
    /// programming error and fails with [`StoreError::InvalidSegmentId`].
    pub fn free_chain(&self, segments: &[SegmentId]) -> Result<()> {
        let mut tree = self.tree.lock();
        for &id in segments {
            let id = id as u64;
            if id >= tree.capacity {
                return Err(StoreError::InvalidSegmentId(id));
            }
            if tree.is_free(id) {
                tracing::warn!(segment = id, "double-free of segment");
                return Err(StoreError::InvalidSegmentId(id));
            }
            tree.mark_free(id);
            tree.free_count += 1;
        }
        Ok(())
    }

    pub fn is_free(&self, id: SegmentId) -> bool {
        self.tree.lock().is_free(id as u64)
    }

    /// Mark one specific segment occupied. Restore-only; the caller has
    /// already verified the segment is free.
    pub fn allocate_specific(&self, id: SegmentId) -> Result<()> {
        let mut tree = self.tree.lock();
        let id = id as u64;
        if !tree.is_free(id) {
            return Err(StoreError::InvalidSegmentId(id));
        }
        tree.mark_allocated(id);
        tree.free_count -= 1;
        Ok(())
    }

    /// Raw leaf bitmap as bytes, for before/after equality checks.
    pub fn snapshot(&self) -> Vec<u8> {
        let tree = self.tree.lock();
        let leaf = &tree.levels[tree.levels.len() - 1];
        let mut out = Vec::with_capacity(leaf.len() * 8);
        for word in leaf {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn equals_snapshot(&self, snapshot: &[u8]) -> bool {
        self.snapshot() == snapshot
    }
}
