//! Single-producer/single-consumer circular index buffer.
//!
//! Sits between the caller thread and one disk worker. The ring hands
//! out *slot indices*; the slot payloads live next to it in the disk
//! channel. Only the producer moves the end index and only the consumer
//! moves the start index, so two atomics with acquire/release pairing
//! are the whole synchronisation story. One slot is always left empty
//! to distinguish full from empty.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Slots per disk ring.
pub const RING_DEPTH: usize = 256;

pub struct IndexRing {
    /// Next index the consumer will read. Owned by the consumer.
    start: AtomicUsize,
    /// Next index the producer will fill. Owned by the producer.
    end: AtomicUsize,
    capacity: usize,
}

impl IndexRing {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity >= 2);
        IndexRing {
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            capacity,
        }
    }

    fn wrap(&self, index: usize) -> usize {
        if index >= self.capacity {
            0
        } else {
            index
        }
    }

    /// Slot index the producer may fill, or `None` when the ring is
    /// full. Producer-side only.
    pub fn write_index(&self) -> Option<usize> {
        // Relaxed: the producer owns `end`.
        let end = self.end.load(Ordering::Relaxed);
        let end_plus_1 = self.wrap(end + 1);
        // Acquire: the consumer owns `start`.
        let start = self.start.load(Ordering::Acquire);
        if start == end_plus_1 {
            return None;
        }
        Some(end)
    }

    /// Publish the slot returned by the last `write_index`.
    pub fn commit_write(&self) {
        let end_plus_1 = self.wrap(self.end.load(Ordering::Relaxed) + 1);
        // Release: the slot contents must be visible before the index.
        self.end.store(end_plus_1, Ordering::Release);
    }

    /// Slot index the consumer may take, or `None` when the ring is
    /// empty. Consumer-side only.
    pub fn read_index(&self) -> Option<usize> {
        // Relaxed: the consumer owns `start`.
        let start = self.start.load(Ordering::Relaxed);
        // Acquire: pairs with the producer's release in `commit_write`.
        let end = self.end.load(Ordering::Acquire);
        if end == start {
            return None;
        }
        Some(start)
    }

    /// Retire the slot returned by the last `read_index`.
    pub fn commit_read(&self) {
        let start_plus_1 = self.wrap(self.start.load(Ordering::Relaxed) + 1);
        // Release: the slot is free for reuse once the index moves.
        self.start.store(start_plus_1, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.end.load(Ordering::Acquire) == self.start.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        let start = self.start.load(Ordering::Acquire);
        let mut end = self.end.load(Ordering::Acquire);
        if end < start {
            end += self.capacity;
        }
        end - start
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_ring() {
        let ring = IndexRing::new(8);
        assert!(ring.is_empty());
        assert_eq!(ring.read_index(), None);
        assert_eq!(ring.write_index(), Some(0));
    }

    #[test]
    fn test_fill_and_drain() {
        let ring = IndexRing::new(4);
        // Capacity 4 stores at most 3 entries.
        for expected in 0..3 {
            assert_eq!(ring.write_index(), Some(expected));
            ring.commit_write();
        }
        assert_eq!(ring.write_index(), None);
        assert_eq!(ring.len(), 3);

        for expected in 0..3 {
            assert_eq!(ring.read_index(), Some(expected));
            ring.commit_read();
        }
        assert_eq!(ring.read_index(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_wrap_around() {
        let ring = IndexRing::new(4);
        for round in 0..10 {
            let index = ring.write_index().unwrap();
            assert_eq!(index, round % 4);
            ring.commit_write();
            assert_eq!(ring.read_index(), Some(index));
            ring.commit_read();
        }
    }

    #[test]
    fn test_spsc_threads() {
        let ring = Arc::new(IndexRing::new(RING_DEPTH));
        let slots: Arc<Vec<AtomicUsize>> =
            Arc::new((0..RING_DEPTH).map(|_| AtomicUsize::new(0)).collect());
        const COUNT: usize = 100_000;

        let producer = {
            let ring = Arc::clone(&ring);
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                for value in 1..=COUNT {
                    loop {
                        if let Some(index) = ring.write_index() {
                            slots[index].store(value, Ordering::Relaxed);
                            ring.commit_write();
                            break;
                        }
                        thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 1;
        while expected <= COUNT {
            if let Some(index) = ring.read_index() {
                assert_eq!(slots[index].load(Ordering::Relaxed), expected);
                ring.commit_read();
                expected += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
