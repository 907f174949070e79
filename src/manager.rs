//! The public storage engine façade.
//!
//! Coordinates the allocator, the per-disk I/O pipeline, and the
//! catalog behind four operation families: Push (admit a bundle),
//! Pop/Return (hand the best sendable bundle to egress, or put it
//! back), Read (stream a popped bundle's segments), and Remove
//! (tombstone and free a transmitted bundle).
//!
//! The catalog is populated synchronously at the end of Push, so a Pop
//! issued immediately afterwards finds the bundle even while its
//! segment writes are still queued: per-disk FIFO ordering guarantees
//! the writes land before any read of the same segments.

use crate::allocator::SegmentAllocator;
use crate::bundle::{Eid, PrimaryBlock, Priority};
use crate::catalog::{BundleCatalog, CatalogEntry};
use crate::config::StorageConfig;
use crate::disk::{DiskIoPipeline, DiskRequest, ReadSlot};
use crate::error::{Result, StoreError};
use crate::restore::{self, RestoreStats};
use crate::segment::{
    SegmentHeader, SegmentId, NOT_A_HEAD, SEGMENT_CHAIN_END, SEGMENT_RESERVED_BYTES,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Segments a read session keeps in flight ahead of the consumer.
pub const READ_CACHE_DEPTH: usize = 32;

/// State of one bundle being pushed. Created by
/// [`BundleStorageManager::push_begin`]; dropped after the final
/// segment is staged.
pub struct WriteSession {
    entry: CatalogEntry,
    next_logical_segment: usize,
}

impl WriteSession {
    pub fn bundle_size(&self) -> u64 {
        self.entry.bundle_size
    }

    pub fn segment_count(&self) -> usize {
        self.entry.segments.len()
    }
}

/// State of one popped bundle being read back. Holds custody of the
/// catalog entry until `return_top` or `remove`.
pub struct ReadSession {
    entry: CatalogEntry,
    /// Next segment to hand to the consumer.
    next_logical_segment: usize,
    /// Next segment to prefetch.
    next_segment_to_cache: usize,
    cache_read_index: usize,
    cache_write_index: usize,
    cache: Vec<Arc<ReadSlot>>,
}

impl ReadSession {
    fn new(entry: CatalogEntry, segment_size: usize) -> Self {
        ReadSession {
            entry,
            next_logical_segment: 0,
            next_segment_to_cache: 0,
            cache_read_index: 0,
            cache_write_index: 0,
            cache: (0..READ_CACHE_DEPTH)
                .map(|_| Arc::new(ReadSlot::new(segment_size)))
                .collect(),
        }
    }

    pub fn bundle_size(&self) -> u64 {
        self.entry.bundle_size
    }

    pub fn segments(&self) -> &[SegmentId] {
        &self.entry.segments
    }

    pub fn destination(&self) -> Eid {
        self.entry.dest
    }

    pub fn priority(&self) -> Priority {
        self.entry.priority
    }

    pub fn expiration(&self) -> u64 {
        self.entry.expiration
    }

    pub fn is_fully_read(&self) -> bool {
        self.next_logical_segment == self.entry.segments.len()
    }
}

/// The persistent bundle storage engine.
pub struct BundleStorageManager {
    segment_size: usize,
    payload_per_segment: usize,
    allocator: SegmentAllocator,
    catalog: Mutex<BundleCatalog>,
    pipeline: DiskIoPipeline,
    restore_stats: Option<RestoreStats>,
    restored_from_disk: bool,
}

impl BundleStorageManager {
    /// Validate the configuration, optionally restore the catalog and
    /// allocator from the existing disk files, then spawn one worker
    /// per disk.
    ///
    /// When restore is requested but fails, the engine starts empty and
    /// the files are opened without truncation so their contents remain
    /// available for inspection.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let mut allocator = SegmentAllocator::new(config.max_segments());
        let mut catalog = BundleCatalog::new();
        let mut restore_stats = None;
        let mut restored_from_disk = false;

        if config.try_restore_from_disk {
            match restore::restore_from_disk(&config, &allocator, &mut catalog) {
                Some(stats) => {
                    tracing::info!(
                        bundles = stats.bundles_restored,
                        bytes = stats.bytes_restored,
                        segments = stats.segments_restored,
                        "restored catalog from disk"
                    );
                    restore_stats = Some(stats);
                    restored_from_disk = true;
                }
                None => {
                    tracing::warn!("restore from disk failed; starting empty");
                    allocator = SegmentAllocator::new(config.max_segments());
                    catalog = BundleCatalog::new();
                }
            }
        }

        let pipeline = DiskIoPipeline::start(
            config.storage_disks.clone(),
            config.segment_size(),
            !config.try_restore_from_disk,
            config.auto_delete_files_on_exit,
        )?;

        Ok(BundleStorageManager {
            segment_size: config.segment_size(),
            payload_per_segment: config.payload_per_segment(),
            allocator,
            catalog: Mutex::new(catalog),
            pipeline,
            restore_stats,
            restored_from_disk,
        })
    }

    /// Admit a bundle: allocate its segment chain and capture the
    /// routing metadata from the primary block.
    ///
    /// Fails with [`StoreError::OutOfSpace`] when the allocator cannot
    /// supply the chain; nothing is mutated in that case.
    pub fn push_begin(&self, primary: &PrimaryBlock, bundle_size: u64) -> Result<WriteSession> {
        let priority = primary.priority().ok_or(StoreError::UnsupportedPriority)?;
        let total_segments = bundle_size.div_ceil(self.payload_per_segment as u64) as usize;
        let segments = self.allocator.allocate_chain(total_segments)?;
        Ok(WriteSession {
            entry: CatalogEntry {
                bundle_size,
                segments,
                dest: primary.dest,
                priority,
                expiration: primary.expiration(),
            },
            next_logical_segment: 0,
        })
    }

    /// Stage one segment's payload slice (at most `payload_per_segment`
    /// bytes) and queue its write. Completing the final segment inserts
    /// the chain into the catalog.
    pub fn push_segment(&self, session: &mut WriteSession, payload: &[u8]) -> Result<usize> {
        let total = session.entry.segments.len();
        if session.next_logical_segment >= total {
            return Ok(0);
        }
        debug_assert!(payload.len() <= self.payload_per_segment);

        let index = session.next_logical_segment;
        let header = SegmentHeader {
            bundle_size: if index == 0 {
                session.entry.bundle_size
            } else {
                NOT_A_HEAD
            },
            next_segment: if index + 1 == total {
                SEGMENT_CHAIN_END
            } else {
                session.entry.segments[index + 1]
            },
        };

        let mut block = vec![0u8; self.segment_size];
        header.write_to(&mut block);
        block[SEGMENT_RESERVED_BYTES..SEGMENT_RESERVED_BYTES + payload.len()]
            .copy_from_slice(payload);
        self.pipeline.submit(DiskRequest::Write {
            segment_id: session.entry.segments[index],
            block: block.into_boxed_slice(),
        });

        session.next_logical_segment += 1;
        if session.next_logical_segment == total {
            self.catalog.lock().insert(session.entry.clone());
        }
        Ok(payload.len())
    }

    /// Slice a whole bundle into segments and push every one. Returns
    /// the byte count pushed, equal to `bundle_size` on success.
    pub fn push_all_segments(&self, session: &mut WriteSession, bundle: &[u8]) -> Result<u64> {
        debug_assert_eq!(bundle.len() as u64, session.entry.bundle_size);
        let mut pushed = 0u64;
        for chunk in bundle.chunks(self.payload_per_segment) {
            pushed += self.push_segment(session, chunk)? as u64;
        }
        Ok(pushed)
    }

    /// Take custody of the best sendable bundle for the currently
    /// reachable destinations, or `None` when nothing qualifies.
    pub fn pop_top(&self, reachable_destinations: &[u64]) -> Option<ReadSession> {
        let entry = self.catalog.lock().pop_top(reachable_destinations)?;
        Some(ReadSession::new(entry, self.segment_size))
    }

    /// Put a popped bundle back at the front of its expiration bucket,
    /// e.g. after a failed transmission. The allocator and the disk are
    /// untouched; an immediate `pop_top` yields the same bundle.
    pub fn return_top(&self, session: ReadSession) {
        self.catalog.lock().insert(session.entry);
    }

    /// Copy the next segment's payload slice into `out` (which must
    /// hold at least `payload_per_segment` bytes), prefetching up to
    /// [`READ_CACHE_DEPTH`] segments ahead. Returns the bytes copied,
    /// or `Ok(0)` once the chain is exhausted.
    ///
    /// On-disk headers are cross-checked against the in-memory chain;
    /// divergences are logged and the read continues, trusting the
    /// catalog.
    pub fn read_next_segment(&self, session: &mut ReadSession, out: &mut [u8]) -> Result<usize> {
        let total = session.entry.segments.len();
        if session.next_logical_segment >= total {
            return Ok(0);
        }

        while session.next_segment_to_cache - session.next_logical_segment < READ_CACHE_DEPTH
            && session.next_segment_to_cache < total
        {
            let segment_id = session.entry.segments[session.next_segment_to_cache];
            let slot = &session.cache[session.cache_write_index];
            slot.reset();
            self.pipeline.submit(DiskRequest::Read {
                segment_id,
                slot: Arc::clone(slot),
            });
            session.cache_write_index = (session.cache_write_index + 1) % READ_CACHE_DEPTH;
            session.next_segment_to_cache += 1;
        }

        let slot = Arc::clone(&session.cache[session.cache_read_index]);
        while !slot.is_ready() {
            self.pipeline.wait_brief();
        }
        if slot.is_failed() {
            return Err(StoreError::SegmentReadFailed(
                session.entry.segments[session.next_logical_segment] as u64,
            ));
        }

        let data = slot.data.lock();
        let header = SegmentHeader::read_from(&data);
        let index = session.next_logical_segment;

        if index == 0 {
            if header.bundle_size != session.entry.bundle_size {
                tracing::warn!(
                    read = header.bundle_size,
                    expected = session.entry.bundle_size,
                    "head segment length disagrees with catalog"
                );
            }
        } else if header.bundle_size != NOT_A_HEAD {
            tracing::warn!(
                read = header.bundle_size,
                "interior segment carries a length instead of the sentinel"
            );
        }

        session.next_logical_segment += 1;
        if session.next_logical_segment < total {
            let expected = session.entry.segments[session.next_logical_segment];
            if header.next_segment != expected {
                tracing::warn!(
                    read = header.next_segment as u64,
                    expected = expected as u64,
                    "next-segment pointer disagrees with catalog chain"
                );
            }
        } else if header.next_segment != SEGMENT_CHAIN_END {
            tracing::warn!(
                read = header.next_segment as u64,
                "last segment missing the end-of-chain sentinel"
            );
        }

        // The catalog chain decides sizing; only the tail segment is
        // partial.
        let size = if session.next_logical_segment == total {
            match (session.entry.bundle_size % self.payload_per_segment as u64) as usize {
                0 => self.payload_per_segment,
                tail => tail,
            }
        } else {
            self.payload_per_segment
        };

        out[..size].copy_from_slice(&data[SEGMENT_RESERVED_BYTES..SEGMENT_RESERVED_BYTES + size]);
        session.cache_read_index = (session.cache_read_index + 1) % READ_CACHE_DEPTH;
        Ok(size)
    }

    /// Read the whole remaining chain and return the bundle bytes.
    pub fn read_all_segments(&self, session: &mut ReadSession) -> Result<Vec<u8>> {
        let mut out = vec![0u8; session.entry.bundle_size as usize];
        let mut offset = 0usize;
        while !session.is_fully_read() {
            let n = self.read_next_segment(session, &mut out[offset..])?;
            offset += n;
        }
        debug_assert_eq!(offset, out.len());
        Ok(out)
    }

    /// Delete a popped bundle: tombstone its head segment on disk, then
    /// free the chain. The tombstone write is queued before the
    /// deletion is acknowledged, so a crash at any point leaves either
    /// a live bundle or an ignorable dead chain, never a resurrected
    /// one.
    ///
    /// Fails with [`StoreError::BundleNotFullyRead`] unless the whole
    /// chain was read or `force` is set.
    pub fn remove(&self, session: &ReadSession, force: bool) -> Result<()> {
        if !force && !session.is_fully_read() {
            return Err(StoreError::BundleNotFullyRead);
        }

        let mut block = vec![0u8; self.segment_size];
        SegmentHeader::tombstone().write_to(&mut block);
        self.pipeline.submit(DiskRequest::Write {
            segment_id: session.entry.segments[0],
            block: block.into_boxed_slice(),
        });

        self.allocator.free_chain(&session.entry.segments)
    }

    /// Drain in-flight operations, join the disk workers, and release
    /// (optionally unlink) the files. Also runs on drop.
    pub fn stop(&mut self) {
        self.pipeline.stop();
    }

    pub fn successfully_restored_from_disk(&self) -> bool {
        self.restored_from_disk
    }

    pub fn restore_stats(&self) -> Option<RestoreStats> {
        self.restore_stats
    }

    pub fn segment_allocator(&self) -> &SegmentAllocator {
        &self.allocator
    }

    pub fn free_segment_count(&self) -> u64 {
        self.allocator.free_count()
    }

    pub fn capacity_segments(&self) -> u64 {
        self.allocator.capacity()
    }

    pub fn payload_per_segment(&self) -> usize {
        self.payload_per_segment
    }

    pub fn catalog_bundle_count(&self) -> usize {
        self.catalog.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir, disks: usize, capacity: u64) -> StorageConfig {
        StorageConfig {
            storage_disks: (0..disks)
                .map(|i| dir.path().join(format!("store{i}.bin")))
                .collect(),
            total_capacity_bytes: capacity,
            try_restore_from_disk: false,
            auto_delete_files_on_exit: true,
            segment_size_multiple_of_4kb: 1,
        }
    }

    fn primary(dest: u64, priority: Priority, lifetime: u64) -> PrimaryBlock {
        PrimaryBlock::new(Eid::new(dest, 1), Eid::new(100, 1), priority, 0, lifetime)
    }

    #[test]
    fn test_push_populates_catalog_synchronously() {
        let dir = TempDir::new().unwrap();
        let bsm = BundleStorageManager::open(config_in(&dir, 2, 4096 * 64)).unwrap();

        let data = vec![0x5Au8; 100];
        let mut session = bsm.push_begin(&primary(9, Priority::Normal, 5), 100).unwrap();
        assert_eq!(session.segment_count(), 1);
        assert_eq!(bsm.catalog_bundle_count(), 0);
        assert_eq!(bsm.push_all_segments(&mut session, &data).unwrap(), 100);
        assert_eq!(bsm.catalog_bundle_count(), 1);
    }

    #[test]
    fn test_push_out_of_space_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        // Room for four segments only.
        let bsm = BundleStorageManager::open(config_in(&dir, 2, 4096 * 4)).unwrap();
        let free_before = bsm.free_segment_count();

        let too_big = 10 * bsm.payload_per_segment() as u64;
        let result = bsm.push_begin(&primary(1, Priority::Bulk, 1), too_big);
        assert!(matches!(result, Err(StoreError::OutOfSpace)));
        assert_eq!(bsm.free_segment_count(), free_before);
        assert_eq!(bsm.catalog_bundle_count(), 0);
    }

    #[test]
    fn test_remove_requires_full_read() {
        let dir = TempDir::new().unwrap();
        let bsm = BundleStorageManager::open(config_in(&dir, 2, 4096 * 64)).unwrap();

        let payload = bsm.payload_per_segment();
        let data = vec![1u8; payload * 2];
        let mut write = bsm
            .push_begin(&primary(3, Priority::Bulk, 1), data.len() as u64)
            .unwrap();
        bsm.push_all_segments(&mut write, &data).unwrap();

        let mut read = bsm.pop_top(&[3]).unwrap();
        let mut out = vec![0u8; payload];
        bsm.read_next_segment(&mut read, &mut out).unwrap();
        assert!(matches!(
            bsm.remove(&read, false),
            Err(StoreError::BundleNotFullyRead)
        ));

        // Force removal works without draining the chain.
        bsm.remove(&read, true).unwrap();
        assert_eq!(bsm.free_segment_count(), bsm.capacity_segments());
    }

    #[test]
    fn test_reserved_priority_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bsm = BundleStorageManager::open(config_in(&dir, 1, 4096 * 16)).unwrap();

        let mut block = primary(1, Priority::Bulk, 1);
        block.flags |= 3 << 7;
        assert!(matches!(
            bsm.push_begin(&block, 10),
            Err(StoreError::UnsupportedPriority)
        ));
    }
}
