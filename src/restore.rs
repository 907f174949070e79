//! Crash-consistent rebuild of the catalog and allocator.
//!
//! The reserved header on every segment is the single source of truth
//! on disk, so restore needs nothing but the flat files: it scans every
//! candidate head segment in id order, re-parses the primary block from
//! the head's payload prefix, and re-walks each chain through its
//! next-segment pointers, claiming segments in the allocator as it
//! goes.
//!
//! End-of-file at a candidate head boundary just ends that disk's scan.
//! Any inconsistency *inside* a chain walk (short read, pointer to an
//! out-of-range or already-claimed segment, premature or missing
//! end-of-chain sentinel) aborts the whole restore: the engine starts
//! empty and the files are left as they are.

use crate::allocator::SegmentAllocator;
use crate::bundle::PrimaryBlock;
use crate::catalog::{BundleCatalog, CatalogEntry};
use crate::config::StorageConfig;
use crate::segment::{
    segment_offset, SegmentHeader, SegmentId, NOT_A_HEAD, SEGMENT_CHAIN_END,
    SEGMENT_RESERVED_BYTES,
};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

/// Totals reported by a successful restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub bundles_restored: u64,
    pub bytes_restored: u64,
    pub segments_restored: u64,
}

fn read_segment(file: &mut File, offset: u64, block: &mut [u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(block)
}

/// Scan the disk files and repopulate `allocator` and `catalog`.
/// Returns `None` on failure, in which case both may be partially
/// mutated and must be discarded by the caller.
pub(crate) fn restore_from_disk(
    config: &StorageConfig,
    allocator: &SegmentAllocator,
    catalog: &mut BundleCatalog,
) -> Option<RestoreStats> {
    let segment_size = config.segment_size();
    let payload_per_segment = config.payload_per_segment() as u64;
    let num_disks = config.num_disks();
    let max_segments = config.max_segments();

    let mut files = Vec::with_capacity(num_disks);
    let mut file_sizes = Vec::with_capacity(num_disks);
    for path in &config.storage_disks {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot open storage file for restore");
                return None;
            }
        };
        let size = match file.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot stat storage file for restore");
                return None;
            }
        };
        tracing::info!(path = %path.display(), size, "scanning storage file");
        files.push(file);
        file_sizes.push(size);
    }

    let mut stats = RestoreStats::default();
    let mut block = vec![0u8; segment_size];
    let mut disk_scan_done = vec![false; num_disks];

    for candidate in 0..max_segments {
        if disk_scan_done.iter().all(|&done| done) {
            break;
        }
        let disk_index = (candidate % num_disks as u64) as usize;
        if disk_scan_done[disk_index] {
            continue;
        }
        let candidate = candidate as SegmentId;
        let offset = segment_offset(candidate, num_disks, segment_size);
        if offset + segment_size as u64 > file_sizes[disk_index] {
            disk_scan_done[disk_index] = true;
            continue;
        }
        // Already absorbed into a chain found earlier in the scan.
        if !allocator.is_free(candidate) {
            continue;
        }

        if read_segment(&mut files[disk_index], offset, &mut block).is_err() {
            // Truncated at a head boundary: end of this disk's scan.
            disk_scan_done[disk_index] = true;
            continue;
        }
        let head = SegmentHeader::read_from(&block);
        // Tombstoned head, or a mid-chain segment of a chain whose head
        // comes later in the scan.
        if head.bundle_size == NOT_A_HEAD {
            continue;
        }
        let Some(primary) = PrimaryBlock::decode(&block[SEGMENT_RESERVED_BYTES..]) else {
            continue;
        };
        let Some(priority) = primary.priority() else {
            continue;
        };

        let bundle_size = head.bundle_size;
        let total_segments = bundle_size.div_ceil(payload_per_segment) as usize;
        if total_segments == 0 {
            continue;
        }

        let mut segments: Vec<SegmentId> = Vec::with_capacity(total_segments);
        if allocator.allocate_specific(candidate).is_err() {
            tracing::error!(segment = candidate as u64, "head segment vanished from the free map; aborting restore");
            return None;
        }
        segments.push(candidate);
        let mut next_segment = head.next_segment;

        for _ in 1..total_segments {
            if next_segment == SEGMENT_CHAIN_END {
                tracing::error!(
                    head = candidate as u64,
                    expected = total_segments,
                    walked = segments.len(),
                    "chain ended before its expected segment count; aborting restore"
                );
                return None;
            }
            let id = next_segment;
            if id as u64 >= max_segments || !allocator.is_free(id) {
                tracing::error!(
                    segment = id as u64,
                    "chain points at an out-of-range or already-claimed segment; aborting restore"
                );
                return None;
            }
            let disk = id as usize % num_disks;
            let offset = segment_offset(id, num_disks, segment_size);
            if read_segment(&mut files[disk], offset, &mut block).is_err() {
                tracing::error!(
                    segment = id as u64,
                    disk,
                    "short read inside a chain walk; aborting restore"
                );
                return None;
            }
            if allocator.allocate_specific(id).is_err() {
                tracing::error!(segment = id as u64, "segment claimed twice; aborting restore");
                return None;
            }
            segments.push(id);
            next_segment = SegmentHeader::read_from(&block).next_segment;
        }

        if next_segment != SEGMENT_CHAIN_END {
            tracing::error!(
                head = candidate as u64,
                "last segment of chain missing the end-of-chain sentinel; aborting restore"
            );
            return None;
        }

        catalog.insert(CatalogEntry {
            bundle_size,
            segments,
            dest: primary.dest,
            priority,
            expiration: primary.expiration(),
        });
        stats.bundles_restored += 1;
        stats.bytes_restored += bundle_size;
        stats.segments_restored += total_segments as u64;
    }

    tracing::info!(
        bundles = stats.bundles_restored,
        bytes = stats.bytes_restored,
        segments = stats.segments_restored,
        "restore scan complete"
    );
    Some(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config_for(paths: Vec<PathBuf>) -> StorageConfig {
        StorageConfig {
            storage_disks: paths,
            total_capacity_bytes: 4096 * 64,
            try_restore_from_disk: true,
            auto_delete_files_on_exit: false,
            segment_size_multiple_of_4kb: 1,
        }
    }

    #[test]
    fn test_missing_file_fails_restore() {
        let dir = TempDir::new().unwrap();
        let config = config_for(vec![dir.path().join("absent.bin")]);
        let allocator = SegmentAllocator::new(config.max_segments());
        let mut catalog = BundleCatalog::new();
        assert!(restore_from_disk(&config, &allocator, &mut catalog).is_none());
    }

    #[test]
    fn test_empty_files_restore_nothing() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = (0..2).map(|i| dir.path().join(format!("s{i}.bin"))).collect();
        for path in &paths {
            std::fs::File::create(path).unwrap();
        }
        let config = config_for(paths);
        let allocator = SegmentAllocator::new(config.max_segments());
        let mut catalog = BundleCatalog::new();
        let stats = restore_from_disk(&config, &allocator, &mut catalog).unwrap();
        assert_eq!(stats, RestoreStats::default());
        assert!(catalog.is_empty());
        assert_eq!(allocator.free_count(), config.max_segments());
    }
}
