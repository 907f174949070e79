//! Storage engine configuration.
//!
//! Loaded from JSON, mirroring the operator-facing field names:
//!
//! ```json
//! {
//!   "storage_disks": ["/mnt/sda1/store0.bin", "/mnt/sdb1/store1.bin"],
//!   "total_capacity_bytes": 8192000,
//!   "try_restore_from_disk": false,
//!   "auto_delete_files_on_exit": true,
//!   "segment_size_multiple_of_4kb": 1
//! }
//! ```

use crate::error::{Result, StoreError};
use crate::segment::{SegmentId, SEGMENT_ALIGNMENT, SEGMENT_RESERVED_BYTES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_segment_multiple() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// One flat file per disk; the list length is the disk count.
    pub storage_disks: Vec<PathBuf>,

    /// Upper bound on total engine size. Allocator capacity is
    /// `total_capacity_bytes / segment_size`.
    pub total_capacity_bytes: u64,

    /// Read existing files at startup and repopulate the catalog.
    #[serde(default)]
    pub try_restore_from_disk: bool,

    /// Unlink the disk files on shutdown.
    #[serde(default)]
    pub auto_delete_files_on_exit: bool,

    /// `SEGMENT_SIZE = 4096 * this`.
    #[serde(default = "default_segment_multiple")]
    pub segment_size_multiple_of_4kb: u32,
}

impl StorageConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn num_disks(&self) -> usize {
        self.storage_disks.len()
    }

    pub fn segment_size(&self) -> usize {
        SEGMENT_ALIGNMENT * self.segment_size_multiple_of_4kb as usize
    }

    /// Bundle payload bytes stored per segment.
    pub fn payload_per_segment(&self) -> usize {
        self.segment_size() - SEGMENT_RESERVED_BYTES
    }

    /// Allocator capacity in segments.
    pub fn max_segments(&self) -> u64 {
        self.total_capacity_bytes / self.segment_size() as u64
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.storage_disks.is_empty() {
            return Err(StoreError::InvalidConfig(
                "storage_disks must list at least one file".into(),
            ));
        }
        if self.segment_size_multiple_of_4kb == 0 {
            return Err(StoreError::InvalidConfig(
                "segment_size_multiple_of_4kb must be positive".into(),
            ));
        }
        if self.max_segments() == 0 {
            return Err(StoreError::InvalidConfig(format!(
                "total_capacity_bytes {} is below one segment of {} bytes",
                self.total_capacity_bytes,
                self.segment_size()
            )));
        }
        // Sentinel ids must never be producible by the allocator.
        if self.max_segments() >= SegmentId::MAX as u64 {
            return Err(StoreError::InvalidConfig(format!(
                "capacity of {} segments would collide with the segment id sentinel",
                self.max_segments()
            )));
        }
        Ok(())
    }
}
