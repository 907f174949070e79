//! Bundlestore: persistent bundle storage for DTN routers
//!
//! `bundlestore` durably buffers delay-tolerant networking bundles
//! across multiple local disks between a router's ingress and egress
//! paths. Bundles arrive faster than downstream contacts can drain
//! them; the engine stripes each bundle over fixed-size segments,
//! indexes it by destination, priority, and expiration, and survives
//! process restart by rebuilding all state from the raw disk files.
//!
//! ## Features
//!
//! - **Fixed-size segments** (4 KB multiples) so every write is
//!   filesystem-block aligned and header writes can never tear
//! - **Multi-disk striping**: consecutive segments of a chain land on
//!   consecutive disks, one I/O worker thread per disk
//! - **Summary-tree allocator**: O(depth) allocation over hundreds of
//!   millions of segments, lowest-numbered-first
//! - **Priority/expiration catalog**: egress pops the most urgent
//!   bundle among its currently reachable destinations
//! - **Crash-consistent restore**: catalog and allocator rebuild from
//!   segment headers alone; deletion tombstones make removal durable
//!
//! ## Example
//!
//! ```rust,no_run
//! use bundlestore::{BundleStorageManager, Eid, PrimaryBlock, Priority, StorageConfig};
//!
//! # fn main() -> bundlestore::Result<()> {
//! let config = StorageConfig::from_json_str(r#"{
//!     "storage_disks": ["/mnt/sda1/store0.bin", "/mnt/sdb1/store1.bin"],
//!     "total_capacity_bytes": 8192000
//! }"#)?;
//! let engine = BundleStorageManager::open(config)?;
//!
//! // Ingress: admit a bundle.
//! let bundle = vec![0u8; 10_000];
//! let primary = PrimaryBlock::new(Eid::new(7, 1), Eid::new(100, 1), Priority::Normal, 0, 3600);
//! let mut write = engine.push_begin(&primary, bundle.len() as u64)?;
//! engine.push_all_segments(&mut write, &bundle)?;
//!
//! // Egress: destination 7 is reachable, send the best bundle.
//! if let Some(mut read) = engine.pop_top(&[7]) {
//!     let bytes = engine.read_all_segments(&mut read)?;
//!     // ... transmit ...
//!     engine.remove(&read, false)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │               BundleStorageManager                 │
//! │   Push / PopTop / ReturnTop / Read / Remove        │
//! ├──────────────┬──────────────────┬──────────────────┤
//! │  Segment     │  Bundle catalog  │  Restore         │
//! │  allocator   │  dest→pri→expiry │  (startup scan)  │
//! ├──────────────┴──────────────────┴──────────────────┤
//! │          Per-disk SPSC rings + worker threads      │
//! ├────────────┬────────────┬────────────┬─────────────┤
//! │ store0.bin │ store1.bin │ store2.bin │ store3.bin  │
//! │  segments  │  segments  │  segments  │  segments   │
//! │  0,4,8,…   │  1,5,9,…   │  2,6,10,…  │  3,7,11,…   │
//! └────────────┴────────────┴────────────┴─────────────┘
//! ```
//!
//! On disk, each file is a flat array of segments. A segment is a small
//! reserved header (bundle length + next-segment pointer) followed by a
//! payload slice; all-ones sentinels mark chain ends and deleted heads.

pub mod allocator;
pub mod bundle;
pub mod catalog;
pub mod config;
pub mod disk;
pub mod error;
pub mod manager;
mod restore;
pub mod ring;
pub mod segment;

pub use allocator::SegmentAllocator;
pub use bundle::{Eid, PrimaryBlock, Priority, NUM_PRIORITIES};
pub use catalog::{BundleCatalog, CatalogEntry};
pub use config::StorageConfig;
pub use error::{Result, StoreError};
pub use manager::{BundleStorageManager, ReadSession, WriteSession, READ_CACHE_DEPTH};
pub use restore::RestoreStats;
pub use segment::{
    SegmentId, NOT_A_HEAD, SEGMENT_CHAIN_END, SEGMENT_ID_BYTES, SEGMENT_RESERVED_BYTES,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
