//! Per-disk I/O workers.
//!
//! One worker thread per storage disk, each owning that disk's flat
//! file. Requests flow through a single-producer/single-consumer index
//! ring ([`crate::ring::IndexRing`]); the slot payloads are staged next
//! to the ring. Within one disk, requests retire strictly in issue
//! order; across disks there is no ordering and callers synchronise on
//! per-segment completion flags instead.
//!
//! All blocking is a bounded 10 ms condition-variable wait with
//! re-check, so a stalled worker shows up as latency, never as a hang.

use crate::error::Result;
use crate::ring::{IndexRing, RING_DEPTH};
use crate::segment::{segment_offset, SegmentId};
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Bounded wait used everywhere a thread parks.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

/// Destination of one segment read. The reading session owns one slot
/// per prefetch position; the worker holds a second reference while the
/// read is in flight.
pub struct ReadSlot {
    pub data: Mutex<Vec<u8>>,
    ready: AtomicBool,
    failed: AtomicBool,
}

impl ReadSlot {
    pub fn new(segment_size: usize) -> Self {
        ReadSlot {
            data: Mutex::new(vec![0u8; segment_size]),
            ready: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// Re-arm before reuse for the next prefetched segment.
    pub fn reset(&self) {
        self.failed.store(false, Ordering::Relaxed);
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// One queued disk operation.
pub enum DiskRequest {
    /// Store a fully staged segment block (reserved header + payload).
    Write {
        segment_id: SegmentId,
        block: Box<[u8]>,
    },
    /// Load a segment into the caller's slot and flag completion.
    Read {
        segment_id: SegmentId,
        slot: Arc<ReadSlot>,
    },
}

impl DiskRequest {
    fn segment_id(&self) -> SegmentId {
        match self {
            DiskRequest::Write { segment_id, .. } | DiskRequest::Read { segment_id, .. } => {
                *segment_id
            }
        }
    }
}

/// Caller-side wakeup: workers signal here after freeing a ring slot
/// and after completing a read.
struct CompletionSignal {
    lock: Mutex<()>,
    cv: Condvar,
}

impl CompletionSignal {
    fn new() -> Self {
        CompletionSignal {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    fn notify(&self) {
        self.cv.notify_all();
    }

    fn wait_brief(&self) {
        let mut guard = self.lock.lock();
        self.cv.wait_for(&mut guard, PARK_TIMEOUT);
    }
}

/// State shared between the caller and one disk's worker.
struct DiskChannel {
    ring: IndexRing,
    slots: Vec<Mutex<Option<DiskRequest>>>,
    /// Serialises application threads into the ring's single-producer
    /// side. The worker is the lone consumer.
    producer_lock: Mutex<()>,
    stop: AtomicBool,
    work_lock: Mutex<()>,
    work_cv: Condvar,
}

impl DiskChannel {
    fn new() -> Self {
        DiskChannel {
            ring: IndexRing::new(RING_DEPTH),
            slots: (0..RING_DEPTH).map(|_| Mutex::new(None)).collect(),
            producer_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
            work_lock: Mutex::new(()),
            work_cv: Condvar::new(),
        }
    }

    fn wake_worker(&self) {
        self.work_cv.notify_one();
    }

    fn park_worker(&self) {
        let mut guard = self.work_lock.lock();
        self.work_cv.wait_for(&mut guard, PARK_TIMEOUT);
    }
}

/// The per-disk worker pool behind the storage manager.
pub struct DiskIoPipeline {
    channels: Vec<Arc<DiskChannel>>,
    workers: Vec<thread::JoinHandle<()>>,
    signal: Arc<CompletionSignal>,
    paths: Vec<PathBuf>,
    num_disks: usize,
    delete_files_on_stop: bool,
    stopped: bool,
}

impl DiskIoPipeline {
    /// Open every disk file and spawn one worker per disk.
    ///
    /// `truncate` clears existing files (fresh start); a restored or
    /// forensically preserved store opens without truncation.
    pub fn start(
        paths: Vec<PathBuf>,
        segment_size: usize,
        truncate: bool,
        delete_files_on_stop: bool,
    ) -> Result<Self> {
        let num_disks = paths.len();
        let signal = Arc::new(CompletionSignal::new());
        let mut channels = Vec::with_capacity(num_disks);
        let mut workers = Vec::with_capacity(num_disks);

        // Open every file before spawning anything so a bad path fails
        // the whole startup cleanly.
        let mut files = Vec::with_capacity(num_disks);
        for path in &paths {
            files.push(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(truncate)
                    .open(path)?,
            );
        }

        for (disk_index, file) in files.into_iter().enumerate() {
            let channel = Arc::new(DiskChannel::new());
            channels.push(Arc::clone(&channel));

            let signal = Arc::clone(&signal);
            let handle = thread::Builder::new()
                .name(format!("bundlestore-disk-{disk_index}"))
                .spawn(move || {
                    worker_loop(disk_index, file, num_disks, segment_size, channel, signal)
                })?;
            workers.push(handle);
        }

        Ok(DiskIoPipeline {
            channels,
            workers,
            signal,
            paths,
            num_disks,
            delete_files_on_stop,
            stopped: false,
        })
    }

    pub fn num_disks(&self) -> usize {
        self.num_disks
    }

    /// Queue a request on the disk its segment stripes to, blocking in
    /// bounded waits while that disk's ring is full.
    pub fn submit(&self, request: DiskRequest) {
        let disk_index = request.segment_id() as usize % self.num_disks;
        let channel = &self.channels[disk_index];
        let mut request = Some(request);
        loop {
            {
                let _producer = channel.producer_lock.lock();
                if let Some(slot_index) = channel.ring.write_index() {
                    *channel.slots[slot_index].lock() = request.take();
                    channel.ring.commit_write();
                    channel.wake_worker();
                    return;
                }
            }
            self.signal.wait_brief();
        }
    }

    /// Bounded wait for any completion or freed ring slot.
    pub fn wait_brief(&self) {
        self.signal.wait_brief();
    }

    /// Drain every ring, join the workers, and release (optionally
    /// unlink) the disk files. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        for channel in &self.channels {
            channel.stop.store(true, Ordering::Release);
            channel.wake_worker();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        if self.delete_files_on_stop {
            for path in &self.paths {
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::info!(path = %path.display(), "deleted storage file"),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to delete storage file")
                    }
                }
            }
        }
    }
}

impl Drop for DiskIoPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    disk_index: usize,
    mut file: File,
    num_disks: usize,
    segment_size: usize,
    channel: Arc<DiskChannel>,
    signal: Arc<CompletionSignal>,
) {
    loop {
        let Some(slot_index) = channel.ring.read_index() else {
            // Stop only once the ring has drained: in-flight writes
            // must land or restart would see torn chains.
            if channel.stop.load(Ordering::Acquire) {
                break;
            }
            channel.park_worker();
            continue;
        };

        let request = channel.slots[slot_index].lock().take();
        channel.ring.commit_read();
        signal.notify();
        let Some(request) = request else { continue };

        match request {
            DiskRequest::Write { segment_id, block } => {
                let offset = segment_offset(segment_id, num_disks, segment_size);
                let outcome = file
                    .seek(SeekFrom::Start(offset))
                    .and_then(|_| file.write_all(&block));
                if let Err(e) = outcome {
                    tracing::error!(
                        disk = disk_index,
                        segment = segment_id as u64,
                        offset,
                        error = %e,
                        "segment write failed"
                    );
                }
            }
            DiskRequest::Read { segment_id, slot } => {
                let offset = segment_offset(segment_id, num_disks, segment_size);
                {
                    let mut data = slot.data.lock();
                    let outcome = file
                        .seek(SeekFrom::Start(offset))
                        .and_then(|_| file.read_exact(data.as_mut_slice()));
                    if let Err(e) = outcome {
                        tracing::error!(
                            disk = disk_index,
                            segment = segment_id as u64,
                            offset,
                            error = %e,
                            "segment read failed"
                        );
                        slot.failed.store(true, Ordering::Relaxed);
                    }
                }
                slot.ready.store(true, Ordering::Release);
                signal.notify();
            }
        }
    }
}
