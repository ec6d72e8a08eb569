//! The log engine
//!
//! [`LogEngine`] owns everything that touches the device: the attached
//! controller, the metadata table image, the segment usage table, and the
//! worker threads with their queue pairs. It is created once with
//! [`LogEngine::init`] and torn down with [`LogEngine::shutdown`] (or drop).
//!
//! # Write path
//!
//! ```text
//! append ──► payload + entry sub-requests ──► io queue ──► io workers
//!                                                             │
//!                              last completion (barrier) ◄────┘
//!                                         │
//!            dirty address sectors ──► metadata queue ──► metadata worker
//!                                         │
//!                                 info page (commit point)
//!                                         │
//!                   last_written_ver raised, caller notified
//! ```

mod append;
mod commit;
mod load;
mod read;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::allocator::SegmentAllocator;
use crate::config::EngineConfig;
use crate::device::{
    Controller, ControllerOptions, ControllerSelector, DeviceGeometry, Driver, QueuePair,
    StorageDevice,
};
use crate::error::{Error, Result};
use crate::io::{RequestQueue, Worker, WorkerStats, WorkerStatsSnapshot};
use crate::layout::{LogEntry, LogMetadataInfo, LOG_ENTRY_SIZE};
use crate::registry::LogRegistry;

/// When a write call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Return once the metadata commit completed (or failed).
    Sync,
    /// Return once the sub-requests are queued; observe completion through
    /// [`LogEngine::last_written_ver`] and [`LogEngine::take_write_error`].
    Async,
}

/// Result of reading the metadata table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The table was read from the device.
    Loaded {
        /// In-use slots found.
        logs: usize,
    },
    /// The table was already read by this engine; nothing was done.
    AlreadyLoaded,
}

/// An opened log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHandle {
    /// Stable log id (the metadata slot index).
    pub id: u32,
    /// Committed metadata at open time.
    pub metadata: LogMetadataInfo,
    /// Whether the log was created by this call.
    pub created: bool,
}

/// One append: the payload, its log entry, and the metadata it commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    /// Payload bytes; `entry.data_len` must match.
    pub data: Vec<u8>,
    /// Entry record written at `log_offset`.
    pub entry: LogEntry,
    /// Byte offset of the entry in the log-entry space (a multiple of 64).
    pub log_offset: u64,
    /// Metadata committed once the payload and entry are on the device.
    pub metadata: LogMetadataInfo,
}

impl AppendRequest {
    /// Append `data` as the entry at `committed.tail`, storing the payload
    /// at `data_offset` and committing `version`.
    pub fn at_tail(
        committed: &LogMetadataInfo,
        data: Vec<u8>,
        data_offset: u64,
        version: i64,
    ) -> Self {
        let entry = LogEntry::new(version, data_offset, data.len() as u64);
        let mut metadata = committed.clone();
        metadata.tail = committed.tail + 1;
        metadata.version = version;
        Self {
            data,
            entry,
            log_offset: committed.tail as u64 * LOG_ENTRY_SIZE,
            metadata,
        }
    }

    /// Attach a hybrid logical clock timestamp to the entry.
    pub fn with_hlc(mut self, realtime: u64, logical: u64) -> Self {
        self.entry = self.entry.with_hlc(realtime, logical);
        self
    }
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// One entry per data/log worker.
    pub io_workers: Vec<WorkerStatsSnapshot>,
    /// The metadata worker.
    pub metadata_worker: WorkerStatsSnapshot,
    /// Segments tracked, metadata segments included.
    pub total_segments: usize,
    /// Segments not assigned to any log.
    pub free_segments: usize,
    /// In-use metadata slots.
    pub logs: usize,
}

impl EngineStats {
    /// Completed commands across all workers.
    pub fn completed(&self) -> u64 {
        self.io_workers.iter().map(|w| w.completed).sum::<u64>() + self.metadata_worker.completed
    }
}

/// State shared between caller threads and completion callbacks.
pub(crate) struct EngineShared {
    geometry: DeviceGeometry,
    config: EngineConfig,
    allocator: SegmentAllocator,
    registry: LogRegistry,
    io_queue: Arc<RequestQueue>,
    meta_queue: Arc<RequestQueue>,
    shutting_down: AtomicBool,
}

impl EngineShared {
    fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }
}

/// Append-only multi-log engine over one attached namespace.
pub struct LogEngine<D: StorageDevice> {
    shared: Arc<EngineShared>,
    io_workers: Mutex<Vec<Worker>>,
    meta_worker: Mutex<Option<Worker>>,
    io_stats: Vec<Arc<WorkerStats>>,
    meta_stats: Arc<WorkerStats>,
    controller: Mutex<Option<Controller<D>>>,
}

impl<D: StorageDevice> LogEngine<D> {
    /// Attach a controller through `driver` and start the workers.
    ///
    /// Fails with [`Error::NoController`] when enumeration attaches nothing.
    pub fn init(driver: &dyn Driver<D>, config: EngineConfig) -> Result<Self> {
        if config.io_threads == 0 {
            return Err(Error::invalid("io_threads must be at least 1"));
        }
        if config.queue_pair_requests == 0 {
            return Err(Error::invalid("queue_pair_requests must be at least 1"));
        }

        let requested = ControllerOptions {
            num_io_queues: (config.io_threads + 1) as u32,
            io_queue_size: config.queue_pair_requests as u32,
            io_queue_requests: config.queue_pair_requests as u32,
        };
        let mut selector = ControllerSelector::new(config.controller_address.clone(), requested);
        driver.enumerate(&mut selector);
        let Some((controller, opts)) = selector.into_attached() else {
            error!(filter = ?config.controller_address, "no controller attached");
            return Err(Error::NoController);
        };

        let namespace = Arc::clone(controller.namespace());
        let ns: &D = &namespace;
        let max_transfer = match config.max_io_bytes {
            Some(cap) => cap.min(controller.max_transfer_size()),
            None => controller.max_transfer_size(),
        };
        let geometry = DeviceGeometry::new(ns.sector_size(), max_transfer, ns.capacity())?;

        let io_threads = config
            .io_threads
            .min((opts.num_io_queues.saturating_sub(1) as usize).max(1));
        let depth = (opts.io_queue_requests as usize).max(1);
        let idle_poll = config.idle_poll.max(Duration::from_millis(1));

        let shared = Arc::new(EngineShared {
            geometry,
            allocator: SegmentAllocator::new(geometry.segment_count()),
            registry: LogRegistry::new(),
            io_queue: Arc::new(RequestQueue::new("io")),
            meta_queue: Arc::new(RequestQueue::new("metadata")),
            shutting_down: AtomicBool::new(false),
            config,
        });

        let engine = Self {
            shared,
            io_workers: Mutex::new(Vec::with_capacity(io_threads)),
            meta_worker: Mutex::new(None),
            io_stats: (0..io_threads)
                .map(|_| Arc::new(WorkerStats::default()))
                .collect(),
            meta_stats: Arc::new(WorkerStats::default()),
            controller: Mutex::new(Some(controller)),
        };

        // A failure here drops the engine, which stops whatever was started.
        for (i, stats) in engine.io_stats.iter().enumerate() {
            let qpair = QueuePair::new(Arc::clone(&namespace), geometry, depth)?;
            let worker = Worker::spawn(
                format!("nvlog-io-{i}"),
                Arc::clone(&engine.shared.io_queue),
                qpair,
                Arc::clone(stats),
                idle_poll,
            )?;
            engine.io_workers.lock().push(worker);
        }
        let qpair = QueuePair::new(Arc::clone(&namespace), geometry, depth)?;
        let worker = Worker::spawn(
            "nvlog-meta".to_string(),
            Arc::clone(&engine.shared.meta_queue),
            qpair,
            Arc::clone(&engine.meta_stats),
            idle_poll,
        )?;
        *engine.meta_worker.lock() = Some(worker);

        info!(
            capacity = geometry.capacity(),
            sector_size = geometry.sector_size(),
            max_io_bytes = geometry.max_io_bytes(),
            segments = geometry.segment_count(),
            io_threads,
            "log engine started"
        );
        Ok(engine)
    }

    /// Geometry of the attached namespace.
    pub fn geometry(&self) -> DeviceGeometry {
        self.shared.geometry
    }

    /// Configuration the engine was started with.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// True once [`shutdown`](Self::shutdown) has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Highest version whose metadata commit completed, or `-1`.
    pub fn last_written_ver(&self, id: u32) -> Result<i64> {
        Ok(self.shared.registry.slot(id)?.last_written())
    }

    /// Take the error recorded by the last failed write of a log.
    pub fn take_write_error(&self, id: u32) -> Result<Option<Error>> {
        Ok(self.shared.registry.slot(id)?.take_error())
    }

    /// Block until `version` of log `id` is committed.
    ///
    /// Returns `Ok(false)` on timeout, and the recorded write error if one
    /// is pending (see [`LogEngine::take_write_error`]).
    pub fn wait_for_version(&self, id: u32, version: i64, timeout: Duration) -> Result<bool> {
        let slot = self.shared.registry.opened(id)?;
        let deadline = Instant::now() + timeout;
        slot.pending.wait_until(deadline, || {
            slot.last_written() >= version || slot.peek_error().is_some()
        });
        if slot.last_written() >= version {
            return Ok(true);
        }
        match slot.peek_error() {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }

    /// Committed metadata of a log.
    pub fn log_metadata(&self, id: u32) -> Result<LogMetadataInfo> {
        self.shared
            .registry
            .slot(id)?
            .info()
            .ok_or_else(|| Error::not_found(format!("log id {id} is not in use")))
    }

    /// Snapshot of engine and worker counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            io_workers: self.io_stats.iter().map(|s| s.snapshot()).collect(),
            metadata_worker: self.meta_stats.snapshot(),
            total_segments: self.shared.allocator.total(),
            free_segments: self.shared.allocator.free_count(),
            logs: self.shared.registry.len(),
        }
    }

    /// Stop accepting requests, drain in-flight work and release the device.
    ///
    /// Io workers are drained first since their completions may still queue
    /// metadata commits. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);

        let io_workers = std::mem::take(&mut *self.io_workers.lock());
        let meta_worker = self.meta_worker.lock().take();
        if io_workers.is_empty() && meta_worker.is_none() {
            return;
        }

        let outstanding: u64 = self.io_stats.iter().map(|s| s.outstanding()).sum();
        info!(
            outstanding,
            queued = self.shared.io_queue.len(),
            "shutting down log engine"
        );

        self.shared.io_queue.close(io_workers.len());
        for worker in io_workers {
            worker.join();
        }

        self.shared.meta_queue.close(1);
        if let Some(worker) = meta_worker {
            worker.join();
        }

        if let Some(controller) = self.controller.lock().take() {
            info!(trid = %controller.transport(), "controller released");
        }
    }
}

impl<D: StorageDevice> Drop for LogEngine<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
