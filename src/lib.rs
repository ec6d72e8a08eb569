//! nvlog - An append-only multi-log engine over raw block namespaces
//!
//! Up to 1024 named logs share one namespace. Each log addresses two
//! private virtual spaces, one for its 64-byte entry records and one for
//! payloads, backed on demand by 64 MiB segments. A global metadata table
//! in the first segment maps virtual segments to physical ones and records
//! each log's head, tail and version.
//!
//! # Features
//!
//! - Atomic multi-part appends: payload and entry land first, then the
//!   metadata commit publishes the new tail and version
//! - Crash consistency: a log recovers to its last completed metadata commit
//! - Dedicated worker threads owning device queue pairs, with a single
//!   metadata worker keeping commits ordered
//! - Synchronous and asynchronous durability modes
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nvlog::prelude::*;
//!
//! let namespace = Arc::new(MemNamespace::new(4 * SEGMENT_SIZE));
//! let driver = LocalDriver::single("mem0", namespace);
//! let engine = LogEngine::init(&driver, EngineConfig::default())?;
//!
//! let log = engine.load("orders")?;
//! let request = AppendRequest::at_tail(&log.metadata, b"hello".to_vec(), 0, 1);
//! engine.append(log.id, request, Durability::Sync)?;
//! assert_eq!(engine.read_data(log.id, 0)?, b"hello");
//! ```

#![warn(missing_docs)]

mod allocator;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
mod io;
pub mod layout;
mod registry;

pub use config::{BusyPolicy, ConfigError, EngineConfig, NvlogConfig};
pub use engine::{AppendRequest, Durability, EngineStats, LoadOutcome, LogEngine, LogHandle};
pub use error::{Error, Result};
pub use io::WorkerStatsSnapshot;
pub use layout::{LogEntry, LogMetadataInfo};

/// Utility for size literals
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::{BusyPolicy, EngineConfig};
    pub use crate::device::{FileNamespace, LocalDriver, MemNamespace, StorageDevice};
    pub use crate::engine::{AppendRequest, Durability, LogEngine, LogHandle};
    pub use crate::error::{Error, Result};
    pub use crate::layout::{LogEntry, LogMetadataInfo, SEGMENT_SIZE};
}
