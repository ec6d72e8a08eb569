//! Physical segment allocation
//!
//! The device is carved into fixed 64 MiB segments. Every segment past the
//! metadata table is handed out on demand to one log's log-entry or data
//! space and stays with that log for the life of the table.
//!
//! # Key Types
//!
//! - [`SegmentAllocator`]: global usage bitset, lowest free segment first

mod segment_allocator;

pub use segment_allocator::SegmentAllocator;
