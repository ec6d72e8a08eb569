//! On-device layout of the global metadata table and log-entry records.
//!
//! All structures are encoded explicitly into little-endian byte buffers, so
//! the layout does not depend on Rust's memory layout rules.
//!
//! ```text
//! segment 0: global metadata table
//! | slot 0 (32 KiB) | slot 1 | ... | slot 1023 | unused |
//!
//! slot:
//! | log-entry table 2048 x u16 | data table 12288 x u16 | info page (4 KiB) |
//! ```

mod entry;
mod metadata;

pub use entry::{LogEntry, LogEntryError};
pub use metadata::{AddressTable, LogMetadataInfo, MetadataError, SegmentSpace};

/// Number of logs supported by the metadata table.
pub const NUM_LOGS_SUPPORTED: usize = 1 << 10;

/// Shift of the physical segment size.
pub const SEGMENT_BIT: u32 = 26;

/// Physical segment size (64 MiB).
pub const SEGMENT_SIZE: u64 = 1 << SEGMENT_BIT;

/// Length of the log-entry address translation table.
pub const LOG_ENTRY_TABLE_LEN: usize = 1 << 11;

/// Length of the payload address translation table.
pub const DATA_TABLE_LEN: usize = 3 * (1 << 12);

/// Size of one metadata slot.
pub const LOG_METADATA_SIZE: u64 = 1 << 15;

/// Size of the info page at the end of a slot.
pub const METADATA_INFO_SIZE: usize = 4096;

/// Size of the address-translation part of a slot.
pub const METADATA_ADDRESS_SIZE: usize = (LOG_ENTRY_TABLE_LEN + DATA_TABLE_LEN) * 2;

/// Size of the whole metadata table.
pub const METADATA_TABLE_SIZE: u64 = NUM_LOGS_SUPPORTED as u64 * LOG_METADATA_SIZE;

/// Segments reserved at the start of the device for the metadata table.
pub const RESERVED_SEGMENTS: u16 = METADATA_TABLE_SIZE.div_ceil(SEGMENT_SIZE) as u16;

/// Addressable space shared out between logs.
pub const LOG_ADDRESS_SPACE: u64 = (1 << (SEGMENT_BIT + 11)) >> 6;

/// Upper bound on tracked segments: the per-log share of the addressable
/// space minus a reserved margin, capped by the u16 segment id width.
pub const MAX_SEGMENTS: usize = {
    let derived = (LOG_ADDRESS_SPACE / NUM_LOGS_SUPPORTED as u64) as usize - 256;
    let id_limit = u16::MAX as usize + 1;
    if derived < id_limit {
        derived
    } else {
        id_limit
    }
};

/// Size of one log-entry record.
pub const LOG_ENTRY_SIZE: u64 = 64;

/// Version value meaning "nothing committed yet".
pub const INVALID_VERSION: i64 = -1;

/// Maximum name length in bytes (the field keeps a NUL terminator).
pub const MAX_NAME_LEN: usize = 255;

const _: () = assert!(METADATA_ADDRESS_SIZE + METADATA_INFO_SIZE == LOG_METADATA_SIZE as usize);

/// Physical segment identifier.
pub type SegmentId = u16;

/// Device byte offset of the first byte of a metadata slot.
#[inline]
pub const fn slot_offset(slot: usize) -> u64 {
    slot as u64 * LOG_METADATA_SIZE
}

/// Device byte offset of a slot's info page.
#[inline]
pub const fn info_page_offset(slot: usize) -> u64 {
    slot_offset(slot) + METADATA_ADDRESS_SIZE as u64
}

/// Device byte offset of a physical segment.
#[inline]
pub const fn segment_offset(segment: SegmentId) -> u64 {
    (segment as u64) << SEGMENT_BIT
}

/// Virtual bytes addressable in a space.
#[inline]
pub const fn space_size(space: SegmentSpace) -> u64 {
    match space {
        SegmentSpace::LogEntry => LOG_ENTRY_TABLE_LEN as u64 * SEGMENT_SIZE,
        SegmentSpace::Data => DATA_TABLE_LEN as u64 * SEGMENT_SIZE,
    }
}
