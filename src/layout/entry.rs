//! Fixed-size log-entry records.

use std::fmt;

use super::LOG_ENTRY_SIZE;

/// Errors related to log entry parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntryError {
    /// Buffer shorter than one record.
    BufferTooSmall,
}

impl fmt::Display for LogEntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntryError::BufferTooSmall => write!(f, "entry buffer too small"),
        }
    }
}

impl std::error::Error for LogEntryError {}

/// One appended item, as stored in a log's log-entry space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogEntry {
    /// Version of the data; matches the metadata version it belongs to.
    pub version: i64,
    /// Length of the payload in bytes.
    pub data_len: u64,
    /// Offset of the payload in the log's virtual data space.
    pub data_offset: u64,
    /// Realtime component of the hybrid logical clock.
    pub hlc_realtime: u64,
    /// Logical component of the hybrid logical clock.
    pub hlc_logical: u64,
}

impl LogEntry {
    /// Encoded size in bytes.
    pub const SIZE: usize = LOG_ENTRY_SIZE as usize;

    /// Create an entry without timestamp.
    pub fn new(version: i64, data_offset: u64, data_len: u64) -> Self {
        Self {
            version,
            data_len,
            data_offset,
            hlc_realtime: 0,
            hlc_logical: 0,
        }
    }

    /// Attach a hybrid logical clock timestamp.
    pub fn with_hlc(mut self, realtime: u64, logical: u64) -> Self {
        self.hlc_realtime = realtime;
        self.hlc_logical = logical;
        self
    }

    /// Write the 64-byte little-endian record into `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), LogEntryError> {
        if buf.len() < Self::SIZE {
            return Err(LogEntryError::BufferTooSmall);
        }
        buf[..Self::SIZE].fill(0);
        buf[0..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.data_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.hlc_realtime.to_le_bytes());
        buf[32..40].copy_from_slice(&self.hlc_logical.to_le_bytes());
        Ok(())
    }

    /// Read a record from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, LogEntryError> {
        if buf.len() < Self::SIZE {
            return Err(LogEntryError::BufferTooSmall);
        }
        Ok(Self {
            version: i64::from_le_bytes(le8(&buf[0..8])),
            data_len: u64::from_le_bytes(le8(&buf[8..16])),
            data_offset: u64::from_le_bytes(le8(&buf[16..24])),
            hlc_realtime: u64::from_le_bytes(le8(&buf[24..32])),
            hlc_logical: u64::from_le_bytes(le8(&buf[32..40])),
        })
    }

    /// Byte offset of this entry's payload end in the data space.
    pub fn data_end(&self) -> u64 {
        self.data_offset + self.data_len
    }
}

pub(super) fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}
