//! Error type returned by the log engine.

use std::io;

use crate::config::ConfigError;
use crate::layout::{LogEntryError, MetadataError};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine and its public log API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No free physical segment is left.
    #[error("no free segment left on the device")]
    OutOfSpace,
    /// Every metadata slot is taken.
    #[error("metadata table is full ({0} logs)")]
    TooManyLogs(usize),
    /// The requested index or log has no backing storage.
    #[error("not found: {0}")]
    NotFound(String),
    /// The requested index or address lies outside the valid range.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// The device reported a failed completion.
    #[error("device error ({kind:?}): {message}")]
    Device {
        /// I/O error category.
        kind: io::ErrorKind,
        /// Device-supplied detail.
        message: String,
    },
    /// The engine no longer accepts requests.
    #[error("engine is shutting down")]
    ShuttingDown,
    /// A write is already in flight for this log and the busy policy is fail-fast.
    #[error("log {0} has a write in flight")]
    Busy(u32),
    /// Caller-supplied arguments violate a precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The persisted metadata table failed validation.
    #[error("metadata corruption: {0}")]
    Corruption(String),
    /// Device enumeration attached no controller.
    #[error("no controller attached")]
    NoController,
    /// The attached namespace cannot host the on-device layout.
    #[error("invalid device geometry: {0}")]
    InvalidGeometry(String),
    /// The configuration could not be loaded or applied.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub(crate) fn out_of_range(message: impl Into<String>) -> Self {
        Error::OutOfRange(message.into())
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        Error::Corruption(message.into())
    }

    /// Whether the error came from a device completion.
    pub fn is_device_error(&self) -> bool {
        matches!(self, Error::Device { .. })
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Device {
            kind: value.kind(),
            message: value.to_string(),
        }
    }
}

impl From<MetadataError> for Error {
    fn from(value: MetadataError) -> Self {
        match value {
            MetadataError::InvalidName | MetadataError::NameTooLong(_) => {
                Error::InvalidArgument(value.to_string())
            }
            other => Error::Corruption(other.to_string()),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(value: ConfigError) -> Self {
        Error::Config(value.to_string())
    }
}

impl From<LogEntryError> for Error {
    fn from(value: LogEntryError) -> Self {
        Error::Corruption(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_maps_to_device() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "controller reset").into();
        assert!(err.is_device_error());
        assert!(err.to_string().contains("controller reset"));
    }

    #[test]
    fn test_metadata_error_mapping() {
        let err: Error = MetadataError::NameTooLong(300).into();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err: Error = MetadataError::ChecksumMismatch.into();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
