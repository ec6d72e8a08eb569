//! Geometry of the attached namespace.

use crate::error::{Error, Result};
use crate::layout::{
    segment_offset, LOG_ENTRY_SIZE, MAX_SEGMENTS, METADATA_INFO_SIZE, RESERVED_SEGMENTS,
    SEGMENT_BIT,
};

/// Sector size, transfer limit and capacity of a namespace.
///
/// Every offset and length the engine submits is validated or rounded
/// against this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    sector_size: u32,
    sector_bit: u32,
    /// `offset & sector_mask` is the offset within its sector.
    sector_mask: u64,
    max_io_bytes: u32,
    capacity: u64,
}

impl DeviceGeometry {
    /// Derive geometry from namespace properties.
    ///
    /// `max_transfer` is rounded down to whole sectors.
    pub fn new(sector_size: usize, max_transfer: usize, capacity: u64) -> Result<Self> {
        if !sector_size.is_power_of_two()
            || (sector_size as u64) < LOG_ENTRY_SIZE
            || sector_size > METADATA_INFO_SIZE
        {
            return Err(Error::InvalidGeometry(format!(
                "unsupported sector size {sector_size}"
            )));
        }
        let max_io = max_transfer - max_transfer % sector_size;
        if max_io < METADATA_INFO_SIZE {
            return Err(Error::InvalidGeometry(format!(
                "max transfer size {max_transfer} is below {METADATA_INFO_SIZE} bytes"
            )));
        }
        let max_io = u32::try_from(max_io).unwrap_or(u32::MAX - (u32::MAX % sector_size as u32));
        let reserved_end = segment_offset(RESERVED_SEGMENTS);
        if capacity < reserved_end {
            return Err(Error::InvalidGeometry(format!(
                "capacity {capacity} cannot hold the metadata table ({reserved_end} bytes)"
            )));
        }

        Ok(Self {
            sector_size: sector_size as u32,
            sector_bit: sector_size.trailing_zeros(),
            sector_mask: sector_size as u64 - 1,
            max_io_bytes: max_io,
            capacity: capacity & !(sector_size as u64 - 1),
        })
    }

    #[inline]
    /// Logical block size in bytes.
    pub fn sector_size(&self) -> usize {
        self.sector_size as usize
    }

    /// log2 of the sector size.
    #[inline]
    pub fn sector_bit(&self) -> u32 {
        self.sector_bit
    }

    /// Largest single request in bytes.
    #[inline]
    pub fn max_io_bytes(&self) -> usize {
        self.max_io_bytes as usize
    }

    /// Sectors in one maximal request.
    #[inline]
    pub fn sectors_per_max_io(&self) -> u32 {
        self.max_io_bytes >> self.sector_bit
    }

    /// Capacity in bytes (whole sectors).
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    /// Capacity in logical blocks.
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity >> self.sector_bit
    }

    /// Physical segments the usage table tracks, metadata segments included.
    pub fn segment_count(&self) -> usize {
        ((self.capacity >> SEGMENT_BIT) as usize).min(MAX_SEGMENTS)
    }

    #[inline]
    /// Whether `value` is a multiple of the sector size.
    pub fn is_aligned(&self, value: u64) -> bool {
        value & self.sector_mask == 0
    }

    /// Round `value` down to a sector boundary.
    #[inline]
    pub fn round_down(&self, value: u64) -> u64 {
        value & !self.sector_mask
    }

    /// Round `value` up to a sector boundary.
    #[inline]
    pub fn round_up(&self, value: u64) -> u64 {
        (value + self.sector_mask) & !self.sector_mask
    }

    /// Logical block address of a byte offset.
    #[inline]
    pub fn lba(&self, offset: u64) -> u64 {
        offset >> self.sector_bit
    }

    /// Byte offset of a logical block address.
    #[inline]
    pub fn lba_offset(&self, lba: u64) -> u64 {
        lba << self.sector_bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SEGMENT_SIZE;

    #[test]
    fn test_geometry_derivation() {
        let geo = DeviceGeometry::new(512, 131_072 + 100, 4 * SEGMENT_SIZE + 77).unwrap();
        assert_eq!(geo.sector_bit(), 9);
        assert_eq!(geo.max_io_bytes(), 131_072);
        assert_eq!(geo.sectors_per_max_io(), 256);
        assert_eq!(geo.capacity(), 4 * SEGMENT_SIZE);
        assert_eq!(geo.segment_count(), 4);
    }

    #[test]
    fn test_rounding() {
        let geo = DeviceGeometry::new(4096, 1 << 20, SEGMENT_SIZE).unwrap();
        assert!(geo.is_aligned(8192));
        assert!(!geo.is_aligned(8193));
        assert_eq!(geo.round_down(8193), 8192);
        assert_eq!(geo.round_up(8193), 12288);
        assert_eq!(geo.round_up(8192), 8192);
        assert_eq!(geo.lba(12288), 3);
        assert_eq!(geo.lba_offset(3), 12288);
    }

    #[test]
    fn test_rejects_unusable_devices() {
        assert!(DeviceGeometry::new(500, 1 << 20, SEGMENT_SIZE).is_err());
        assert!(DeviceGeometry::new(8192, 1 << 20, SEGMENT_SIZE).is_err());
        assert!(DeviceGeometry::new(512, 2048, SEGMENT_SIZE).is_err());
        assert!(DeviceGeometry::new(512, 1 << 20, SEGMENT_SIZE - 512).is_err());
    }
}
