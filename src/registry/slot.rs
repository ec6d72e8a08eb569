use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::allocator::SegmentAllocator;
use crate::error::{Error, Result};
use crate::layout::{
    segment_offset, space_size, AddressTable, LogMetadataInfo, SegmentId, SegmentSpace,
    INVALID_VERSION, METADATA_ADDRESS_SIZE, SEGMENT_BIT, SEGMENT_SIZE,
};
use crate::registry::PendingWrite;

/// A contiguous device range inside one physical segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Extent {
    pub(crate) device_offset: u64,
    pub(crate) len: usize,
}

/// Sector of a log-entry space holding the newest committed entry.
///
/// Entries are 64 bytes, so a sector holds several of them; the next append
/// rewrites the whole sector from this image instead of reading it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TailSector {
    /// Virtual offset of the sector in the log-entry space.
    pub(crate) offset: u64,
    pub(crate) bytes: Vec<u8>,
    /// Sector-aligned end of the newest entry's payload.
    pub(crate) data_end: u64,
}

/// In-memory image of one metadata slot.
pub(crate) struct SlotState {
    /// Committed info; `None` while the slot is free.
    pub(crate) info: Option<LogMetadataInfo>,
    pub(crate) table: AddressTable,
    /// Sectors of the address part changed since the last commit.
    dirty: BTreeSet<usize>,
    pub(crate) tail_sector: Option<TailSector>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            info: None,
            table: AddressTable::new(),
            dirty: BTreeSet::new(),
            tail_sector: None,
        }
    }

    /// Map a virtual range onto device extents no larger than `max_io`.
    pub(crate) fn translate(
        &self,
        space: SegmentSpace,
        virt: u64,
        len: u64,
        max_io: usize,
    ) -> Result<Vec<Extent>> {
        check_space_range(space, virt, len)?;
        let mut extents = Vec::new();
        let mut pos = virt;
        let end = virt + len;
        while pos < end {
            let index = (pos >> SEGMENT_BIT) as usize;
            let within = pos & (SEGMENT_SIZE - 1);
            let take = (end - pos).min(SEGMENT_SIZE - within).min(max_io as u64);
            let segment = self.table.get(space, index).ok_or_else(|| {
                Error::not_found(format!("{space} segment {index} is not assigned"))
            })?;
            extents.push(Extent {
                device_offset: segment_offset(segment) + within,
                len: take as usize,
            });
            pos += take;
        }
        Ok(extents)
    }

    /// Back every logical segment touched by `[virt, virt + len)`.
    ///
    /// Returns the segments allocated by this call. On failure nothing
    /// allocated here stays assigned.
    pub(crate) fn assign(
        &mut self,
        space: SegmentSpace,
        virt: u64,
        len: u64,
        allocator: &SegmentAllocator,
    ) -> Result<Vec<(usize, SegmentId)>> {
        check_space_range(space, virt, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let first = (virt >> SEGMENT_BIT) as usize;
        let last = ((virt + len - 1) >> SEGMENT_BIT) as usize;

        let mut allocated = Vec::new();
        for index in first..=last {
            if self.table.get(space, index).is_some() {
                continue;
            }
            match allocator.allocate(space) {
                Ok(segment) => {
                    self.table.set(space, index, segment);
                    allocated.push((index, segment));
                }
                Err(err) => {
                    self.unassign(space, &allocated, allocator);
                    return Err(err);
                }
            }
        }
        Ok(allocated)
    }

    /// Undo assignments made by [`SlotState::assign`].
    pub(crate) fn unassign(
        &mut self,
        space: SegmentSpace,
        assigned: &[(usize, SegmentId)],
        allocator: &SegmentAllocator,
    ) {
        for &(index, segment) in assigned {
            self.table.clear(space, index);
            allocator.release(segment);
        }
    }

    pub(crate) fn mark_dirty(&mut self, space: SegmentSpace, index: usize, sector_size: usize) {
        self.dirty
            .insert(AddressTable::byte_offset(space, index) / sector_size);
    }

    pub(crate) fn mark_all_dirty(&mut self, sector_size: usize) {
        self.dirty.extend(0..METADATA_ADDRESS_SIZE / sector_size);
    }

    pub(crate) fn take_dirty(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub(crate) fn restore_dirty(&mut self, sectors: &[usize]) {
        self.dirty.extend(sectors.iter().copied());
    }

    /// Lowest data offset a new payload may start at. Everything below
    /// belongs to committed entries.
    pub(crate) fn data_floor(&self) -> u64 {
        self.tail_sector.as_ref().map_or(0, |tail| tail.data_end)
    }

    #[cfg(test)]
    pub(crate) fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Forget everything; used when a fresh claim fails to persist.
    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }
}

/// One entry of the metadata table with its per-log runtime state.
pub(crate) struct LogSlot {
    id: u32,
    pub(crate) state: RwLock<SlotState>,
    pub(crate) pending: PendingWrite,
    last_written: AtomicI64,
    write_error: Mutex<Option<Error>>,
    opened: AtomicBool,
}

impl LogSlot {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            state: RwLock::new(SlotState::new()),
            pending: PendingWrite::default(),
            last_written: AtomicI64::new(INVALID_VERSION),
            write_error: Mutex::new(None),
            opened: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn last_written(&self) -> i64 {
        self.last_written.load(Ordering::Acquire)
    }

    /// Raise the high-water mark; never lowers it.
    pub(crate) fn publish_version(&self, version: i64) {
        self.last_written.fetch_max(version, Ordering::AcqRel);
    }

    pub(crate) fn reset_version(&self, version: i64) {
        self.last_written.store(version, Ordering::Release);
    }

    pub(crate) fn record_error(&self, error: Error) {
        *self.write_error.lock() = Some(error);
    }

    pub(crate) fn peek_error(&self) -> Option<Error> {
        self.write_error.lock().clone()
    }

    pub(crate) fn take_error(&self) -> Option<Error> {
        self.write_error.lock().take()
    }

    pub(crate) fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Mark the slot opened; returns whether this call opened it.
    pub(crate) fn open(&self) -> bool {
        !self.opened.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn close(&self) {
        self.opened.store(false, Ordering::Release);
    }

    /// Committed info, if the slot is in use.
    pub(crate) fn info(&self) -> Option<LogMetadataInfo> {
        self.state.read().info.clone()
    }
}

pub(crate) fn check_space_range(space: SegmentSpace, virt: u64, len: u64) -> Result<()> {
    match virt.checked_add(len) {
        Some(end) if end <= space_size(space) => Ok(()),
        _ => Err(Error::out_of_range(format!(
            "[{virt}, +{len}) exceeds the {space} space"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_splits_at_segment_and_max_io() {
        let mut state = SlotState::new();
        state.table.set(SegmentSpace::Data, 0, 3);
        state.table.set(SegmentSpace::Data, 1, 7);

        let virt = SEGMENT_SIZE - 4096;
        let extents = state
            .translate(SegmentSpace::Data, virt, 12288, 8192)
            .unwrap();
        assert_eq!(
            extents,
            vec![
                Extent {
                    device_offset: segment_offset(3) + SEGMENT_SIZE - 4096,
                    len: 4096
                },
                Extent {
                    device_offset: segment_offset(7),
                    len: 8192
                },
            ]
        );
    }

    #[test]
    fn test_translate_unassigned_is_not_found() {
        let state = SlotState::new();
        assert!(matches!(
            state.translate(SegmentSpace::LogEntry, 0, 512, 4096),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            state.translate(SegmentSpace::LogEntry, space_size(SegmentSpace::LogEntry), 1, 4096),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_assign_rolls_back_on_exhaustion() {
        let allocator = SegmentAllocator::new(3);
        let mut state = SlotState::new();
        state.table.set(SegmentSpace::Data, 0, 9);

        // Needs segments for indices 1, 2 and 3 but only two are free.
        let err = state
            .assign(SegmentSpace::Data, 0, 4 * SEGMENT_SIZE, &allocator)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfSpace));
        assert_eq!(state.table.assigned_count(), 1);
        assert_eq!(allocator.free_count(), 2);

        let assigned = state
            .assign(SegmentSpace::Data, SEGMENT_SIZE, 10, &allocator)
            .unwrap();
        assert_eq!(assigned, vec![(1, 1)]);
        assert!(state
            .assign(SegmentSpace::Data, SEGMENT_SIZE + 100, 10, &allocator)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_dirty_sectors() {
        let mut state = SlotState::new();
        state.mark_dirty(SegmentSpace::LogEntry, 0, 512);
        state.mark_dirty(SegmentSpace::LogEntry, 255, 512);
        state.mark_dirty(SegmentSpace::Data, 0, 512);
        assert_eq!(state.take_dirty(), vec![0, 8]);
        assert!(!state.has_dirty());

        state.restore_dirty(&[3]);
        assert!(state.has_dirty());
        state.mark_all_dirty(4096);
        assert_eq!(state.take_dirty().len(), 7);
    }

    #[test]
    fn test_data_floor_follows_tail_sector() {
        let mut state = SlotState::new();
        assert_eq!(state.data_floor(), 0);
        state.tail_sector = Some(TailSector {
            offset: 0,
            bytes: vec![0u8; 512],
            data_end: 1024,
        });
        assert_eq!(state.data_floor(), 1024);
        state.reset();
        assert_eq!(state.data_floor(), 0);
    }

    #[test]
    fn test_version_high_water_mark() {
        let slot = LogSlot::new(0);
        assert_eq!(slot.last_written(), INVALID_VERSION);
        slot.publish_version(5);
        slot.publish_version(3);
        assert_eq!(slot.last_written(), 5);
        assert!(slot.open());
        assert!(!slot.open());
    }
}
