//! Read path: translate under the slot's read lock, then block on the
//! completion of reads issued through the io queue.

use crossbeam::channel::{bounded, Receiver};
use tracing::trace;

use crate::device::{IoCommand, StorageDevice, Submission};
use crate::engine::{EngineShared, LogEngine};
use crate::error::{Error, Result};
use crate::layout::{LogEntry, SegmentSpace, LOG_ENTRY_SIZE};
use crate::registry::Extent;

impl EngineShared {
    /// Read sector-aligned extents through the io queue and wait for all.
    pub(crate) fn read_extents(&self, extents: &[Extent]) -> Result<Vec<Vec<u8>>> {
        let geometry = self.geometry;
        let mut waiters: Vec<Receiver<std::io::Result<Vec<u8>>>> =
            Vec::with_capacity(extents.len());

        for extent in extents {
            let (tx, rx) = bounded(1);
            let command = IoCommand::Read {
                lba: geometry.lba(extent.device_offset),
                lba_count: (extent.len >> geometry.sector_bit()) as u32,
            };
            let submission = Submission::new(
                command,
                Box::new(move |res| {
                    let _ = tx.send(res);
                }),
            );
            if self.io_queue.push(submission).is_err() {
                return Err(Error::ShuttingDown);
            }
            waiters.push(rx);
        }

        waiters
            .into_iter()
            .map(|rx| match rx.recv() {
                Ok(result) => result.map_err(Error::from),
                Err(_) => Err(Error::ShuttingDown),
            })
            .collect()
    }

    /// Extent of the sector holding entry `index`, plus the entry's offset
    /// within that sector.
    fn entry_location(&self, id: u32, index: u64) -> Result<(Extent, usize)> {
        let slot = self.registry.opened(id)?;
        let geometry = self.geometry;
        let state = slot.state.read();
        let info = state
            .info
            .as_ref()
            .ok_or_else(|| Error::not_found(format!("log id {id} is not in use")))?;
        if index >= info.tail.max(0) as u64 || index < info.head.max(0) as u64 {
            return Err(Error::out_of_range(format!(
                "entry {index} of log {id} outside [{}, {})",
                info.head, info.tail
            )));
        }

        let virt = index * LOG_ENTRY_SIZE;
        let sector_virt = geometry.round_down(virt);
        let extents = state.translate(
            SegmentSpace::LogEntry,
            sector_virt,
            geometry.sector_size() as u64,
            geometry.max_io_bytes(),
        )?;
        Ok((extents[0], (virt - sector_virt) as usize))
    }

    pub(crate) fn read_entry(&self, id: u32, index: u64) -> Result<LogEntry> {
        self.check_running()?;
        let (extent, within) = self.entry_location(id, index)?;
        let sector = self.read_extents(&[extent])?;
        let entry = LogEntry::decode(&sector[0][within..])?;
        trace!(id, index, version = entry.version, "read entry");
        Ok(entry)
    }

    pub(crate) fn read_data(&self, id: u32, index: u64) -> Result<Vec<u8>> {
        let entry = self.read_entry(id, index)?;
        if entry.data_len == 0 {
            return Ok(Vec::new());
        }
        let geometry = self.geometry;
        let extents = {
            let slot = self.registry.opened(id)?;
            let state = slot.state.read();
            state.translate(
                SegmentSpace::Data,
                entry.data_offset,
                geometry.round_up(entry.data_len),
                geometry.max_io_bytes(),
            )?
        };

        let mut data = Vec::with_capacity(geometry.round_up(entry.data_len) as usize);
        for chunk in self.read_extents(&extents)? {
            data.extend_from_slice(&chunk);
        }
        data.truncate(entry.data_len as usize);
        Ok(data)
    }

    pub(crate) fn read_lba(&self, lba: u64) -> Result<Vec<u8>> {
        self.check_running()?;
        let geometry = self.geometry;
        if lba >= geometry.capacity_sectors() {
            return Err(Error::out_of_range(format!(
                "lba {lba} beyond {} sectors",
                geometry.capacity_sectors()
            )));
        }
        let extent = Extent {
            device_offset: geometry.lba_offset(lba),
            len: geometry.sector_size(),
        };
        let mut sectors = self.read_extents(&[extent])?;
        Ok(sectors.remove(0))
    }
}

impl<D: StorageDevice> LogEngine<D> {
    /// Read the entry record at `index` (zero-based).
    ///
    /// Fails with [`Error::OutOfRange`] outside `[head, tail)` of the
    /// committed metadata.
    pub fn read_entry(&self, id: u32, index: u64) -> Result<LogEntry> {
        self.shared.read_entry(id, index)
    }

    /// Read the payload of the entry at `index`.
    pub fn read_data(&self, id: u32, index: u64) -> Result<Vec<u8>> {
        self.shared.read_data(id, index)
    }

    /// Read one raw sector.
    pub fn read_lba(&self, lba: u64) -> Result<Vec<u8>> {
        self.shared.read_lba(lba)
    }
}
