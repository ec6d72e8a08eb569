//! Reading the metadata table back and opening logs.

use std::sync::Arc;

use crossbeam::channel::bounded;
use tracing::{debug, info};

use crate::config::BusyPolicy;
use crate::device::StorageDevice;
use crate::engine::commit::Origin;
use crate::engine::{EngineShared, LoadOutcome, LogEngine, LogHandle};
use crate::error::{Error, Result};
use crate::layout::{
    info_page_offset, slot_offset, space_size, AddressTable, LogEntry, LogMetadataInfo,
    SegmentSpace, LOG_ENTRY_SIZE, METADATA_ADDRESS_SIZE, METADATA_INFO_SIZE, NUM_LOGS_SUPPORTED,
};
use crate::registry::{validate, Claimed, Extent, LogSlot, RecoveredSlot, TailSector};

impl EngineShared {
    /// Read the table from the device once per engine lifetime.
    pub(crate) fn ensure_loaded(&self) -> Result<LoadOutcome> {
        self.check_running()?;
        let mut loaded = self.registry.load_guard();
        if *loaded {
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        let recovered = self.read_table()?;
        validate(&recovered, self.geometry.segment_count())?;
        for slot in &recovered {
            for (_, _, segment) in slot.table.assigned() {
                self.allocator.mark_used(segment)?;
            }
        }

        let logs = recovered.len();
        self.registry.install(recovered);
        *loaded = true;
        info!(
            logs,
            free_segments = self.allocator.free_count(),
            "metadata table loaded"
        );
        Ok(LoadOutcome::Loaded { logs })
    }

    fn read_table(&self) -> Result<Vec<RecoveredSlot>> {
        let pages: Vec<Extent> = (0..NUM_LOGS_SUPPORTED)
            .map(|slot| Extent {
                device_offset: info_page_offset(slot),
                len: METADATA_INFO_SIZE,
            })
            .collect();

        let mut in_use = Vec::new();
        for (slot, page) in self.read_extents(&pages)?.into_iter().enumerate() {
            let decoded = LogMetadataInfo::decode(&page)
                .map_err(|err| Error::corruption(format!("slot {slot}: {err}")))?;
            if let Some(info) = decoded {
                in_use.push((slot, info));
            }
        }

        let max_io = self.geometry.max_io_bytes();
        let mut recovered = Vec::with_capacity(in_use.len());
        for (slot, info) in in_use {
            let extents: Vec<Extent> = (0..METADATA_ADDRESS_SIZE)
                .step_by(max_io)
                .map(|start| Extent {
                    device_offset: slot_offset(slot) + start as u64,
                    len: max_io.min(METADATA_ADDRESS_SIZE - start),
                })
                .collect();
            let mut image = Vec::with_capacity(METADATA_ADDRESS_SIZE);
            for chunk in self.read_extents(&extents)? {
                image.extend_from_slice(&chunk);
            }
            let table = AddressTable::decode(&image)
                .map_err(|err| Error::corruption(format!("slot {slot}: {err}")))?;
            debug!(slot, name = %info.name, tail = info.tail, version = info.version, "recovered log");
            recovered.push(RecoveredSlot { slot, info, table });
        }
        Ok(recovered)
    }

    /// Id of `name`, claiming and persisting a new slot if needed.
    ///
    /// Concurrent loaders of the same name wait on the claim and see the log
    /// only after its first commit succeeded.
    fn create_or_open(self: &Arc<Self>, name: &str) -> Result<(u32, bool)> {
        self.check_running()?;
        let claim = match self.registry.claim(name, self.geometry.sector_size())? {
            Claimed::Existing(id) => return Ok((id, false)),
            Claimed::New(claim) => claim,
        };

        let id = claim.id();
        let info = LogMetadataInfo::new(name, id);
        claim.slot().pending.begin(info.clone(), BusyPolicy::Wait)?;

        let (tx, rx) = bounded(1);
        self.commit_metadata(id, info, None, Some(tx), Origin::Caller);
        if let Err(err) = rx.recv().unwrap_or(Err(Error::ShuttingDown)) {
            claim.slot().take_error();
            return Err(err);
        }
        claim.publish();
        info!(name, id, "created log");
        Ok((id, true))
    }

    /// Mark a slot opened, priming the cached sector that holds its newest
    /// committed entry.
    fn open_slot(&self, slot: &LogSlot) -> Result<LogMetadataInfo> {
        let info = slot
            .info()
            .ok_or_else(|| Error::not_found(format!("log id {} is not in use", slot.id())))?;
        if slot.is_opened() {
            return Ok(info);
        }
        if info.tail > 0 {
            let tail = self.read_tail_sector(slot, info.tail as u64 - 1)?;
            let mut state = slot.state.write();
            // A racing opener may have opened the slot and appended since.
            if !slot.is_opened() {
                state.tail_sector = Some(tail);
            }
        }

        if slot.open() {
            info!(
                id = slot.id(),
                name = %info.name,
                head = info.head,
                tail = info.tail,
                version = info.version,
                "opened log"
            );
        }
        Ok(info)
    }

    /// Read the log-entry sector holding entry `last`.
    fn read_tail_sector(&self, slot: &LogSlot, last: u64) -> Result<TailSector> {
        let geometry = self.geometry;
        let entry_virt = last * LOG_ENTRY_SIZE;
        let offset = geometry.round_down(entry_virt);
        let extents = slot
            .state
            .read()
            .translate(
                SegmentSpace::LogEntry,
                offset,
                geometry.sector_size() as u64,
                geometry.max_io_bytes(),
            )
            .map_err(|err| {
                Error::corruption(format!(
                    "log {} tail sector is not addressable: {err}",
                    slot.id()
                ))
            })?;
        let bytes = self.read_extents(&extents)?.concat();

        let entry = LogEntry::decode(&bytes[(entry_virt - offset) as usize..])?;
        let payload_end = entry
            .data_offset
            .checked_add(entry.data_len)
            .filter(|&end| end <= space_size(SegmentSpace::Data))
            .ok_or_else(|| {
                Error::corruption(format!(
                    "log {} entry {last} payload [{}, +{}) exceeds the data space",
                    slot.id(),
                    entry.data_offset,
                    entry.data_len
                ))
            })?;
        Ok(TailSector {
            offset,
            bytes,
            data_end: geometry.round_up(payload_end),
        })
    }

    pub(crate) fn load(self: &Arc<Self>, name: &str) -> Result<LogHandle> {
        self.ensure_loaded()?;
        let (id, created) = match self.registry.lookup(name) {
            Some(id) => (id, false),
            None => self.create_or_open(name)?,
        };
        let metadata = self.open_slot(self.registry.slot(id)?)?;
        Ok(LogHandle {
            id,
            metadata,
            created,
        })
    }
}

impl<D: StorageDevice> LogEngine<D> {
    /// Read the metadata table from the device if this engine has not yet.
    ///
    /// A repeat call returns [`LoadOutcome::AlreadyLoaded`] without device
    /// I/O. A table that fails validation is reported as
    /// [`Error::Corruption`].
    pub fn ensure_loaded(&self) -> Result<LoadOutcome> {
        self.shared.ensure_loaded()
    }

    /// Open the log called `name`, creating it if the table has none.
    ///
    /// Must be called before any append or read against the log.
    pub fn load(&self, name: &str) -> Result<LogHandle> {
        self.shared.load(name)
    }

    /// Id of the log called `name`, creating it if needed. The log is
    /// opened as by [`LogEngine::load`].
    pub fn create_or_open(&self, name: &str) -> Result<u32> {
        self.shared.load(name).map(|handle| handle.id)
    }
}
