//! Append and metadata-only updates.

use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver};
use tracing::debug;

use crate::device::{IoCommand, StorageDevice, Submission};
use crate::engine::commit::{Notify, Origin};
use crate::engine::{AppendRequest, Durability, EngineShared, LogEngine};
use crate::error::{Error, Result};
use crate::io::CompletionBarrier;
use crate::layout::{LogMetadataInfo, SegmentSpace, LOG_ENTRY_SIZE};
use crate::registry::{check_space_range, LogSlot, TailSector};

/// Device writes of one append, prepared under the slot lock.
struct AppendPlan {
    writes: Vec<(u64, Vec<u8>)>,
    tail: TailSector,
}

fn wait_handle(durability: Durability) -> (Notify, Option<Receiver<Result<()>>>) {
    match durability {
        Durability::Sync => {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        }
        Durability::Async => (None, None),
    }
}

fn wait(rx: Option<Receiver<Result<()>>>) -> Result<()> {
    match rx {
        Some(rx) => rx.recv().unwrap_or(Err(Error::ShuttingDown)),
        None => Ok(()),
    }
}

impl EngineShared {
    /// Checks that need no committed state.
    fn validate_request(&self, id: u32, request: &AppendRequest) -> Result<()> {
        let AppendRequest {
            data,
            entry,
            log_offset,
            metadata,
        } = request;

        if data.len() as u64 != entry.data_len {
            return Err(Error::invalid(format!(
                "payload is {} bytes but the entry says {}",
                data.len(),
                entry.data_len
            )));
        }
        if !self.geometry.is_aligned(entry.data_offset) {
            return Err(Error::invalid(format!(
                "data offset {} is not sector aligned",
                entry.data_offset
            )));
        }
        if log_offset % LOG_ENTRY_SIZE != 0 {
            return Err(Error::invalid(format!(
                "log offset {log_offset} is not a multiple of {LOG_ENTRY_SIZE}"
            )));
        }
        if metadata.id != id {
            return Err(Error::invalid(format!(
                "metadata id {} does not match log {id}",
                metadata.id
            )));
        }
        if metadata.version != entry.version {
            return Err(Error::invalid(format!(
                "metadata version {} does not match entry version {}",
                metadata.version, entry.version
            )));
        }
        check_space_range(SegmentSpace::Data, entry.data_offset, entry.data_len)?;
        check_space_range(SegmentSpace::LogEntry, *log_offset, LOG_ENTRY_SIZE)?;
        Ok(())
    }

    /// Checks of a new metadata image against the committed one.
    fn validate_progress(
        slot: &LogSlot,
        committed: &LogMetadataInfo,
        next: &LogMetadataInfo,
    ) -> Result<()> {
        if next.name != committed.name || !next.in_use {
            return Err(Error::invalid(format!(
                "metadata for log {} must keep its name and stay in use",
                committed.id
            )));
        }
        if next.head < committed.head || next.head > next.tail {
            return Err(Error::invalid(format!(
                "head {} must stay within [{}, {}]",
                next.head, committed.head, next.tail
            )));
        }
        if next.version < committed.version || next.version < slot.last_written() {
            return Err(Error::invalid(format!(
                "version {} is older than committed version {}",
                next.version, committed.version
            )));
        }
        Ok(())
    }

    /// Allocate backing segments and build the sub-requests.
    fn plan_append(&self, slot: &LogSlot, request: &AppendRequest) -> Result<AppendPlan> {
        let geometry = self.geometry;
        let sector = geometry.sector_size();
        let AppendRequest {
            data,
            entry,
            log_offset,
            metadata,
        } = request;

        let mut state = slot.state.write();
        let committed = state
            .info
            .clone()
            .ok_or_else(|| Error::not_found(format!("log id {} is not in use", slot.id())))?;
        Self::validate_progress(slot, &committed, metadata)?;

        let index = log_offset / LOG_ENTRY_SIZE;
        if index < committed.tail as u64 {
            return Err(Error::invalid(format!(
                "entry {index} is below the committed tail {}; entries are immutable",
                committed.tail
            )));
        }
        if index != committed.tail as u64 || metadata.tail != committed.tail + 1 {
            return Err(Error::invalid(format!(
                "an append writes entry {} and moves the tail to {}, got entry {index} and tail {}",
                committed.tail,
                committed.tail + 1,
                metadata.tail
            )));
        }
        if entry.version <= committed.version {
            return Err(Error::invalid(format!(
                "version {} must exceed committed version {}",
                entry.version, committed.version
            )));
        }
        let floor = state.data_floor();
        if entry.data_offset < floor {
            return Err(Error::invalid(format!(
                "data offset {} overlaps committed payload below {floor}",
                entry.data_offset
            )));
        }

        let padded = geometry.round_up(entry.data_len);
        let sector_virt = geometry.round_down(*log_offset);

        let new_data = state.assign(SegmentSpace::Data, entry.data_offset, padded, &self.allocator)?;
        let new_entry = match state.assign(
            SegmentSpace::LogEntry,
            sector_virt,
            sector as u64,
            &self.allocator,
        ) {
            Ok(assigned) => assigned,
            Err(err) => {
                state.unassign(SegmentSpace::Data, &new_data, &self.allocator);
                return Err(err);
            }
        };
        for &(index, _) in &new_data {
            state.mark_dirty(SegmentSpace::Data, index, sector);
        }
        for &(index, _) in &new_entry {
            state.mark_dirty(SegmentSpace::LogEntry, index, sector);
        }

        let mut writes = Vec::new();
        if padded > 0 {
            let mut payload = data.clone();
            payload.resize(padded as usize, 0);
            let extents = state.translate(
                SegmentSpace::Data,
                entry.data_offset,
                padded,
                geometry.max_io_bytes(),
            )?;
            let mut pos = 0usize;
            for extent in extents {
                writes.push((
                    geometry.lba(extent.device_offset),
                    payload[pos..pos + extent.len].to_vec(),
                ));
                pos += extent.len;
            }
        }

        let mut bytes = match &state.tail_sector {
            Some(cached) if cached.offset == sector_virt => cached.bytes.clone(),
            _ => vec![0u8; sector],
        };
        let within = (*log_offset - sector_virt) as usize;
        entry.encode(&mut bytes[within..])?;
        let extent = state.translate(
            SegmentSpace::LogEntry,
            sector_virt,
            sector as u64,
            geometry.max_io_bytes(),
        )?[0];
        writes.push((geometry.lba(extent.device_offset), bytes.clone()));

        debug!(
            id = slot.id(),
            index,
            version = entry.version,
            data_len = entry.data_len,
            new_segments = new_data.len() + new_entry.len(),
            sub_requests = writes.len(),
            "append planned"
        );
        Ok(AppendPlan {
            writes,
            tail: TailSector {
                offset: sector_virt,
                bytes,
                data_end: entry.data_offset + padded,
            },
        })
    }

    pub(crate) fn append(
        self: &Arc<Self>,
        id: u32,
        request: AppendRequest,
        durability: Durability,
    ) -> Result<()> {
        self.check_running()?;
        let slot = self.registry.opened(id)?;
        self.validate_request(id, &request)?;

        slot.pending
            .begin(request.metadata.clone(), self.config.busy_policy)?;
        let plan = match self
            .check_running()
            .and_then(|_| self.plan_append(slot, &request))
        {
            Ok(plan) => plan,
            Err(err) => {
                slot.pending.finish();
                return Err(err);
            }
        };

        let (notify, rx) = wait_handle(durability);
        let AppendPlan { writes, tail } = plan;
        let metadata = request.metadata;

        // The last data/entry completion queues the metadata commit.
        let shared = Arc::clone(self);
        let barrier = CompletionBarrier::new(writes.len(), move |result| match result {
            Ok(()) => shared.commit_metadata(id, metadata, Some(tail), notify, Origin::Completion),
            Err(err) => shared.fail_write(id, err, notify),
        });

        for (lba, buf) in writes {
            let part = Arc::clone(&barrier);
            let submission = Submission::new(
                IoCommand::Write { lba, buf },
                Box::new(move |res| part.arrive(res.map(drop).map_err(Error::from))),
            );
            if self.io_queue.push(submission).is_err() {
                barrier.arrive(Err(Error::ShuttingDown));
            }
        }

        wait(rx)
    }

    pub(crate) fn update_metadata(
        self: &Arc<Self>,
        id: u32,
        metadata: LogMetadataInfo,
        durability: Durability,
    ) -> Result<()> {
        self.check_running()?;
        let slot = self.registry.opened(id)?;
        if metadata.id != id {
            return Err(Error::invalid(format!(
                "metadata id {} does not match log {id}",
                metadata.id
            )));
        }

        slot.pending
            .begin(metadata.clone(), self.config.busy_policy)?;
        let checked = self.check_running().and_then(|_| {
            let committed = slot
                .info()
                .ok_or_else(|| Error::not_found(format!("log id {id} is not in use")))?;
            Self::validate_progress(slot, &committed, &metadata)?;
            if metadata.tail != committed.tail {
                return Err(Error::invalid(format!(
                    "tail {} differs from committed tail {}; only appends move the tail",
                    metadata.tail, committed.tail
                )));
            }
            Ok(())
        });
        if let Err(err) = checked {
            slot.pending.finish();
            return Err(err);
        }

        let (notify, rx) = wait_handle(durability);
        debug!(id, head = metadata.head, version = metadata.version, "metadata update");
        self.commit_metadata(id, metadata, None, notify, Origin::Caller);
        wait(rx)
    }
}

impl<D: StorageDevice> LogEngine<D> {
    /// Append one entry and its payload, then commit `request.metadata`.
    ///
    /// Precondition violations are returned before anything is queued.
    /// With [`Durability::Sync`] the call returns the outcome of the
    /// metadata commit; with [`Durability::Async`] it returns once the
    /// sub-requests are queued.
    pub fn append(&self, id: u32, request: AppendRequest, durability: Durability) -> Result<()> {
        self.shared.append(id, request, durability)
    }

    /// Commit new metadata without appending (for example a head advance).
    pub fn update_metadata(
        &self,
        id: u32,
        metadata: LogMetadataInfo,
        durability: Durability,
    ) -> Result<()> {
        self.shared.update_metadata(id, metadata, durability)
    }
}
