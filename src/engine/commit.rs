//! Metadata commit: dirty address sectors, a flush, the info page, and a
//! second flush before the new version is published.

use std::sync::Arc;

use crossbeam::channel::Sender;
use tracing::{debug, warn};

use crate::device::{IoCommand, Submission};
use crate::engine::EngineShared;
use crate::error::{Error, Result};
use crate::io::CompletionBarrier;
use crate::layout::{
    info_page_offset, slot_offset, LogMetadataInfo, METADATA_ADDRESS_SIZE, METADATA_INFO_SIZE,
};
use crate::registry::TailSector;

/// Wait handle of a synchronous caller.
pub(crate) type Notify = Option<Sender<Result<()>>>;

/// Who is enqueueing a metadata request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// A caller thread; rejected once the metadata queue is closed.
    Caller,
    /// A completion callback running on a worker.
    Completion,
}

/// Group sorted dirty sectors into contiguous runs of at most
/// `max_sectors`, as `(first sector, sector count)`.
pub(crate) fn dirty_runs(dirty: &[usize], max_sectors: usize) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for &sector in dirty {
        match runs.last_mut() {
            Some((start, count)) if *start + *count == sector && *count < max_sectors => {
                *count += 1;
            }
            _ => runs.push((sector, 1)),
        }
    }
    runs
}

impl EngineShared {
    /// Persist `info` for log `id`, together with any dirty address sectors.
    ///
    /// The caller holds the log's pending write; it is released once the
    /// flushed info page is published or any part fails.
    pub(crate) fn commit_metadata(
        self: &Arc<Self>,
        id: u32,
        info: LogMetadataInfo,
        tail: Option<TailSector>,
        notify: Notify,
        origin: Origin,
    ) {
        let geometry = self.geometry;
        let sector = geometry.sector_size();

        let mut page = vec![0u8; METADATA_INFO_SIZE];
        if let Err(err) = info.encode(&mut page) {
            self.fail_write(id, err.into(), notify);
            return;
        }

        let slot = match self.registry.slot(id) {
            Ok(slot) => slot,
            Err(err) => {
                self.fail_write(id, err, notify);
                return;
            }
        };
        let (dirty, chunks) = {
            let mut state = slot.state.write();
            let dirty = state.take_dirty();
            let mut chunks = Vec::new();
            if !dirty.is_empty() {
                let mut image = vec![0u8; METADATA_ADDRESS_SIZE];
                if let Err(err) = state.table.encode(&mut image) {
                    state.restore_dirty(&dirty);
                    drop(state);
                    self.fail_write(id, err.into(), notify);
                    return;
                }
                for (first, count) in dirty_runs(&dirty, geometry.max_io_bytes() / sector) {
                    let start = first * sector;
                    let buf = image[start..start + count * sector].to_vec();
                    let lba = geometry.lba(slot_offset(id as usize) + start as u64);
                    chunks.push((lba, buf));
                }
            }
            (dirty, chunks)
        };

        debug!(
            id,
            version = info.version,
            tail = info.tail,
            address_chunks = chunks.len(),
            "issuing metadata commit"
        );

        // With address chunks in flight the flush is queued from their
        // completion, not from the original context.
        let flush_origin = if chunks.is_empty() {
            origin
        } else {
            Origin::Completion
        };
        let shared = Arc::clone(self);
        let barrier = CompletionBarrier::new(chunks.len(), move |result| match result {
            Ok(()) => shared.flush_then(id, notify, flush_origin, move |shared, notify| {
                shared.write_info_page(id, info, page, tail, notify);
            }),
            Err(err) => {
                if let Ok(slot) = shared.registry.slot(id) {
                    slot.state.write().restore_dirty(&dirty);
                }
                shared.fail_write(id, err, notify);
            }
        });

        for (lba, buf) in chunks {
            let part = Arc::clone(&barrier);
            let submission = Submission::new(
                IoCommand::Write { lba, buf },
                Box::new(move |res| part.arrive(res.map(drop).map_err(Error::from))),
            );
            if self.push_metadata(submission, origin).is_err() {
                barrier.arrive(Err(Error::ShuttingDown));
            }
        }
    }

    /// Write the info page; it becomes the commit point once flushed.
    fn write_info_page(
        self: &Arc<Self>,
        id: u32,
        info: LogMetadataInfo,
        page: Vec<u8>,
        tail: Option<TailSector>,
        notify: Notify,
    ) {
        let lba = self.geometry.lba(info_page_offset(id as usize));
        let shared = Arc::clone(self);
        let pending = Arc::new(parking_lot::Mutex::new(Some((info, tail, notify))));
        let on_reject = Arc::clone(&pending);

        let submission = Submission::new(
            IoCommand::Write { lba, buf: page },
            Box::new(move |res| {
                let Some((info, tail, notify)) = pending.lock().take() else {
                    return;
                };
                match res {
                    Ok(_) => shared.flush_then(
                        id,
                        notify,
                        Origin::Completion,
                        move |shared, notify| shared.finalize(id, info, tail, notify),
                    ),
                    Err(err) => shared.fail_write(id, err.into(), notify),
                }
            }),
        );
        if self.push_metadata(submission, Origin::Completion).is_err() {
            if let Some((_, _, notify)) = on_reject.lock().take() {
                self.fail_write(id, Error::ShuttingDown, notify);
            }
        }
    }

    /// Flush the namespace, then continue with `next`. Completed writes are
    /// on stable media before `next` runs.
    fn flush_then<F>(self: &Arc<Self>, id: u32, notify: Notify, origin: Origin, next: F)
    where
        F: FnOnce(&Arc<Self>, Notify) + Send + 'static,
    {
        let shared = Arc::clone(self);
        let pending = Arc::new(parking_lot::Mutex::new(Some((notify, next))));
        let on_reject = Arc::clone(&pending);

        let submission = Submission::new(
            IoCommand::Flush,
            Box::new(move |res| {
                let Some((notify, next)) = pending.lock().take() else {
                    return;
                };
                match res {
                    Ok(_) => next(&shared, notify),
                    Err(err) => shared.fail_write(id, err.into(), notify),
                }
            }),
        );
        if self.push_metadata(submission, origin).is_err() {
            if let Some((notify, _)) = on_reject.lock().take() {
                self.fail_write(id, Error::ShuttingDown, notify);
            }
        }
    }

    /// Publish a committed version.
    fn finalize(&self, id: u32, info: LogMetadataInfo, tail: Option<TailSector>, notify: Notify) {
        let Ok(slot) = self.registry.slot(id) else {
            return;
        };
        let version = info.version;
        {
            let mut state = slot.state.write();
            if let Some(tail) = tail {
                state.tail_sector = Some(tail);
            }
            debug!(id, version, head = info.head, tail = info.tail, "metadata committed");
            state.info = Some(info);
        }
        slot.publish_version(version);
        slot.pending.finish();
        if let Some(tx) = notify {
            let _ = tx.send(Ok(()));
        }
    }

    /// Fail the write in flight for log `id`. Device errors are not retried.
    pub(crate) fn fail_write(&self, id: u32, error: Error, notify: Notify) {
        warn!(id, "write failed: {error}");
        if let Ok(slot) = self.registry.slot(id) {
            slot.record_error(error.clone());
            slot.pending.finish();
        }
        if let Some(tx) = notify {
            let _ = tx.send(Err(error));
        }
    }

    fn push_metadata(
        &self,
        submission: Submission,
        origin: Origin,
    ) -> std::result::Result<(), Submission> {
        match origin {
            Origin::Caller => self.meta_queue.push(submission),
            Origin::Completion => self.meta_queue.push_internal(submission),
        }
    }
}
