//! Submission/completion queue pair over a namespace.
//!
//! Commands are queued by [`QueuePair::submit`] and only executed when the
//! owner reaps with [`QueuePair::process_completions`], which also invokes
//! each command's completion callback. A queue pair is owned by exactly one
//! thread.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use tracing::trace;

use crate::device::{DeviceGeometry, StorageDevice};

/// Completion callback. Receives the command's buffer back: filled for
/// reads, as submitted for writes, empty for flushes.
pub type CompletionFn = Box<dyn FnOnce(io::Result<Vec<u8>>) + Send + 'static>;

/// A device command addressed in logical blocks.
#[derive(Debug)]
pub enum IoCommand {
    /// Read `lba_count` sectors starting at `lba`.
    Read {
        /// First logical block.
        lba: u64,
        /// Blocks to read.
        lba_count: u32,
    },
    /// Write `buf` (whole sectors) starting at `lba`.
    Write {
        /// First logical block.
        lba: u64,
        /// Data, a whole number of sectors.
        buf: Vec<u8>,
    },
    /// Flush the namespace's volatile cache.
    Flush,
}

/// A command together with its completion callback.
pub struct Submission {
    /// Command to execute.
    pub command: IoCommand,
    /// Invoked once with the command's result.
    pub callback: CompletionFn,
}

impl Submission {
    /// Pair `command` with `callback`.
    pub fn new(command: IoCommand, callback: CompletionFn) -> Self {
        Self { command, callback }
    }

    /// Complete without executing.
    pub fn fail(self, error: io::Error) {
        (self.callback)(Err(error));
    }
}

/// One queue pair bound to a namespace.
pub struct QueuePair<D: StorageDevice> {
    namespace: Arc<D>,
    geometry: DeviceGeometry,
    depth: usize,
    pending: VecDeque<Submission>,
    runtime: tokio::runtime::Runtime,
}

impl<D: StorageDevice> QueuePair<D> {
    /// Allocate a queue pair allowing `depth` outstanding commands.
    pub fn new(namespace: Arc<D>, geometry: DeviceGeometry, depth: usize) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        Ok(Self {
            namespace,
            geometry,
            depth: depth.max(1),
            pending: VecDeque::with_capacity(depth.max(1)),
            runtime,
        })
    }

    /// Queue a command. A full queue pair hands the submission back.
    pub fn submit(&mut self, submission: Submission) -> Result<(), Submission> {
        if self.is_full() {
            return Err(submission);
        }
        self.pending.push_back(submission);
        Ok(())
    }

    /// Commands submitted and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// True when no more commands can be submitted before a reap.
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.depth
    }

    /// Execute up to `max` queued commands (0 = all) and run their callbacks.
    pub fn process_completions(&mut self, max: usize) -> usize {
        let limit = if max == 0 { self.pending.len() } else { max };
        let mut completed = 0;
        while completed < limit {
            let Some(Submission { command, callback }) = self.pending.pop_front() else {
                break;
            };
            let result = self.execute(command);
            trace!(ok = result.is_ok(), "command completed");
            callback(result);
            completed += 1;
        }
        completed
    }

    fn execute(&self, command: IoCommand) -> io::Result<Vec<u8>> {
        let geometry = self.geometry;
        let namespace: &D = &self.namespace;
        match command {
            IoCommand::Read { lba, lba_count } => {
                self.check_lbas(lba, lba_count as u64)?;
                let mut buf = vec![0u8; lba_count as usize * geometry.sector_size()];
                let offset = geometry.lba_offset(lba);
                let read = self.runtime.block_on(namespace.read(offset, &mut buf))?;
                if read != buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("short read at lba {lba}: {read} of {} bytes", buf.len()),
                    ));
                }
                Ok(buf)
            }
            IoCommand::Write { lba, buf } => {
                if buf.is_empty() || !geometry.is_aligned(buf.len() as u64) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("write of {} bytes is not whole sectors", buf.len()),
                    ));
                }
                self.check_lbas(lba, geometry.lba(buf.len() as u64))?;
                let offset = geometry.lba_offset(lba);
                let written = self.runtime.block_on(namespace.write(offset, &buf))?;
                if written != buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("partial write at lba {lba}: {written} of {} bytes", buf.len()),
                    ));
                }
                Ok(buf)
            }
            IoCommand::Flush => {
                self.runtime.block_on(namespace.flush())?;
                Ok(Vec::new())
            }
        }
    }

    fn check_lbas(&self, lba: u64, count: u64) -> io::Result<()> {
        let geometry = self.geometry;
        if count == 0 || count > geometry.sectors_per_max_io() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sector count {count} outside 1..={}", geometry.sectors_per_max_io()),
            ));
        }
        match lba.checked_add(count) {
            Some(end) if end <= geometry.capacity_sectors() => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("lba range {lba}+{count} beyond namespace end"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::device::MemNamespace;
    use crate::layout::SEGMENT_SIZE;

    fn qpair(depth: usize) -> QueuePair<MemNamespace> {
        let ns = Arc::new(MemNamespace::new(2 * SEGMENT_SIZE));
        let geometry = DeviceGeometry::new(512, 64 * 1024, ns.capacity()).unwrap();
        QueuePair::new(ns, geometry, depth).unwrap()
    }

    #[test]
    fn test_completion_runs_only_when_reaped() {
        let mut qp = qpair(4);
        let done = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&done);
        let write = Submission::new(
            IoCommand::Write {
                lba: 8,
                buf: vec![3u8; 1024],
            },
            Box::new(move |res| {
                assert_eq!(res.unwrap().len(), 1024);
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(qp.submit(write).is_ok());
        assert_eq!(qp.outstanding(), 1);
        assert_eq!(done.load(Ordering::SeqCst), 0);

        assert_eq!(qp.process_completions(0), 1);
        assert_eq!(done.load(Ordering::SeqCst), 1);

        let read = Submission::new(
            IoCommand::Read { lba: 8, lba_count: 2 },
            Box::new(|res| assert!(res.unwrap().iter().all(|&b| b == 3))),
        );
        qp.submit(read).ok().unwrap();
        qp.process_completions(1);
        assert_eq!(qp.outstanding(), 0);
    }

    #[test]
    fn test_full_queue_returns_submission() {
        let mut qp = qpair(1);
        qp.submit(Submission::new(IoCommand::Flush, Box::new(|_| {})))
            .ok()
            .unwrap();
        let rejected = qp.submit(Submission::new(IoCommand::Flush, Box::new(|_| {})));
        assert!(rejected.is_err());
    }

    #[test]
    fn test_oversized_command_fails_on_completion() {
        let mut qp = qpair(4);
        let failed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failed);
        qp.submit(Submission::new(
            IoCommand::Read {
                lba: 0,
                lba_count: 129,
            },
            Box::new(move |res| {
                assert_eq!(res.unwrap_err().kind(), io::ErrorKind::InvalidInput);
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        ))
        .ok()
        .unwrap();
        qp.process_completions(0);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }
}
