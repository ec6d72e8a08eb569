//! Worker threads draining a request queue into their own queue pair.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::device::{QueuePair, StorageDevice, Submission};
use crate::io::queue::{QueueItem, RequestQueue};

/// Per-worker counters.
#[derive(Debug, Default)]
pub(crate) struct WorkerStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    outstanding: AtomicU64,
}

impl WorkerStats {
    pub(crate) fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            submitted: self.submitted.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            errors: self.errors.load(Ordering::Acquire),
            outstanding: self.outstanding.load(Ordering::Acquire),
        }
    }

    pub(crate) fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    /// Commands handed to the queue pair.
    pub submitted: u64,
    /// Commands whose completion callback ran.
    pub completed: u64,
    /// Completions that reported an error.
    pub errors: u64,
    /// Submitted and not yet completed.
    pub outstanding: u64,
}

/// A running worker thread.
pub(crate) struct Worker {
    name: String,
    handle: thread::JoinHandle<()>,
}

impl Worker {
    /// Spawn a worker that owns `qpair` and drains `queue`.
    pub(crate) fn spawn<D: StorageDevice>(
        name: String,
        queue: Arc<RequestQueue>,
        qpair: QueuePair<D>,
        stats: Arc<WorkerStats>,
        idle_poll: Duration,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(queue, qpair, stats, idle_poll))?;

        Ok(Self { name, handle })
    }

    /// Wait for the thread to exit. The queue must be closed first.
    pub(crate) fn join(self) {
        if self.handle.join().is_err() {
            warn!(worker = %self.name, "worker thread panicked");
        }
    }
}

fn worker_loop<D: StorageDevice>(
    queue: Arc<RequestQueue>,
    mut qpair: QueuePair<D>,
    stats: Arc<WorkerStats>,
    idle_poll: Duration,
) {
    debug!(queue = queue.name(), "worker started");
    loop {
        if let Some(QueueItem::Request(submission)) = queue.recv_timeout(idle_poll) {
            submit(&mut qpair, &stats, submission);
        }
        while !qpair.is_full() {
            match queue.try_recv() {
                Some(QueueItem::Request(submission)) => submit(&mut qpair, &stats, submission),
                Some(QueueItem::Wake) => continue,
                None => break,
            }
        }

        qpair.process_completions(0);

        // Completions may push follow-up requests, so the queue is checked
        // after reaping.
        if queue.is_closed() && queue.is_empty() && qpair.outstanding() == 0 {
            break;
        }
    }
    debug!(queue = queue.name(), "worker stopped");
}

fn submit<D: StorageDevice>(
    qpair: &mut QueuePair<D>,
    stats: &Arc<WorkerStats>,
    submission: Submission,
) {
    if qpair.is_full() {
        qpair.process_completions(0);
    }

    let Submission { command, callback } = submission;
    let counters = Arc::clone(stats);
    let tracked = Submission::new(
        command,
        Box::new(move |result: io::Result<Vec<u8>>| {
            if let Err(err) = &result {
                counters.errors.fetch_add(1, Ordering::AcqRel);
                warn!("device command failed: {err}");
            }
            counters.completed.fetch_add(1, Ordering::AcqRel);
            counters.outstanding.fetch_sub(1, Ordering::AcqRel);
            callback(result);
        }),
    );

    stats.submitted.fetch_add(1, Ordering::AcqRel);
    stats.outstanding.fetch_add(1, Ordering::AcqRel);
    if let Err(rejected) = qpair.submit(tracked) {
        rejected.fail(io::Error::new(
            io::ErrorKind::WouldBlock,
            "queue pair full after reaping",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceGeometry, IoCommand, MemNamespace};
    use crate::layout::SEGMENT_SIZE;
    use crossbeam::channel::bounded;

    fn spawn_worker(queue: &Arc<RequestQueue>, depth: usize) -> (Worker, Arc<WorkerStats>) {
        let ns = Arc::new(MemNamespace::new(2 * SEGMENT_SIZE));
        let geometry = DeviceGeometry::new(512, 64 * 1024, 2 * SEGMENT_SIZE).unwrap();
        let qpair = QueuePair::new(ns, geometry, depth).unwrap();
        let stats = Arc::new(WorkerStats::default());
        let worker = Worker::spawn(
            "test-worker".into(),
            Arc::clone(queue),
            qpair,
            Arc::clone(&stats),
            Duration::from_millis(1),
        )
        .unwrap();
        (worker, stats)
    }

    #[test]
    fn test_worker_executes_and_counts() {
        let queue = Arc::new(RequestQueue::new("io"));
        let (worker, stats) = spawn_worker(&queue, 2);

        let (tx, rx) = bounded(8);
        for lba in 0..5u64 {
            let tx = tx.clone();
            let write = Submission::new(
                IoCommand::Write {
                    lba: lba * 8,
                    buf: vec![lba as u8; 512],
                },
                Box::new(move |res| {
                    let _ = tx.send(res.is_ok());
                }),
            );
            queue.push(write).ok().unwrap();
        }
        for _ in 0..5 {
            assert!(rx.recv().unwrap());
        }

        queue.close(1);
        worker.join();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.submitted, 5);
        assert_eq!(snapshot.completed, 5);
        assert_eq!(snapshot.outstanding, 0);
        assert_eq!(snapshot.errors, 0);
    }

    #[test]
    fn test_worker_drains_follow_up_requests_after_close() {
        let queue = Arc::new(RequestQueue::new("metadata"));
        let (worker, _stats) = spawn_worker(&queue, 4);
        let (tx, rx) = bounded(1);

        let follow_queue = Arc::clone(&queue);
        let first = Submission::new(
            IoCommand::Flush,
            Box::new(move |_| {
                let second = Submission::new(
                    IoCommand::Flush,
                    Box::new(move |res| {
                        let _ = tx.send(res.is_ok());
                    }),
                );
                follow_queue.push_internal(second).ok().unwrap();
            }),
        );
        queue.push(first).ok().unwrap();
        queue.close(1);

        worker.join();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn test_failed_command_counts_error() {
        let queue = Arc::new(RequestQueue::new("io"));
        let (worker, stats) = spawn_worker(&queue, 1);
        let (tx, rx) = bounded(1);

        queue
            .push(Submission::new(
                IoCommand::Write {
                    lba: 1,
                    buf: vec![0u8; 100],
                },
                Box::new(move |res| {
                    let _ = tx.send(res.is_err());
                }),
            ))
            .ok()
            .unwrap();
        assert!(rx.recv().unwrap());

        queue.close(1);
        worker.join();
        assert_eq!(stats.snapshot().errors, 1);
    }
}
