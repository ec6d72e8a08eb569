//! Request queue shared by callers and the workers that drain it.

use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;

use crate::device::Submission;

pub(crate) enum QueueItem {
    Request(Submission),
    /// Nudges a blocked worker so it re-checks the closed flag.
    Wake,
}

/// Unbounded FIFO of device submissions.
///
/// Caller-facing pushes are rejected once the queue is closed. Completion
/// callbacks running on a worker use [`RequestQueue::push_internal`], which
/// the worker is guaranteed to drain before it exits.
pub(crate) struct RequestQueue {
    name: &'static str,
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
    open: RwLock<bool>,
}

impl RequestQueue {
    pub(crate) fn new(name: &'static str) -> Self {
        let (tx, rx) = unbounded();
        Self {
            name,
            tx,
            rx,
            open: RwLock::new(true),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue a request. A closed queue hands the submission back.
    pub(crate) fn push(&self, submission: Submission) -> Result<(), Submission> {
        let open = self.open.read();
        if !*open {
            return Err(submission);
        }
        self.send(submission)
    }

    /// Enqueue from a completion callback, regardless of the closed flag.
    pub(crate) fn push_internal(&self, submission: Submission) -> Result<(), Submission> {
        self.send(submission)
    }

    fn send(&self, submission: Submission) -> Result<(), Submission> {
        self.tx
            .send(QueueItem::Request(submission))
            .map_err(|err| match err.into_inner() {
                QueueItem::Request(submission) => submission,
                QueueItem::Wake => unreachable!("only requests are sent here"),
            })
    }

    /// Stop accepting caller requests and wake `waiters` blocked workers.
    pub(crate) fn close(&self, waiters: usize) {
        let mut open = self.open.write();
        *open = false;
        for _ in 0..waiters {
            let _ = self.tx.send(QueueItem::Wake);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        !*self.open.read()
    }

    /// Requests (and wake tokens) still queued.
    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Block up to `timeout` for the next item.
    pub(crate) fn recv_timeout(&self, timeout: Duration) -> Option<QueueItem> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub(crate) fn try_recv(&self) -> Option<QueueItem> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}
