//! Request pipeline between callers and the device
//!
//! Callers never touch a queue pair. They push [`Submission`]s onto one of
//! two [`RequestQueue`]s: the data/log queue, drained by one or more io
//! workers, or the metadata queue, drained by exactly one worker so commits
//! for a log stay totally ordered. Each worker owns a queue pair and reaps
//! its completions, which is where completion callbacks run.
//!
//! [`Submission`]: crate::device::Submission

mod barrier;
mod queue;
mod worker;

pub(crate) use barrier::CompletionBarrier;
pub(crate) use queue::RequestQueue;
pub(crate) use worker::{Worker, WorkerStats};
pub use worker::WorkerStatsSnapshot;
