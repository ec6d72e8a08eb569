use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::config::BusyPolicy;
use crate::error::{Error, Result};
use crate::layout::LogMetadataInfo;

/// Serializes writes to one log.
///
/// Holds the metadata image of the write in flight, from the moment the
/// write is accepted until its metadata commit (or failure) completes.
#[derive(Default)]
pub(crate) struct PendingWrite {
    image: Mutex<Option<LogMetadataInfo>>,
    cond: Condvar,
}

impl PendingWrite {
    /// Take the write slot for `image`.
    pub(crate) fn begin(&self, image: LogMetadataInfo, policy: BusyPolicy) -> Result<()> {
        let mut guard = self.image.lock();
        while guard.is_some() {
            if policy == BusyPolicy::FailFast {
                return Err(Error::Busy(image.id));
            }
            self.cond.wait(&mut guard);
        }
        *guard = Some(image);
        Ok(())
    }

    /// Release the write slot and wake every waiter.
    pub(crate) fn finish(&self) -> Option<LogMetadataInfo> {
        let mut guard = self.image.lock();
        let image = guard.take();
        self.cond.notify_all();
        image
    }

    /// Version of the write in flight, if any.
    #[cfg(test)]
    pub(crate) fn in_flight_version(&self) -> Option<i64> {
        self.image.lock().as_ref().map(|image| image.version)
    }

    /// Block until `done` holds or `deadline` passes. `done` is re-checked
    /// after every [`PendingWrite::finish`].
    pub(crate) fn wait_until(&self, deadline: Instant, done: impl Fn() -> bool) -> bool {
        let mut guard = self.image.lock();
        loop {
            if done() {
                return true;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return done();
            }
        }
    }
}
