//! In-memory view of the global metadata table
//!
//! One [`LogSlot`] per metadata slot, a name index over the in-use slots,
//! and the two locks that guard table-wide changes: the assignment lock
//! (claiming a free slot) and the load-once lock (reading the table back
//! from the device).

mod pending;
mod recovery;
mod slot;

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::layout::{LogMetadataInfo, NUM_LOGS_SUPPORTED};

pub(crate) use pending::PendingWrite;
pub(crate) use recovery::{validate, RecoveredSlot};
pub(crate) use slot::{check_space_range, Extent, LogSlot, TailSector};

pub(crate) struct LogRegistry {
    slots: Vec<LogSlot>,
    names: RwLock<HashMap<String, u32>>,
    assignment: Mutex<()>,
    load_once: Mutex<bool>,
}

impl LogRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: (0..NUM_LOGS_SUPPORTED as u32).map(LogSlot::new).collect(),
            names: RwLock::new(HashMap::new()),
            assignment: Mutex::new(()),
            load_once: Mutex::new(false),
        }
    }

    pub(crate) fn slot(&self, id: u32) -> Result<&LogSlot> {
        self.slots
            .get(id as usize)
            .ok_or_else(|| Error::not_found(format!("log id {id}")))
    }

    /// A slot that is in use and opened in this process.
    pub(crate) fn opened(&self, id: u32) -> Result<&LogSlot> {
        let slot = self.slot(id)?;
        if !slot.is_opened() {
            return Err(Error::not_found(format!("log {id} is not loaded")));
        }
        Ok(slot)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<u32> {
        self.names.read().get(name).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.names.read().len()
    }

    /// Guard of the load-once flag; `true` once the table has been read.
    pub(crate) fn load_guard(&self) -> MutexGuard<'_, bool> {
        self.load_once.lock()
    }

    /// Claim the first free slot for `name`, or return the existing id.
    ///
    /// A fresh claim holds the assignment lock until it is published or
    /// dropped, so no other loader can see the name or take the slot while
    /// the caller persists it. Dropping an unpublished claim frees the slot.
    pub(crate) fn claim(&self, name: &str, sector_size: usize) -> Result<Claimed<'_>> {
        LogMetadataInfo::validate_name(name)?;
        let assignment = self.assignment.lock();
        if let Some(id) = self.lookup(name) {
            return Ok(Claimed::Existing(id));
        }

        for slot in &self.slots {
            let mut state = slot.state.write();
            if state.info.is_some() {
                continue;
            }
            state.info = Some(LogMetadataInfo::new(name, slot.id()));
            state.mark_all_dirty(sector_size);
            drop(state);

            debug!(name, id = slot.id(), "claimed metadata slot");
            return Ok(Claimed::New(Claim {
                registry: self,
                _assignment: assignment,
                slot,
                name: name.to_string(),
                published: false,
            }));
        }
        Err(Error::TooManyLogs(NUM_LOGS_SUPPORTED))
    }

    /// Install validated slots read from the device.
    pub(crate) fn install(&self, recovered: Vec<RecoveredSlot>) {
        let _assignment = self.assignment.lock();
        let mut names = self.names.write();
        for RecoveredSlot { slot, info, table } in recovered {
            let log = &self.slots[slot];
            log.reset_version(info.version);
            names.insert(info.name.clone(), info.id);
            let mut state = log.state.write();
            state.info = Some(info);
            state.table = table;
        }
    }
}

/// Outcome of [`LogRegistry::claim`].
pub(crate) enum Claimed<'a> {
    /// The name already maps to this id.
    Existing(u32),
    /// A free slot reserved for the name, not yet visible to lookups.
    New(Claim<'a>),
}

/// A slot reserved for a new log while its first commit is in flight.
pub(crate) struct Claim<'a> {
    registry: &'a LogRegistry,
    _assignment: MutexGuard<'a, ()>,
    slot: &'a LogSlot,
    name: String,
    published: bool,
}

impl Claim<'_> {
    pub(crate) fn id(&self) -> u32 {
        self.slot.id()
    }

    pub(crate) fn slot(&self) -> &LogSlot {
        self.slot
    }

    /// Make the log visible by name once it is durable.
    pub(crate) fn publish(mut self) -> u32 {
        self.registry
            .names
            .write()
            .insert(std::mem::take(&mut self.name), self.slot.id());
        self.published = true;
        self.slot.id()
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        debug!(name = %self.name, id = self.slot.id(), "released unpublished claim");
        self.slot.state.write().reset();
        self.slot.close();
    }
}
