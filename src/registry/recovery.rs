//! Validation of a metadata table read back from the device.

use std::collections::{HashMap, HashSet};

use tracing::error;

use crate::error::{Error, Result};
use crate::layout::{AddressTable, LogMetadataInfo, INVALID_VERSION, RESERVED_SEGMENTS};

/// An in-use slot as read from the device.
#[derive(Debug, Clone)]
pub(crate) struct RecoveredSlot {
    pub(crate) slot: usize,
    pub(crate) info: LogMetadataInfo,
    pub(crate) table: AddressTable,
}

/// Check the recovered slots against each other and the device size.
///
/// Any violation is reported as [`Error::Corruption`]; there is no partial
/// recovery.
pub(crate) fn validate(slots: &[RecoveredSlot], segment_count: usize) -> Result<()> {
    let mut names: HashMap<&str, usize> = HashMap::new();
    let mut owners: HashSet<u16> = HashSet::new();

    for recovered in slots {
        let RecoveredSlot { slot, info, table } = recovered;
        let fail = |message: String| {
            error!(slot, name = %info.name, "metadata table corrupt: {message}");
            Err(Error::corruption(format!("slot {slot}: {message}")))
        };

        if info.id as usize != *slot {
            return fail(format!("stored id {} does not match the slot", info.id));
        }
        if info.tail < info.head || info.head < 0 {
            return fail(format!("head {} / tail {} out of order", info.head, info.tail));
        }
        if info.version < INVALID_VERSION {
            return fail(format!("invalid version {}", info.version));
        }
        if let Some(other) = names.insert(info.name.as_str(), *slot) {
            return fail(format!("name {:?} is also used by slot {other}", info.name));
        }
        for (space, index, segment) in table.assigned() {
            if segment < RESERVED_SEGMENTS || segment as usize >= segment_count {
                return fail(format!(
                    "{space} segment {index} maps to segment {segment} outside the device"
                ));
            }
            if !owners.insert(segment) {
                return fail(format!("segment {segment} is assigned more than once"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SegmentSpace;

    fn recovered(slot: usize, name: &str) -> RecoveredSlot {
        RecoveredSlot {
            slot,
            info: LogMetadataInfo::new(name, slot as u32),
            table: AddressTable::new(),
        }
    }

    #[test]
    fn test_valid_table() {
        let mut a = recovered(0, "a");
        a.table.set(SegmentSpace::LogEntry, 0, 1);
        let mut b = recovered(3, "b");
        b.table.set(SegmentSpace::Data, 0, 2);
        b.info.tail = 4;
        assert!(validate(&[a, b], 4).is_ok());
    }

    #[test]
    fn test_duplicate_segment() {
        let mut a = recovered(0, "a");
        a.table.set(SegmentSpace::LogEntry, 0, 1);
        let mut b = recovered(1, "b");
        b.table.set(SegmentSpace::Data, 5, 1);
        assert!(matches!(validate(&[a, b], 4), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_segment_beyond_device() {
        let mut a = recovered(0, "a");
        a.table.set(SegmentSpace::Data, 0, 4);
        assert!(matches!(validate(&[a], 4), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_duplicate_name_and_bad_progress() {
        assert!(validate(&[recovered(0, "a"), recovered(1, "a")], 4).is_err());

        let mut a = recovered(0, "a");
        a.info.head = 2;
        a.info.tail = 1;
        assert!(validate(&[a], 4).is_err());

        let mut b = recovered(2, "b");
        b.info.id = 7;
        assert!(validate(&[b], 4).is_err());
    }
}
