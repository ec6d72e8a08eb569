//! Metadata slot codec: address-translation tables and the info page.

use std::fmt;

use super::entry::le8;
use super::{
    SegmentId, DATA_TABLE_LEN, INVALID_VERSION, LOG_ENTRY_TABLE_LEN, MAX_NAME_LEN,
    METADATA_ADDRESS_SIZE, METADATA_INFO_SIZE,
};

/// Errors related to metadata slot parsing/validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// Buffer shorter than the encoded structure.
    BufferTooSmall,
    /// Stored checksum does not match the info fields.
    ChecksumMismatch,
    /// The in-use byte is neither 0 nor 1.
    InvalidFlag(u8),
    /// The name is empty, unterminated or not UTF-8.
    InvalidName,
    /// The name does not fit the 256-byte field.
    NameTooLong(usize),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::BufferTooSmall => write!(f, "metadata buffer too small"),
            MetadataError::ChecksumMismatch => write!(f, "metadata checksum mismatch"),
            MetadataError::InvalidFlag(flag) => write!(f, "invalid in-use flag {flag:#x}"),
            MetadataError::InvalidName => write!(f, "invalid log name"),
            MetadataError::NameTooLong(len) => {
                write!(f, "log name of {len} bytes exceeds {MAX_NAME_LEN}")
            }
        }
    }
}

impl std::error::Error for MetadataError {}

/// The two per-log virtual address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentSpace {
    /// Fixed-size log-entry records.
    LogEntry,
    /// Variable-size payload bytes.
    Data,
}

impl SegmentSpace {
    /// Number of logical segments in this space.
    pub const fn table_len(self) -> usize {
        match self {
            SegmentSpace::LogEntry => LOG_ENTRY_TABLE_LEN,
            SegmentSpace::Data => DATA_TABLE_LEN,
        }
    }
}

impl fmt::Display for SegmentSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentSpace::LogEntry => write!(f, "log-entry"),
            SegmentSpace::Data => write!(f, "data"),
        }
    }
}

/// Logical segment index to physical segment id, for both spaces of a log.
///
/// Physical segment 0 always holds the metadata table, so a stored 0 means
/// "not assigned yet".
#[derive(Clone, PartialEq, Eq)]
pub struct AddressTable {
    log_entry: Vec<SegmentId>,
    data: Vec<SegmentId>,
}

impl AddressTable {
    /// Table with every logical segment unassigned.
    pub fn new() -> Self {
        Self {
            log_entry: vec![0; LOG_ENTRY_TABLE_LEN],
            data: vec![0; DATA_TABLE_LEN],
        }
    }

    /// Physical segment backing `index`, if assigned.
    pub fn get(&self, space: SegmentSpace, index: usize) -> Option<SegmentId> {
        match self.table(space).get(index) {
            Some(&0) | None => None,
            Some(&segment) => Some(segment),
        }
    }

    /// Map `index` to `segment`. Segment 0 is never a valid target.
    pub fn set(&mut self, space: SegmentSpace, index: usize, segment: SegmentId) {
        debug_assert!(segment != 0, "segment 0 is reserved for metadata");
        self.table_mut(space)[index] = segment;
    }

    /// Mark `index` unassigned.
    pub fn clear(&mut self, space: SegmentSpace, index: usize) {
        self.table_mut(space)[index] = 0;
    }

    /// All assigned `(space, logical index, physical segment)` triples.
    pub fn assigned(&self) -> impl Iterator<Item = (SegmentSpace, usize, SegmentId)> + '_ {
        let entries = self
            .log_entry
            .iter()
            .enumerate()
            .filter(|(_, &s)| s != 0)
            .map(|(i, &s)| (SegmentSpace::LogEntry, i, s));
        let data = self
            .data
            .iter()
            .enumerate()
            .filter(|(_, &s)| s != 0)
            .map(|(i, &s)| (SegmentSpace::Data, i, s));
        entries.chain(data)
    }

    /// Number of assigned logical segments across both spaces.
    pub fn assigned_count(&self) -> usize {
        self.assigned().count()
    }

    /// Byte offset of an entry within the encoded address part of a slot.
    pub const fn byte_offset(space: SegmentSpace, index: usize) -> usize {
        match space {
            SegmentSpace::LogEntry => index * 2,
            SegmentSpace::Data => (LOG_ENTRY_TABLE_LEN + index) * 2,
        }
    }

    /// Encode as the 28 KiB address part of a slot.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), MetadataError> {
        if buf.len() < METADATA_ADDRESS_SIZE {
            return Err(MetadataError::BufferTooSmall);
        }
        for (i, segment) in self.log_entry.iter().chain(self.data.iter()).enumerate() {
            buf[i * 2..i * 2 + 2].copy_from_slice(&segment.to_le_bytes());
        }
        Ok(())
    }

    /// Decode the address part of a slot.
    pub fn decode(buf: &[u8]) -> Result<Self, MetadataError> {
        if buf.len() < METADATA_ADDRESS_SIZE {
            return Err(MetadataError::BufferTooSmall);
        }
        let mut ids = buf[..METADATA_ADDRESS_SIZE]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]));
        let log_entry = ids.by_ref().take(LOG_ENTRY_TABLE_LEN).collect();
        let data = ids.collect();
        Ok(Self { log_entry, data })
    }

    fn table(&self, space: SegmentSpace) -> &[SegmentId] {
        match space {
            SegmentSpace::LogEntry => &self.log_entry,
            SegmentSpace::Data => &self.data,
        }
    }

    fn table_mut(&mut self, space: SegmentSpace) -> &mut [SegmentId] {
        match space {
            SegmentSpace::LogEntry => &mut self.log_entry,
            SegmentSpace::Data => &mut self.data,
        }
    }
}

impl Default for AddressTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AddressTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressTable")
            .field("assigned", &self.assigned_count())
            .finish()
    }
}

/// Info part of a metadata slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMetadataInfo {
    /// Unique name of the log.
    pub name: String,
    /// Slot index; stable for the lifetime of the log.
    pub id: u32,
    /// Index of the first live entry.
    pub head: i64,
    /// One past the last committed entry.
    pub tail: i64,
    /// Latest committed version, or [`INVALID_VERSION`].
    pub version: i64,
    /// Whether the slot is occupied.
    pub in_use: bool,
}

impl LogMetadataInfo {
    const NAME_FIELD: usize = 256;
    const ID_OFFSET: usize = 256;
    // 4 bytes of padding keep the i64 fields 8-byte aligned.
    const HEAD_OFFSET: usize = 264;
    const TAIL_OFFSET: usize = 272;
    const VERSION_OFFSET: usize = 280;
    const IN_USE_OFFSET: usize = 288;
    const FIELDS_END: usize = 289;
    const CHECKSUM_OFFSET: usize = METADATA_INFO_SIZE - 8;

    /// A fresh, empty log occupying slot `id`.
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
            head: 0,
            tail: 0,
            version: INVALID_VERSION,
            in_use: true,
        }
    }

    /// Whether the log holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.tail == self.head
    }

    /// Number of live entries.
    pub fn len(&self) -> u64 {
        (self.tail - self.head).max(0) as u64
    }

    /// Compare head, tail and version only.
    pub fn same_progress(&self, other: &Self) -> bool {
        self.head == other.head && self.tail == other.tail && self.version == other.version
    }

    /// Reject empty names, embedded NULs and names over the slot limit.
    pub fn validate_name(name: &str) -> Result<(), MetadataError> {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(MetadataError::InvalidName);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(MetadataError::NameTooLong(name.len()));
        }
        Ok(())
    }

    /// Encode as a 4 KiB info page, checksum included.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), MetadataError> {
        if buf.len() < METADATA_INFO_SIZE {
            return Err(MetadataError::BufferTooSmall);
        }
        Self::validate_name(&self.name)?;

        buf[..METADATA_INFO_SIZE].fill(0);
        buf[..self.name.len()].copy_from_slice(self.name.as_bytes());
        buf[Self::ID_OFFSET..Self::ID_OFFSET + 4].copy_from_slice(&self.id.to_le_bytes());
        buf[Self::HEAD_OFFSET..Self::HEAD_OFFSET + 8].copy_from_slice(&self.head.to_le_bytes());
        buf[Self::TAIL_OFFSET..Self::TAIL_OFFSET + 8].copy_from_slice(&self.tail.to_le_bytes());
        buf[Self::VERSION_OFFSET..Self::VERSION_OFFSET + 8]
            .copy_from_slice(&self.version.to_le_bytes());
        buf[Self::IN_USE_OFFSET] = u8::from(self.in_use);

        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[..Self::FIELDS_END]);
        buf[Self::CHECKSUM_OFFSET..METADATA_INFO_SIZE].copy_from_slice(&checksum.to_le_bytes());
        Ok(())
    }

    /// Decode an info page. Free slots decode to `None` without further checks.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, MetadataError> {
        if buf.len() < METADATA_INFO_SIZE {
            return Err(MetadataError::BufferTooSmall);
        }
        match buf[Self::IN_USE_OFFSET] {
            0 => return Ok(None),
            1 => {}
            flag => return Err(MetadataError::InvalidFlag(flag)),
        }

        let stored = u64::from_le_bytes(le8(&buf[Self::CHECKSUM_OFFSET..]));
        if stored != xxhash_rust::xxh3::xxh3_64(&buf[..Self::FIELDS_END]) {
            return Err(MetadataError::ChecksumMismatch);
        }

        let name_field = &buf[..Self::NAME_FIELD];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .ok_or(MetadataError::InvalidName)?;
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| MetadataError::InvalidName)?
            .to_string();
        Self::validate_name(&name)?;

        let mut id = [0u8; 4];
        id.copy_from_slice(&buf[Self::ID_OFFSET..Self::ID_OFFSET + 4]);

        Ok(Some(Self {
            name,
            id: u32::from_le_bytes(id),
            head: i64::from_le_bytes(le8(&buf[Self::HEAD_OFFSET..])),
            tail: i64::from_le_bytes(le8(&buf[Self::TAIL_OFFSET..])),
            version: i64::from_le_bytes(le8(&buf[Self::VERSION_OFFSET..])),
            in_use: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_layout_offsets() {
        let mut info = LogMetadataInfo::new("orders", 3);
        info.head = 2;
        info.tail = 9;
        info.version = 41;

        let mut page = vec![0u8; METADATA_INFO_SIZE];
        info.encode(&mut page).unwrap();

        assert_eq!(&page[..6], b"orders");
        assert_eq!(page[6], 0);
        assert_eq!(&page[256..260], &3u32.to_le_bytes());
        assert_eq!(&page[264..272], &2i64.to_le_bytes());
        assert_eq!(&page[272..280], &9i64.to_le_bytes());
        assert_eq!(&page[280..288], &41i64.to_le_bytes());
        assert_eq!(page[288], 1);
        assert_eq!(LogMetadataInfo::decode(&page).unwrap(), Some(info));
    }

    #[test]
    fn test_free_slot_decodes_to_none() {
        let page = vec![0u8; METADATA_INFO_SIZE];
        assert_eq!(LogMetadataInfo::decode(&page).unwrap(), None);
    }

    #[test]
    fn test_corrupted_info_is_rejected() {
        let mut page = vec![0u8; METADATA_INFO_SIZE];
        LogMetadataInfo::new("a", 0).encode(&mut page).unwrap();
        page[270] ^= 0x01;
        assert_eq!(
            LogMetadataInfo::decode(&page),
            Err(MetadataError::ChecksumMismatch)
        );

        page[288] = 7;
        assert_eq!(LogMetadataInfo::decode(&page), Err(MetadataError::InvalidFlag(7)));
    }

    #[test]
    fn test_name_validation() {
        assert!(LogMetadataInfo::validate_name("").is_err());
        assert_eq!(
            LogMetadataInfo::validate_name(&"x".repeat(256)),
            Err(MetadataError::NameTooLong(256))
        );
        assert!(LogMetadataInfo::validate_name(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn test_address_table_codec() {
        let mut table = AddressTable::new();
        table.set(SegmentSpace::LogEntry, 0, 5);
        table.set(SegmentSpace::Data, 7, 9);

        let mut buf = vec![0u8; METADATA_ADDRESS_SIZE];
        table.encode(&mut buf).unwrap();
        assert_eq!(&buf[0..2], &5u16.to_le_bytes());
        let data_start = LOG_ENTRY_TABLE_LEN * 2;
        assert_eq!(&buf[data_start + 14..data_start + 16], &9u16.to_le_bytes());

        assert_eq!(
            AddressTable::byte_offset(SegmentSpace::Data, 7),
            data_start + 14
        );
        let decoded = AddressTable::decode(&buf).unwrap();
        assert_eq!(decoded.get(SegmentSpace::Data, 7), Some(9));
        assert_eq!(decoded.get(SegmentSpace::Data, 6), None);
        assert_eq!(decoded.assigned_count(), 2);
    }

    #[test]
    fn test_progress_comparison_ignores_name() {
        let a = LogMetadataInfo::new("a", 0);
        let mut b = LogMetadataInfo::new("b", 1);
        assert!(a.same_progress(&b));
        b.tail = 1;
        assert!(!a.same_progress(&b));
    }
}
