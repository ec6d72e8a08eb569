//! Sparse in-memory namespace
//!
//! Stores only the pages that were written; unwritten ranges read back as
//! zeros, like a freshly formatted namespace. Useful for tests and for
//! exercising full-size layouts without allocating the whole capacity.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::device::traits::check_range;
use crate::device::SyncStorageDevice;

const PAGE_SIZE: u64 = 4096;

/// In-memory namespace with a fixed capacity.
pub struct MemNamespace {
    capacity: u64,
    sector_size: usize,
    pages: RwLock<HashMap<u64, Box<[u8]>>>,
    bytes_written: AtomicU64,
}

impl MemNamespace {
    /// Create a namespace with 512-byte sectors.
    pub fn new(capacity: u64) -> Self {
        Self::with_sector_size(capacity, 512)
    }

    /// Create a namespace with a specific sector size (power of two, ≤ 4096).
    pub fn with_sector_size(capacity: u64, sector_size: usize) -> Self {
        debug_assert!(sector_size.is_power_of_two() && sector_size as u64 <= PAGE_SIZE);
        Self {
            capacity,
            sector_size,
            pages: RwLock::new(HashMap::new()),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// Number of resident pages.
    pub fn resident_pages(&self) -> usize {
        self.pages.read().len()
    }

    /// Total bytes accepted by writes.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    /// Overwrite bytes directly, bypassing alignment checks.
    ///
    /// Used to simulate media corruption.
    pub fn poke(&self, offset: u64, bytes: &[u8]) {
        self.copy_in(offset, bytes);
    }

    fn copy_in(&self, offset: u64, buf: &[u8]) {
        let mut pages = self.pages.write();
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page_no = pos / PAGE_SIZE;
            let in_page = (pos % PAGE_SIZE) as usize;
            let len = (PAGE_SIZE as usize - in_page).min(buf.len() - done);
            let page = pages
                .entry(page_no)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page[in_page..in_page + len].copy_from_slice(&buf[done..done + len]);
            done += len;
        }
    }
}

impl SyncStorageDevice for MemNamespace {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        check_range(offset, buf.len(), self.sector_size, self.capacity)?;
        let pages = self.pages.read();
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page_no = pos / PAGE_SIZE;
            let in_page = (pos % PAGE_SIZE) as usize;
            let len = (PAGE_SIZE as usize - in_page).min(buf.len() - done);
            match pages.get(&page_no) {
                Some(page) => buf[done..done + len].copy_from_slice(&page[in_page..in_page + len]),
                None => buf[done..done + len].fill(0),
            }
            done += len;
        }
        Ok(buf.len())
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        check_range(offset, buf.len(), self.sector_size, self.capacity)?;
        self.copy_in(offset, buf);
        self.bytes_written
            .fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn capacity_sync(&self) -> u64 {
        self.capacity
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritten_reads_zero() {
        let ns = MemNamespace::new(1 << 20);
        let mut buf = [1u8; 512];
        assert_eq!(ns.read_sync(4096, &mut buf).unwrap(), 512);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(ns.resident_pages(), 0);
    }

    #[test]
    fn test_write_spanning_pages() {
        let ns = MemNamespace::new(1 << 20);
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        ns.write_sync(3584, &data).unwrap();

        let mut buf = vec![0u8; 8192];
        ns.read_sync(3584, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(ns.resident_pages(), 3);
        assert_eq!(ns.bytes_written(), 8192);
    }

    #[test]
    fn test_rejects_unaligned_and_out_of_bounds() {
        let ns = MemNamespace::new(4096);
        let mut buf = [0u8; 512];
        assert!(ns.read_sync(1, &mut buf).is_err());
        assert!(ns.write_sync(4096, &buf).is_err());
    }
}
