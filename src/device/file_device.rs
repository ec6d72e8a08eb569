//! File-backed namespace
//!
//! Emulates a raw namespace with a preallocated (sparse) file. Positional
//! reads and writes keep the file handle lock-free.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::device::traits::check_range;
use crate::device::SyncStorageDevice;

/// A file standing in for an NVMe namespace.
pub struct FileNamespace {
    /// Path to the backing file
    path: PathBuf,
    file: File,
    capacity: u64,
    sector_size: usize,
}

impl FileNamespace {
    /// Open the backing file, creating it with `capacity` bytes if missing.
    ///
    /// An existing file keeps its length; it must be at least one sector.
    pub fn open(path: impl AsRef<Path>, capacity: u64, sector_size: usize) -> io::Result<Self> {
        if !sector_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sector size {sector_size} is not a power of two"),
            ));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut len = file.metadata()?.len();
        if len == 0 {
            file.set_len(capacity)?;
            len = capacity;
            debug!(path = %path.display(), capacity, "created namespace file");
        }
        let capacity = len - len % sector_size as u64;

        Ok(Self {
            path,
            file,
            capacity,
            sector_size,
        })
    }

    /// Get the path to the file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SyncStorageDevice for FileNamespace {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        check_range(offset, buf.len(), self.sector_size, self.capacity)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(buf.len())
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        check_range(offset, buf.len(), self.sector_size, self.capacity)?;
        self.file.write_all_at(buf, offset)?;
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        self.file.sync_data()
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
    use tempfile::tempdir;

    #[test]
    fn test_file_namespace_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ns0.img");

        let ns = FileNamespace::open(&path, 1 << 20, 512).unwrap();
        assert_eq!(ns.capacity_sync(), 1 << 20);

        let data = vec![0x5Au8; 1024];
        assert_eq!(ns.write_sync(2048, &data).unwrap(), 1024);
        ns.flush_sync().unwrap();

        let mut buf = vec![0u8; 1024];
        ns.read_sync(2048, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_reopen_keeps_capacity_and_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ns1.img");

        {
            let ns = FileNamespace::open(&path, 64 * 1024, 4096).unwrap();
            ns.write_sync(4096, &[7u8; 4096]).unwrap();
        }

        let ns = FileNamespace::open(&path, 1, 4096).unwrap();
        assert_eq!(ns.capacity_sync(), 64 * 1024);
        let mut buf = vec![0u8; 4096];
        ns.read_sync(4096, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_rejects_bad_sector_size() {
        let dir = tempdir().unwrap();
        assert!(FileNamespace::open(dir.path().join("bad.img"), 4096, 500).is_err());
    }
}
