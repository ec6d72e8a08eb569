//! Namespace traits for the block devices the engine runs on.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by namespace I/O.
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Async block namespace.
///
/// Offsets and lengths handed to a namespace are always multiples of
/// [`StorageDevice::sector_size`]; the engine validates them before submission.
pub trait StorageDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes starting at `offset`.
    fn read<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> IoFuture<'a, usize>;

    /// Write `buf` at `offset`.
    fn write<'a>(&'a self, offset: u64, buf: &'a [u8]) -> IoFuture<'a, usize>;

    /// Flush volatile write caches to stable media.
    fn flush(&self) -> IoFuture<'_, ()>;

    /// Namespace capacity in bytes.
    fn capacity(&self) -> u64;

    /// Logical block size.
    fn sector_size(&self) -> usize {
        512
    }
}

/// Synchronous namespace trait (for simpler implementations).
pub trait SyncStorageDevice: Send + Sync + 'static {
    /// Read data synchronously
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write data synchronously
    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Flush synchronously
    fn flush_sync(&self) -> io::Result<()>;

    /// Capacity in bytes
    fn capacity_sync(&self) -> u64;

    /// Logical block size
    fn sector_size(&self) -> usize {
        512
    }
}

/// Implement async trait for sync namespaces
impl<T: SyncStorageDevice> StorageDevice for T {
    fn read<'a>(&'a self, offset: u64, buf: &'a mut [u8]) -> IoFuture<'a, usize> {
        let result = self.read_sync(offset, buf);
        Box::pin(async move { result })
    }

    fn write<'a>(&'a self, offset: u64, buf: &'a [u8]) -> IoFuture<'a, usize> {
        let result = self.write_sync(offset, buf);
        Box::pin(async move { result })
    }

    fn flush(&self) -> IoFuture<'_, ()> {
        let result = self.flush_sync();
        Box::pin(async move { result })
    }

    fn capacity(&self) -> u64 {
        self.capacity_sync()
    }

    fn sector_size(&self) -> usize {
        SyncStorageDevice::sector_size(self)
    }
}

/// Shared namespaces forward to the inner implementation.
impl<T: SyncStorageDevice> SyncStorageDevice for Arc<T> {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_sync(offset, buf)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        (**self).write_sync(offset, buf)
    }

    fn flush_sync(&self) -> io::Result<()> {
        (**self).flush_sync()
    }

    fn capacity_sync(&self) -> u64 {
        (**self).capacity_sync()
    }

    fn sector_size(&self) -> usize {
        (**self).sector_size()
    }
}

/// Check that a request is sector aligned and inside the namespace.
pub(crate) fn check_range(
    offset: u64,
    len: usize,
    sector_size: usize,
    capacity: u64,
) -> io::Result<()> {
    let sector = sector_size as u64;
    if offset % sector != 0 || len as u64 % sector != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unaligned request: offset {offset}, length {len}, sector {sector_size}"),
        ));
    }
    match offset.checked_add(len as u64) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("request [{offset}, +{len}) exceeds capacity {capacity}"),
        )),
    }
}
