//! Shared test utilities for crash consistency and fault injection tests.

#![allow(dead_code)]

use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use nvlog::device::{LocalDriver, MemNamespace, SyncStorageDevice};
use nvlog::layout::{info_page_offset, SEGMENT_SIZE};
use nvlog::{EngineConfig, LogEngine};

/// Default namespace size for tests: seven usable segments.
pub const TEST_CAPACITY: u64 = 8 * SEGMENT_SIZE;

/// A write or flush that reached the device, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Write(u64),
    Flush,
}

/// A fault-injection wrapper around a shared [`MemNamespace`].
///
/// Writes overlapping an armed byte range fail with `io::ErrorKind::Other`
/// until the range is cleared, and [`FaultInjectionDevice::hold_writes`]
/// parks writers until released. The inner namespace stays reachable so a
/// later engine can reopen the same bytes.
pub struct FaultInjectionDevice {
    inner: Arc<MemNamespace>,
    fail_range: Mutex<Option<Range<u64>>>,
    fail_once: AtomicBool,
    fail_flushes: AtomicBool,
    held: Mutex<bool>,
    released: Condvar,
    parked: AtomicU64,
    write_count: AtomicU64,
    failed_writes: AtomicU64,
    ops: Mutex<Vec<DeviceOp>>,
}

impl FaultInjectionDevice {
    pub fn new(inner: Arc<MemNamespace>) -> Self {
        Self {
            inner,
            fail_range: Mutex::new(None),
            fail_once: AtomicBool::new(false),
            fail_flushes: AtomicBool::new(false),
            held: Mutex::new(false),
            released: Condvar::new(),
            parked: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &Arc<MemNamespace> {
        &self.inner
    }

    /// Fail every write touching `range`.
    pub fn fail_writes_in(&self, range: Range<u64>) {
        self.fail_once.store(false, Ordering::SeqCst);
        *self.fail_range.lock() = Some(range);
    }

    /// Fail only the next write of the info page of slot `id`.
    pub fn fail_info_page_once(&self, id: u32) {
        self.fail_info_page(id);
        self.fail_once.store(true, Ordering::SeqCst);
    }

    /// Fail every flush until [`FaultInjectionDevice::clear_faults`].
    pub fn fail_flushes(&self) {
        self.fail_flushes.store(true, Ordering::SeqCst);
    }

    /// Fail writes of the info page of metadata slot `id`.
    pub fn fail_info_page(&self, id: u32) {
        let start = info_page_offset(id as usize);
        self.fail_writes_in(start..start + 4096);
    }

    /// Fail writes anywhere past the metadata segment.
    pub fn fail_data_writes(&self) {
        self.fail_writes_in(SEGMENT_SIZE..u64::MAX);
    }

    pub fn clear_faults(&self) {
        *self.fail_range.lock() = None;
        self.fail_flushes.store(false, Ordering::SeqCst);
    }

    /// Block every write until [`FaultInjectionDevice::release_writes`].
    pub fn hold_writes(&self) {
        *self.held.lock() = true;
    }

    pub fn release_writes(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }

    /// Wait until `writers` writes are parked by the hold gate.
    pub fn wait_parked(&self, writers: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.parked.load(Ordering::SeqCst) < writers {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn ops(&self) -> Vec<DeviceOp> {
        self.ops.lock().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    pub fn flush_count(&self) -> usize {
        self.ops().iter().filter(|op| **op == DeviceOp::Flush).count()
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::SeqCst)
    }
}

impl SyncStorageDevice for FaultInjectionDevice {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_sync(offset, buf)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        {
            let mut held = self.held.lock();
            if *held {
                self.parked.fetch_add(1, Ordering::SeqCst);
                while *held {
                    self.released.wait(&mut held);
                }
                self.parked.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.write_count.fetch_add(1, Ordering::SeqCst);
        self.ops.lock().push(DeviceOp::Write(offset));
        let mut armed = self.fail_range.lock();
        if let Some(range) = armed.clone() {
            let end = offset + buf.len() as u64;
            if offset < range.end && range.start < end {
                if self.fail_once.swap(false, Ordering::SeqCst) {
                    *armed = None;
                }
                self.failed_writes.fetch_add(1, Ordering::SeqCst);
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected write failure at offset {offset}"),
                ));
            }
        }
        drop(armed);
        self.inner.write_sync(offset, buf)
    }

    fn flush_sync(&self) -> io::Result<()> {
        self.ops.lock().push(DeviceOp::Flush);
        if self.fail_flushes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected flush failure"));
        }
        self.inner.flush_sync()
    }

    fn capacity_sync(&self) -> u64 {
        self.inner.capacity_sync()
    }

    fn sector_size(&self) -> usize {
        SyncStorageDevice::sector_size(&*self.inner)
    }
}

/// A fresh sparse namespace of [`TEST_CAPACITY`] bytes.
pub fn namespace() -> Arc<MemNamespace> {
    Arc::new(MemNamespace::new(TEST_CAPACITY))
}

/// An engine over `namespace` with the default configuration.
pub fn engine(namespace: &Arc<MemNamespace>) -> LogEngine<MemNamespace> {
    engine_with(namespace, EngineConfig::default())
}

pub fn engine_with(
    namespace: &Arc<MemNamespace>,
    config: EngineConfig,
) -> LogEngine<MemNamespace> {
    let driver = LocalDriver::single("mem0", Arc::clone(namespace));
    LogEngine::init(&driver, config).expect("engine init")
}

/// An engine over a fault-injecting wrapper of `namespace`.
pub fn faulty_engine(
    namespace: &Arc<MemNamespace>,
) -> (LogEngine<FaultInjectionDevice>, Arc<FaultInjectionDevice>) {
    faulty_engine_with(namespace, EngineConfig::default())
}

pub fn faulty_engine_with(
    namespace: &Arc<MemNamespace>,
    config: EngineConfig,
) -> (LogEngine<FaultInjectionDevice>, Arc<FaultInjectionDevice>) {
    let device = Arc::new(FaultInjectionDevice::new(Arc::clone(namespace)));
    let driver = LocalDriver::single("faulty0", Arc::clone(&device));
    let engine = LogEngine::init(&driver, config).expect("engine init");
    (engine, device)
}

/// Payload `len` bytes long, filled with `byte`.
pub fn payload(byte: u8, len: usize) -> Vec<u8> {
    vec![byte; len]
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}

/// Seed and step count of a randomized test, overridable through
/// `NVLOG_FUZZ_SEED` and `NVLOG_FUZZ_STEPS`.
pub fn fuzz_params(tag: &str, default_steps: usize) -> (u64, usize) {
    let mut seed = env_u64("NVLOG_FUZZ_SEED").unwrap_or(0x6e76_6c6f_6700_0001);
    for (i, b) in tag.as_bytes().iter().enumerate() {
        seed ^= (*b as u64) << ((i % 8) * 8);
        seed = seed.rotate_left(13).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    }
    let steps = env_u64("NVLOG_FUZZ_STEPS")
        .map(|s| s as usize)
        .unwrap_or(default_steps);
    (seed, steps)
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
