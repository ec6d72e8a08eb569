//! Block device abstraction
//!
//! This module provides the namespace traits, the controller probe/attach
//! contract, device geometry and the queue pairs that workers submit to.

mod controller;
mod file_device;
mod geometry;
mod mem_device;
mod qpair;
mod traits;

pub use controller::{
    AttachHandler, Controller, ControllerOptions, Driver, LocalDriver, TransportId, TransportType,
};
pub(crate) use controller::ControllerSelector;
pub use file_device::FileNamespace;
pub use geometry::DeviceGeometry;
pub use mem_device::MemNamespace;
pub use qpair::{CompletionFn, IoCommand, QueuePair, Submission};
pub use traits::{IoFuture, StorageDevice, SyncStorageDevice};
