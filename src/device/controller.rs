//! Controller discovery: probe/attach callbacks and an in-process driver.
//!
//! A driver enumerates controllers and calls back into an [`AttachHandler`]:
//! `probe` accepts or rejects each discovered controller and may adjust its
//! options; `attach` hands over an accepted controller.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::device::StorageDevice;

/// Transport a controller is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Local PCIe function.
    Pcie,
    /// NVMe over TCP.
    Tcp,
    /// NVMe over RDMA.
    Rdma,
    /// In-process namespace.
    Local,
}

/// Identifies one discovered controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportId {
    /// Transport the controller was found on.
    pub transport: TransportType,
    /// Transport address (PCI BDF, host:port, or a local label).
    pub address: String,
}

impl TransportId {
    /// Transport id from its parts.
    pub fn new(transport: TransportType, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
        }
    }

    /// Transport id for an in-process namespace.
    pub fn local(address: impl Into<String>) -> Self {
        Self::new(TransportType::Local, address)
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.transport, self.address)
    }
}

/// Options negotiated while probing a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Number of I/O queue pairs requested.
    pub num_io_queues: u32,
    /// Entries per I/O queue.
    pub io_queue_size: u32,
    /// Outstanding requests allowed per queue pair.
    pub io_queue_requests: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            num_io_queues: 8,
            io_queue_size: 256,
            io_queue_requests: 512,
        }
    }
}

/// An attached controller and its single active namespace.
pub struct Controller<D: StorageDevice> {
    transport: TransportId,
    namespace: Arc<D>,
    max_transfer_size: usize,
}

impl<D: StorageDevice> Controller<D> {
    /// Controller exposing `namespace`, accepting requests up to
    /// `max_transfer_size` bytes.
    pub fn new(transport: TransportId, namespace: Arc<D>, max_transfer_size: usize) -> Self {
        Self {
            transport,
            namespace,
            max_transfer_size,
        }
    }

    /// Where the controller was found.
    pub fn transport(&self) -> &TransportId {
        &self.transport
    }

    /// The first (and only) active namespace.
    pub fn namespace(&self) -> &Arc<D> {
        &self.namespace
    }

    /// Largest transfer the controller accepts in one command.
    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }
}

impl<D: StorageDevice> fmt::Debug for Controller<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let namespace: &D = &self.namespace;
        f.debug_struct("Controller")
            .field("transport", &self.transport)
            .field("capacity", &namespace.capacity())
            .field("max_transfer_size", &self.max_transfer_size)
            .finish()
    }
}

/// Callbacks invoked by a driver's enumeration routine.
pub trait AttachHandler<D: StorageDevice> {
    /// Accept (`true`) or reject a discovered controller.
    fn probe(&mut self, trid: &TransportId, opts: &mut ControllerOptions) -> bool;

    /// Take ownership of an accepted controller.
    fn attach(&mut self, trid: &TransportId, controller: Controller<D>, opts: &ControllerOptions);
}

/// A controller enumeration routine.
pub trait Driver<D: StorageDevice> {
    /// Probe every reachable controller; returns how many were attached.
    fn enumerate(&self, handler: &mut dyn AttachHandler<D>) -> usize;
}

/// Driver over namespaces living in this process.
pub struct LocalDriver<D: StorageDevice> {
    controllers: Vec<(TransportId, Arc<D>, usize)>,
}

impl<D: StorageDevice> LocalDriver<D> {
    /// Default controller transfer limit (128 KiB).
    pub const DEFAULT_MAX_TRANSFER: usize = 128 * 1024;

    /// Driver with no namespaces.
    pub fn new() -> Self {
        Self {
            controllers: Vec::new(),
        }
    }

    /// Driver exposing exactly one namespace.
    pub fn single(address: impl Into<String>, namespace: Arc<D>) -> Self {
        Self::new().with_namespace(address, namespace)
    }

    /// Add a namespace behind a controller with the default transfer limit.
    pub fn with_namespace(self, address: impl Into<String>, namespace: Arc<D>) -> Self {
        self.with_controller(address, namespace, Self::DEFAULT_MAX_TRANSFER)
    }

    /// Add a namespace behind a controller with its own transfer limit.
    pub fn with_controller(
        mut self,
        address: impl Into<String>,
        namespace: Arc<D>,
        max_transfer_size: usize,
    ) -> Self {
        self.controllers
            .push((TransportId::local(address), namespace, max_transfer_size));
        self
    }
}

impl<D: StorageDevice> Default for LocalDriver<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: StorageDevice> Driver<D> for LocalDriver<D> {
    fn enumerate(&self, handler: &mut dyn AttachHandler<D>) -> usize {
        let mut attached = 0;
        for (trid, namespace, max_transfer) in &self.controllers {
            let mut opts = ControllerOptions::default();
            if !handler.probe(trid, &mut opts) {
                debug!(%trid, "controller rejected by probe");
                continue;
            }
            let controller = Controller::new(trid.clone(), Arc::clone(namespace), *max_transfer);
            handler.attach(trid, controller, &opts);
            attached += 1;
        }
        attached
    }
}

/// Attach handler that keeps the first acceptable controller.
pub(crate) struct ControllerSelector<D: StorageDevice> {
    address_filter: Option<String>,
    requested: ControllerOptions,
    attached: Option<(Controller<D>, ControllerOptions)>,
}

impl<D: StorageDevice> ControllerSelector<D> {
    pub(crate) fn new(address_filter: Option<String>, requested: ControllerOptions) -> Self {
        Self {
            address_filter,
            requested,
            attached: None,
        }
    }

    pub(crate) fn into_attached(self) -> Option<(Controller<D>, ControllerOptions)> {
        self.attached
    }
}

impl<D: StorageDevice> AttachHandler<D> for ControllerSelector<D> {
    fn probe(&mut self, trid: &TransportId, opts: &mut ControllerOptions) -> bool {
        if self.attached.is_some() {
            return false;
        }
        if let Some(filter) = &self.address_filter {
            if *filter != trid.address {
                return false;
            }
        }
        opts.num_io_queues = self.requested.num_io_queues;
        opts.io_queue_size = self.requested.io_queue_size;
        opts.io_queue_requests = self.requested.io_queue_requests;
        true
    }

    fn attach(&mut self, trid: &TransportId, controller: Controller<D>, opts: &ControllerOptions) {
        if self.attached.is_some() {
            warn!(%trid, "ignoring extra controller attach");
            return;
        }
        let namespace: &D = controller.namespace();
        info!(
            %trid,
            capacity = namespace.capacity(),
            sector_size = namespace.sector_size(),
            "attached controller"
        );
        self.attached = Some((controller, opts.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemNamespace;

    #[test]
    fn test_selector_keeps_first_controller() {
        let driver = LocalDriver::new()
            .with_namespace("ns-a", Arc::new(MemNamespace::new(1 << 20)))
            .with_namespace("ns-b", Arc::new(MemNamespace::new(1 << 20)));

        let mut selector = ControllerSelector::new(None, ControllerOptions::default());
        assert_eq!(driver.enumerate(&mut selector), 1);

        let (controller, _) = selector.into_attached().unwrap();
        assert_eq!(controller.transport().address, "ns-a");
    }

    #[test]
    fn test_selector_address_filter() {
        let driver = LocalDriver::new()
            .with_namespace("ns-a", Arc::new(MemNamespace::new(1 << 20)))
            .with_namespace("ns-b", Arc::new(MemNamespace::new(1 << 20)));

        let requested = ControllerOptions {
            num_io_queues: 2,
            ..ControllerOptions::default()
        };
        let mut selector = ControllerSelector::new(Some("ns-b".into()), requested);
        driver.enumerate(&mut selector);

        let (controller, opts) = selector.into_attached().unwrap();
        assert_eq!(controller.transport().address, "ns-b");
        assert_eq!(opts.num_io_queues, 2);
    }

    #[test]
    fn test_no_match_attaches_nothing() {
        let driver: LocalDriver<MemNamespace> = LocalDriver::new();
        let mut selector = ControllerSelector::new(None, ControllerOptions::default());
        assert_eq!(driver.enumerate(&mut selector), 0);
        assert!(selector.into_attached().is_none());
    }
}
