//! Device collaborator interfaces.
//!
//! The burst runtime never talks to hardware directly. It goes through four
//! small seams:
//!
//! - [`Backend`] opens a device by identifier.
//! - [`Device`] locates and opens control components and opens DMA queues.
//! - [`Component`] reads and writes 32-bit control/status registers.
//! - [`RxChannel`](crate::queue::RxChannel) /
//!   [`TxChannel`](crate::queue::TxChannel) carry the burst protocol for one
//!   queue.
//!
//! Devices and components are closed when dropped. [`sim`] provides an
//! in-memory implementation used by the tests and the `burstq` binary.

pub mod sim;

use std::fmt;

use crate::queue::{QueueId, RxChannel, TxChannel};

/// Location of a component inside the device tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentOffset(pub usize);

impl fmt::Display for ComponentOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A resource the device layer hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Device(String),
    Component(ComponentOffset),
    Queue(QueueId),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(id) => write!(f, "device {id:?}"),
            Self::Component(offset) => write!(f, "component at {offset}"),
            Self::Queue(queue) => write!(f, "queue {queue}"),
        }
    }
}

/// Errors reported by device collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The resource does not exist, is already bound, or cannot be opened.
    #[error("{resource} unavailable: {reason}")]
    ResourceUnavailable { resource: Resource, reason: String },
    /// No component with the given compatible string and index exists.
    #[error("component {compatible:?} #{index} not found")]
    NotFound { compatible: String, index: usize },
    /// A queue rejected activation.
    #[error("queue {queue} failed to start: {reason}")]
    ActivationFailed { queue: QueueId, reason: String },
}

impl DeviceError {
    /// Shorthand for a [`DeviceError::ResourceUnavailable`] on a queue.
    #[must_use]
    pub fn queue_unavailable(queue: QueueId, reason: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            resource: Resource::Queue(queue),
            reason: reason.into(),
        }
    }
}

/// Opens devices by identifier.
///
/// Shared by reference with the coordinator, which opens exactly one device
/// per run.
pub trait Backend: Sync {
    type Device: Device;

    /// Opens the device named `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ResourceUnavailable`] if no such device exists
    /// or it cannot be opened.
    fn open_device(&self, identifier: &str) -> Result<Self::Device, DeviceError>;
}

/// An opened device.
pub trait Device {
    type Rx: RxChannel;
    type Tx: TxChannel;
    type Component: Component;

    /// Identifier the device was opened with.
    fn identifier(&self) -> &str;

    /// Number of receive queues the device exposes.
    fn rx_queue_count(&self) -> usize;

    /// Number of transmit queues the device exposes.
    fn tx_queue_count(&self) -> usize;

    /// Finds the `index`-th component whose compatible string matches.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotFound`] if there is no such component.
    fn find_component(
        &self,
        compatible: &str,
        index: usize,
    ) -> Result<ComponentOffset, DeviceError>;

    /// Opens the component at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ResourceUnavailable`] if it cannot be opened.
    fn open_component(&self, offset: ComponentOffset) -> Result<Self::Component, DeviceError>;

    /// Opens receive queue `index`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ResourceUnavailable`] if the index is out of
    /// range or the queue is already open.
    fn open_rx_queue(&self, index: usize) -> Result<Self::Rx, DeviceError>;

    /// Opens transmit queue `index`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ResourceUnavailable`] if the index is out of
    /// range or the queue is already open.
    fn open_tx_queue(&self, index: usize) -> Result<Self::Tx, DeviceError>;
}

/// Register access to one on-device component.
pub trait Component {
    /// Reads the 32-bit register at byte address `addr`.
    fn read32(&self, addr: u32) -> u32;

    /// Writes the 32-bit register at byte address `addr`. Fire-and-forget.
    fn write32(&mut self, addr: u32, value: u32);
}
