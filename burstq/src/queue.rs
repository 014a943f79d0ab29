//! DMA queue lifecycle.
//!
//! A [`Queue`] wraps one device channel (anything implementing
//! [`RxChannel`] or [`TxChannel`]) and enforces its lifecycle:
//!
//! ```text
//! Closed --open--> Opened --start--> Started --stop--> Stopped --close--> Closed
//!                                       ^                 |
//!                                       +-----start-------+
//! ```
//!
//! Burst operations (see [`burst`]) are only valid in `Started`. `stop` and
//! `close` are best-effort and idempotent, so a teardown routine can call
//! them on every queue it opened regardless of how far setup got. Dropping a
//! queue closes it.

pub mod burst;

use std::fmt;

use crate::device::DeviceError;
use crate::trace::{debug, warn};

pub use burst::{Packet, PacketMut, PayloadTooLarge, RxBurst, TxBurst};

/// Transfer direction of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host.
    Rx,
    /// Host to device.
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => write!(f, "rx"),
            Self::Tx => write!(f, "tx"),
        }
    }
}

/// Identity of a queue: direction plus channel index on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub direction: Direction,
    pub index: usize,
}

impl QueueId {
    #[must_use]
    pub const fn rx(index: usize) -> Self {
        Self {
            direction: Direction::Rx,
            index,
        }
    }

    #[must_use]
    pub const fn tx(index: usize) -> Self {
        Self {
            direction: Direction::Tx,
            index,
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.direction, self.index)
    }
}

/// Lifecycle state of a [`Queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Closed,
    Opened,
    Started,
    Stopped,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Opened => write!(f, "opened"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Errors raised by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A burst or lifecycle operation was called in a state that forbids it.
    ///
    /// This is a contract bug in the caller, never a transient condition.
    #[error("protocol violation on {queue}: {op} called while {state}")]
    ProtocolViolation {
        queue: QueueId,
        op: &'static str,
        state: QueueState,
    },
    /// A transmit packet does not fit the queue's slots.
    #[error("{queue}: {source}")]
    Payload {
        queue: QueueId,
        #[source]
        source: PayloadTooLarge,
    },
    /// The channel refused to start.
    #[error(transparent)]
    Activation(#[from] DeviceError),
}

/// Lifecycle operations every device channel provides.
///
/// `stop` and `close` are called at most once per successful `start` /
/// open by [`Queue`], but implementations should still tolerate repeats.
pub trait Channel: Send {
    /// Enables data flow in hardware.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ActivationFailed`] if the channel rejects
    /// activation.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Disables data flow.
    fn stop(&mut self);

    /// Unbinds the channel from the device.
    fn close(&mut self);
}

/// Receive side of the burst protocol on a device channel.
///
/// Every `rx_burst_get` must be followed by exactly one `rx_burst_put`
/// before the next `rx_burst_get`. Implementations may panic when that
/// pairing is broken; [`Queue::acquire_rx`] makes it impossible to break.
pub trait RxChannel: Channel {
    /// Exposes up to `max` received packets and returns how many.
    fn rx_burst_get(&mut self, max: usize) -> usize;

    /// Packet `offset` of the current burst.
    fn rx_packet(&self, offset: usize) -> Packet<'_>;

    /// Returns the current burst to the ring.
    fn rx_burst_put(&mut self);
}

/// Transmit side of the burst protocol on a device channel.
///
/// Every `tx_burst_get` must be followed by exactly one `tx_burst_put`
/// before the next `tx_burst_get`.
pub trait TxChannel: Channel {
    /// Largest payload a slot can carry, in bytes.
    fn max_payload(&self) -> usize;

    /// Reserves up to `max` empty slots and returns how many.
    fn tx_burst_get(&mut self, max: usize) -> usize;

    /// Slot `offset` of the current burst.
    fn tx_packet_mut(&mut self, offset: usize) -> PacketMut<'_>;

    /// Hands the first `count` slots of the current burst to hardware and
    /// returns the rest to the ring unused.
    fn tx_burst_put(&mut self, count: usize);
}

/// Per-queue burst accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Acquire calls, including ones that returned nothing.
    pub acquires: u64,
    /// Release calls, including releases of empty bursts.
    pub releases: u64,
    /// Acquires that returned zero descriptors.
    pub empty_acquires: u64,
    /// Acquires that returned fewer descriptors than requested (but not zero).
    pub short_acquires: u64,
    /// Packets received or committed for transmission.
    pub packets: u64,
    /// Payload bytes received or committed for transmission.
    pub bytes: u64,
}

/// Lifecycle wrapper around one device channel.
pub struct Queue<C: Channel> {
    id: QueueId,
    state: QueueState,
    channel: C,
    stats: QueueStats,
}

impl<C: Channel> Queue<C> {
    /// Wraps a channel that the device has just opened.
    ///
    /// Normally reached through [`crate::device::Device::open_rx_queue`] via
    /// [`Queue::open_rx`] or [`Queue::open_tx`].
    pub fn from_opened(id: QueueId, channel: C) -> Self {
        debug!(queue = %id, "queue opened");
        Self {
            id,
            state: QueueState::Opened,
            channel,
            stats: QueueStats::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> QueueState {
        self.state
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Underlying channel.
    #[must_use]
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Enables data flow.
    ///
    /// # Errors
    ///
    /// - [`QueueError::ProtocolViolation`] unless the queue is `Opened` or
    ///   `Stopped`.
    /// - [`QueueError::Activation`] if the channel rejects activation; the
    ///   queue stays in its previous state.
    pub fn start(&mut self) -> Result<(), QueueError> {
        match self.state {
            QueueState::Opened | QueueState::Stopped => {}
            state => {
                return Err(QueueError::ProtocolViolation {
                    queue: self.id,
                    op: "start",
                    state,
                });
            }
        }
        self.channel.start()?;
        self.state = QueueState::Started;
        debug!(queue = %self.id, "queue started");
        Ok(())
    }

    /// Disables data flow. A no-op unless the queue is `Started`.
    pub fn stop(&mut self) {
        if self.state == QueueState::Started {
            self.channel.stop();
            self.state = QueueState::Stopped;
            debug!(queue = %self.id, "queue stopped");
        }
    }

    /// Stops the queue if needed and unbinds it. A no-op once `Closed`.
    pub fn close(&mut self) {
        if self.state == QueueState::Closed {
            return;
        }
        if self.state == QueueState::Started {
            warn!(queue = %self.id, "closing a started queue; stopping it first");
            self.stop();
        }
        self.channel.close();
        self.state = QueueState::Closed;
        debug!(queue = %self.id, "queue closed");
    }

    /// Fails with a protocol violation unless the queue is `Started`.
    fn require_started(&self, op: &'static str) -> Result<(), QueueError> {
        if self.state == QueueState::Started {
            Ok(())
        } else {
            Err(QueueError::ProtocolViolation {
                queue: self.id,
                op,
                state: self.state,
            })
        }
    }
}

impl<C: Channel> Drop for Queue<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: Channel> fmt::Debug for Queue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<C: RxChannel> Queue<C> {
    /// Opens receive channel `index` on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ResourceUnavailable`] if the index is invalid
    /// or already bound.
    pub fn open_rx<D>(device: &D, index: usize) -> Result<Self, DeviceError>
    where
        D: crate::device::Device<Rx = C>,
    {
        let channel = device.open_rx_queue(index)?;
        Ok(Self::from_opened(QueueId::rx(index), channel))
    }
}

impl<C: TxChannel> Queue<C> {
    /// Opens transmit channel `index` on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ResourceUnavailable`] if the index is invalid
    /// or already bound.
    pub fn open_tx<D>(device: &D, index: usize) -> Result<Self, DeviceError>
    where
        D: crate::device::Device<Tx = C>,
    {
        let channel = device.open_tx_queue(index)?;
        Ok(Self::from_opened(QueueId::tx(index), channel))
    }

    /// Largest payload one transmit slot can carry.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.channel.max_payload()
    }
}
