//! Burst acquire/release protocol.
//!
//! A burst lends a window of ring slots to the caller without copying:
//!
//! - [`Queue::acquire_rx`] exposes up to `capacity` received packets as an
//!   [`RxBurst`]. Zero packets means "nothing yet, poll again".
//! - [`Queue::acquire_tx`] reserves up to `capacity` empty slots as a
//!   [`TxBurst`]. Fewer slots than requested means the ring is full; only
//!   the granted slots may be written.
//!
//! The burst guard holds the queue mutably, so the descriptors it hands out
//! cannot outlive the release, and a second acquire cannot start before the
//! first is released:
//!
//! ```compile_fail
//! use burstq::device::sim::{SimBackend, SimConfig};
//! use burstq::device::{Backend, Device};
//! use burstq::queue::Queue;
//!
//! let backend = SimBackend::new(SimConfig::new(1, 0));
//! let device = backend.open_device("0").unwrap();
//! let mut queue = Queue::open_rx(&device, 0).unwrap();
//! queue.start().unwrap();
//!
//! let first = queue.acquire_rx(64).unwrap();
//! let second = queue.acquire_rx(64).unwrap(); // `queue` is still lent to `first`
//! drop(first);
//! drop(second);
//! ```
//!
//! Dropping a guard releases it. For receive that returns the packets to
//! the ring; for transmit it returns the slots unused. Transmit slots reach
//! hardware only through [`TxBurst::release`] or [`TxBurst::commit`].

use std::fmt;

use crate::trace::trace;

use super::{Queue, QueueError, RxChannel, TxChannel};

/// Borrowed view of one received packet.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    data: &'a [u8],
    header: &'a [u8],
    flags: u16,
}

impl<'a> Packet<'a> {
    /// Builds a descriptor over ring memory. Used by channel implementations.
    #[must_use]
    pub const fn new(data: &'a [u8], header: &'a [u8], flags: u16) -> Self {
        Self {
            data,
            header,
            flags,
        }
    }

    /// Payload bytes.
    #[must_use]
    pub const fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Metadata bytes (usually empty).
    #[must_use]
    pub const fn header(&self) -> &'a [u8] {
        self.header
    }

    #[must_use]
    pub const fn data_length(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub const fn header_length(&self) -> usize {
        self.header.len()
    }

    #[must_use]
    pub const fn flags(&self) -> u16 {
        self.flags
    }
}

impl fmt::Debug for Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("data_length", &self.data.len())
            .field("header_length", &self.header.len())
            .field("flags", &self.flags)
            .finish()
    }
}

/// A payload or metadata length does not fit its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("length of {len} bytes exceeds slot size of {max}")]
pub struct PayloadTooLarge {
    pub len: usize,
    pub max: usize,
}

/// Borrowed, writable view of one transmit slot.
pub struct PacketMut<'a> {
    data: &'a mut [u8],
    data_len: &'a mut usize,
    header: &'a mut [u8],
    header_len: &'a mut usize,
    flags: &'a mut u16,
}

impl<'a> PacketMut<'a> {
    /// Builds a descriptor over ring memory. Used by channel implementations.
    pub fn from_parts(
        data: &'a mut [u8],
        data_len: &'a mut usize,
        header: &'a mut [u8],
        header_len: &'a mut usize,
        flags: &'a mut u16,
    ) -> Self {
        Self {
            data,
            data_len,
            header,
            header_len,
            flags,
        }
    }

    /// Payload capacity of the slot.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The whole payload area, regardless of the current length.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut *self.data
    }

    /// The valid payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..*self.data_len]
    }

    #[must_use]
    pub fn data_length(&self) -> usize {
        *self.data_len
    }

    /// Sets how many payload bytes the slot carries.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadTooLarge`] if `len` exceeds the slot capacity.
    pub fn set_data_length(&mut self, len: usize) -> Result<(), PayloadTooLarge> {
        if len > self.data.len() {
            return Err(PayloadTooLarge {
                len,
                max: self.data.len(),
            });
        }
        *self.data_len = len;
        Ok(())
    }

    /// Copies `bytes` into the slot and sets the data length.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadTooLarge`] if `bytes` does not fit.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), PayloadTooLarge> {
        self.set_data_length(bytes.len())?;
        self.data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copies `bytes` into the metadata area and sets the metadata length.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadTooLarge`] if `bytes` does not fit.
    pub fn write_header(&mut self, bytes: &[u8]) -> Result<(), PayloadTooLarge> {
        if bytes.len() > self.header.len() {
            return Err(PayloadTooLarge {
                len: bytes.len(),
                max: self.header.len(),
            });
        }
        self.header[..bytes.len()].copy_from_slice(bytes);
        *self.header_len = bytes.len();
        Ok(())
    }

    #[must_use]
    pub fn header_length(&self) -> usize {
        *self.header_len
    }

    pub fn set_flags(&mut self, flags: u16) {
        *self.flags = flags;
    }

    #[must_use]
    pub fn flags(&self) -> u16 {
        *self.flags
    }
}

impl<C: RxChannel> Queue<C> {
    /// Requests up to `capacity` received packets.
    ///
    /// The returned burst may be empty; that means nothing is available yet
    /// and is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ProtocolViolation`] unless the queue is
    /// `Started`.
    pub fn acquire_rx(&mut self, capacity: usize) -> Result<RxBurst<'_, C>, QueueError> {
        self.require_started("acquire_rx")?;
        let len = self.channel.rx_burst_get(capacity);
        self.record_acquire(capacity, len);
        trace!(queue = %self.id, requested = capacity, granted = len, "rx burst acquired");
        Ok(RxBurst {
            queue: self,
            len,
            released: false,
        })
    }
}

impl<C: TxChannel> Queue<C> {
    /// Requests up to `capacity` empty transmit slots.
    ///
    /// The returned burst may hold fewer slots than requested when the ring
    /// is short on space; only the granted slots may be written.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ProtocolViolation`] unless the queue is
    /// `Started`.
    pub fn acquire_tx(&mut self, capacity: usize) -> Result<TxBurst<'_, C>, QueueError> {
        self.require_started("acquire_tx")?;
        let len = self.channel.tx_burst_get(capacity);
        self.record_acquire(capacity, len);
        trace!(queue = %self.id, requested = capacity, granted = len, "tx burst acquired");
        Ok(TxBurst {
            queue: self,
            len,
            released: false,
        })
    }
}

impl<C: super::Channel> Queue<C> {
    fn record_acquire(&mut self, requested: usize, granted: usize) {
        self.stats.acquires += 1;
        if granted == 0 {
            self.stats.empty_acquires += 1;
        } else if granted < requested {
            self.stats.short_acquires += 1;
        }
    }
}

/// Received packets lent by the ring until release.
pub struct RxBurst<'q, C: RxChannel> {
    queue: &'q mut Queue<C>,
    len: usize,
    released: bool,
}

impl<C: RxChannel> RxBurst<'_, C> {
    /// Number of packets in the burst.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Packet `offset` of the burst.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= self.len()`.
    #[must_use]
    pub fn get(&self, offset: usize) -> Packet<'_> {
        assert!(
            offset < self.len,
            "packet {offset} outside burst of {}",
            self.len
        );
        self.queue.channel.rx_packet(offset)
    }

    /// Packets in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = Packet<'_>> + '_ {
        let channel = &self.queue.channel;
        (0..self.len).map(move |offset| channel.rx_packet(offset))
    }

    /// Returns the packets to the ring.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        let bytes: usize = self.iter().map(|packet| packet.data_length()).sum();
        self.queue.channel.rx_burst_put();
        self.released = true;

        let stats = &mut self.queue.stats;
        stats.releases += 1;
        stats.packets += self.len as u64;
        stats.bytes += bytes as u64;
        trace!(queue = %self.queue.id, packets = self.len, bytes, "rx burst released");
    }
}

impl<C: RxChannel> Drop for RxBurst<'_, C> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Empty transmit slots lent by the ring until commit or release.
pub struct TxBurst<'q, C: TxChannel> {
    queue: &'q mut Queue<C>,
    len: usize,
    released: bool,
}

impl<C: TxChannel> TxBurst<'_, C> {
    /// Number of slots granted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest payload a slot can carry.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.queue.channel.max_payload()
    }

    /// Slot `offset` of the burst.
    ///
    /// # Panics
    ///
    /// Panics if `offset >= self.len()`.
    pub fn get_mut(&mut self, offset: usize) -> PacketMut<'_> {
        assert!(
            offset < self.len,
            "slot {offset} outside burst of {}",
            self.len
        );
        self.queue.channel.tx_packet_mut(offset)
    }

    /// Hands every granted slot to hardware.
    pub fn release(mut self) {
        let count = self.len;
        self.put(count);
    }

    /// Hands the first `count` slots to hardware and returns the rest to
    /// the ring unused.
    ///
    /// # Panics
    ///
    /// Panics if `count > self.len()`.
    pub fn commit(mut self, count: usize) {
        assert!(
            count <= self.len,
            "committing {count} slots of a {}-slot burst",
            self.len
        );
        self.put(count);
    }

    fn put(&mut self, count: usize) {
        if self.released {
            return;
        }
        let bytes: usize = (0..count)
            .map(|offset| {
                self.queue
                    .channel
                    .tx_packet_mut(offset)
                    .data_length()
            })
            .sum();
        self.queue.channel.tx_burst_put(count);
        self.released = true;

        let stats = &mut self.queue.stats;
        stats.releases += 1;
        stats.packets += count as u64;
        stats.bytes += bytes as u64;
        trace!(
            queue = %self.queue.id,
            granted = self.len,
            committed = count,
            bytes,
            "tx burst released"
        );
    }
}

impl<C: TxChannel> Drop for TxBurst<'_, C> {
    fn drop(&mut self) {
        self.put(0);
    }
}
