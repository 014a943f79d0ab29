//! Batched single-producer single-consumer packet slot ring.
//!
//! The in-memory stand-in for a hardware DMA ring. [`slot_ring`] returns a
//! `(Writer, Reader)` pair over one shared ring:
//!
//! - [`Writer`] reserves a window of free slots, fills them in place and
//!   publishes them (the NIC side of a receive ring, the driver side of a
//!   transmit ring).
//! - [`Reader`] exposes a window of published slots, reads them in place and
//!   retires them (the driver side of a receive ring, the NIC side of a
//!   transmit ring).
//!
//! Both handles are [`Send`] but not [`Sync`], and every window operation
//! takes `&mut self`, so the single-writer/single-reader invariant is upheld
//! by ownership.
//!
//! # Example
//!
//! ```
//! use burstq::ring;
//!
//! let (mut writer, mut reader) = ring::slot_ring(8, 64, 0);
//!
//! writer.push(b"hello", 0).unwrap();
//! assert_eq!(reader.peek(4), 1);
//! assert_eq!(reader.slot(0).data(), b"hello");
//! reader.retire(1);
//! ```

pub(crate) mod slots;

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::queue::{Packet, PacketMut};

use slots::{SlotData, SlotRing};

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Error returned by [`Writer::push`] when no slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ring is full")]
pub struct RingFull;

/// Creates a ring of `capacity` slots with `data_size` payload bytes and
/// `header_size` metadata bytes per slot.
///
/// # Panics
///
/// Panics if `capacity == 0`.
#[must_use]
pub fn slot_ring(capacity: usize, data_size: usize, header_size: usize) -> (Writer, Reader) {
    let ring = Arc::new(SlotRing::new(capacity, data_size, header_size));
    (
        Writer {
            ring: Arc::clone(&ring),
            reserved: 0,
            _unsync: PhantomData,
        },
        Reader {
            ring,
            exposed: 0,
            _unsync: PhantomData,
        },
    )
}

/// Read-only view of one ring slot.
#[derive(Clone, Copy)]
pub struct SlotRef<'a> {
    slot: &'a SlotData,
}

impl<'a> SlotRef<'a> {
    /// Valid payload bytes.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        &self.slot.data[..self.slot.data_len]
    }

    /// Valid metadata bytes.
    #[must_use]
    pub fn header(&self) -> &'a [u8] {
        &self.slot.header[..self.slot.header_len]
    }

    #[must_use]
    pub fn flags(&self) -> u16 {
        self.slot.flags
    }

    /// Burst descriptor over this slot.
    #[must_use]
    pub fn to_packet(self) -> Packet<'a> {
        Packet::new(self.data(), self.header(), self.flags())
    }
}

/// Mutable view of one reserved ring slot.
pub struct SlotMut<'a> {
    slot: &'a mut SlotData,
}

impl<'a> SlotMut<'a> {
    /// Burst descriptor over this slot.
    #[must_use]
    pub fn into_packet_mut(self) -> PacketMut<'a> {
        let SlotData {
            data,
            data_len,
            header,
            header_len,
            flags,
        } = self.slot;
        PacketMut::from_parts(data, data_len, header, header_len, flags)
    }

    /// Full payload capacity of the slot, regardless of the current length.
    pub fn data_buf(&mut self) -> &mut [u8] {
        &mut self.slot.data
    }

    /// Full metadata capacity of the slot.
    pub fn header_buf(&mut self) -> &mut [u8] {
        &mut self.slot.header
    }

    #[must_use]
    pub fn data_len(&self) -> usize {
        self.slot.data_len
    }

    #[must_use]
    pub fn header_len(&self) -> usize {
        self.slot.header_len
    }

    #[must_use]
    pub fn flags(&self) -> u16 {
        self.slot.flags
    }

    /// Sets the valid payload length, clamped to the slot size.
    pub fn set_data_len(&mut self, len: usize) {
        self.slot.data_len = len.min(self.slot.data.len());
    }

    /// Sets the valid metadata length, clamped to the slot size.
    pub fn set_header_len(&mut self, len: usize) {
        self.slot.header_len = len.min(self.slot.header.len());
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.slot.flags = flags;
    }

    /// Read-only view of the slot as it currently stands.
    #[must_use]
    pub fn view(&self) -> SlotRef<'_> {
        SlotRef { slot: self.slot }
    }
}

/// Filling end of a slot ring.
pub struct Writer {
    ring: Arc<SlotRing>,
    /// Size of the currently reserved window.
    reserved: usize,
    _unsync: PhantomUnsync,
}

impl Writer {
    /// Total number of slots in the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Reserves up to `max` free slots and returns how many were granted.
    ///
    /// Reserved slots have their lengths and flags cleared. Reserving again
    /// replaces the previous, unpublished window.
    pub fn reserve(&mut self, max: usize) -> usize {
        // SAFETY: `&mut self` on the only Writer makes this the single writer.
        let granted = unsafe { self.ring.writable(max) };
        for offset in 0..granted {
            // SAFETY: offset < granted, one slot borrowed at a time.
            unsafe { self.ring.writer_slot(offset) }.reset();
        }
        self.reserved = granted;
        granted
    }

    /// Size of the currently reserved window.
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Mutable view of reserved slot `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is outside the reserved window.
    pub fn slot_mut(&mut self, offset: usize) -> SlotMut<'_> {
        assert!(
            offset < self.reserved,
            "slot {offset} outside reserved window of {}",
            self.reserved
        );
        // SAFETY: offset is inside the window and `&mut self` prevents a
        // second live SlotMut.
        SlotMut {
            slot: unsafe { self.ring.writer_slot(offset) },
        }
    }

    /// Publishes the first `count` reserved slots and drops the rest of the
    /// reservation.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the reserved window.
    pub fn publish(&mut self, count: usize) {
        assert!(
            count <= self.reserved,
            "publishing {count} slots of a {}-slot reservation",
            self.reserved
        );
        // SAFETY: single writer, count within the reserved window.
        unsafe { self.ring.publish(count) };
        self.reserved = 0;
    }

    /// Copies `payload` into one free slot and publishes it.
    ///
    /// Payload bytes beyond the slot size are truncated.
    ///
    /// # Errors
    ///
    /// Returns [`RingFull`] if no slot is free.
    pub fn push(&mut self, payload: &[u8], flags: u16) -> Result<(), RingFull> {
        if self.reserve(1) == 0 {
            return Err(RingFull);
        }
        let mut slot = self.slot_mut(0);
        let len = payload.len().min(slot.data_buf().len());
        slot.data_buf()[..len].copy_from_slice(&payload[..len]);
        slot.set_data_len(len);
        slot.set_flags(flags);
        self.publish(1);
        Ok(())
    }
}

/// Draining end of a slot ring.
pub struct Reader {
    ring: Arc<SlotRing>,
    /// Size of the currently exposed window.
    exposed: usize,
    _unsync: PhantomUnsync,
}

impl Reader {
    /// Total number of slots in the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Exposes up to `max` published slots and returns how many are readable.
    pub fn peek(&mut self, max: usize) -> usize {
        // SAFETY: `&mut self` on the only Reader makes this the single reader.
        self.exposed = unsafe { self.ring.readable(max) };
        self.exposed
    }

    /// Size of the currently exposed window.
    #[must_use]
    pub fn exposed(&self) -> usize {
        self.exposed
    }

    /// Read-only view of exposed slot `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is outside the exposed window.
    #[must_use]
    pub fn slot(&self, offset: usize) -> SlotRef<'_> {
        assert!(
            offset < self.exposed,
            "slot {offset} outside exposed window of {}",
            self.exposed
        );
        // SAFETY: offset is inside the published window.
        SlotRef {
            slot: unsafe { self.ring.reader_slot(offset) },
        }
    }

    /// Retires the first `count` exposed slots back to the writer.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the exposed window.
    pub fn retire(&mut self, count: usize) {
        assert!(
            count <= self.exposed,
            "retiring {count} slots of a {}-slot window",
            self.exposed
        );
        // SAFETY: single reader, count within the exposed window.
        unsafe { self.ring.retire(count) };
        self.exposed = 0;
    }

    /// Copies the oldest published slot's payload into a new vector and
    /// retires it.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        if self.peek(1) == 0 {
            return None;
        }
        let payload = self.slot(0).data().to_vec();
        self.retire(1);
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn empty_ring_exposes_nothing() {
        let (_writer, mut reader) = slot_ring(4, 16, 0);
        assert_eq!(reader.peek(4), 0);
        assert_eq!(reader.pop(), None);
    }

    #[test]
    fn reserve_is_bounded_by_free_space() {
        let (mut writer, mut reader) = slot_ring(4, 16, 0);

        assert_eq!(writer.reserve(10), 4);
        writer.publish(3);
        assert_eq!(writer.reserve(10), 1);
        writer.publish(0);

        assert_eq!(reader.peek(2), 2);
        reader.retire(2);
        assert_eq!(writer.reserve(10), 3);
    }

    #[test]
    fn partial_publish_returns_unused_slots() {
        let (mut writer, mut reader) = slot_ring(8, 16, 0);

        assert_eq!(writer.reserve(5), 5);
        for i in 0..2 {
            let mut slot = writer.slot_mut(i);
            slot.data_buf()[0] = i as u8;
            slot.set_data_len(1);
        }
        writer.publish(2);

        assert_eq!(reader.peek(8), 2);
        assert_eq!(reader.slot(1).data(), &[1]);
        assert_eq!(writer.reserve(8), 6);
    }

    #[test]
    fn push_truncates_to_slot_size() {
        let (mut writer, mut reader) = slot_ring(2, 4, 0);
        writer.push(b"abcdefgh", 7).unwrap();

        assert_eq!(reader.peek(1), 1);
        assert_eq!(reader.slot(0).data(), b"abcd");
        assert_eq!(reader.slot(0).flags(), 7);
    }

    #[test]
    fn push_reports_full() {
        let (mut writer, _reader) = slot_ring(2, 4, 0);
        writer.push(b"a", 0).unwrap();
        writer.push(b"b", 0).unwrap();
        assert_eq!(writer.push(b"c", 0), Err(RingFull));
    }

    #[test]
    fn window_wraps_around() {
        let (mut writer, mut reader) = slot_ring(4, 8, 0);

        for round in 0..5u8 {
            for k in 0..3u8 {
                writer.push(&[round, k], 0).unwrap();
            }
            assert_eq!(reader.peek(4), 3);
            for k in 0..3u8 {
                assert_eq!(reader.slot(k as usize).data(), &[round, k]);
            }
            reader.retire(3);
        }
    }

    #[test]
    fn reserved_slots_start_cleared() {
        let (mut writer, mut reader) = slot_ring(1, 8, 4);
        writer.reserve(1);
        {
            let mut slot = writer.slot_mut(0);
            slot.set_data_len(8);
            slot.set_header_len(4);
            slot.set_flags(3);
        }
        writer.publish(1);
        assert_eq!(reader.peek(1), 1);
        reader.retire(1);

        assert_eq!(writer.reserve(1), 1);
        let slot = writer.slot_mut(0);
        assert_eq!(slot.data_len(), 0);
        assert_eq!(slot.header_len(), 0);
        assert_eq!(slot.flags(), 0);
    }

    #[test]
    #[should_panic(expected = "outside exposed window")]
    fn slot_outside_window_panics() {
        let (_writer, mut reader) = slot_ring(4, 8, 0);
        reader.peek(4);
        let _ = reader.slot(0);
    }

    #[test]
    fn cross_thread_transfer_preserves_order() {
        const PACKETS: u32 = 10_000;
        let (mut writer, mut reader) = slot_ring(64, 8, 0);

        let producer = thread::spawn(move || {
            let mut next = 0u32;
            while next < PACKETS {
                let granted = writer.reserve(16);
                let count = granted.min((PACKETS - next) as usize);
                for offset in 0..count {
                    let mut slot = writer.slot_mut(offset);
                    slot.data_buf()[..4].copy_from_slice(&(next + offset as u32).to_le_bytes());
                    slot.set_data_len(4);
                }
                writer.publish(count);
                next += count as u32;
                if granted == 0 {
                    thread::yield_now();
                }
            }
        });

        let mut expected = 0u32;
        while expected < PACKETS {
            let count = reader.peek(32);
            for offset in 0..count {
                let bytes: [u8; 4] = reader.slot(offset).data().try_into().unwrap();
                assert_eq!(u32::from_le_bytes(bytes), expected);
                expected += 1;
            }
            reader.retire(count);
            if count == 0 {
                thread::yield_now();
            }
        }

        producer.join().unwrap();
    }
}
