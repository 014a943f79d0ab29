//! Core batched SPSC slot ring algorithm.
//!
//! A fixed number of fixed-size packet slots shared between one writer and
//! one reader. Unlike an element queue, both sides work on *windows*: the
//! writer reserves up to `n` free slots, fills them in place and publishes
//! them in one step; the reader exposes up to `n` filled slots, reads them
//! in place and retires them in one step. This is the shape of a DMA
//! descriptor ring, where hardware and driver hand regions back and forth
//! without copying.
//!
//! # Safety
//!
//! The types in this module have unsafe APIs because they require the caller
//! to uphold the SPSC invariant: exactly one writer and one reader, with no
//! concurrent access to either role. [`super::Writer`] and [`super::Reader`]
//! enforce that invariant through ownership.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Role marker: fields owned exclusively by the writer.
pub struct WriterRole;

/// Role marker: fields owned exclusively by the reader.
pub struct ReaderRole;

/// Role marker: slots whose ownership transfers via the SPSC protocol.
pub struct SlotRole;

/// Interior-mutable cell with a role marker for nominal type safety.
///
/// The `Role` doesn't affect runtime behavior; it only makes the different
/// logical kinds of cells distinct types.
#[repr(transparent)]
pub struct RingCell<T, Role>(UnsafeCell<T>, PhantomData<Role>);

impl<T, Role> RingCell<T, Role> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value), PhantomData)
    }

    pub const fn get(&self) -> *mut T {
        self.0.get()
    }
}

// SAFETY: every slot is either inside the writer's window or inside the
// reader's window, never both. The head/tail indices with Release/Acquire
// ordering are the synchronization barrier between the two.
unsafe impl<T: Send, Role> Sync for RingCell<T, Role> {}
unsafe impl<T: Send, Role> Send for RingCell<T, Role> {}

/// Writer-side state: head index and cached tail.
#[repr(C)]
#[repr(align(64))]
pub struct WriterState {
    /// Index one past the last published slot.
    /// Owned by the writer, read by the reader.
    pub head: AtomicUsize,

    /// Cached copy of the reader's tail index.
    pub cached_tail: RingCell<usize, WriterRole>,
}

/// Reader-side state: tail index and cached head.
#[repr(C)]
#[repr(align(64))]
pub struct ReaderState {
    /// Index of the oldest unretired slot.
    /// Owned by the reader, read by the writer.
    pub tail: AtomicUsize,

    /// Cached copy of the writer's head index.
    pub cached_head: RingCell<usize, ReaderRole>,
}

/// One packet slot.
///
/// `data` and `header` are allocated once at ring construction with the
/// ring's slot sizes; the length fields say how much of each is valid.
pub struct SlotData {
    pub data: Box<[u8]>,
    pub data_len: usize,
    pub header: Box<[u8]>,
    pub header_len: usize,
    pub flags: u16,
}

impl SlotData {
    fn new(data_size: usize, header_size: usize) -> Self {
        Self {
            data: vec![0u8; data_size].into_boxed_slice(),
            data_len: 0,
            header: vec![0u8; header_size].into_boxed_slice(),
            header_len: 0,
            flags: 0,
        }
    }

    /// Clears lengths and flags before the slot is handed to a writer.
    pub fn reset(&mut self) {
        self.data_len = 0;
        self.header_len = 0;
        self.flags = 0;
    }
}

/// Ring of packet slots.
pub struct SlotRing {
    pub writer: WriterState,
    pub reader: ReaderState,
    slots: Box<[RingCell<SlotData, SlotRole>]>,
}

impl SlotRing {
    /// Creates a ring of `capacity` slots, each holding `data_size` payload
    /// bytes and `header_size` metadata bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize, data_size: usize, header_size: usize) -> Self {
        assert!(capacity > 0, "slot ring capacity must be greater than 0");
        let slots = (0..capacity)
            .map(|_| RingCell::new(SlotData::new(data_size, header_size)))
            .collect();
        Self {
            writer: WriterState {
                head: AtomicUsize::new(0),
                cached_tail: RingCell::new(0),
            },
            reader: ReaderState {
                tail: AtomicUsize::new(0),
                cached_head: RingCell::new(0),
            },
            slots,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns how many slots (at most `max`) the writer may fill right now.
    ///
    /// # Safety
    ///
    /// Only the single writer may call this.
    #[inline]
    pub unsafe fn writable(&self, max: usize) -> usize {
        let head = self.writer.head.load(Ordering::Relaxed);
        // SAFETY: the writer has exclusive access to cached_tail.
        let cached_tail = unsafe { &mut *self.writer.cached_tail.get() };

        let mut free = self.capacity() - head.wrapping_sub(*cached_tail);
        if free < max {
            // Refresh from the reader (acquire pairs with its release in `retire`).
            *cached_tail = self.reader.tail.load(Ordering::Acquire);
            free = self.capacity() - head.wrapping_sub(*cached_tail);
        }
        free.min(max)
    }

    /// Returns how many slots (at most `max`) the reader may read right now.
    ///
    /// # Safety
    ///
    /// Only the single reader may call this.
    #[inline]
    pub unsafe fn readable(&self, max: usize) -> usize {
        let tail = self.reader.tail.load(Ordering::Relaxed);
        // SAFETY: the reader has exclusive access to cached_head.
        let cached_head = unsafe { &mut *self.reader.cached_head.get() };

        let mut avail = cached_head.wrapping_sub(tail);
        if avail < max {
            // Refresh from the writer (acquire pairs with its release in `publish`).
            *cached_head = self.writer.head.load(Ordering::Acquire);
            avail = cached_head.wrapping_sub(tail);
        }
        avail.min(max)
    }

    /// Returns the slot `offset` positions past the writer's head.
    ///
    /// # Safety
    ///
    /// Only the single writer may call this, `offset` must be below the
    /// last value returned by [`writable`](Self::writable), and the caller
    /// must not hold two references to the same slot.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn writer_slot(&self, offset: usize) -> &mut SlotData {
        let head = self.writer.head.load(Ordering::Relaxed);
        let index = head.wrapping_add(offset) % self.capacity();
        // SAFETY: the slot lies in the free region between head and
        // tail + capacity, which the reader never touches.
        unsafe { &mut *self.slots[index].get() }
    }

    /// Returns the slot `offset` positions past the reader's tail.
    ///
    /// # Safety
    ///
    /// Only the single reader may call this and `offset` must be below the
    /// last value returned by [`readable`](Self::readable).
    #[inline]
    pub unsafe fn reader_slot(&self, offset: usize) -> &SlotData {
        let tail = self.reader.tail.load(Ordering::Relaxed);
        let index = tail.wrapping_add(offset) % self.capacity();
        // SAFETY: the slot lies in the published region between tail and
        // head, which the writer does not touch until it is retired.
        unsafe { &*self.slots[index].get() }
    }

    /// Publishes `count` filled slots to the reader.
    ///
    /// # Safety
    ///
    /// Only the single writer may call this and `count` must not exceed the
    /// last value returned by [`writable`](Self::writable).
    #[inline]
    pub unsafe fn publish(&self, count: usize) {
        let head = self.writer.head.load(Ordering::Relaxed);
        self.writer
            .head
            .store(head.wrapping_add(count), Ordering::Release);
    }

    /// Returns `count` read slots to the writer.
    ///
    /// # Safety
    ///
    /// Only the single reader may call this and `count` must not exceed the
    /// last value returned by [`readable`](Self::readable).
    #[inline]
    pub unsafe fn retire(&self, count: usize) {
        let tail = self.reader.tail.load(Ordering::Relaxed);
        self.reader
            .tail
            .store(tail.wrapping_add(count), Ordering::Release);
    }
}

// SAFETY: slot contents are only reachable through the windows described
// above; the indices are atomics.
unsafe impl Send for SlotRing {}
unsafe impl Sync for SlotRing {}
