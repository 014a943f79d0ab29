//! In-memory device.
//!
//! Emulates a DMA-capable card closely enough to exercise the burst
//! runtime: every queue is backed by a [`slot_ring`], the driver side of
//! which is handed out as a channel when the queue is opened, while the
//! "hardware" side is available as a port:
//!
//! - [`SimRxPort`] pushes packets into a receive ring, playing the card's
//!   DMA engine.
//! - [`SimTxPort`] drains packets committed to a transmit ring.
//!
//! The device records every lifecycle call in a journal ([`SimEvent`]) so
//! tests can check setup and teardown order, keeps a small register file per
//! component, and can be told to fail opening or starting given queues.
//!
//! The channels assert the burst pairing contract and panic when it is
//! broken; [`Queue`](crate::queue::Queue) never breaks it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::DEFAULT_RESET_COMPATIBLE;
use crate::queue::{Channel, Direction, Packet, PacketMut, QueueId, RxChannel, TxChannel};
use crate::ring::{Reader, RingFull, Writer, slot_ring};
use crate::trace::{debug, warn};

use super::{Backend, Component, ComponentOffset, Device, DeviceError, Resource};

/// Offset of the first component in the emulated device tree.
const COMPONENT_BASE: usize = 0x8000;

/// Distance between consecutive components in the emulated device tree.
const COMPONENT_STRIDE: usize = 0x100;

/// Static description of an emulated device.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Identifier accepted by [`Backend::open_device`].
    pub identifier: String,
    pub rx_queues: usize,
    pub tx_queues: usize,
    /// Slots per ring unless overridden per queue.
    pub ring_capacity: usize,
    /// Per-queue ring sizes.
    pub capacity_overrides: Vec<(QueueId, usize)>,
    /// Payload bytes per slot.
    pub slot_size: usize,
    /// Metadata bytes per slot.
    pub header_size: usize,
    /// Compatible strings of the components in the device tree, in order.
    pub components: Vec<String>,
    /// 32-bit registers per component.
    pub registers_per_component: usize,
    /// Queues whose open fails.
    pub fail_open: Vec<QueueId>,
    /// Queues whose start fails.
    pub fail_start: Vec<QueueId>,
}

impl SimConfig {
    /// A device named `"0"` with the given queue counts and one reset
    /// component.
    #[must_use]
    pub fn new(rx_queues: usize, tx_queues: usize) -> Self {
        Self {
            identifier: "0".into(),
            rx_queues,
            tx_queues,
            ring_capacity: 1024,
            capacity_overrides: Vec::new(),
            slot_size: 2048,
            header_size: 0,
            components: vec![DEFAULT_RESET_COMPATIBLE.into()],
            registers_per_component: 16,
            fail_open: Vec::new(),
            fail_start: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    #[must_use]
    pub fn with_ring_capacity(mut self, slots: usize) -> Self {
        self.ring_capacity = slots;
        self
    }

    /// Gives one queue a ring of its own size.
    #[must_use]
    pub fn with_queue_capacity(mut self, queue: QueueId, slots: usize) -> Self {
        self.capacity_overrides.push((queue, slots));
        self
    }

    #[must_use]
    pub fn with_slot_size(mut self, bytes: usize) -> Self {
        self.slot_size = bytes;
        self
    }

    #[must_use]
    pub fn with_header_size(mut self, bytes: usize) -> Self {
        self.header_size = bytes;
        self
    }

    /// Replaces the device tree's component list.
    #[must_use]
    pub fn with_components(mut self, compatibles: Vec<String>) -> Self {
        self.components = compatibles;
        self
    }

    #[must_use]
    pub fn failing_open(mut self, queue: QueueId) -> Self {
        self.fail_open.push(queue);
        self
    }

    #[must_use]
    pub fn failing_start(mut self, queue: QueueId) -> Self {
        self.fail_start.push(queue);
        self
    }

    fn capacity_of(&self, queue: QueueId) -> usize {
        self.capacity_overrides
            .iter()
            .rev()
            .find(|(id, _)| *id == queue)
            .map_or(self.ring_capacity, |&(_, slots)| slots)
    }
}

/// One entry of the device journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    DeviceOpened,
    ComponentOpened(ComponentOffset),
    QueueOpened(QueueId),
    QueueStarted(QueueId),
    QueueStopped(QueueId),
    QueueClosed(QueueId),
    RegisterWrite {
        component: ComponentOffset,
        addr: u32,
        value: u32,
    },
    ComponentClosed(ComponentOffset),
    DeviceClosed,
}

/// State shared by the backend, the device and every channel.
struct Shared {
    config: SimConfig,
    /// Driver halves of the receive rings, present while the queue is closed.
    rx_rings: Vec<Mutex<Option<Reader>>>,
    /// Driver halves of the transmit rings, present while the queue is closed.
    tx_rings: Vec<Mutex<Option<Writer>>>,
    registers: Vec<Vec<AtomicU32>>,
    journal: Mutex<Vec<SimEvent>>,
    device_open: AtomicBool,
}

impl Shared {
    fn record(&self, event: SimEvent) {
        lock(&self.journal).push(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Emulated card: opens [`SimDevice`]s and hands out hardware-side ports.
pub struct SimBackend {
    shared: Arc<Shared>,
    rx_ports: Mutex<Vec<Option<SimRxPort>>>,
    tx_ports: Mutex<Vec<Option<SimTxPort>>>,
}

impl SimBackend {
    /// Builds every ring described by `config`.
    ///
    /// # Panics
    ///
    /// Panics if a ring capacity is zero.
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        let mut rx_rings = Vec::with_capacity(config.rx_queues);
        let mut rx_ports = Vec::with_capacity(config.rx_queues);
        for index in 0..config.rx_queues {
            let id = QueueId::rx(index);
            let (writer, reader) =
                slot_ring(config.capacity_of(id), config.slot_size, config.header_size);
            rx_rings.push(Mutex::new(Some(reader)));
            rx_ports.push(Some(SimRxPort { id, writer }));
        }

        let mut tx_rings = Vec::with_capacity(config.tx_queues);
        let mut tx_ports = Vec::with_capacity(config.tx_queues);
        for index in 0..config.tx_queues {
            let id = QueueId::tx(index);
            let (writer, reader) =
                slot_ring(config.capacity_of(id), config.slot_size, config.header_size);
            tx_rings.push(Mutex::new(Some(writer)));
            tx_ports.push(Some(SimTxPort { id, reader }));
        }

        let registers = config
            .components
            .iter()
            .map(|_| {
                (0..config.registers_per_component)
                    .map(|_| AtomicU32::new(0))
                    .collect()
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                config,
                rx_rings,
                tx_rings,
                registers,
                journal: Mutex::new(Vec::new()),
                device_open: AtomicBool::new(false),
            }),
            rx_ports: Mutex::new(rx_ports),
            tx_ports: Mutex::new(tx_ports),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    /// Takes the hardware side of receive queue `index`. Each port can be
    /// taken once.
    pub fn take_rx_port(&self, index: usize) -> Option<SimRxPort> {
        lock(&self.rx_ports).get_mut(index)?.take()
    }

    /// Takes the hardware side of transmit queue `index`. Each port can be
    /// taken once.
    pub fn take_tx_port(&self, index: usize) -> Option<SimTxPort> {
        lock(&self.tx_ports).get_mut(index)?.take()
    }

    /// Snapshot of the journal.
    #[must_use]
    pub fn journal(&self) -> Vec<SimEvent> {
        lock(&self.shared.journal).clone()
    }

    /// Current value of register `addr` of the `component`-th component.
    #[must_use]
    pub fn register(&self, component: usize, addr: u32) -> Option<u32> {
        self.shared
            .registers
            .get(component)?
            .get(addr as usize / 4)
            .map(|reg| reg.load(Ordering::Acquire))
    }
}

impl Backend for SimBackend {
    type Device = SimDevice;

    fn open_device(&self, identifier: &str) -> Result<SimDevice, DeviceError> {
        if identifier != self.shared.config.identifier {
            return Err(DeviceError::ResourceUnavailable {
                resource: Resource::Device(identifier.into()),
                reason: "no such device".into(),
            });
        }
        if self.shared.device_open.swap(true, Ordering::AcqRel) {
            return Err(DeviceError::ResourceUnavailable {
                resource: Resource::Device(identifier.into()),
                reason: "already open".into(),
            });
        }
        self.shared.record(SimEvent::DeviceOpened);
        debug!(device = identifier, "sim device opened");
        Ok(SimDevice {
            shared: Arc::clone(&self.shared),
        })
    }
}

/// An opened emulated device.
pub struct SimDevice {
    shared: Arc<Shared>,
}

impl SimDevice {
    fn open_channel_error(&self, queue: QueueId) -> Option<DeviceError> {
        let config = &self.shared.config;
        let count = match queue.direction {
            Direction::Rx => config.rx_queues,
            Direction::Tx => config.tx_queues,
        };
        if queue.index >= count {
            return Some(DeviceError::queue_unavailable(
                queue,
                format!("device has {count} {} queues", queue.direction),
            ));
        }
        if config.fail_open.contains(&queue) {
            return Some(DeviceError::queue_unavailable(queue, "open refused"));
        }
        None
    }
}

impl Device for SimDevice {
    type Rx = SimRxChannel;
    type Tx = SimTxChannel;
    type Component = SimComponent;

    fn identifier(&self) -> &str {
        &self.shared.config.identifier
    }

    fn rx_queue_count(&self) -> usize {
        self.shared.config.rx_queues
    }

    fn tx_queue_count(&self) -> usize {
        self.shared.config.tx_queues
    }

    fn find_component(
        &self,
        compatible: &str,
        index: usize,
    ) -> Result<ComponentOffset, DeviceError> {
        self.shared
            .config
            .components
            .iter()
            .enumerate()
            .filter(|(_, c)| c.as_str() == compatible)
            .nth(index)
            .map(|(position, _)| {
                ComponentOffset(COMPONENT_BASE + position * COMPONENT_STRIDE)
            })
            .ok_or_else(|| DeviceError::NotFound {
                compatible: compatible.into(),
                index,
            })
    }

    fn open_component(&self, offset: ComponentOffset) -> Result<SimComponent, DeviceError> {
        let position = offset
            .0
            .checked_sub(COMPONENT_BASE)
            .filter(|delta| delta % COMPONENT_STRIDE == 0)
            .map(|delta| delta / COMPONENT_STRIDE)
            .filter(|&position| position < self.shared.registers.len());
        let Some(position) = position else {
            return Err(DeviceError::ResourceUnavailable {
                resource: Resource::Component(offset),
                reason: "no component at this offset".into(),
            });
        };
        self.shared.record(SimEvent::ComponentOpened(offset));
        Ok(SimComponent {
            shared: Arc::clone(&self.shared),
            offset,
            position,
        })
    }

    fn open_rx_queue(&self, index: usize) -> Result<SimRxChannel, DeviceError> {
        let id = QueueId::rx(index);
        if let Some(err) = self.open_channel_error(id) {
            return Err(err);
        }
        let Some(reader) = lock(&self.shared.rx_rings[index]).take() else {
            return Err(DeviceError::queue_unavailable(id, "already bound"));
        };
        self.shared.record(SimEvent::QueueOpened(id));
        Ok(SimRxChannel {
            id,
            shared: Arc::clone(&self.shared),
            reader: Some(reader),
            started: false,
            window: None,
        })
    }

    fn open_tx_queue(&self, index: usize) -> Result<SimTxChannel, DeviceError> {
        let id = QueueId::tx(index);
        if let Some(err) = self.open_channel_error(id) {
            return Err(err);
        }
        let Some(writer) = lock(&self.shared.tx_rings[index]).take() else {
            return Err(DeviceError::queue_unavailable(id, "already bound"));
        };
        self.shared.record(SimEvent::QueueOpened(id));
        Ok(SimTxChannel {
            id,
            shared: Arc::clone(&self.shared),
            writer: Some(writer),
            started: false,
            window: None,
        })
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.shared.record(SimEvent::DeviceClosed);
        self.shared.device_open.store(false, Ordering::Release);
        debug!("sim device closed");
    }
}

/// Register window of one emulated component.
pub struct SimComponent {
    shared: Arc<Shared>,
    offset: ComponentOffset,
    position: usize,
}

impl Component for SimComponent {
    fn read32(&self, addr: u32) -> u32 {
        self.shared.registers[self.position]
            .get(addr as usize / 4)
            .map_or(0, |reg| reg.load(Ordering::Acquire))
    }

    fn write32(&mut self, addr: u32, value: u32) {
        match self.shared.registers[self.position].get(addr as usize / 4) {
            Some(reg) => reg.store(value, Ordering::Release),
            None => warn!(component = %self.offset, addr, "write outside register file ignored"),
        }
        self.shared.record(SimEvent::RegisterWrite {
            component: self.offset,
            addr,
            value,
        });
    }
}

impl Drop for SimComponent {
    fn drop(&mut self) {
        self.shared.record(SimEvent::ComponentClosed(self.offset));
    }
}

/// Lifecycle bookkeeping shared by both channel kinds.
fn start_channel(shared: &Shared, id: QueueId, started: &mut bool) -> Result<(), DeviceError> {
    if shared.config.fail_start.contains(&id) {
        return Err(DeviceError::ActivationFailed {
            queue: id,
            reason: "channel rejected activation".into(),
        });
    }
    *started = true;
    shared.record(SimEvent::QueueStarted(id));
    Ok(())
}

fn stop_channel(shared: &Shared, id: QueueId, started: &mut bool) {
    if *started {
        *started = false;
        shared.record(SimEvent::QueueStopped(id));
    }
}

/// Driver side of an emulated receive queue.
pub struct SimRxChannel {
    id: QueueId,
    shared: Arc<Shared>,
    reader: Option<Reader>,
    started: bool,
    /// Size of the burst currently lent out.
    window: Option<usize>,
}

impl SimRxChannel {
    fn reader(&self) -> &Reader {
        match &self.reader {
            Some(reader) => reader,
            None => panic!("{}: burst operation on a closed channel", self.id),
        }
    }

    fn reader_mut(&mut self) -> &mut Reader {
        match &mut self.reader {
            Some(reader) => reader,
            None => panic!("{}: burst operation on a closed channel", self.id),
        }
    }
}

impl Channel for SimRxChannel {
    fn start(&mut self) -> Result<(), DeviceError> {
        start_channel(&self.shared, self.id, &mut self.started)
    }

    fn stop(&mut self) {
        stop_channel(&self.shared, self.id, &mut self.started);
    }

    fn close(&mut self) {
        self.stop();
        if let Some(reader) = self.reader.take() {
            *lock(&self.shared.rx_rings[self.id.index]) = Some(reader);
            self.shared.record(SimEvent::QueueClosed(self.id));
        }
    }
}

impl RxChannel for SimRxChannel {
    fn rx_burst_get(&mut self, max: usize) -> usize {
        assert!(
            self.window.is_none(),
            "{}: rx burst acquired twice without release",
            self.id
        );
        let count = self.reader_mut().peek(max);
        self.window = Some(count);
        count
    }

    fn rx_packet(&self, offset: usize) -> Packet<'_> {
        self.reader().slot(offset).to_packet()
    }

    fn rx_burst_put(&mut self) {
        let Some(count) = self.window.take() else {
            panic!("{}: rx burst released without acquire", self.id);
        };
        self.reader_mut().retire(count);
    }
}

impl Drop for SimRxChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Driver side of an emulated transmit queue.
pub struct SimTxChannel {
    id: QueueId,
    shared: Arc<Shared>,
    writer: Option<Writer>,
    started: bool,
    window: Option<usize>,
}

impl SimTxChannel {
    fn writer_mut(&mut self) -> &mut Writer {
        match &mut self.writer {
            Some(writer) => writer,
            None => panic!("{}: burst operation on a closed channel", self.id),
        }
    }
}

impl Channel for SimTxChannel {
    fn start(&mut self) -> Result<(), DeviceError> {
        start_channel(&self.shared, self.id, &mut self.started)
    }

    fn stop(&mut self) {
        stop_channel(&self.shared, self.id, &mut self.started);
    }

    fn close(&mut self) {
        self.stop();
        if let Some(writer) = self.writer.take() {
            *lock(&self.shared.tx_rings[self.id.index]) = Some(writer);
            self.shared.record(SimEvent::QueueClosed(self.id));
        }
    }
}

impl TxChannel for SimTxChannel {
    fn max_payload(&self) -> usize {
        self.shared.config.slot_size
    }

    fn tx_burst_get(&mut self, max: usize) -> usize {
        assert!(
            self.window.is_none(),
            "{}: tx burst acquired twice without release",
            self.id
        );
        let count = self.writer_mut().reserve(max);
        self.window = Some(count);
        count
    }

    fn tx_packet_mut(&mut self, offset: usize) -> PacketMut<'_> {
        self.writer_mut().slot_mut(offset).into_packet_mut()
    }

    fn tx_burst_put(&mut self, count: usize) {
        let Some(granted) = self.window.take() else {
            panic!("{}: tx burst released without acquire", self.id);
        };
        assert!(
            count <= granted,
            "{}: committing {count} of {granted} granted slots",
            self.id
        );
        self.writer_mut().publish(count);
    }
}

impl Drop for SimTxChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hardware side of an emulated receive queue.
pub struct SimRxPort {
    id: QueueId,
    writer: Writer,
}

impl SimRxPort {
    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Delivers one packet into the ring.
    ///
    /// # Errors
    ///
    /// Returns [`RingFull`] while the driver has not released enough slots.
    pub fn push(&mut self, payload: &[u8]) -> Result<(), RingFull> {
        self.writer.push(payload, 0)
    }

    /// Delivers one packet with metadata and flags.
    ///
    /// # Errors
    ///
    /// Returns [`RingFull`] while the driver has not released enough slots.
    pub fn push_with_header(
        &mut self,
        payload: &[u8],
        header: &[u8],
        flags: u16,
    ) -> Result<(), RingFull> {
        if self.writer.reserve(1) == 0 {
            return Err(RingFull);
        }
        let mut slot = self.writer.slot_mut(0);
        let len = payload.len().min(slot.data_buf().len());
        slot.data_buf()[..len].copy_from_slice(&payload[..len]);
        slot.set_data_len(len);
        let header_len = header.len().min(slot.header_buf().len());
        slot.header_buf()[..header_len].copy_from_slice(&header[..header_len]);
        slot.set_header_len(header_len);
        slot.set_flags(flags);
        self.writer.publish(1);
        Ok(())
    }
}

/// Hardware side of an emulated transmit queue.
pub struct SimTxPort {
    id: QueueId,
    reader: Reader,
}

impl SimTxPort {
    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Takes the oldest committed packet off the ring.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.reader.pop()
    }

    /// Takes every committed packet off the ring.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.reader.pop()).collect()
    }
}
