//! Transmit worker.
//!
//! Fills one transmit queue from one [`PacketSource`], one burst per round.
//! A short grant is logged and only the granted slots are filled; a zero
//! grant is an idle poll. When the source runs dry mid-burst the slots
//! filled so far are committed and the worker finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use minstant::Instant;

use crate::io::PacketSource;
use crate::queue::{Queue, QueueError, QueueId, TxChannel};
use crate::trace::{debug, trace, warn};

use super::backoff::{Backoff, BackoffPolicy};
use super::{Poll, RunError, Worker, WorkerReport, WorkerStatus};

/// Burst loop over one transmit queue.
pub struct TxWorker<'q, C: TxChannel, S: PacketSource + ?Sized> {
    queue: &'q mut Queue<C>,
    source: &'q mut S,
    batch_size: usize,
    rounds: u32,
    rounds_done: u32,
    /// Packets committed so far.
    sent: i64,
    exhausted: bool,
    max_polls: Option<u64>,
    polls: u64,
    backoff: Box<dyn Backoff + Send>,
    /// Any raised flag cancels the worker.
    shutdown: Vec<&'q AtomicBool>,
    started: Option<Instant>,
    elapsed: Duration,
    finished: Option<WorkerStatus>,
}

impl<'q, C: TxChannel, S: PacketSource + ?Sized> TxWorker<'q, C, S> {
    /// Creates a worker sending `rounds` bursts of up to `batch_size`
    /// packets.
    pub fn new(queue: &'q mut Queue<C>, source: &'q mut S, batch_size: usize, rounds: u32) -> Self {
        Self {
            queue,
            source,
            batch_size,
            rounds,
            rounds_done: 0,
            sent: 0,
            exhausted: false,
            max_polls: None,
            polls: 0,
            backoff: Box::new(BackoffPolicy::Spin.build()),
            shutdown: Vec::new(),
            started: None,
            elapsed: Duration::ZERO,
            finished: None,
        }
    }

    /// Gives up after `max_polls` acquire calls.
    #[must_use]
    pub fn with_max_polls(mut self, max_polls: Option<u64>) -> Self {
        self.max_polls = max_polls;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Box<dyn Backoff + Send>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Stops at the next poll once `flag` is raised. Can be given several
    /// flags.
    #[must_use]
    pub fn with_shutdown(mut self, flag: &'q AtomicBool) -> Self {
        self.shutdown.push(flag);
        self
    }

    /// Packets the worker would send if every grant were full.
    fn planned(&self) -> i64 {
        i64::from(self.rounds) * i64::try_from(self.batch_size).unwrap_or(i64::MAX)
    }

    fn cancelled(&self) -> bool {
        self.shutdown
            .iter()
            .any(|flag| flag.load(Ordering::Acquire))
    }

    fn finish(&mut self, status: WorkerStatus) -> Poll {
        if let Some(started) = self.started {
            self.elapsed = started.elapsed();
        }
        self.finished = Some(status);
        debug!(
            queue = %self.queue.id(),
            %status,
            sent = self.sent,
            rounds = self.rounds_done,
            "tx worker finished"
        );
        Poll::Done(status)
    }
}

impl<C: TxChannel, S: PacketSource + ?Sized> Worker for TxWorker<'_, C, S> {
    fn queue_id(&self) -> QueueId {
        self.queue.id()
    }

    fn poll_once(&mut self) -> Result<Poll, RunError> {
        if let Some(status) = self.finished {
            return Ok(Poll::Done(status));
        }
        if self.exhausted {
            return Ok(self.finish(WorkerStatus::SourceExhausted));
        }
        if self.rounds_done >= self.rounds {
            return Ok(self.finish(WorkerStatus::Complete));
        }
        if self.cancelled() {
            return Ok(self.finish(WorkerStatus::Cancelled));
        }
        if self.max_polls.is_some_and(|max| self.polls >= max) {
            return Ok(self.finish(WorkerStatus::UnderDelivery));
        }

        self.started.get_or_insert_with(Instant::now);
        self.polls += 1;

        let queue = self.queue.id();
        let mut burst = self.queue.acquire_tx(self.batch_size)?;
        let granted = burst.len();
        if granted == 0 {
            burst.release();
            self.backoff.idle();
            return Ok(Poll::Idle);
        }
        if granted < self.batch_size {
            warn!(
                %queue,
                requested = self.batch_size,
                granted,
                "short transmit grant; sending only the granted slots"
            );
        }

        let mut filled = 0;
        while filled < granted {
            let mut packet = burst.get_mut(filled);
            let next = self
                .source
                .next_packet(packet.payload_mut())
                .map_err(|source| RunError::Source { queue, source })?;
            let Some(len) = next else {
                self.exhausted = true;
                break;
            };
            packet
                .set_data_length(len)
                .map_err(|source| QueueError::Payload { queue, source })?;
            filled += 1;
        }
        burst.commit(filled);

        self.sent += i64::try_from(filled).unwrap_or(i64::MAX);
        self.rounds_done += 1;
        self.backoff.reset();
        trace!(%queue, granted, committed = filled, round = self.rounds_done, "tx burst sent");
        Ok(Poll::Progress(filled))
    }

    fn report(&self) -> WorkerReport {
        let initial = self.planned();
        WorkerReport {
            queue: self.queue.id(),
            status: self.finished.unwrap_or(WorkerStatus::Cancelled),
            initial,
            remaining: initial - self.sent,
            polls: self.polls,
            stats: self.queue.stats(),
            elapsed: self.elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Backend;
    use crate::device::sim::{SimBackend, SimConfig};
    use crate::io::{PATTERN_MARKER, PATTERN_MARKER_OFFSET, PatternSource, ReaderSource};
    use std::io::Cursor;

    #[test]
    fn one_round_fills_every_granted_slot() {
        let backend = SimBackend::new(SimConfig::new(0, 1));
        let mut port = backend.take_tx_port(0).unwrap();
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_tx(&device, 0).unwrap();
        queue.start().unwrap();

        let mut source = PatternSource::new(64);
        let report = TxWorker::new(&mut queue, &mut source, 64, 1).run().unwrap();

        assert_eq!(report.status, WorkerStatus::Complete);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.stats.packets, 64);
        assert_eq!(report.stats.bytes, 64 * 64);

        let sent = port.drain();
        assert_eq!(sent.len(), 64);
        assert!(
            sent.iter()
                .all(|p| p.len() == 64 && p[PATTERN_MARKER_OFFSET] == PATTERN_MARKER)
        );
    }

    #[test]
    fn short_grant_sends_only_granted_slots() {
        let backend = SimBackend::new(SimConfig::new(0, 1).with_ring_capacity(40));
        let mut port = backend.take_tx_port(0).unwrap();
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_tx(&device, 0).unwrap();
        queue.start().unwrap();

        let mut source = PatternSource::new(64);
        let report = TxWorker::new(&mut queue, &mut source, 64, 1).run().unwrap();

        assert_eq!(report.status, WorkerStatus::Complete);
        assert_eq!(report.stats.packets, 40);
        assert_eq!(report.stats.short_acquires, 1);
        assert_eq!(report.remaining, 24);
        assert_eq!(port.drain().len(), 40);
    }

    #[test]
    fn exhausted_source_commits_the_filled_prefix() {
        let backend = SimBackend::new(SimConfig::new(0, 1));
        let mut port = backend.take_tx_port(0).unwrap();
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_tx(&device, 0).unwrap();
        queue.start().unwrap();

        let mut source = ReaderSource::new(Cursor::new(b"aaaabbbbcc".to_vec()), 4);
        let report = TxWorker::new(&mut queue, &mut source, 8, 3).run().unwrap();

        assert_eq!(report.status, WorkerStatus::SourceExhausted);
        assert_eq!(report.stats.packets, 3);
        assert_eq!(
            port.drain(),
            vec![b"aaaa".to_vec(), b"bbbb".to_vec(), b"cc".to_vec()]
        );
    }

    #[test]
    fn full_ring_is_an_idle_poll_until_the_cap() {
        let backend = SimBackend::new(SimConfig::new(0, 1).with_ring_capacity(8));
        let _port = backend.take_tx_port(0).unwrap();
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_tx(&device, 0).unwrap();
        queue.start().unwrap();

        let mut source = PatternSource::new(16);
        let report = TxWorker::new(&mut queue, &mut source, 8, 3)
            .with_max_polls(Some(5))
            .run()
            .unwrap();

        assert_eq!(report.status, WorkerStatus::UnderDelivery);
        assert_eq!(report.stats.packets, 8);
        assert_eq!(report.stats.empty_acquires, 4);
        assert_eq!(report.remaining, 16);
    }

    #[test]
    fn oversized_source_packet_is_rejected() {
        let backend = SimBackend::new(SimConfig::new(0, 1).with_slot_size(16));
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_tx(&device, 0).unwrap();
        queue.start().unwrap();

        struct Liar;

        impl PacketSource for Liar {
            fn next_packet(&mut self, _: &mut [u8]) -> std::io::Result<Option<usize>> {
                Ok(Some(17))
            }
        }

        let err = TxWorker::new(&mut queue, &mut Liar, 4, 1).run().unwrap_err();
        assert!(matches!(err, RunError::Queue(QueueError::Payload { .. })));
        assert_eq!(queue.stats().packets, 0);
        assert_eq!(queue.stats().releases, 1);
    }
}
