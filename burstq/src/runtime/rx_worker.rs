//! Receive worker.
//!
//! Drains one receive queue into one sink until the queue's budget is met:
//!
//! 1. Check the shutdown flag and the poll cap (outside any burst).
//! 2. Acquire up to `batch_size` packets.
//! 3. Empty burst: back off and poll again.
//! 4. Otherwise append every payload to the sink in burst order, release,
//!    and charge the burst size against the budget.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use minstant::Instant;

use crate::queue::{Queue, QueueId, RxChannel};
use crate::trace::{debug, trace, warn};

use super::backoff::{Backoff, BackoffPolicy};
use super::{Poll, RunError, Worker, WorkerReport, WorkerStatus};

/// Packets a receive queue still owes.
///
/// Signed: a burst larger than what is left drives it below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    initial: i64,
    remaining: i64,
}

impl Budget {
    #[must_use]
    pub const fn new(initial: i64) -> Self {
        Self {
            initial,
            remaining: initial,
        }
    }

    #[must_use]
    pub const fn initial(&self) -> i64 {
        self.initial
    }

    #[must_use]
    pub const fn remaining(&self) -> i64 {
        self.remaining
    }

    /// Whether nothing more is owed.
    #[must_use]
    pub const fn is_met(&self) -> bool {
        self.remaining <= 0
    }

    /// Charges `packets` against the budget.
    pub fn consume(&mut self, packets: usize) {
        self.remaining = self
            .remaining
            .saturating_sub(i64::try_from(packets).unwrap_or(i64::MAX));
    }
}

/// Burst loop over one receive queue.
pub struct RxWorker<'q, C: RxChannel, W: Write + ?Sized> {
    queue: &'q mut Queue<C>,
    sink: &'q mut W,
    budget: Budget,
    batch_size: usize,
    max_polls: Option<u64>,
    polls: u64,
    backoff: Box<dyn Backoff + Send>,
    /// Any raised flag cancels the worker.
    shutdown: Vec<&'q AtomicBool>,
    started: Option<Instant>,
    elapsed: Duration,
    finished: Option<WorkerStatus>,
}

impl<'q, C: RxChannel, W: Write + ?Sized> RxWorker<'q, C, W> {
    /// Creates a worker owing `budget` packets, acquiring `batch_size` at a
    /// time. Busy-polls without a poll cap until configured otherwise.
    pub fn new(queue: &'q mut Queue<C>, sink: &'q mut W, budget: i64, batch_size: usize) -> Self {
        Self {
            queue,
            sink,
            budget: Budget::new(budget),
            batch_size,
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

    fn cancelled(&self) -> bool {
        self.shutdown
            .iter()
            .any(|flag| flag.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn budget(&self) -> Budget {
        self.budget
    }

    fn finish(&mut self, status: WorkerStatus) -> Poll {
        if let Some(started) = self.started {
            self.elapsed = started.elapsed();
        }
        self.finished = Some(status);
        match status {
            WorkerStatus::Complete => debug!(
                queue = %self.queue.id(),
                polls = self.polls,
                remaining = self.budget.remaining(),
                "rx worker complete"
            ),
            _ => warn!(
                queue = %self.queue.id(),
                %status,
                remaining = self.budget.remaining(),
                polls = self.polls,
                "rx worker stopped short of its budget"
            ),
        }
        Poll::Done(status)
    }
}

impl<C: RxChannel, W: Write + ?Sized> Worker for RxWorker<'_, C, W> {
    fn queue_id(&self) -> QueueId {
        self.queue.id()
    }

    fn poll_once(&mut self) -> Result<Poll, RunError> {
        if let Some(status) = self.finished {
            return Ok(Poll::Done(status));
        }
        if self.budget.is_met() {
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
        let burst = self.queue.acquire_rx(self.batch_size)?;
        if burst.is_empty() {
            burst.release();
            self.backoff.idle();
            return Ok(Poll::Idle);
        }

        let count = burst.len();
        for packet in burst.iter() {
            self.sink
                .write_all(packet.data())
                .map_err(|source| RunError::Sink { queue, source })?;
        }
        burst.release();

        self.budget.consume(count);
        self.backoff.reset();
        trace!(%queue, count, remaining = self.budget.remaining(), "rx burst drained");
        Ok(Poll::Progress(count))
    }

    fn report(&self) -> WorkerReport {
        WorkerReport {
            queue: self.queue.id(),
            status: self.finished.unwrap_or(WorkerStatus::Cancelled),
            initial: self.budget.initial(),
            remaining: self.budget.remaining(),
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
    use crate::queue::{Queue, QueueError};

    fn payload(queue: usize, seq: usize) -> Vec<u8> {
        format!("q{queue}-p{seq};").into_bytes()
    }

    #[test]
    fn budget_goes_negative_on_oversized_burst() {
        let mut budget = Budget::new(5);
        budget.consume(3);
        assert!(!budget.is_met());
        budget.consume(4);
        assert_eq!(budget.remaining(), -2);
        assert!(budget.is_met());
        assert_eq!(budget.initial(), 5);
    }

    #[test]
    fn drains_budget_into_sink_in_order() {
        let backend = SimBackend::new(SimConfig::new(1, 0));
        let mut port = backend.take_rx_port(0).unwrap();
        for seq in 0..10 {
            port.push(&payload(0, seq)).unwrap();
        }

        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_rx(&device, 0).unwrap();
        queue.start().unwrap();

        let mut sink = Vec::<u8>::new();
        let report = RxWorker::new(&mut queue, &mut sink, 10, 4)
            .with_max_polls(Some(100))
            .run()
            .unwrap();

        let expected: Vec<u8> = (0..10).flat_map(|seq| payload(0, seq)).collect();
        assert_eq!(sink, expected);
        assert_eq!(report.status, WorkerStatus::Complete);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.delivered(), 10);
        assert_eq!(report.polls, 3);
        assert_eq!(report.stats.packets, 10);
        assert_eq!(report.stats.acquires, report.stats.releases);
    }

    #[test]
    fn empty_polls_do_not_touch_the_budget() {
        let backend = SimBackend::new(SimConfig::new(1, 0));
        let mut port = backend.take_rx_port(0).unwrap();
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_rx(&device, 0).unwrap();
        queue.start().unwrap();

        let mut sink = Vec::<u8>::new();
        let mut worker = RxWorker::new(&mut queue, &mut sink, 2, 8);
        assert_eq!(worker.poll_once().unwrap(), Poll::Idle);
        assert_eq!(worker.poll_once().unwrap(), Poll::Idle);
        assert_eq!(worker.budget().remaining(), 2);

        port.push(b"a").unwrap();
        port.push(b"b").unwrap();
        assert_eq!(worker.poll_once().unwrap(), Poll::Progress(2));
        for _ in 0..2 {
            assert_eq!(
                worker.poll_once().unwrap(),
                Poll::Done(WorkerStatus::Complete)
            );
        }

        let report = worker.report();
        assert_eq!(report.stats.empty_acquires, 2);
        assert_eq!(report.stats.acquires, 3);
        assert_eq!(report.stats.releases, 3);
        assert_eq!(sink, b"ab");
    }

    #[test]
    fn poll_cap_reports_under_delivery() {
        let backend = SimBackend::new(SimConfig::new(1, 0));
        let mut port = backend.take_rx_port(0).unwrap();
        for seq in 0..3 {
            port.push(&payload(0, seq)).unwrap();
        }
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_rx(&device, 0).unwrap();
        queue.start().unwrap();

        let mut sink = Vec::<u8>::new();
        let report = RxWorker::new(&mut queue, &mut sink, 5, 64)
            .with_max_polls(Some(10))
            .run()
            .unwrap();

        assert_eq!(report.status, WorkerStatus::UnderDelivery);
        assert_eq!(report.remaining, 2);
        assert_eq!(report.polls, 10);
        assert_eq!(report.stats.packets, 3);
    }

    #[test]
    fn shutdown_flag_cancels_between_bursts() {
        let backend = SimBackend::new(SimConfig::new(1, 0));
        let mut port = backend.take_rx_port(0).unwrap();
        port.push(b"x").unwrap();
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_rx(&device, 0).unwrap();
        queue.start().unwrap();

        let flag = AtomicBool::new(false);
        let mut sink = Vec::<u8>::new();
        let mut worker = RxWorker::new(&mut queue, &mut sink, 100, 64).with_shutdown(&flag);
        assert_eq!(worker.poll_once().unwrap(), Poll::Progress(1));
        flag.store(true, Ordering::Release);
        assert_eq!(
            worker.poll_once().unwrap(),
            Poll::Done(WorkerStatus::Cancelled)
        );
        assert_eq!(worker.report().remaining, 99);
    }

    #[test]
    fn any_of_several_flags_cancels() {
        let backend = SimBackend::new(SimConfig::new(1, 0));
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_rx(&device, 0).unwrap();
        queue.start().unwrap();

        let caller = AtomicBool::new(false);
        let run = AtomicBool::new(false);
        let mut sink = Vec::<u8>::new();
        let mut worker = RxWorker::new(&mut queue, &mut sink, 5, 64)
            .with_shutdown(&caller)
            .with_shutdown(&run);
        assert_eq!(worker.poll_once().unwrap(), Poll::Idle);
        run.store(true, Ordering::Release);
        assert_eq!(
            worker.poll_once().unwrap(),
            Poll::Done(WorkerStatus::Cancelled)
        );
        assert!(!caller.load(Ordering::Acquire));
    }

    #[test]
    fn unstarted_queue_is_a_fatal_error() {
        let backend = SimBackend::new(SimConfig::new(1, 0));
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_rx(&device, 0).unwrap();

        let mut sink = Vec::<u8>::new();
        let err = RxWorker::new(&mut queue, &mut sink, 1, 64).run().unwrap_err();
        assert!(matches!(
            err,
            RunError::Queue(QueueError::ProtocolViolation { op: "acquire_rx", .. })
        ));
    }

    #[test]
    fn sink_failure_releases_the_burst() {
        struct BrokenSink;

        impl Write for BrokenSink {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk full"))
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let backend = SimBackend::new(SimConfig::new(1, 0));
        let mut port = backend.take_rx_port(0).unwrap();
        port.push(b"x").unwrap();
        let device = backend.open_device("0").unwrap();
        let mut queue = Queue::open_rx(&device, 0).unwrap();
        queue.start().unwrap();

        let mut sink = BrokenSink;
        let err = RxWorker::new(&mut queue, &mut sink, 1, 64).run().unwrap_err();
        assert!(matches!(err, RunError::Sink { .. }));

        let stats = queue.stats();
        assert_eq!(stats.acquires, stats.releases);
        // Released despite the error: the queue accepts the next acquire.
        assert!(queue.acquire_rx(64).unwrap().is_empty());
    }
}
