//! Queue workers and their orchestration.
//!
//! - `rx_worker` / `tx_worker`: per-queue burst loops against a budget.
//! - `coordinator`: device and queue setup, one worker per queue, ordered
//!   teardown.
//! - `backoff`: what a worker does after an empty poll.
//! - `topology`: optional pinning of worker threads to CPU cores.

pub mod backoff;
pub mod coordinator;
pub mod rx_worker;
pub mod topology;
pub mod tx_worker;

use std::fmt;
use std::time::Duration;

use crate::config::ConfigError;
use crate::device::DeviceError;
use crate::io::OpenError;
use crate::queue::{Direction, QueueError, QueueId, QueueStats};

pub use coordinator::{Coordinator, RunReport};
pub use rx_worker::{Budget, RxWorker};
pub use tx_worker::TxWorker;

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// The budget was met (receive) or every round was sent (transmit).
    Complete,
    /// The poll cap was reached first.
    UnderDelivery,
    /// The shutdown flag was raised first.
    Cancelled,
    /// The transmit source ran dry.
    SourceExhausted,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::UnderDelivery => write!(f, "under-delivery"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::SourceExhausted => write!(f, "source exhausted"),
        }
    }
}

/// Result of one [`Worker::poll_once`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// A burst moved this many packets.
    Progress(usize),
    /// The burst was empty.
    Idle,
    /// The worker is finished; further polls return the same status.
    Done(WorkerStatus),
}

/// Final state of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub queue: QueueId,
    pub status: WorkerStatus,
    /// Packets owed at the start.
    pub initial: i64,
    /// Packets still owed at the end. Negative when a receive queue
    /// delivered more than it owed.
    pub remaining: i64,
    /// Acquire calls issued.
    pub polls: u64,
    pub stats: QueueStats,
    /// Time from first poll to completion.
    pub elapsed: Duration,
}

impl WorkerReport {
    /// Packets moved, as counted against the budget.
    #[must_use]
    pub fn delivered(&self) -> i64 {
        self.initial - self.remaining
    }
}

impl fmt::Display for WorkerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: remaining {} of {} ({} packets, {} bytes, {} polls, {:.3} ms) {}",
            self.queue,
            self.remaining,
            self.initial,
            self.stats.packets,
            self.stats.bytes,
            self.polls,
            self.elapsed.as_secs_f64() * 1e3,
            self.status
        )
    }
}

/// A per-queue burst loop that can be stepped or run to completion.
pub trait Worker {
    fn queue_id(&self) -> QueueId;

    /// Performs at most one acquire/release cycle.
    ///
    /// # Errors
    ///
    /// Protocol violations and sink or source failures end the worker.
    fn poll_once(&mut self) -> Result<Poll, RunError>;

    /// Snapshot of the worker's counters.
    fn report(&self) -> WorkerReport;

    /// Polls until done.
    ///
    /// # Errors
    ///
    /// Returns the first error of [`Worker::poll_once`].
    fn run(mut self) -> Result<WorkerReport, RunError>
    where
        Self: Sized,
    {
        loop {
            if let Poll::Done(_) = self.poll_once()? {
                return Ok(self.report());
            }
        }
    }
}

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("device setup failed: {0}")]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Open(#[from] OpenError),
    /// Writing received payloads failed.
    #[error("{queue}: sink write failed: {source}")]
    Sink {
        queue: QueueId,
        #[source]
        source: std::io::Error,
    },
    /// Reading transmit payloads failed.
    #[error("{queue}: source read failed: {source}")]
    Source {
        queue: QueueId,
        #[source]
        source: std::io::Error,
    },
    /// More queues are configured than the device exposes.
    #[error("device exposes {available} {direction} queues, {requested} configured")]
    QueueOutOfRange {
        direction: Direction,
        requested: usize,
        available: usize,
    },
    /// The caller supplied the wrong number of sinks or sources.
    #[error("{expected} queues configured but {got} sinks/sources supplied")]
    EndpointCount { expected: usize, got: usize },
    #[error("worker for {0} panicked")]
    WorkerPanicked(QueueId),
}
