//! Run orchestration.
//!
//! A run goes through these phases on the calling thread:
//!
//! 1. Validate the configuration and check the sink/source count.
//! 2. Open the device, then the reset component (receive only, when
//!    enabled), then every queue in index order, then start every queue.
//! 3. Write the reset pulse (receive only).
//! 4. Drive one worker per queue: one scoped thread each, or all of them
//!    round-robin on the calling thread.
//! 5. Flush the sinks and tear down in reverse: stop every queue from the
//!    last to the first, close them in the same order, close the
//!    component, close the device.
//!
//! Every resource acquired in phase 2 is recorded in a [`Session`], whose
//! teardown runs on drop. A failure halfway through setup therefore cleans
//! up exactly what was acquired, in reverse order, and nothing else.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;

use crate::config::{Config, ResetConfig, Schedule};
use crate::device::{Backend, Component, Device, DeviceError};
use crate::io::PacketSource;
use crate::queue::{Channel, Direction, Queue, QueueId};
use crate::trace::{debug, error, info, warn};

use super::topology::pin_to_core;
use super::{Poll, RunError, RxWorker, TxWorker, Worker, WorkerReport, WorkerStatus};

/// Resources acquired during setup, in acquisition order.
struct Session<D: Device, C: Channel> {
    queues: Vec<Queue<C>>,
    component: Option<D::Component>,
    device: D,
}

impl<D: Device, C: Channel> Session<D, C> {
    fn new(device: D) -> Self {
        Self {
            queues: Vec::new(),
            component: None,
            device,
        }
    }

    fn open_component(&mut self, reset: &ResetConfig) -> Result<(), DeviceError> {
        let offset = self.device.find_component(&reset.compatible, reset.index)?;
        self.component = Some(self.device.open_component(offset)?);
        debug!(compatible = %reset.compatible, %offset, "reset component opened");
        Ok(())
    }

    fn teardown(&mut self) {
        for queue in self.queues.iter_mut().rev() {
            queue.stop();
        }
        while let Some(mut queue) = self.queues.pop() {
            queue.close();
        }
        self.component = None;
        debug!(device = self.device.identifier(), "session torn down");
    }
}

impl<D: Device, C: Channel> Drop for Session<D, C> {
    fn drop(&mut self) {
        // The device itself closes when the field drops after this.
        self.teardown();
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub direction: Direction,
    /// One report per queue, in queue order.
    pub workers: Vec<WorkerReport>,
    /// Time spent driving the workers.
    pub elapsed: Duration,
}

impl RunReport {
    /// Whether every worker finished with [`WorkerStatus::Complete`].
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.workers
            .iter()
            .all(|report| report.status == WorkerStatus::Complete)
    }

    /// Workers that did not complete.
    pub fn incomplete(&self) -> impl Iterator<Item = &WorkerReport> {
        self.workers
            .iter()
            .filter(|report| report.status != WorkerStatus::Complete)
    }

    /// Packets moved across all queues.
    #[must_use]
    pub fn total_packets(&self) -> u64 {
        self.workers.iter().map(|report| report.stats.packets).sum()
    }
}

/// Sets up a device, runs one worker per queue and tears everything down.
pub struct Coordinator<'b, B: Backend> {
    backend: &'b B,
    config: Config,
    shutdown: Arc<AtomicBool>,
}

impl<'b, B: Backend> Coordinator<'b, B> {
    pub fn new(backend: &'b B, config: Config) -> Self {
        Self {
            backend,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Flag that cancels running workers at their next poll when raised.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Drains every configured receive queue into its sink.
    ///
    /// `sinks[i]` receives the payloads of queue `i`. Sinks are flushed
    /// after all workers finish and before the queues are torn down.
    ///
    /// # Errors
    ///
    /// Configuration, setup, worker and sink failures abort the run after
    /// cleaning up whatever was acquired. An under-delivering queue is not
    /// an error; see [`RunReport::incomplete`].
    pub fn receive<W: Write + Send>(&self, sinks: &mut [W]) -> Result<RunReport, RunError> {
        self.config.validate()?;
        let rx = &self.config.rx;
        let count = rx.queue_count();
        if sinks.len() != count {
            return Err(RunError::EndpointCount {
                expected: count,
                got: sinks.len(),
            });
        }

        info!(
            device = %self.config.device,
            queues = count,
            iterations = rx.iterations,
            schedule = %self.config.schedule,
            "receive run starting"
        );
        let reset = rx.reset.enabled.then_some(&rx.reset);
        let mut session = self.setup(Direction::Rx, count, reset, |device, index| {
            Queue::open_rx(device, index)
        })?;

        if let (Some(component), Some(reset)) = (session.component.as_mut(), reset) {
            component.write32(reset.address, reset.value);
            info!(address = reset.address, value = reset.value, "reset pulse written");
        }

        let abort = AtomicBool::new(false);
        let started = Instant::now();
        let workers: Vec<_> = session
            .queues
            .iter_mut()
            .zip(sinks.iter_mut())
            .zip(rx.budgets())
            .map(|((queue, sink), budget)| {
                RxWorker::new(queue, sink, budget, self.config.batch_size)
                    .with_max_polls(rx.max_polls)
                    .with_backoff(Box::new(rx.backoff.build()))
                    .with_shutdown(&self.shutdown)
                    .with_shutdown(&abort)
            })
            .collect();
        let reports = self.drive(workers, &abort)?;
        let elapsed = started.elapsed();

        for (index, sink) in sinks.iter_mut().enumerate() {
            sink.flush().map_err(|source| RunError::Sink {
                queue: QueueId::rx(index),
                source,
            })?;
        }
        drop(session);

        Ok(finish(Direction::Rx, reports, elapsed))
    }

    /// Fills every configured transmit queue from its source.
    ///
    /// # Errors
    ///
    /// Configuration, setup, worker and source failures abort the run after
    /// cleaning up whatever was acquired.
    pub fn transmit<S: PacketSource>(&self, sources: &mut [S]) -> Result<RunReport, RunError> {
        self.config.validate()?;
        let tx = &self.config.tx;
        if sources.len() != tx.queues {
            return Err(RunError::EndpointCount {
                expected: tx.queues,
                got: sources.len(),
            });
        }

        info!(
            device = %self.config.device,
            queues = tx.queues,
            rounds = tx.rounds,
            schedule = %self.config.schedule,
            "transmit run starting"
        );
        let mut session = self.setup(Direction::Tx, tx.queues, None, |device, index| {
            Queue::open_tx(device, index)
        })?;

        let abort = AtomicBool::new(false);
        let started = Instant::now();
        let workers: Vec<_> = session
            .queues
            .iter_mut()
            .zip(sources.iter_mut())
            .map(|(queue, source)| {
                TxWorker::new(queue, source, self.config.batch_size, tx.rounds)
                    .with_max_polls(tx.max_polls)
                    .with_backoff(Box::new(tx.backoff.build()))
                    .with_shutdown(&self.shutdown)
                    .with_shutdown(&abort)
            })
            .collect();
        let reports = self.drive(workers, &abort)?;
        let elapsed = started.elapsed();
        drop(session);

        Ok(finish(Direction::Tx, reports, elapsed))
    }

    /// Opens the device, the optional reset component and `count` queues,
    /// then starts the queues.
    fn setup<C, F>(
        &self,
        direction: Direction,
        count: usize,
        reset: Option<&ResetConfig>,
        open: F,
    ) -> Result<Session<B::Device, C>, RunError>
    where
        C: Channel,
        F: Fn(&B::Device, usize) -> Result<Queue<C>, DeviceError>,
    {
        let device = self
            .backend
            .open_device(&self.config.device)
            .inspect_err(|e| error!(error = %e, "failed to open device"))?;

        let available = match direction {
            Direction::Rx => device.rx_queue_count(),
            Direction::Tx => device.tx_queue_count(),
        };
        if count > available {
            error!(%direction, requested = count, available, "not enough queues on device");
            return Err(RunError::QueueOutOfRange {
                direction,
                requested: count,
                available,
            });
        }

        let mut session = Session::new(device);
        if let Some(reset) = reset {
            session
                .open_component(reset)
                .inspect_err(|e| error!(error = %e, "failed to open reset component"))?;
        }
        for index in 0..count {
            let queue = open(&session.device, index)
                .inspect_err(|e| error!(error = %e, "failed to open queue"))?;
            session.queues.push(queue);
        }
        for queue in &mut session.queues {
            queue
                .start()
                .inspect_err(|e| error!(error = %e, "failed to start queue"))?;
        }
        debug!(%direction, queues = count, "all queues started");
        Ok(session)
    }

    /// Drives every worker to completion. The first worker to fail or
    /// panic raises `abort`, which cancels the others at their next poll.
    fn drive<W: Worker + Send>(
        &self,
        workers: Vec<W>,
        abort: &AtomicBool,
    ) -> Result<Vec<WorkerReport>, RunError> {
        match self.config.schedule {
            Schedule::ThreadPerQueue => self.drive_threads(workers, abort),
            Schedule::RoundRobin => drive_round_robin(workers, abort),
        }
    }

    /// Runs each worker on its own scoped thread and joins them all.
    fn drive_threads<W: Worker + Send>(
        &self,
        workers: Vec<W>,
        abort: &AtomicBool,
    ) -> Result<Vec<WorkerReport>, RunError> {
        let placement = self.config.cpu.resolve(workers.len());
        debug!(strategy = %placement.strategy, "worker placement");

        thread::scope(|scope| {
            let handles: Vec<_> = workers
                .into_iter()
                .enumerate()
                .map(|(index, worker)| {
                    let queue = worker.queue_id();
                    let core = placement.core_for(index);
                    let handle = thread::Builder::new()
                        .name(format!("burstq-{queue}"))
                        .spawn_scoped(scope, move || {
                            let _abort_on_panic = AbortOnPanic(abort);
                            if let Some(core) = core {
                                if pin_to_core(core) {
                                    debug!(%queue, core, "worker pinned");
                                } else {
                                    warn!(%queue, core, "failed to pin worker");
                                }
                            }
                            worker.run().inspect_err(|e| {
                                error!(%queue, error = %e, "worker failed, cancelling the rest");
                                abort.store(true, Ordering::Release);
                            })
                        })
                        .expect("failed to spawn worker thread");
                    (queue, handle)
                })
                .collect();

            // Join every handle before looking at results so no panicked
            // thread is left for the scope to re-raise.
            let results: Vec<_> = handles
                .into_iter()
                .map(|(queue, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        error!(%queue, "worker panicked");
                        Err(RunError::WorkerPanicked(queue))
                    })
                })
                .collect();
            results.into_iter().collect()
        })
    }
}

/// Raises the run's abort flag when a worker thread unwinds.
struct AbortOnPanic<'a>(&'a AtomicBool);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

/// Polls every unfinished worker in turn on the calling thread. The first
/// error ends the run; the remaining workers are not polled again.
fn drive_round_robin<W: Worker>(
    mut workers: Vec<W>,
    abort: &AtomicBool,
) -> Result<Vec<WorkerReport>, RunError> {
    let mut done = vec![false; workers.len()];
    let mut pending = workers.len();
    while pending > 0 {
        for (worker, done) in workers.iter_mut().zip(done.iter_mut()) {
            if *done {
                continue;
            }
            let poll = worker
                .poll_once()
                .inspect_err(|_| abort.store(true, Ordering::Release))?;
            if let Poll::Done(_) = poll {
                *done = true;
                pending -= 1;
            }
        }
    }
    Ok(workers.iter().map(Worker::report).collect())
}

fn finish(direction: Direction, workers: Vec<WorkerReport>, elapsed: Duration) -> RunReport {
    let report = RunReport {
        direction,
        workers,
        elapsed,
    };
    for worker in report.incomplete() {
        warn!(
            queue = %worker.queue,
            status = %worker.status,
            remaining = worker.remaining,
            "queue did not complete"
        );
    }
    info!(
        %direction,
        packets = report.total_packets(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "run finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ComponentOffset;
    use crate::device::sim::{SimBackend, SimConfig, SimEvent};
    use crate::io::PatternSource;

    fn small_config(budgets: Vec<u32>) -> Config {
        let mut config = Config::default();
        config.rx.packets_per_iteration = budgets;
        config.rx.iterations = 1;
        config.rx.max_polls = Some(10_000);
        config
    }

    fn fill(backend: &SimBackend, queue: usize, packets: usize) {
        let mut port = backend.take_rx_port(queue).unwrap();
        for seq in 0..packets {
            port.push(&[queue as u8, seq as u8]).unwrap();
        }
    }

    #[test]
    fn receive_orders_setup_and_teardown() {
        let backend = SimBackend::new(SimConfig::new(2, 0));
        fill(&backend, 0, 3);
        fill(&backend, 1, 2);

        let coordinator = Coordinator::new(&backend, small_config(vec![3, 2]));
        let mut sinks = vec![Vec::<u8>::new(), Vec::new()];
        let report = coordinator.receive(&mut sinks).unwrap();
        assert!(report.is_complete());
        assert_eq!(sinks[1], vec![1, 0, 1, 1]);

        let component = ComponentOffset(0x8000);
        assert_eq!(
            backend.journal(),
            vec![
                SimEvent::DeviceOpened,
                SimEvent::ComponentOpened(component),
                SimEvent::QueueOpened(QueueId::rx(0)),
                SimEvent::QueueOpened(QueueId::rx(1)),
                SimEvent::QueueStarted(QueueId::rx(0)),
                SimEvent::QueueStarted(QueueId::rx(1)),
                SimEvent::RegisterWrite {
                    component,
                    addr: 0,
                    value: 1
                },
                SimEvent::QueueStopped(QueueId::rx(1)),
                SimEvent::QueueStopped(QueueId::rx(0)),
                SimEvent::QueueClosed(QueueId::rx(1)),
                SimEvent::QueueClosed(QueueId::rx(0)),
                SimEvent::ComponentClosed(component),
                SimEvent::DeviceClosed,
            ]
        );
        assert_eq!(backend.register(0, 0), Some(1));
    }

    #[test]
    fn missing_component_aborts_before_queues_open() {
        let backend = SimBackend::new(SimConfig::new(1, 0).with_components(Vec::new()));
        let coordinator = Coordinator::new(&backend, small_config(vec![1]));
        let err = coordinator.receive(&mut [Vec::<u8>::new()]).unwrap_err();

        assert!(matches!(
            err,
            RunError::Device(DeviceError::NotFound { .. })
        ));
        assert_eq!(
            backend.journal(),
            vec![SimEvent::DeviceOpened, SimEvent::DeviceClosed]
        );
    }

    #[test]
    fn reset_can_be_disabled() {
        let backend = SimBackend::new(SimConfig::new(1, 0).with_components(Vec::new()));
        fill(&backend, 0, 1);
        let mut config = small_config(vec![1]);
        config.rx.reset.enabled = false;

        let report = Coordinator::new(&backend, config)
            .receive(&mut [Vec::<u8>::new()])
            .unwrap();
        assert!(report.is_complete());
    }

    #[test]
    fn too_many_queues_is_rejected() {
        let backend = SimBackend::new(SimConfig::new(2, 0));
        let coordinator = Coordinator::new(&backend, small_config(vec![1, 1, 1]));
        let err = coordinator
            .receive(&mut [Vec::<u8>::new(), Vec::new(), Vec::new()])
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::QueueOutOfRange {
                requested: 3,
                available: 2,
                ..
            }
        ));
    }

    #[test]
    fn sink_count_must_match() {
        let backend = SimBackend::new(SimConfig::new(2, 0));
        let coordinator = Coordinator::new(&backend, small_config(vec![1, 1]));
        let err = coordinator.receive(&mut [Vec::<u8>::new()]).unwrap_err();
        assert!(matches!(
            err,
            RunError::EndpointCount {
                expected: 2,
                got: 1
            }
        ));
        assert!(backend.journal().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_before_setup() {
        let backend = SimBackend::new(SimConfig::new(1, 0));
        let mut config = small_config(vec![1]);
        config.batch_size = 0;
        let err = Coordinator::new(&backend, config)
            .receive(&mut [Vec::<u8>::new()])
            .unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
        assert!(backend.journal().is_empty());
    }

    #[test]
    fn raised_shutdown_flag_cancels_workers() {
        let backend = SimBackend::new(SimConfig::new(1, 0));
        let mut config = small_config(vec![5]);
        config.rx.max_polls = None;
        let coordinator = Coordinator::new(&backend, config);
        coordinator.shutdown_flag().store(true, Ordering::Release);

        let report = coordinator.receive(&mut [Vec::<u8>::new()]).unwrap();
        assert_eq!(report.workers[0].status, WorkerStatus::Cancelled);
        assert_eq!(report.workers[0].remaining, 5);
        assert!(!report.is_complete());
    }

    /// Sink that fails every write when `broken` is set.
    struct Sink {
        broken: bool,
        bytes: Vec<u8>,
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.broken {
                return Err(std::io::Error::other("disk full"));
            }
            self.bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_worker_cancels_starved_siblings() {
        for schedule in [Schedule::ThreadPerQueue, Schedule::RoundRobin] {
            let (done, outcome) = std::sync::mpsc::channel();
            thread::spawn(move || {
                // rx1 never receives anything and polls without a cap.
                let backend = SimBackend::new(SimConfig::new(2, 0));
                fill(&backend, 0, 1);
                let mut config = small_config(vec![1, 1]);
                config.rx.max_polls = None;
                config.schedule = schedule;

                let coordinator = Coordinator::new(&backend, config);
                let mut sinks = [
                    Sink {
                        broken: true,
                        bytes: Vec::new(),
                    },
                    Sink {
                        broken: false,
                        bytes: Vec::new(),
                    },
                ];
                let result = coordinator.receive(&mut sinks);
                let caller_flag = coordinator.shutdown_flag().load(Ordering::Acquire);
                let _ = done.send((result, caller_flag, backend.journal()));
            });

            let Ok((result, caller_flag, journal)) = outcome.recv_timeout(Duration::from_secs(10))
            else {
                panic!("{schedule}: run kept polling after a worker failed");
            };
            assert!(
                matches!(&result, Err(RunError::Sink { queue, .. }) if *queue == QueueId::rx(0)),
                "{schedule}: {result:?}"
            );
            // The abort is local to the run.
            assert!(!caller_flag);
            assert_eq!(journal.last(), Some(&SimEvent::DeviceClosed));
        }
    }

    #[test]
    fn transmit_skips_the_reset_component() {
        let backend = SimBackend::new(SimConfig::new(0, 2));
        let mut config = Config::default();
        config.tx.queues = 2;
        let mut sources = vec![PatternSource::new(64), PatternSource::new(64)];

        let report = Coordinator::new(&backend, config)
            .transmit(&mut sources)
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.total_packets(), 128);
        assert!(
            !backend
                .journal()
                .iter()
                .any(|event| matches!(event, SimEvent::ComponentOpened(_)))
        );
    }
}
