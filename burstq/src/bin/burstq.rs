//! burstq command-line driver.
//!
//! Runs a receive or transmit session against the in-memory device. The
//! emulated card is fed (receive) or drained (transmit) by helper threads
//! while the coordinator drives one worker per queue.
//!
//! # Usage
//!
//! ```sh
//! burstq receive --out-dir /tmp/capture --iterations 6
//! burstq transmit --queues 4 --packet-len 64
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use burstq::config::{Config, ConfigError};
use burstq::device::sim::{SimBackend, SimConfig, SimRxPort, SimTxPort};
use burstq::io::{self, OpenError, PacketSource, PatternSource};
use burstq::runtime::topology::CpuConfig;
use burstq::runtime::{Coordinator, RunError, RunReport};

/// Slot size of the emulated rings unless packets need more.
const DEFAULT_SLOT_SIZE: usize = 2048;

/// Payload length of emulated received packets.
const DEFAULT_RX_PACKET_LEN: usize = 64;

/// Receive poll cap implied by `--withhold` when none is given.
const WITHHOLD_MAX_POLLS: u64 = 1_000_000;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Run(#[from] RunError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Receive,
    Transmit,
}

/// Knobs of the emulated card.
#[derive(Debug, Clone)]
struct Emulation {
    ring_capacity: usize,
    rx_packet_len: usize,
    /// Packets per queue the card never delivers.
    withhold: u64,
}

impl Default for Emulation {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            rx_packet_len: DEFAULT_RX_PACKET_LEN,
            withhold: 0,
        }
    }
}

fn main() {
    burstq::init_tracing();
    if let Err(e) = run() {
        eprintln!("burstq: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    let (mode, config, emulation) = parse_args(&args)?;
    config.validate()?;

    let report = match mode {
        Mode::Receive => receive(config, &emulation)?,
        Mode::Transmit => transmit(config, &emulation)?,
    };

    for worker in &report.workers {
        println!("{worker}");
    }
    let incomplete = report.incomplete().count();
    if incomplete > 0 {
        eprintln!("burstq: {incomplete} queue(s) did not complete");
    }
    Ok(())
}

fn receive(config: Config, emulation: &Emulation) -> Result<RunReport, CliError> {
    let rx = &config.rx;
    let mut sinks = io::create_sinks(&rx.output_dir, &rx.file_prefix, rx.queue_count())?;

    let backend = SimBackend::new(
        SimConfig::new(rx.queue_count(), 0)
            .with_identifier(config.device.clone())
            .with_ring_capacity(emulation.ring_capacity)
            .with_slot_size(DEFAULT_SLOT_SIZE.max(emulation.rx_packet_len)),
    );
    let feeds: Vec<(SimRxPort, u64)> = rx
        .budgets()
        .into_iter()
        .enumerate()
        .filter_map(|(index, budget)| {
            let packets = u64::try_from(budget)
                .unwrap_or(0)
                .saturating_sub(emulation.withhold);
            backend.take_rx_port(index).map(|port| (port, packets))
        })
        .collect();

    let coordinator = Coordinator::new(&backend, config);
    let stop = AtomicBool::new(false);
    let report = thread::scope(|scope| {
        for (port, packets) in feeds {
            let stop = &stop;
            let len = emulation.rx_packet_len;
            thread::Builder::new()
                .name(format!("sim-{}", port.id()))
                .spawn_scoped(scope, move || feed(port, packets, len, stop))
                .expect("failed to spawn feeder thread");
        }
        let report = coordinator.receive(&mut sinks);
        stop.store(true, Ordering::Release);
        report
    })?;
    Ok(report)
}

/// Plays the card's receive DMA: pushes `packets` packets, retrying while
/// the ring is full.
fn feed(mut port: SimRxPort, packets: u64, len: usize, stop: &AtomicBool) {
    let queue = port.id().index as u8;
    let mut payload = vec![0u8; len];
    for seq in 0..packets {
        payload.fill(queue);
        for (byte, value) in payload.iter_mut().zip(seq.to_le_bytes()) {
            *byte = value;
        }
        while port.push(&payload).is_err() {
            if stop.load(Ordering::Acquire) {
                return;
            }
            thread::yield_now();
        }
    }
}

fn transmit(config: Config, emulation: &Emulation) -> Result<RunReport, CliError> {
    let tx = &config.tx;
    let mut sources: Vec<Box<dyn PacketSource>> = match &tx.input_dir {
        Some(dir) => io::open_sources(dir, &tx.file_prefix, tx.queues, tx.packet_len)?
            .into_iter()
            .map(|source| Box::new(source) as Box<dyn PacketSource>)
            .collect(),
        None => (0..tx.queues)
            .map(|_| {
                Box::new(PatternSource::new(tx.packet_len)) as Box<dyn PacketSource>
            })
            .collect(),
    };

    let backend = SimBackend::new(
        SimConfig::new(0, tx.queues)
            .with_identifier(config.device.clone())
            .with_ring_capacity(emulation.ring_capacity)
            .with_slot_size(DEFAULT_SLOT_SIZE.max(tx.packet_len)),
    );
    let drains: Vec<SimTxPort> = (0..tx.queues)
        .filter_map(|index| backend.take_tx_port(index))
        .collect();

    let coordinator = Coordinator::new(&backend, config);
    let stop = AtomicBool::new(false);
    let report = thread::scope(|scope| {
        for port in drains {
            let stop = &stop;
            thread::Builder::new()
                .name(format!("sim-{}", port.id()))
                .spawn_scoped(scope, move || drain(port, stop))
                .expect("failed to spawn drain thread");
        }
        let report = coordinator.transmit(&mut sources);
        stop.store(true, Ordering::Release);
        report
    })?;
    Ok(report)
}

/// Plays the card's transmit DMA: takes committed packets off the ring
/// until told to stop.
fn drain(mut port: SimTxPort, stop: &AtomicBool) {
    loop {
        let done = stop.load(Ordering::Acquire);
        if port.drain().is_empty() {
            if done {
                return;
            }
            thread::yield_now();
        }
    }
}

/// Fetches the value following flag `args[*i]`.
fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, CliError> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn number<T: std::str::FromStr>(args: &[String], i: &mut usize) -> Result<T, CliError> {
    let flag = args[*i].clone();
    let raw = value(args, i)?;
    raw.parse()
        .map_err(|_| {
            CliError::Usage(format!("invalid value for {flag}: {raw}"))
        })
}

fn parse_cpu(raw: &str) -> Result<CpuConfig, CliError> {
    match raw {
        "auto" => Ok(CpuConfig::Auto),
        "off" | "none" => Ok(CpuConfig::Disabled),
        list => list
            .split(',')
            .map(|core| core.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map(|cores| CpuConfig::Manual { cores })
            .map_err(|_| CliError::Usage(format!("invalid core list: {list}"))),
    }
}

/// Parses command line arguments. A `--config` file is applied first and
/// every other flag overrides it, wherever it appears.
fn parse_args(args: &[String]) -> Result<(Mode, Config, Emulation), CliError> {
    let mode = match args.get(1).map(String::as_str) {
        Some("receive" | "rx") => Mode::Receive,
        Some("transmit" | "tx") => Mode::Transmit,
        Some("--help" | "-h") => {
            print_usage();
            std::process::exit(0);
        }
        Some(other) => return Err(CliError::Usage(format!("unknown command: {other}"))),
        None => {
            print_usage();
            return Err(CliError::Usage("missing command".into()));
        }
    };

    let mut config = match args.iter().position(|arg| arg == "--config" || arg == "-c") {
        Some(mut at) => Config::load(&PathBuf::from(value(args, &mut at)?))?,
        None => Config::default(),
    };
    let mut emulation = Emulation::default();

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
            }
            "--device" | "-d" => config.device = value(args, &mut i)?.to_owned(),
            "--batch" | "-b" => config.batch_size = number(args, &mut i)?,
            "--schedule" => config.schedule = value(args, &mut i)?.parse()?,
            "--cpu" => config.cpu = parse_cpu(value(args, &mut i)?)?,
            "--max-polls" => {
                let max = Some(number(args, &mut i)?);
                config.rx.max_polls = max;
                config.tx.max_polls = max;
            }
            "--backoff" => {
                let raw = value(args, &mut i)?;
                let policy = raw.parse().map_err(|e| CliError::Usage(format!("{e}")))?;
                config.rx.backoff = policy;
                config.tx.backoff = policy;
            }
            "--iterations" | "-i" => config.rx.iterations = number(args, &mut i)?,
            "--out-dir" | "-o" => config.rx.output_dir = PathBuf::from(value(args, &mut i)?),
            "--prefix" => {
                let prefix = value(args, &mut i)?.to_owned();
                config.rx.file_prefix.clone_from(&prefix);
                config.tx.file_prefix = prefix;
            }
            "--no-reset" => config.rx.reset.enabled = false,
            "--queues" | "-q" => config.tx.queues = number(args, &mut i)?,
            "--packet-len" | "-l" => config.tx.packet_len = number(args, &mut i)?,
            "--rounds" | "-r" => config.tx.rounds = number(args, &mut i)?,
            "--in-dir" => config.tx.input_dir = Some(PathBuf::from(value(args, &mut i)?)),
            "--ring" => emulation.ring_capacity = number(args, &mut i)?,
            "--rx-packet-len" => emulation.rx_packet_len = number(args, &mut i)?,
            "--withhold" => emulation.withhold = number(args, &mut i)?,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(CliError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    if emulation.ring_capacity == 0 {
        return Err(CliError::Usage("--ring must be positive".into()));
    }
    // Withheld packets never arrive, so an uncapped receive would never end.
    if emulation.withhold > 0 && config.rx.max_polls.is_none() {
        config.rx.max_polls = Some(WITHHOLD_MAX_POLLS);
    }
    Ok((mode, config, emulation))
}

fn print_usage() {
    eprintln!(
        r#"burstq - burst DMA queue driver

USAGE:
    burstq <receive|transmit> [OPTIONS]

OPTIONS:
    -c, --config <PATH>       TOML configuration file (flags override it)
    -d, --device <ID>         Device identifier (default: 0)
    -b, --batch <N>           Descriptors per burst (default: 64)
        --schedule <MODE>     thread-per-queue | round-robin
        --cpu <auto|off|LIST> Worker pinning, e.g. 2,3,4 (default: off)
        --max-polls <N>       Give up on a queue after N polls
        --backoff <POLICY>    spin | yield | sleep:<us> | exp:<max-us>
        --prefix <NAME>       Data file prefix (default: dma_data_)
    -h, --help                Print this help message

RECEIVE:
    -i, --iterations <N>      Workload iterations per queue (default: 6)
    -o, --out-dir <DIR>       Directory for <prefix><queue>.dat (default: .)
        --no-reset            Skip the reset pulse after the queues start

TRANSMIT:
    -q, --queues <N>          Transmit queues (default: 4)
    -l, --packet-len <N>      Payload bytes per packet (default: 64)
    -r, --rounds <N>          Bursts per queue (default: 1)
        --in-dir <DIR>        Send <prefix><queue>.dat instead of the pattern

EMULATED DEVICE:
        --ring <N>            Slots per ring (default: 1024)
        --rx-packet-len <N>   Bytes per received packet (default: 64)
        --withhold <N>        Packets per queue the card never delivers;
                              implies --max-polls 1000000 unless given

EXAMPLE:
    burstq receive --out-dir /tmp/capture --max-polls 1000000
    burstq transmit --queues 4 --rounds 8 --backoff yield
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use burstq::runtime::WorkerStatus;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| (*arg).to_owned()).collect()
    }

    #[test]
    fn withhold_implies_a_poll_cap() {
        let (mode, config, emulation) =
            parse_args(&args(&["burstq", "receive", "--withhold", "2"])).unwrap();
        assert_eq!(mode, Mode::Receive);
        assert_eq!(emulation.withhold, 2);
        assert_eq!(config.rx.max_polls, Some(WITHHOLD_MAX_POLLS));
    }

    #[test]
    fn explicit_poll_cap_wins_over_withhold() {
        let (_, config, _) = parse_args(&args(&[
            "burstq",
            "rx",
            "--max-polls",
            "50",
            "--withhold",
            "1",
        ]))
        .unwrap();
        assert_eq!(config.rx.max_polls, Some(50));
    }

    #[test]
    fn no_cap_without_withhold() {
        let (_, config, _) = parse_args(&args(&["burstq", "receive"])).unwrap();
        assert_eq!(config.rx.max_polls, None);
    }

    #[test]
    fn withheld_packets_end_as_under_delivery() {
        let (_, mut config, mut emulation) =
            parse_args(&args(&["burstq", "receive", "--withhold", "1"])).unwrap();
        let dir = std::env::temp_dir().join(format!("burstq-cli-{}", std::process::id()));
        config.rx.packets_per_iteration = vec![2, 3];
        config.rx.iterations = 1;
        std::fs::create_dir_all(&dir).unwrap();
        config.rx.output_dir = dir.clone();
        emulation.ring_capacity = 8;

        let report = receive(config, &emulation).unwrap();
        let remaining: Vec<i64> = report.workers.iter().map(|w| w.remaining).collect();
        assert_eq!(remaining, vec![1, 1]);
        assert!(
            report
                .workers
                .iter()
                .all(|w| w.status == WorkerStatus::UnderDelivery)
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
