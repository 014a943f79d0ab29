//! Run configuration.
//!
//! Defaults reproduce the fixed workload of the receive and transmit
//! programs this crate drives: device `"0"`, bursts of 64 descriptors, 15
//! receive queues drained for 6 iterations, a reset pulse on the debug core
//! after the queues start, and 4 transmit queues sent one burst of 64-byte
//! packets each.
//!
//! A [`Config`] can be loaded from TOML; every field is optional:
//!
//! ```toml
//! device = "0"
//! batch_size = 64
//! schedule = "round-robin"
//!
//! [rx]
//! iterations = 6
//! packets_per_iteration = [18, 18, 14]
//! max_polls = 1000000
//! backoff = { sleep = { micros = 10 } }
//!
//! [rx.reset]
//! enabled = false
//!
//! [tx]
//! queues = 4
//! packet_len = 64
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::runtime::backoff::BackoffPolicy;
use crate::runtime::topology::CpuConfig;

/// Compatible string of the component that receives the reset pulse.
pub const DEFAULT_RESET_COMPATIBLE: &str = "ziti,minimal,multicore_debug_core";

/// Packets expected per receive queue and iteration.
pub const DEFAULT_PACKETS_PER_ITERATION: [u32; 15] =
    [18, 18, 18, 18, 18, 14, 14, 15, 15, 18, 18, 18, 18, 18, 18];

/// Descriptors requested per burst.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Largest burst a queue may request.
pub const MAX_BATCH_SIZE: usize = 1024;

/// Errors loading or validating a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for [`Config`].
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// How queue workers are mapped to threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Schedule {
    /// One thread per queue.
    #[default]
    ThreadPerQueue,
    /// The coordinator thread polls every queue in turn.
    RoundRobin,
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThreadPerQueue => write!(f, "thread-per-queue"),
            Self::RoundRobin => write!(f, "round-robin"),
        }
    }
}

impl FromStr for Schedule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread-per-queue" | "threads" => Ok(Self::ThreadPerQueue),
            "round-robin" | "sequential" => Ok(Self::RoundRobin),
            other => Err(ConfigError::invalid(
                "schedule",
                format!("{other:?} (expected thread-per-queue or round-robin)"),
            )),
        }
    }
}

/// One-shot register write issued after every receive queue has started.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResetConfig {
    pub enabled: bool,
    /// Compatible string of the target component.
    pub compatible: String,
    /// Which matching component to use.
    pub index: usize,
    /// Register byte address.
    pub address: u32,
    pub value: u32,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compatible: DEFAULT_RESET_COMPATIBLE.into(),
            index: 0,
            address: 0,
            value: 1,
        }
    }
}

/// Receive run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RxConfig {
    /// Iterations of the workload table each queue is owed.
    pub iterations: u32,
    /// Packets per iteration for each queue; its length is the queue count.
    pub packets_per_iteration: Vec<u32>,
    /// Polls after which a worker gives up. `None` polls until the budget
    /// is met.
    pub max_polls: Option<u64>,
    pub backoff: BackoffPolicy,
    pub reset: ResetConfig,
    /// Directory receiving one output file per queue.
    pub output_dir: PathBuf,
    /// Output file name prefix; queue `i` writes `<prefix><i>.dat`.
    pub file_prefix: String,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            iterations: 6,
            packets_per_iteration: DEFAULT_PACKETS_PER_ITERATION.to_vec(),
            max_polls: None,
            backoff: BackoffPolicy::default(),
            reset: ResetConfig::default(),
            output_dir: PathBuf::from("."),
            file_prefix: "dma_data_".into(),
        }
    }
}

impl RxConfig {
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.packets_per_iteration.len()
    }

    /// Initial budget of every queue.
    #[must_use]
    pub fn budgets(&self) -> Vec<i64> {
        self.packets_per_iteration
            .iter()
            .map(|&packets| i64::from(packets) * i64::from(self.iterations))
            .collect()
    }
}

/// Transmit run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TxConfig {
    pub queues: usize,
    /// Payload bytes per packet.
    pub packet_len: usize,
    /// Bursts sent per queue.
    pub rounds: u32,
    /// Polls after which a worker gives up on a full ring.
    pub max_polls: Option<u64>,
    pub backoff: BackoffPolicy,
    /// Directory holding one input file per queue (`<prefix><i>.dat`),
    /// read in `packet_len` chunks. `None` sends the built-in pattern.
    pub input_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            queues: 4,
            packet_len: 64,
            rounds: 1,
            max_polls: None,
            backoff: BackoffPolicy::default(),
            input_dir: None,
            file_prefix: "dma_data_".into(),
        }
    }
}

/// Full run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Device identifier passed to the backend.
    pub device: String,
    /// Descriptors requested per burst.
    pub batch_size: usize,
    pub schedule: Schedule,
    pub cpu: CpuConfig,
    pub rx: RxConfig,
    pub tx: TxConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: "0".into(),
            batch_size: DEFAULT_BATCH_SIZE,
            schedule: Schedule::default(),
            cpu: CpuConfig::default(),
            rx: RxConfig::default(),
            tx: TxConfig::default(),
        }
    }
}

impl Config {
    /// Parses a TOML document. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input or unknown keys.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not a valid configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges. Queue indices are checked against the device at
    /// setup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.is_empty() {
            return Err(ConfigError::invalid("device", "must not be empty"));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::invalid(
                "batch_size",
                format!("{} is outside 1..={MAX_BATCH_SIZE}", self.batch_size),
            ));
        }
        if self.rx.iterations == 0 {
            return Err(ConfigError::invalid("rx.iterations", "must be positive"));
        }
        if self.rx.packets_per_iteration.is_empty() {
            return Err(ConfigError::invalid(
                "rx.packets_per_iteration",
                "needs at least one queue",
            ));
        }
        if let Some(queue) = self.rx.packets_per_iteration.iter().position(|&p| p == 0) {
            return Err(ConfigError::invalid(
                "rx.packets_per_iteration",
                format!("queue {queue} expects no packets"),
            ));
        }
        if self.rx.max_polls == Some(0) || self.tx.max_polls == Some(0) {
            return Err(ConfigError::invalid("max_polls", "must be positive"));
        }
        if self.tx.queues == 0 {
            return Err(ConfigError::invalid("tx.queues", "must be positive"));
        }
        if self.tx.packet_len == 0 {
            return Err(ConfigError::invalid("tx.packet_len", "must be positive"));
        }
        if self.tx.rounds == 0 {
            return Err(ConfigError::invalid("tx.rounds", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_workload() {
        let config = Config::default();
        config.validate().unwrap();

        assert_eq!(config.device, "0");
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.rx.queue_count(), 15);
        assert_eq!(config.rx.budgets()[0], 108);
        assert_eq!(config.rx.budgets()[5], 84);
        assert_eq!(config.rx.budgets()[7], 90);
        assert!(config.rx.reset.enabled);
        assert_eq!(config.rx.reset.compatible, DEFAULT_RESET_COMPATIBLE);
        assert_eq!((config.rx.reset.address, config.rx.reset.value), (0, 1));
        assert_eq!(config.tx.queues, 4);
        assert_eq!(config.tx.packet_len, 64);
        assert_eq!(config.tx.rounds, 1);
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn toml_overrides() {
        let config = Config::from_toml_str(
            r#"
            device = "1"
            batch_size = 32
            schedule = "round-robin"
            cpu = { manual = { cores = [2, 3] } }

            [rx]
            iterations = 2
            packets_per_iteration = [4, 5]
            max_polls = 100
            backoff = { exponential = { max_micros = 50 } }
            file_prefix = "q"

            [rx.reset]
            enabled = false

            [tx]
            queues = 2
            backoff = "yield"
            "#,
        )
        .unwrap();

        assert_eq!(config.device, "1");
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.schedule, Schedule::RoundRobin);
        assert_eq!(config.cpu, CpuConfig::Manual { cores: vec![2, 3] });
        assert_eq!(config.rx.budgets(), vec![8, 10]);
        assert_eq!(config.rx.max_polls, Some(100));
        assert_eq!(
            config.rx.backoff,
            BackoffPolicy::Exponential { max_micros: 50 }
        );
        assert!(!config.rx.reset.enabled);
        assert_eq!(config.rx.reset.value, 1);
        assert_eq!(config.rx.file_prefix, "q");
        assert_eq!(config.tx.queues, 2);
        assert_eq!(config.tx.packet_len, 64);
        assert_eq!(config.tx.backoff, BackoffPolicy::Yield);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Config::from_toml_str("batch = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("batch_size", Box::new(|c| c.batch_size = 0)),
            (
                "batch_size",
                Box::new(|c| c.batch_size = MAX_BATCH_SIZE + 1),
            ),
            ("rx.iterations", Box::new(|c| c.rx.iterations = 0)),
            (
                "rx.packets_per_iteration",
                Box::new(|c| c.rx.packets_per_iteration.clear()),
            ),
            (
                "rx.packets_per_iteration",
                Box::new(|c| c.rx.packets_per_iteration[3] = 0),
            ),
            ("max_polls", Box::new(|c| c.rx.max_polls = Some(0))),
            ("tx.queues", Box::new(|c| c.tx.queues = 0)),
            ("tx.packet_len", Box::new(|c| c.tx.packet_len = 0)),
            ("tx.rounds", Box::new(|c| c.tx.rounds = 0)),
            ("device", Box::new(|c| c.device.clear())),
        ];

        for (expected, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            match config.validate() {
                Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected invalid {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn schedule_parses_aliases() {
        assert_eq!(
            "threads".parse::<Schedule>().unwrap(),
            Schedule::ThreadPerQueue
        );
        assert_eq!(
            "sequential".parse::<Schedule>().unwrap(),
            Schedule::RoundRobin
        );
        assert!("fifo".parse::<Schedule>().is_err());
    }
}
