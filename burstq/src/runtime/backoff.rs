//! Idle strategies for empty polls.
//!
//! A worker that acquires an empty burst (or a zero transmit grant) calls
//! [`Backoff::idle`] before polling again and [`Backoff::reset`] as soon as
//! a burst carries packets. The default is a pure busy-poll.

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use serde::Deserialize;

/// Strategy invoked between empty polls.
pub trait Backoff {
    /// Called after a poll that moved no packets.
    fn idle(&mut self);

    /// Called after a poll that moved packets.
    fn reset(&mut self);
}

/// Configurable backoff policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Spin-loop hint, then poll again.
    #[default]
    Spin,
    /// Yield the time slice.
    Yield,
    /// Sleep a fixed period.
    Sleep { micros: u64 },
    /// Sleep 1µs, doubling per consecutive empty poll up to `max_micros`.
    Exponential { max_micros: u64 },
}

impl BackoffPolicy {
    /// Builds the per-worker backoff state for this policy.
    #[must_use]
    pub fn build(self) -> PolicyBackoff {
        PolicyBackoff {
            policy: self,
            current: Duration::from_micros(1),
        }
    }
}

impl fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spin => write!(f, "spin"),
            Self::Yield => write!(f, "yield"),
            Self::Sleep { micros } => write!(f, "sleep:{micros}"),
            Self::Exponential { max_micros } => write!(f, "exp:{max_micros}"),
        }
    }
}

/// Error parsing a [`BackoffPolicy`] from its command-line form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid backoff {0:?} (expected spin, yield, sleep:<us> or exp:<max-us>)")]
pub struct ParseBackoffError(String);

impl FromStr for BackoffPolicy {
    type Err = ParseBackoffError;

    /// Parses `spin`, `yield`, `sleep:<micros>` or `exp:<max_micros>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseBackoffError(s.to_owned());
        match s.split_once(':') {
            None if s == "spin" => Ok(Self::Spin),
            None if s == "yield" => Ok(Self::Yield),
            Some(("sleep", micros)) => Ok(Self::Sleep {
                micros: micros.parse().map_err(|_| err())?,
            }),
            Some(("exp", max)) => Ok(Self::Exponential {
                max_micros: max.parse().map_err(|_| err())?,
            }),
            _ => Err(err()),
        }
    }
}

/// [`Backoff`] driven by a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct PolicyBackoff {
    policy: BackoffPolicy,
    /// Next exponential sleep.
    current: Duration,
}

impl PolicyBackoff {
    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}

impl Backoff for PolicyBackoff {
    fn idle(&mut self) {
        match self.policy {
            BackoffPolicy::Spin => std::hint::spin_loop(),
            BackoffPolicy::Yield => thread::yield_now(),
            BackoffPolicy::Sleep { micros } => thread::sleep(Duration::from_micros(micros)),
            BackoffPolicy::Exponential { max_micros } => {
                let max = Duration::from_micros(max_micros.max(1));
                thread::sleep(self.current.min(max));
                self.current = (self.current * 2).min(max);
            }
        }
    }

    fn reset(&mut self) {
        self.current = Duration::from_micros(1);
    }
}
