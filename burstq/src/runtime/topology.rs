//! CPU topology detection and worker placement.
//!
//! Each queue worker busy-polls its ring, so it benefits from a core of its
//! own. This module detects the CPU topology at runtime and decides which
//! core, if any, each worker thread is pinned to.
//!
//! # Placement Strategy
//!
//! - **Dedicated**: at least one physical core per worker. Worker `i` is
//!   pinned to the `i`-th available core.
//! - **SmtShare**: enough logical cores but not enough physical ones;
//!   workers share physical cores through SMT siblings.
//! - **NoPin**: more workers than logical cores. Pinning would stack busy
//!   pollers on one core, so the OS schedules them.
//!
//! # Detection
//!
//! Core counts come from `num_cpus`, core IDs and pinning from
//! `core_affinity`. Placement assumes the OS lists one ID per physical core
//! before it lists SMT siblings.

use core_affinity::CoreId;
use serde::Deserialize;

/// Core counts and pinnable core IDs of this machine.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Logical cores, SMT siblings included.
    pub logical_cores: usize,
    /// Total physical cores.
    pub physical_cores: usize,
    /// More logical than physical cores.
    pub has_smt: bool,
    /// Core IDs this process may pin to.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Queries the running system.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        let has_smt = logical_cores > physical_cores;

        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            physical_cores,
            has_smt,
            available_cores,
        }
    }

    /// Selects a placement for `workers` worker threads.
    #[must_use]
    pub fn select_placement(&self, workers: usize) -> WorkerPlacement {
        let available = &self.available_cores;

        let strategy = if workers <= self.physical_cores.min(available.len()) {
            PlacementStrategy::Dedicated
        } else if workers <= available.len() {
            PlacementStrategy::SmtShare
        } else {
            PlacementStrategy::NoPin
        };

        let cores = match strategy {
            PlacementStrategy::Dedicated | PlacementStrategy::SmtShare => {
                available.iter().take(workers).copied().map(Some).collect()
            }
            _ => vec![None; workers],
        };

        WorkerPlacement { cores, strategy }
    }
}

/// Core assignment for each worker thread.
#[derive(Debug, Clone)]
pub struct WorkerPlacement {
    /// Core of worker `i` (None = unpinned).
    pub cores: Vec<Option<usize>>,
    /// How the cores were chosen.
    pub strategy: PlacementStrategy,
}

impl WorkerPlacement {
    /// Creates a placement with all workers unpinned.
    #[must_use]
    pub fn unpinned(workers: usize) -> Self {
        Self {
            cores: vec![None; workers],
            strategy: PlacementStrategy::NoPin,
        }
    }

    /// Core for worker `index`, if it is pinned.
    #[must_use]
    pub fn core_for(&self, index: usize) -> Option<usize> {
        self.cores.get(index).copied().flatten()
    }
}

/// Strategy used for worker placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// One physical core per worker.
    Dedicated,
    /// Workers share physical cores via SMT.
    SmtShare,
    /// Workers are left to the scheduler.
    NoPin,
    /// Cores listed in the configuration.
    Manual,
}

impl std::fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dedicated => write!(f, "dedicated"),
            Self::SmtShare => write!(f, "smt-share"),
            Self::NoPin => write!(f, "no-pin"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Whether and how worker threads are pinned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuConfig {
    /// Auto-detect topology and choose a placement.
    Auto,
    /// User-specified cores; worker `i` runs on `cores[i]`, workers past the
    /// end of the list are unpinned.
    Manual { cores: Vec<usize> },
    /// Never pin.
    #[default]
    Disabled,
}

impl CpuConfig {
    /// Resolves the config to a concrete placement for `workers` threads.
    #[must_use]
    pub fn resolve(&self, workers: usize) -> WorkerPlacement {
        match self {
            Self::Auto => CpuTopology::detect().select_placement(workers),
            Self::Manual { cores } => WorkerPlacement {
                cores: (0..workers).map(|i| cores.get(i).copied()).collect(),
                strategy: PlacementStrategy::Manual,
            },
            Self::Disabled => WorkerPlacement::unpinned(workers),
        }
    }
}

/// Pins the calling thread to `core_id`.
///
/// Returns whether the thread is now pinned.
/// Fails for unknown core IDs or when the OS refuses.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(physical: usize, logical: usize) -> CpuTopology {
        CpuTopology {
            logical_cores: logical,
            physical_cores: physical,
            has_smt: logical > physical,
            available_cores: (0..logical).collect(),
        }
    }

    #[test]
    fn topology_detection_returns_valid_counts() {
        let topo = CpuTopology::detect();

        assert!(topo.logical_cores > 0);
        assert!(topo.physical_cores > 0);
        assert!(topo.logical_cores >= topo.physical_cores);
        assert!(!topo.available_cores.is_empty());
    }

    #[test]
    fn dedicated_when_physical_cores_suffice() {
        let placement = topology(16, 32).select_placement(15);
        assert_eq!(placement.strategy, PlacementStrategy::Dedicated);
        assert_eq!(placement.core_for(0), Some(0));
        assert_eq!(placement.core_for(14), Some(14));
        assert_eq!(placement.core_for(15), None);
    }

    #[test]
    fn smt_share_when_only_logical_cores_suffice() {
        let placement = topology(4, 8).select_placement(6);
        assert_eq!(placement.strategy, PlacementStrategy::SmtShare);
        assert_eq!(placement.cores.len(), 6);
        assert!(placement.cores.iter().all(Option::is_some));
    }

    #[test]
    fn no_pin_when_oversubscribed() {
        let placement = topology(2, 4).select_placement(15);
        assert_eq!(placement.strategy, PlacementStrategy::NoPin);
        assert!(placement.cores.iter().all(Option::is_none));
        assert_eq!(placement.cores.len(), 15);
    }

    #[test]
    fn cpu_config_disabled_returns_unpinned() {
        let placement = CpuConfig::Disabled.resolve(3);
        assert_eq!(placement.strategy, PlacementStrategy::NoPin);
        assert_eq!(placement.cores, vec![None, None, None]);
    }

    #[test]
    fn cpu_config_manual_uses_specified_cores() {
        let config = CpuConfig::Manual { cores: vec![5, 6] };
        let placement = config.resolve(3);

        assert_eq!(placement.cores, vec![Some(5), Some(6), None]);
        assert_eq!(placement.strategy, PlacementStrategy::Manual);
    }

    #[test]
    fn cpu_config_auto_resolves() {
        let placement = CpuConfig::Auto.resolve(1);
        assert!(
            !matches!(placement.strategy, PlacementStrategy::Manual),
            "auto should not return manual strategy"
        );
    }
}
