//! Host capacity ceiling
//!
//! How many workspaces may run at once, derived from total RAM and CPU cores
//! every tick. Host metrics come from a [`HostProbe`] so tests can pin them.

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, warn};

/// RAM assumed when /proc/meminfo cannot be read
pub const FALLBACK_RAM_GB: u64 = 16;

/// Measured host resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResources {
    pub total_ram_gb: u64,
    pub cpu_cores: u64,
}

/// Source of host resource figures
pub trait HostProbe: Send + Sync {
    fn probe(&self) -> HostResources;
}

/// Reads /proc/meminfo and the available parallelism of this process.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    meminfo: PathBuf,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_meminfo(path: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: path.into(),
        }
    }

    fn total_ram_gb(&self) -> u64 {
        match std::fs::read_to_string(&self.meminfo) {
            Ok(content) => parse_meminfo_total_gb(&content).unwrap_or_else(|| {
                warn!(path = %self.meminfo.display(), "No MemTotal in meminfo, assuming {FALLBACK_RAM_GB} GB");
                FALLBACK_RAM_GB
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.meminfo.display(), "meminfo not present, assuming {FALLBACK_RAM_GB} GB");
                FALLBACK_RAM_GB
            }
            Err(e) => {
                warn!(path = %self.meminfo.display(), error = %e, "Failed to read meminfo");
                FALLBACK_RAM_GB
            }
        }
    }
}

impl HostProbe for SystemProbe {
    fn probe(&self) -> HostResources {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);
        HostResources {
            total_ram_gb: self.total_ram_gb(),
            cpu_cores,
        }
    }
}

/// `MemTotal:  32768000 kB` to whole gigabytes
pub fn parse_meminfo_total_gb(content: &str) -> Option<u64> {
    let line = content.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024 / 1024)
}

/// Fixed figures, for tests and hosts where probing is not wanted
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub HostResources);

impl FixedProbe {
    pub fn new(total_ram_gb: u64, cpu_cores: u64) -> Self {
        Self(HostResources {
            total_ram_gb,
            cpu_cores,
        })
    }
}

impl HostProbe for FixedProbe {
    fn probe(&self) -> HostResources {
        self.0
    }
}

/// Capacity formula parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityPolicy {
    /// RAM kept back for the host itself
    pub reserved_ram_gb: u64,
    pub ram_per_instance_gb: u64,
    pub cores_per_instance: u64,
    pub hard_cap: usize,
    /// Operator override; replaces the formula when set
    pub max_concurrent: Option<usize>,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            reserved_ram_gb: 4,
            ram_per_instance_gb: 6,
            cores_per_instance: 2,
            hard_cap: 10,
            max_concurrent: None,
        }
    }
}

impl CapacityPolicy {
    /// Running-slot ceiling for the given host. Always at least 1.
    pub fn capacity(&self, host: HostResources) -> usize {
        if let Some(max) = self.max_concurrent {
            return max.max(1);
        }

        let ram_budget = (host.total_ram_gb.saturating_sub(self.reserved_ram_gb)
            / self.ram_per_instance_gb.max(1))
        .max(1);
        let cpu_budget = (host.cpu_cores / self.cores_per_instance.max(1)).max(1);
        let formula = ram_budget.min(cpu_budget) as usize;
        formula.min(self.hard_cap.max(1))
    }

    pub fn capacity_for(&self, probe: &dyn HostProbe) -> usize {
        self.capacity(probe.probe())
    }
}
