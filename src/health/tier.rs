//! Detects which resource tier the host machine falls into, so the
//! rest of the agent can scale queue size, heartbeat cadence, and
//! retry ceilings to the hardware it's actually running on.

use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Resampled periodically — a gym's always-on mini-PC doesn't change
/// tier mid-flight, but this lets `lite` installs recover automatically
/// if someone upgrades the box.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Lite,
    Normal,
    Full,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Lite => "lite",
            Tier::Normal => "normal",
            Tier::Full => "full",
        }
    }

    /// Queue capacity, in events, appropriate for this tier.
    pub fn default_queue_max_size(&self) -> usize {
        match self {
            Tier::Lite => 1_000,
            Tier::Normal => 10_000,
            Tier::Full => 100_000,
        }
    }

    /// Heartbeat cadence appropriate for this tier.
    pub fn default_heartbeat_interval(&self) -> Duration {
        match self {
            Tier::Lite => Duration::from_secs(300),
            Tier::Normal => Duration::from_secs(60),
            Tier::Full => Duration::from_secs(30),
        }
    }

    /// Submission retry ceiling before an event is parked.
    pub fn default_retry_ceiling(&self) -> u32 {
        match self {
            Tier::Lite => 6,
            Tier::Normal => 12,
            Tier::Full => 20,
        }
    }

    /// Whether the queue database should run in WAL mode.
    pub fn wal(&self) -> bool {
        !matches!(self, Tier::Lite)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Samples host CPU count and total memory via `sysinfo` and classifies
/// the box into a tier. An explicit config override always wins.
pub struct TierDetector {
    system: RwLock<System>,
    pinned: Option<Tier>,
}

impl TierDetector {
    pub fn new(pinned: Option<Tier>) -> Self {
        Self {
            system: RwLock::new(System::new_all()),
            pinned,
        }
    }

    pub fn detect(&self) -> Tier {
        if let Some(tier) = self.pinned {
            return tier;
        }

        let mut system = self.system.write().unwrap();
        system.refresh_memory();
        system.refresh_cpu_all();

        classify(system.cpus().len(), system.total_memory())
    }

    /// Current CPU and memory utilization, as fractions of 1.0 — feeds
    /// health classification's resource-pressure check.
    pub fn resource_usage(&self) -> ResourceUsage {
        let mut system = self.system.write().unwrap();
        system.refresh_memory();
        system.refresh_cpu_all();

        let cpu = system.global_cpu_usage() / 100.0;
        let memory = if system.total_memory() == 0 {
            0.0
        } else {
            system.used_memory() as f64 / system.total_memory() as f64
        };

        ResourceUsage { cpu, memory }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
}

/// Total memory is in bytes (as reported by `sysinfo`).
fn classify(cpu_count: usize, total_memory_bytes: u64) -> Tier {
    const GIB: u64 = 1024 * 1024 * 1024;

    if cpu_count <= 1 || total_memory_bytes < 2 * GIB {
        Tier::Lite
    } else if cpu_count <= 2 || total_memory_bytes < 4 * GIB {
        Tier::Normal
    } else {
        Tier::Full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn single_cpu_is_lite_regardless_of_memory() {
        assert_eq!(classify(1, 16 * GIB), Tier::Lite);
    }

    #[test]
    fn low_memory_is_lite_regardless_of_cpu() {
        assert_eq!(classify(8, GIB), Tier::Lite);
    }

    #[test]
    fn modest_hardware_is_normal() {
        assert_eq!(classify(2, 3 * GIB), Tier::Normal);
    }

    #[test]
    fn generous_hardware_is_full() {
        assert_eq!(classify(4, 8 * GIB), Tier::Full);
    }

    #[test]
    fn pinned_tier_overrides_detection() {
        let detector = TierDetector::new(Some(Tier::Full));
        assert_eq!(detector.detect(), Tier::Full);
    }

    #[test]
    fn tier_defaults_scale_up_with_tier() {
        assert!(Tier::Lite.default_queue_max_size() < Tier::Normal.default_queue_max_size());
        assert!(Tier::Normal.default_queue_max_size() < Tier::Full.default_queue_max_size());
        assert!(Tier::Lite.default_heartbeat_interval() > Tier::Full.default_heartbeat_interval());
        assert!(!Tier::Lite.wal());
        assert!(Tier::Normal.wal());
    }
}
