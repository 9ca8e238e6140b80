pub mod alerts;
pub mod artifact;
pub mod config;
pub mod dedup;
pub mod error;
pub mod monitors;
pub mod patterns;
pub mod service;
pub mod tail;
pub mod upload;
pub mod util;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(alias = "info")]
    Low,
    Medium,
    #[serde(alias = "warn")]
    Warning,
    High,
    Error,
    Critical,
}

impl Severity {
    /// Urgent alerts get an artifact bundle attached.
    pub fn is_urgent(self) -> bool {
        matches!(self, Severity::Error | Severity::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OS sample, taken once per cycle by a [`monitors::collector::SystemProbe`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuInformation,
    pub memory: MemoryInformation,
    pub disks: Vec<DiskInformation>,
    pub networks: Vec<NetworkCounters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuInformation {
    /// Average usage over all cores in percent
    pub total_usage: f64,
    pub processes: Vec<ProcessUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub pid: u32,
    pub name: String,
    /// Usage normalized to the whole machine (0-100)
    pub cpu_usage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryInformation {
    pub total: u64,
    pub available: u64,
    pub total_swap: u64,
    pub used_swap: u64,
}

impl MemoryInformation {
    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.total.saturating_sub(self.available)) as f64 / self.total as f64 * 100.0
    }

    pub fn available_mb(&self) -> f64 {
        self.available as f64 / (1024.0 * 1024.0)
    }

    pub fn swap_percent(&self) -> f64 {
        if self.total_swap == 0 {
            return 0.0;
        }
        self.used_swap as f64 / self.total_swap as f64 * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInformation {
    pub mount: String,
    pub total: u64,
    pub available: u64,
}

impl DiskInformation {
    pub fn free_percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.available as f64 / self.total as f64 * 100.0
    }

    pub fn free_gb(&self) -> f64 {
        self.available as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// Cumulative per-NIC counters. Rates are derived from two consecutive samples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCounters {
    pub interface: String,
    pub errors_in: u64,
    pub errors_out: u64,
    pub drops_in: u64,
    pub drops_out: u64,
}

/// A single named measurement, as uploaded to the collector's metrics endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dimensions: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl SystemSnapshot {
    /// Flatten the snapshot into uploadable samples.
    pub fn samples(&self) -> Vec<MetricSample> {
        let sample = |metric: &str, value: f64, dimensions: BTreeMap<String, String>| MetricSample {
            metric: metric.to_string(),
            value,
            dimensions,
            timestamp: self.timestamp,
        };

        let mut samples = vec![
            sample("cpu_total", self.cpu.total_usage, BTreeMap::new()),
            sample("memory_used_pct", self.memory.used_percent(), BTreeMap::new()),
            sample("memory_available_mb", self.memory.available_mb(), BTreeMap::new()),
            sample("pagefile_used_pct", self.memory.swap_percent(), BTreeMap::new()),
        ];

        for process in &self.cpu.processes {
            samples.push(sample(
                "process_cpu",
                process.cpu_usage,
                BTreeMap::from([
                    ("pid".to_string(), process.pid.to_string()),
                    ("name".to_string(), process.name.clone()),
                ]),
            ));
        }

        for disk in &self.disks {
            samples.push(sample(
                "disk_free_pct",
                disk.free_percent(),
                BTreeMap::from([("mount".to_string(), disk.mount.clone())]),
            ));
        }

        samples
    }
}
