//! Threshold evaluation over system snapshots
//!
//! ## Policies
//!
//! ```text
//! cpu / process_cpu : rolling average per tier, warn and crit fire independently
//! memory            : current sample only, highest tier wins
//! disk              : exact mount rule beats "*", crit downgraded above crit_min_gb
//! network           : any positive error/drop rate between two samples warns
//! ```
//!
//! One [`RollingWindow`] exists per (metric, dimension, tier). Windows are
//! created on first observation and dropped once all their samples aged out,
//! so short-lived processes do not pile up.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::config::{CpuThresholds, DiskRule, MemoryThresholds, NetworkRule, ThresholdConfig};
use crate::{DiskInformation, NetworkCounters, Severity, SystemSnapshot};

use super::window::RollingWindow;

pub const CPU_TOTAL: &str = "cpu_total";
pub const PROCESS_CPU: &str = "process_cpu";
pub const MEMORY_USED: &str = "memory_used_pct";
pub const MEMORY_AVAILABLE: &str = "memory_available_mb";
pub const PAGEFILE_USED: &str = "pagefile_used_pct";
pub const DISK_FREE: &str = "disk_free_pct";
pub const NIC_ERRORS: &str = "nic_error_rate";
pub const NIC_DROPS: &str = "nic_drop_rate";

/// A metric that crossed a configured threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breach {
    pub metric: String,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

impl Breach {
    fn new(metric: &str, severity: Severity, value: f64, threshold: f64) -> Self {
        Self {
            metric: metric.to_string(),
            severity,
            value,
            threshold,
            dimensions: BTreeMap::new(),
        }
    }

    fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.dimensions.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Tier {
    Warn,
    Crit,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    metric: &'static str,
    dimension: String,
    tier: Tier,
}

#[derive(Debug)]
pub struct ResourceEvaluator {
    thresholds: ThresholdConfig,
    windows: HashMap<WindowKey, RollingWindow>,
    previous_network: Option<(DateTime<Utc>, HashMap<String, NetworkCounters>)>,
}

impl ResourceEvaluator {
    pub fn new(thresholds: ThresholdConfig) -> Self {
        Self {
            thresholds,
            windows: HashMap::new(),
            previous_network: None,
        }
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Feed one snapshot and return every breach it produces.
    #[instrument(skip_all)]
    pub fn evaluate(&mut self, snapshot: &SystemSnapshot) -> Vec<Breach> {
        let now = snapshot.timestamp;
        let mut breaches = Vec::new();

        if let Some(limits) = self.thresholds.cpu.clone() {
            breaches.extend(self.observe_windowed(
                CPU_TOTAL,
                "total",
                &limits,
                now,
                snapshot.cpu.total_usage,
                BTreeMap::new(),
            ));
        }

        if let Some(limits) = self.thresholds.process_cpu.clone() {
            for process in &snapshot.cpu.processes {
                let dimensions = BTreeMap::from([
                    ("pid".to_string(), process.pid.to_string()),
                    ("name".to_string(), process.name.clone()),
                ]);
                breaches.extend(self.observe_windowed(
                    PROCESS_CPU,
                    &format!("{}:{}", process.pid, process.name),
                    &limits,
                    now,
                    process.cpu_usage,
                    dimensions,
                ));
            }
        }

        if let Some(limits) = &self.thresholds.memory {
            breaches.extend(evaluate_memory(limits, snapshot));
        }

        for disk in &snapshot.disks {
            if let Some(rule) = match_disk_rule(&self.thresholds.disk, &disk.mount) {
                breaches.extend(evaluate_disk(rule, disk));
            }
        }

        if let Some(rule) = self.thresholds.network.clone() {
            breaches.extend(self.evaluate_network(&rule, now, &snapshot.networks));
        }

        self.prune(now);

        if !breaches.is_empty() {
            debug!("{} breaches in snapshot", breaches.len());
        }
        breaches
    }

    fn observe_windowed(
        &mut self,
        metric: &'static str,
        dimension: &str,
        limits: &CpuThresholds,
        now: DateTime<Utc>,
        value: f64,
        dimensions: BTreeMap<String, String>,
    ) -> Vec<Breach> {
        let tiers = [
            (Tier::Warn, limits.warn_pct, limits.warn_window_secs, Severity::Warning),
            (Tier::Crit, limits.crit_pct, limits.crit_window_secs, Severity::Critical),
        ];

        let mut breaches = Vec::new();
        for (tier, threshold, window_secs, severity) in tiers {
            let Some(threshold) = threshold else {
                continue;
            };

            let window = self
                .windows
                .entry(WindowKey {
                    metric,
                    dimension: dimension.to_string(),
                    tier,
                })
                .or_insert_with(|| RollingWindow::new(Duration::from_secs(window_secs)));
            window.add(now, value);

            let average = window.average();
            trace!(
                "{metric}[{dimension}] {tier:?}: avg {average:.1} over {} samples (limit {threshold})",
                window.len()
            );

            if average > threshold {
                breaches.push(Breach {
                    metric: metric.to_string(),
                    severity,
                    value: average,
                    threshold,
                    dimensions: dimensions.clone(),
                });
            }
        }
        breaches
    }

    fn evaluate_network(
        &mut self,
        rule: &NetworkRule,
        now: DateTime<Utc>,
        counters: &[NetworkCounters],
    ) -> Vec<Breach> {
        let current: HashMap<String, NetworkCounters> = counters
            .iter()
            .filter(|nic| rule.interfaces.is_empty() || rule.interfaces.contains(&nic.interface))
            .map(|nic| (nic.interface.clone(), nic.clone()))
            .collect();

        let previous = self.previous_network.replace((now, current.clone()));
        let Some((previous_at, previous)) = previous else {
            return vec![];
        };

        let elapsed = now.signed_duration_since(previous_at).as_seconds_f64();
        if elapsed <= 0.0 {
            return vec![];
        }

        let mut breaches = Vec::new();
        for (name, nic) in &current {
            let Some(before) = previous.get(name) else {
                continue;
            };

            // counter resets saturate to zero
            let errors = nic.errors_in.saturating_sub(before.errors_in)
                + nic.errors_out.saturating_sub(before.errors_out);
            let drops = nic.drops_in.saturating_sub(before.drops_in)
                + nic.drops_out.saturating_sub(before.drops_out);

            for (metric, delta) in [(NIC_ERRORS, errors), (NIC_DROPS, drops)] {
                let rate = delta as f64 / elapsed;
                if rate > 0.0 {
                    breaches.push(Breach::new(metric, Severity::Warning, rate, 0.0).with("nic", name));
                }
            }
        }
        breaches.sort_by(|a, b| a.dimensions.cmp(&b.dimensions).then(a.metric.cmp(&b.metric)));
        breaches
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_stale(now));
        let pruned = before - self.windows.len();
        if pruned > 0 {
            trace!("pruned {pruned} idle windows");
        }
    }
}

fn evaluate_memory(limits: &MemoryThresholds, snapshot: &SystemSnapshot) -> Vec<Breach> {
    let memory = &snapshot.memory;
    let mut breaches = Vec::new();

    if let Some(breach) = above(MEMORY_USED, memory.used_percent(), limits.warn_pct, limits.crit_pct) {
        breaches.push(breach);
    }

    let available = memory.available_mb();
    if let Some(crit) = limits.crit_available_mb
        && available < crit
    {
        breaches.push(Breach::new(MEMORY_AVAILABLE, Severity::Critical, available, crit));
    } else if let Some(warn) = limits.warn_available_mb
        && available < warn
    {
        breaches.push(Breach::new(MEMORY_AVAILABLE, Severity::Warning, available, warn));
    }

    if memory.total_swap > 0
        && let Some(breach) = above(
            PAGEFILE_USED,
            memory.swap_percent(),
            limits.pagefile_warn_pct,
            limits.pagefile_crit_pct,
        )
    {
        breaches.push(breach);
    }

    breaches
}

fn above(metric: &str, value: f64, warn: Option<f64>, crit: Option<f64>) -> Option<Breach> {
    if let Some(crit) = crit
        && value > crit
    {
        return Some(Breach::new(metric, Severity::Critical, value, crit));
    }
    if let Some(warn) = warn
        && value > warn
    {
        return Some(Breach::new(metric, Severity::Warning, value, warn));
    }
    None
}

/// Exact mount match first, then the `"*"` rule.
pub fn match_disk_rule<'a>(rules: &'a [DiskRule], mount: &str) -> Option<&'a DiskRule> {
    rules
        .iter()
        .find(|rule| rule.mount == mount)
        .or_else(|| rules.iter().find(|rule| rule.mount == "*"))
}

pub fn evaluate_disk(rule: &DiskRule, disk: &DiskInformation) -> Option<Breach> {
    let free_pct = disk.free_percent();
    let free_gb = disk.free_gb();

    if let Some(crit) = rule.crit_pct
        && free_pct < crit
    {
        let severity = match rule.crit_min_gb {
            Some(floor) if free_gb > floor => {
                trace!(
                    "{}: {free_pct:.1}% free but {free_gb:.1} GB above floor, downgrading",
                    disk.mount
                );
                Severity::Warning
            }
            _ => Severity::Critical,
        };
        return Some(Breach::new(DISK_FREE, severity, free_pct, crit).with("mount", &disk.mount));
    }

    if let Some(warn) = rule.warn_pct
        && free_pct < warn
    {
        return Some(Breach::new(DISK_FREE, Severity::Warning, free_pct, warn).with("mount", &disk.mount));
    }

    None
}
