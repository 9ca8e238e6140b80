//! OS metric sampling
//!
//! [`SystemProbe`] is the seam between the engine and the operating system.
//! [`SysinfoProbe`] is the real implementation; tests feed the evaluator
//! hand-built snapshots instead.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use sysinfo::{Disks, Networks, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{instrument, trace};

use crate::{
    CpuInformation, DiskInformation, MemoryInformation, NetworkCounters, ProcessUsage,
    SystemSnapshot,
};

pub trait SystemProbe: Send {
    fn sample(&mut self) -> SystemSnapshot;
}

/// Process list with a time-to-live, so the expensive process walk does not
/// run more often than `ttl` even if cycles are short.
#[derive(Debug, Clone)]
pub struct ProcessCache {
    ttl: Duration,
    refreshed_at: Option<Instant>,
    processes: Vec<ProcessUsage>,
}

impl ProcessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            refreshed_at: None,
            processes: Vec::new(),
        }
    }

    pub fn get(&self, now: Instant) -> Option<&[ProcessUsage]> {
        let refreshed_at = self.refreshed_at?;
        (now.duration_since(refreshed_at) < self.ttl).then_some(self.processes.as_slice())
    }

    pub fn store(&mut self, now: Instant, processes: Vec<ProcessUsage>) {
        self.refreshed_at = Some(now);
        self.processes = processes;
    }
}

/// Drop processes under `floor` percent, then keep the `top_n` busiest.
pub fn rank_processes(
    processes: impl IntoIterator<Item = ProcessUsage>,
    floor: f64,
    top_n: usize,
) -> Vec<ProcessUsage> {
    let mut busy: Vec<ProcessUsage> = processes
        .into_iter()
        .filter(|process| process.cpu_usage >= floor)
        .collect();
    busy.sort_by(|a, b| b.cpu_usage.total_cmp(&a.cpu_usage));
    busy.truncate(top_n);
    busy
}

pub struct SysinfoProbe {
    system: System,
    disks: Disks,
    networks: Networks,
    cache: ProcessCache,
    top_processes: usize,
    process_floor: f64,
    /// Set until the first sample, which must not come too soon after priming
    primed_at: Option<Instant>,
}

/// Time still to wait after priming before cpu usage is meaningful.
pub fn cpu_warmup_left(primed_at: Instant, now: Instant) -> Duration {
    sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.saturating_sub(now.duration_since(primed_at))
}

impl SysinfoProbe {
    pub fn new(cache: ProcessCache, top_processes: usize, process_floor: f64) -> Self {
        let mut system = System::new();
        // first refresh only primes the cpu counters
        system.refresh_cpu_usage();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            cache,
            top_processes,
            process_floor,
            primed_at: Some(Instant::now()),
        }
    }

    fn processes(&mut self) -> Vec<ProcessUsage> {
        let now = Instant::now();
        if let Some(cached) = self.cache.get(now) {
            trace!("using cached process list ({} entries)", cached.len());
            return cached.to_vec();
        }

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );

        let cores = self.system.cpus().len().max(1) as f64;
        let ranked = rank_processes(
            self.system.processes().iter().map(|(pid, process)| ProcessUsage {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                cpu_usage: process.cpu_usage() as f64 / cores,
            }),
            self.process_floor,
            self.top_processes,
        );

        self.cache.store(now, ranked.clone());
        ranked
    }

    fn network_counters(&mut self) -> Vec<NetworkCounters> {
        self.networks.refresh(true);
        let drops = read_drop_counters();

        let mut counters: Vec<NetworkCounters> = self
            .networks
            .iter()
            .map(|(name, data)| {
                let (drops_in, drops_out) = drops.get(name).copied().unwrap_or_default();
                NetworkCounters {
                    interface: name.clone(),
                    errors_in: data.total_errors_on_received(),
                    errors_out: data.total_errors_on_transmitted(),
                    drops_in,
                    drops_out,
                }
            })
            .collect();
        counters.sort_by(|a, b| a.interface.cmp(&b.interface));
        counters
    }
}

impl SystemProbe for SysinfoProbe {
    #[instrument(skip_all)]
    fn sample(&mut self) -> SystemSnapshot {
        if let Some(primed_at) = self.primed_at.take() {
            let wait = cpu_warmup_left(primed_at, Instant::now());
            if !wait.is_zero() {
                trace!("waiting {wait:?} for the first cpu measurement");
                std::thread::sleep(wait);
            }
        }

        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let processes = self.processes();
        let networks = self.network_counters();

        let snapshot = SystemSnapshot {
            timestamp: Utc::now(),
            cpu: CpuInformation {
                total_usage: self.system.global_cpu_usage() as f64,
                processes,
            },
            memory: MemoryInformation {
                total: self.system.total_memory(),
                available: self.system.available_memory(),
                total_swap: self.system.total_swap(),
                used_swap: self.system.used_swap(),
            },
            disks: self
                .disks
                .iter()
                .map(|disk| DiskInformation {
                    mount: disk.mount_point().to_string_lossy().into_owned(),
                    total: disk.total_space(),
                    available: disk.available_space(),
                })
                .collect(),
            networks,
        };

        trace!(
            "sampled cpu {:.1}%, {} processes, {} disks, {} nics",
            snapshot.cpu.total_usage,
            snapshot.cpu.processes.len(),
            snapshot.disks.len(),
            snapshot.networks.len()
        );
        snapshot
    }
}

#[cfg(target_os = "linux")]
fn read_drop_counters() -> HashMap<String, (u64, u64)> {
    std::fs::read_to_string("/proc/net/dev")
        .map(|content| parse_proc_net_dev(&content))
        .unwrap_or_default()
}

// sysinfo exposes no drop counters
#[cfg(not(target_os = "linux"))]
fn read_drop_counters() -> HashMap<String, (u64, u64)> {
    HashMap::new()
}

/// `(rx_drop, tx_drop)` per interface from `/proc/net/dev`.
pub fn parse_proc_net_dev(content: &str) -> HashMap<String, (u64, u64)> {
    content
        .lines()
        .skip(2)
        .filter_map(|line| {
            let (name, counters) = line.split_once(':')?;
            let fields: Vec<u64> = counters
                .split_whitespace()
                .map(|field| field.parse().unwrap_or(0))
                .collect();
            let rx_drop = *fields.get(3)?;
            let tx_drop = *fields.get(11)?;
            Some((name.trim().to_string(), (rx_drop, tx_drop)))
        })
        .collect()
}
