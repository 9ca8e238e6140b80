//! Helper functions for integration tests

use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use host_monitoring::{
    CpuInformation, MemoryInformation, SystemSnapshot,
    config::{AlertServerConfig, Config},
    monitors::collector::SystemProbe,
    upload::{CollectorClient, UploadQueue},
};
use serde_json::{Value, json};

pub const API_KEY: &str = "test-key";

/// Collector settings with fast retries so failing tests stay quick
pub fn create_server_config(base_url: &str) -> AlertServerConfig {
    AlertServerConfig {
        base_url: base_url.to_string(),
        api_key: API_KEY.to_string(),
        connect_timeout_secs: 2,
        read_timeout_secs: 5,
        max_attempts: 2,
        backoff_base_ms: 10,
        backoff_max_ms: 20,
        ..Default::default()
    }
}

pub fn create_queue(base_url: &str, dir: &Path, max_items: usize) -> UploadQueue {
    let client = CollectorClient::new(&create_server_config(base_url)).unwrap();
    UploadQueue::new(client, dir, max_items).unwrap()
}

/// Full config rooted at `root`, with the given sources and thresholds.
pub fn create_config(base_url: &str, root: &Path, sources: Value, thresholds: Value) -> Config {
    Config::from_value(json!({
        "host": "test-host",
        "service": "test-service",
        "alert_server": {
            "base_url": base_url,
            "api_key": API_KEY,
            "connect_timeout_secs": 2,
            "read_timeout_secs": 5,
            "max_attempts": 2,
            "backoff_base_ms": 10,
            "backoff_max_ms": 20
        },
        "paths": {
            "logs": root.join("logs"),
            "state": root.join("state"),
            "queue": root.join("queue"),
            "temp": root.join("tmp")
        },
        "monitor": {
            "interval_secs": 1,
            "min_sleep_ms": 10
        },
        "sources": sources,
        "thresholds": thresholds
    }))
    .unwrap()
}

pub fn oom_source(log_glob: &str) -> Value {
    json!([{
        "name": "kernel",
        "paths": [log_glob],
        "patterns": [
            { "name": "oom", "regex": "Out of memory", "severity": "critical", "context_lines": 1 },
            { "name": "error", "regex": "(?i)\\berror\\b", "severity": "medium" }
        ]
    }])
}

pub fn create_snapshot(timestamp: DateTime<Utc>, cpu: f64) -> SystemSnapshot {
    SystemSnapshot {
        timestamp,
        cpu: CpuInformation {
            total_usage: cpu,
            processes: vec![],
        },
        memory: MemoryInformation {
            total: 16 * 1024 * 1024 * 1024,
            available: 8 * 1024 * 1024 * 1024,
            total_swap: 0,
            used_swap: 0,
        },
        disks: vec![],
        networks: vec![],
    }
}

/// Probe that reports a constant CPU load, one second apart per sample
pub struct FakeProbe {
    pub cpu: f64,
    pub next: DateTime<Utc>,
    pub samples: usize,
}

impl FakeProbe {
    pub fn new(cpu: f64) -> Self {
        Self {
            cpu,
            next: Utc::now(),
            samples: 0,
        }
    }
}

impl SystemProbe for FakeProbe {
    fn sample(&mut self) -> SystemSnapshot {
        let snapshot = create_snapshot(self.next, self.cpu);
        self.next += TimeDelta::seconds(1);
        self.samples += 1;
        snapshot
    }
}
