//! The monitoring loop
//!
//! One [`MonitorService`] owns every piece of mutable state (tail offsets,
//! rolling windows, dedup map and queue directory) and runs cycles strictly
//! one after another:
//!
//! ```text
//! Idle -> Scanning -> Evaluating -> Dispatching -> Sleeping -> Scanning ...
//! ```
//!
//! Scanning and Evaluating only collect outgoing payloads; nothing touches the
//! network before Dispatching. Shutdown is observed before a cycle starts and
//! while sleeping, never in the middle of a cycle.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::alerts::{AlertOrigin, AlertPayload};
use crate::artifact::ArtifactBuilder;
use crate::config::{Config, SourceConfig};
use crate::dedup::Deduplicator;
use crate::error::AgentResult;
use crate::monitors::collector::SystemProbe;
use crate::monitors::resources::{Breach, ResourceEvaluator};
use crate::patterns::{Hit, PatternMatcher};
use crate::tail::TailState;
use crate::upload::{CollectorClient, Endpoint, RetryReport, UploadQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    Idle,
    Scanning,
    Evaluating,
    Dispatching,
    Sleeping,
}

/// Lifetime counters of the agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub cycles: u64,
    pub errors: u64,
    pub alerts_sent: u64,
    pub metrics_uploaded: u64,
    pub started_at: DateTime<Utc>,
}

impl Default for AgentStats {
    fn default() -> Self {
        Self {
            cycles: 0,
            errors: 0,
            alerts_sent: 0,
            metrics_uploaded: 0,
            started_at: Utc::now(),
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub hits: usize,
    pub breaches: usize,
    pub suppressed: usize,
    pub alerts_sent: usize,
    pub alerts_queued: usize,
    pub artifacts: usize,
    pub metrics_uploaded: bool,
    pub errors: usize,
    pub retry: RetryReport,
    pub elapsed: Duration,
}

enum Outgoing {
    Alert(AlertPayload),
    Artifact { metadata: Value, path: PathBuf },
    Metrics(Value),
}

struct LogSource {
    config: SourceConfig,
    matcher: PatternMatcher,
}

pub struct MonitorService {
    config: Config,
    origin: AlertOrigin,
    sources: Vec<LogSource>,
    tail: TailState,
    probe: Box<dyn SystemProbe>,
    evaluator: ResourceEvaluator,
    dedup: Deduplicator,
    queue: UploadQueue,
    artifacts: ArtifactBuilder,
    phase: CyclePhase,
    stats: AgentStats,
}

impl MonitorService {
    /// Build the service. Invalid patterns and unusable directories are fatal.
    pub fn new(config: Config, probe: Box<dyn SystemProbe>) -> AgentResult<Self> {
        let sources = config
            .sources
            .iter()
            .map(|source| {
                Ok(LogSource {
                    matcher: PatternMatcher::new(&source.patterns)?,
                    config: source.clone(),
                })
            })
            .collect::<AgentResult<Vec<_>>>()?;

        let client = CollectorClient::new(&config.alert_server)?;
        let queue = UploadQueue::new(client, &config.paths.queue, config.monitor.queue_max_items)?;

        Ok(Self {
            origin: AlertOrigin::new(config.host_name(), config.service.clone()),
            sources,
            tail: TailState::open(&config.paths.state)?,
            probe,
            evaluator: ResourceEvaluator::new(config.thresholds.clone()),
            dedup: Deduplicator::new(config.monitor.dedup_window()),
            queue,
            artifacts: ArtifactBuilder::new(&config.paths.temp),
            phase: CyclePhase::Idle,
            stats: AgentStats::default(),
            config,
        })
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    /// Run cycles until `shutdown` flips to true, or once with `once`.
    pub async fn run(&mut self, once: bool, mut shutdown: watch::Receiver<bool>) {
        info!(
            "monitoring {} log sources every {}s as {}",
            self.sources.len(),
            self.config.monitor.interval_secs,
            self.origin.host
        );

        loop {
            if *shutdown.borrow() {
                debug!("shutdown requested");
                break;
            }

            let report = self.run_cycle().await;
            info!(
                "cycle {} done in {:?}: {} hits, {} breaches, {} sent, {} queued, {} errors",
                self.stats.cycles,
                report.elapsed,
                report.hits,
                report.breaches,
                report.alerts_sent,
                report.alerts_queued,
                report.errors
            );

            if once {
                break;
            }

            let pause = next_sleep(
                self.config.monitor.interval(),
                report.elapsed,
                self.config.monitor.min_sleep(),
            );
            trace!("sleeping {pause:?}");
            self.phase = CyclePhase::Sleeping;

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("shutdown during sleep");
                        break;
                    }
                }
            }
        }

        self.phase = CyclePhase::Idle;
        info!(
            "stopped after {} cycles, {} alerts sent, {} errors",
            self.stats.cycles, self.stats.alerts_sent, self.stats.errors
        );
    }

    /// One full scan, evaluate and dispatch pass.
    #[instrument(skip(self), fields(cycle = self.stats.cycles + 1))]
    pub async fn run_cycle(&mut self) -> CycleReport {
        let started = Instant::now();
        let now = Utc::now();
        let mut report = CycleReport::default();
        let mut outgoing = Vec::new();

        self.phase = CyclePhase::Scanning;
        let sources = std::mem::take(&mut self.sources);
        for source in &sources {
            outgoing.extend(self.scan_source(source, now, &mut report));
        }
        self.sources = sources;

        self.phase = CyclePhase::Evaluating;
        outgoing.extend(self.evaluate_metrics(now, &mut report));

        self.phase = CyclePhase::Dispatching;
        for item in outgoing {
            self.dispatch(item, &mut report).await;
        }
        report.retry = self.queue.retry_queue(self.config.monitor.retry_batch).await;
        self.dedup.prune(now);

        report.elapsed = started.elapsed();
        self.stats.cycles += 1;
        self.stats.errors += report.errors as u64;
        self.stats.alerts_sent += report.alerts_sent as u64;
        if report.metrics_uploaded {
            self.stats.metrics_uploaded += 1;
        }
        report
    }

    fn scan_source(&mut self, source: &LogSource, now: DateTime<Utc>, report: &mut CycleReport) -> Vec<Outgoing> {
        let config = &source.config;
        let (files, glob_errors) = expand_paths(&config.paths);
        report.errors += glob_errors;

        let mut outgoing = Vec::new();
        let mut urgent: Vec<(PathBuf, Hit, AlertPayload)> = Vec::new();

        for file in files {
            let size = match std::fs::metadata(&file) {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    warn!("{}: {e}", file.display());
                    report.errors += 1;
                    continue;
                }
            };
            if size > config.max_file_size() {
                debug!("{}: {size} bytes exceeds scan limit, skipping", file.display());
                report.files_skipped += 1;
                continue;
            }

            let read = match self
                .tail
                .read_new(&file, config.encoding, self.config.monitor.max_tail_bytes)
            {
                Ok(read) => read,
                Err(e) => {
                    warn!("{}: could not tail: {e}", file.display());
                    report.errors += 1;
                    continue;
                }
            };
            report.files_scanned += 1;

            let hits = source.matcher.scan_lines_at(&read.chunk.lines, read.first_line);
            report.hits += hits.len();

            for hit in hits {
                let alert = self.origin.hit_alert(&config.name, &file, &hit, now);
                if !self.dedup.should_alert(&alert.fingerprint, now) {
                    report.suppressed += 1;
                    continue;
                }
                if hit.severity.is_urgent() {
                    urgent.push((file.clone(), hit, alert.clone()));
                }
                outgoing.push(Outgoing::Alert(alert));
            }
        }

        if let Some(artifact) = self.log_artifact(&urgent, report) {
            outgoing.push(artifact);
        }
        outgoing
    }

    fn log_artifact(&self, urgent: &[(PathBuf, Hit, AlertPayload)], report: &mut CycleReport) -> Option<Outgoing> {
        let (_, _, lead) = urgent.iter().max_by_key(|(_, hit, _)| hit.severity)?;

        let files: Vec<PathBuf> = urgent
            .iter()
            .map(|(file, _, _)| file.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let hits_by_file: HashMap<String, Vec<&Hit>> =
            urgent.iter().fold(HashMap::new(), |mut acc, (file, hit, _)| {
                acc.entry(file.display().to_string()).or_default().push(hit);
                acc
            });

        match self
            .artifacts
            .log_bundle(&files, self.config.monitor.artifact_tail_bytes, &hits_by_file)
        {
            Ok(path) => Some(Outgoing::Artifact {
                metadata: lead.artifact_metadata(&path),
                path,
            }),
            Err(e) => {
                error!("could not build log artifact: {e}");
                report.errors += 1;
                None
            }
        }
    }

    fn evaluate_metrics(&mut self, now: DateTime<Utc>, report: &mut CycleReport) -> Vec<Outgoing> {
        let upload_metrics = self.config.monitor.upload_metrics;
        if self.config.thresholds.is_empty() && !upload_metrics {
            return vec![];
        }

        let snapshot = self.probe.sample();
        let breaches = self.evaluator.evaluate(&snapshot);
        report.breaches += breaches.len();

        let mut outgoing = Vec::new();
        let mut critical: Vec<(Breach, AlertPayload)> = Vec::new();

        for breach in breaches {
            let alert = self.origin.breach_alert(&breach, now);
            if !self.dedup.should_alert(&alert.fingerprint, now) {
                report.suppressed += 1;
                continue;
            }
            if breach.severity.is_urgent() {
                critical.push((breach, alert.clone()));
            }
            outgoing.push(Outgoing::Alert(alert));
        }

        if let Some((_, lead)) = critical.first() {
            let breaches: Vec<Breach> = critical.iter().map(|(breach, _)| breach.clone()).collect();
            match self.artifacts.metrics_bundle(&snapshot, &breaches) {
                Ok(path) => outgoing.push(Outgoing::Artifact {
                    metadata: lead.artifact_metadata(&path),
                    path,
                }),
                Err(e) => {
                    error!("could not build metrics artifact: {e}");
                    report.errors += 1;
                }
            }
        }

        if upload_metrics {
            outgoing.push(Outgoing::Metrics(
                self.origin.metrics_payload(snapshot.timestamp, &snapshot.samples()),
            ));
        }
        outgoing
    }

    async fn dispatch(&self, item: Outgoing, report: &mut CycleReport) {
        match item {
            Outgoing::Alert(alert) => {
                let payload = match serde_json::to_value(&alert) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("could not serialize alert: {e}");
                        report.errors += 1;
                        return;
                    }
                };
                if self.queue.send(Endpoint::Alerts, &payload).await {
                    report.alerts_sent += 1;
                } else {
                    report.alerts_queued += 1;
                }
            }
            Outgoing::Artifact { metadata, path } => {
                report.artifacts += 1;
                self.queue.send_artifact(&metadata, &path).await;
                // the queue keeps its own copy on failure
                remove_temp(&path);
            }
            Outgoing::Metrics(payload) => {
                report.metrics_uploaded = self.queue.send(Endpoint::Metrics, &payload).await;
            }
        }
    }
}

/// `max(floor, interval - elapsed)`
pub fn next_sleep(interval: Duration, elapsed: Duration, floor: Duration) -> Duration {
    interval.saturating_sub(elapsed).max(floor)
}

/// Expand source globs into existing regular files, sorted and unique.
/// Returns the files and the number of invalid patterns.
pub fn expand_paths(patterns: &[String]) -> (Vec<PathBuf>, usize) {
    let mut files = BTreeSet::new();
    let mut errors = 0;

    for pattern in patterns {
        let entries = match glob::glob(pattern) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("invalid path pattern `{pattern}`: {e}");
                errors += 1;
                continue;
            }
        };
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => {
                    files.insert(path);
                }
                Ok(_) => {}
                Err(e) => trace!("skipping unreadable glob entry: {e}"),
            }
        }
    }

    (files.into_iter().collect(), errors)
}

fn remove_temp(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!("could not remove {}: {e}", path.display());
    }
}
