//! Durable on-disk queue for undelivered payloads
//!
//! ## Layout
//!
//! ```text
//! {queue_dir}/
//!   alerts_1700000000123456789.json    {endpoint, payload, ts}
//!   uploads_1700000000223456789.json   {endpoint, payload, ts, artifact}
//!   uploads_1700000000223456789.zip    copied artifact
//!   alerts_1699999999000000000.corrupt unreadable item, never retried
//! ```
//!
//! Items are written to a `.tmp` file and renamed, so a crash never leaves a
//! half-written item that looks valid. An item is removed only after the
//! collector confirmed it.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::error::AgentResult;
use crate::util::unix_seconds;

use super::client::{CollectorClient, DeliveryOutcome};
use super::Endpoint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub endpoint: Endpoint,
    pub payload: Value,
    /// Unix seconds at enqueue time
    pub ts: f64,
    /// File name of the sibling zip, for uploads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub delivered: usize,
    pub failed: usize,
    pub corrupt: usize,
    pub remaining: usize,
}

pub struct UploadQueue {
    client: CollectorClient,
    dir: PathBuf,
    max_items: usize,
}

impl UploadQueue {
    pub fn new(client: CollectorClient, dir: impl Into<PathBuf>, max_items: usize) -> AgentResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            client,
            dir,
            max_items,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deliver a JSON payload, queueing it on failure. Never raises.
    #[instrument(skip(self, payload))]
    pub async fn send(&self, endpoint: Endpoint, payload: &Value) -> bool {
        let outcome = self
            .client
            .post_json(endpoint, payload, self.client.max_attempts())
            .await;
        self.settle(endpoint, payload, None, outcome)
    }

    /// Upload an artifact with its metadata, queueing a copy on failure.
    #[instrument(skip(self, metadata))]
    pub async fn send_artifact(&self, metadata: &Value, artifact: &Path) -> bool {
        let outcome = self
            .client
            .post_artifact(metadata, artifact, self.client.max_attempts())
            .await;
        self.settle(Endpoint::Uploads, metadata, Some(artifact), outcome)
    }

    fn settle(&self, endpoint: Endpoint, payload: &Value, artifact: Option<&Path>, outcome: DeliveryOutcome) -> bool {
        match outcome {
            DeliveryOutcome::Delivered => true,
            // queueing would only replay the same rejection
            DeliveryOutcome::Rejected { .. } => false,
            DeliveryOutcome::Failed(reason) | DeliveryOutcome::Unreachable(reason) => {
                match self.enqueue(endpoint, payload, artifact) {
                    Ok(path) => debug!("queued {endpoint} payload as {} ({reason})", path.display()),
                    Err(e) => error!("could not queue {endpoint} payload: {e}"),
                }
                false
            }
        }
    }

    /// Persist an item (and a copy of its artifact), then evict overflow.
    pub fn enqueue(&self, endpoint: Endpoint, payload: &Value, artifact: Option<&Path>) -> AgentResult<PathBuf> {
        let now = Utc::now();
        let mut nanos = now.timestamp_nanos_opt().unwrap_or_default();
        let category = endpoint.category();

        let mut path = self.dir.join(format!("{category}_{nanos}.json"));
        while path.exists() {
            nanos += 1;
            path = self.dir.join(format!("{category}_{nanos}.json"));
        }

        let artifact_name = match artifact {
            Some(source) => {
                let name = format!("{category}_{nanos}.zip");
                std::fs::copy(source, self.dir.join(&name))?;
                Some(name)
            }
            None => None,
        };

        let item = QueueItem {
            endpoint,
            payload: payload.clone(),
            ts: unix_seconds(now),
            artifact: artifact_name,
        };

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&item)?)?;
        std::fs::rename(&tmp, &path)?;

        // the item is in place from here on, so eviction cannot fail the enqueue
        self.evict(category);
        Ok(path)
    }

    /// Queue files, oldest first.
    pub fn pending(&self) -> AgentResult<Vec<PathBuf>> {
        let mut items: Vec<(i64, PathBuf)> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| Some((item_nanos(&path)?, path)))
            .collect();
        items.sort();
        Ok(items.into_iter().map(|(_, path)| path).collect())
    }

    pub fn len(&self) -> usize {
        self.pending().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, category: &str) {
        let pending = match self.pending() {
            Ok(pending) => pending,
            Err(e) => {
                warn!("could not list queue for eviction: {e}");
                return;
            }
        };
        let prefix = format!("{category}_");
        let items: Vec<PathBuf> = pending
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .is_some_and(|name| name.to_string_lossy().starts_with(&prefix))
            })
            .collect();

        if items.len() <= self.max_items {
            return;
        }

        let overflow = items.len() - self.max_items;
        warn!("{category} queue over {} items, evicting {overflow} oldest", self.max_items);
        for path in items.into_iter().take(overflow) {
            remove_item(&path);
        }
    }

    /// Re-attempt up to `max_items` queued items, oldest first.
    ///
    /// Each item gets a single attempt. An item the collector answers with an
    /// error status stays queued and the drain moves on. The drain stops when
    /// the collector is unreachable or refuses the credentials, since every
    /// later item would fail the same way.
    #[instrument(skip(self))]
    pub async fn retry_queue(&self, max_items: usize) -> RetryReport {
        let mut report = RetryReport::default();

        let pending = match self.pending() {
            Ok(pending) => pending,
            Err(e) => {
                error!("could not list queue: {e}");
                return report;
            }
        };

        for path in pending.into_iter().take(max_items) {
            let item = match read_item(&path) {
                Ok(item) => item,
                Err(e) => {
                    warn!("quarantining corrupt queue item {}: {e}", path.display());
                    quarantine(&path);
                    report.corrupt += 1;
                    continue;
                }
            };

            let outcome = match &item.artifact {
                Some(name) => {
                    self.client
                        .post_artifact(&item.payload, &self.dir.join(name), 1)
                        .await
                }
                None => self.client.post_json(item.endpoint, &item.payload, 1).await,
            };

            match outcome {
                DeliveryOutcome::Delivered => {
                    remove_item(&path);
                    report.delivered += 1;
                }
                DeliveryOutcome::Rejected { status } => {
                    warn!("collector rejected queued item with {status}, stopping drain");
                    report.failed += 1;
                    break;
                }
                DeliveryOutcome::Failed(reason) => {
                    debug!("queued item {} still undeliverable: {reason}", path.display());
                    report.failed += 1;
                }
                DeliveryOutcome::Unreachable(reason) => {
                    debug!("collector unreachable, stopping drain: {reason}");
                    report.failed += 1;
                    break;
                }
            }
        }

        report.remaining = self.len();
        if report.delivered > 0 || report.failed > 0 {
            debug!(
                "retry drain: {} delivered, {} failed, {} remaining",
                report.delivered, report.failed, report.remaining
            );
        }
        report
    }
}

fn read_item(path: &Path) -> AgentResult<QueueItem> {
    let content = std::fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

/// Enqueue timestamp encoded in `{category}_{nanos}.json`.
fn item_nanos(path: &Path) -> Option<i64> {
    let stem = path.file_stem()?.to_str()?;
    let (_, nanos) = stem.rsplit_once('_')?;
    nanos.parse().ok()
}

/// Move an unreadable item and its zip out of the `.json` namespace.
fn quarantine(path: &Path) {
    if let Err(e) = std::fs::rename(path, path.with_extension("corrupt")) {
        error!("could not quarantine {}: {e}", path.display());
    }
    let artifact = path.with_extension("zip");
    if artifact.exists()
        && let Err(e) = std::fs::rename(&artifact, path.with_extension("zip.corrupt"))
    {
        error!("could not quarantine {}: {e}", artifact.display());
    }
}

fn remove_item(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("could not remove {}: {e}", path.display());
    }
    let artifact = path.with_extension("zip");
    if artifact.exists()
        && let Err(e) = std::fs::remove_file(&artifact)
    {
        warn!("could not remove {}: {e}", artifact.display());
    }
}
