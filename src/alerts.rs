use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::dedup::{log_fingerprint, metric_fingerprint};
use crate::monitors::resources::Breach;
use crate::patterns::Hit;
use crate::{MetricSample, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Log,
    Metric,
}

/// Body of `POST /alerts`
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub host: String,
    pub service: String,
    pub kind: AlertKind,
    /// Log source name or metric name
    pub source: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub details: Value,
}

/// Who is raising alerts; stamped on every payload.
#[derive(Debug, Clone)]
pub struct AlertOrigin {
    pub host: String,
    pub service: String,
}

impl AlertOrigin {
    pub fn new(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
        }
    }

    pub fn hit_alert(&self, source: &str, path: &Path, hit: &Hit, now: DateTime<Utc>) -> AlertPayload {
        AlertPayload {
            host: self.host.clone(),
            service: self.service.clone(),
            kind: AlertKind::Log,
            source: source.to_string(),
            severity: hit.severity,
            title: format!("{} {} in {}", severity_icon(hit.severity), hit.rule, source),
            message: self.format_hit_message(path, hit),
            fingerprint: log_fingerprint(&self.host, source, &hit.rule, hit.severity, &hit.text),
            timestamp: now,
            details: json!({
                "path": path.display().to_string(),
                "line_number": hit.line_number,
                "rule": hit.rule,
                "text": hit.text,
                "context": hit.context,
            }),
        }
    }

    pub fn breach_alert(&self, breach: &Breach, now: DateTime<Utc>) -> AlertPayload {
        AlertPayload {
            host: self.host.clone(),
            service: self.service.clone(),
            kind: AlertKind::Metric,
            source: breach.metric.clone(),
            severity: breach.severity,
            title: format!("{} {}", severity_icon(breach.severity), breach.metric),
            message: self.format_breach_message(breach),
            fingerprint: metric_fingerprint(
                &self.host,
                &self.service,
                &breach.metric,
                breach.severity,
                &breach.dimensions,
                breach.value,
                breach.threshold,
            ),
            timestamp: now,
            details: json!({
                "value": breach.value,
                "threshold": breach.threshold,
                "dimensions": breach.dimensions,
            }),
        }
    }

    /// Body of `POST /metrics`
    pub fn metrics_payload(&self, timestamp: DateTime<Utc>, samples: &[MetricSample]) -> Value {
        json!({
            "host": self.host,
            "service": self.service,
            "timestamp": timestamp.to_rfc3339(),
            "samples": samples,
        })
    }

    fn format_hit_message(&self, path: &Path, hit: &Hit) -> String {
        format!(
            "**{}** on `{}`: rule `{}` matched {}:{}\n{}",
            hit.severity.as_str().to_uppercase(),
            self.host,
            hit.rule,
            path.display(),
            hit.line_number,
            hit.text
        )
    }

    fn format_breach_message(&self, breach: &Breach) -> String {
        let subject = if breach.dimensions.is_empty() {
            breach.metric.clone()
        } else {
            let dimensions = breach
                .dimensions
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{} ({dimensions})", breach.metric)
        };

        format!(
            "**{}** on `{}`: {} is **{:.1}** (limit: {})",
            breach.severity.as_str().to_uppercase(),
            self.host,
            subject,
            breach.value,
            breach.threshold
        )
    }
}

impl AlertPayload {
    /// `metadata` part of an artifact upload for this alert.
    pub fn artifact_metadata(&self, artifact: &Path) -> Value {
        json!({
            "host": self.host,
            "service": self.service,
            "kind": self.kind,
            "source": self.source,
            "severity": self.severity,
            "fingerprint": self.fingerprint,
            "timestamp": self.timestamp.to_rfc3339(),
            "filename": artifact.file_name().map(|name| name.to_string_lossy().into_owned()),
        })
    }
}

fn severity_icon(severity: Severity) -> &'static str {
    match severity {
        Severity::Low | Severity::Medium => "ℹ️",
        Severity::Warning | Severity::High => "⚠️",
        Severity::Error | Severity::Critical => "🔥",
    }
}
