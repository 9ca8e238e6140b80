//! Alert fingerprints and the suppression window
//!
//! The fingerprint map grows with the number of distinct alert conditions.
//! Dimensions such as process names are partly outside our control, so a
//! long-lived agent calls [`Deduplicator::prune`] once per cycle to forget
//! entries whose window has already elapsed.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::trace;

use crate::Severity;
use crate::util::sha256_hex;

#[derive(Debug, Clone)]
pub struct Deduplicator {
    window: TimeDelta,
    seen: HashMap<String, DateTime<Utc>>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            seen: HashMap::new(),
        }
    }

    /// True (and `now` recorded) when `fingerprint` is new or its window elapsed.
    pub fn should_alert(&mut self, fingerprint: &str, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.seen.get(fingerprint)
            && now.signed_duration_since(*last) < self.window
        {
            trace!("suppressing {fingerprint}");
            return false;
        }

        self.seen.insert(fingerprint.to_string(), now);
        true
    }

    /// Forget fingerprints that would alert again anyway.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.seen
            .retain(|_, last| now.signed_duration_since(*last) < window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Fingerprint of a metric condition. The value is rounded so that jitter
/// around the same level does not defeat suppression.
pub fn metric_fingerprint(
    host: &str,
    service: &str,
    metric: &str,
    severity: Severity,
    dimensions: &BTreeMap<String, String>,
    value: f64,
    threshold: f64,
) -> String {
    let dimensions = dimensions
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",");

    sha256_hex(format!(
        "{host}|{service}|{metric}|{severity}|{dimensions}|{}|{threshold}",
        value.round() as i64
    ))
}

/// Fingerprint of a log hit: the same line content from the same source and
/// rule collapses into one alert.
pub fn log_fingerprint(host: &str, source: &str, rule: &str, severity: Severity, text: &str) -> String {
    sha256_hex(format!("{host}|{source}|{rule}|{severity}|{}", sha256_hex(text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_suppressed_inside_window() {
        let mut dedup = Deduplicator::new(Duration::from_secs(60));
        assert!(dedup.should_alert("fp", at(0)));
        assert!(!dedup.should_alert("fp", at(1)));
        assert!(!dedup.should_alert("fp", at(59)));
        assert!(dedup.should_alert("fp", at(60)));
        // window restarts from the last alert
        assert!(!dedup.should_alert("fp", at(100)));
    }

    #[test]
    fn test_fingerprints_are_independent() {
        let mut dedup = Deduplicator::new(Duration::from_secs(60));
        assert!(dedup.should_alert("a", at(0)));
        assert!(dedup.should_alert("b", at(0)));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_prune_keeps_live_entries() {
        let mut dedup = Deduplicator::new(Duration::from_secs(60));
        dedup.should_alert("old", at(0));
        dedup.should_alert("new", at(50));

        dedup.prune(at(70));
        assert_eq!(dedup.len(), 1);
        assert!(!dedup.should_alert("new", at(71)));
        assert!(dedup.should_alert("old", at(71)));
    }

    #[test]
    fn test_metric_fingerprint_rounds_value() {
        let dims = BTreeMap::from([("mount".to_string(), "/".to_string())]);
        let a = metric_fingerprint("h", "s", "disk_free_pct", Severity::Warning, &dims, 12.2, 15.0);
        let b = metric_fingerprint("h", "s", "disk_free_pct", Severity::Warning, &dims, 11.8, 15.0);
        let c = metric_fingerprint("h", "s", "disk_free_pct", Severity::Critical, &dims, 12.2, 15.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_log_fingerprint_depends_on_content() {
        let a = log_fingerprint("h", "syslog", "oom", Severity::Critical, "Out of memory: pid 1");
        let b = log_fingerprint("h", "syslog", "oom", Severity::Critical, "Out of memory: pid 2");
        let c = log_fingerprint("h", "kern", "oom", Severity::Critical, "Out of memory: pid 1");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
