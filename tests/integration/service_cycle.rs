//! End-to-end cycles of the monitor service

use std::io::{Read, Write};

use chrono::{TimeDelta, Utc};
use host_monitoring::{
    Severity,
    config::{CpuThresholds, ThresholdConfig},
    monitors::resources::ResourceEvaluator,
    service::{CyclePhase, MonitorService},
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn append(path: &std::path::Path, text: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

#[tokio::test]
async fn test_oom_line_raises_one_alert_with_artifact() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;
    // artifact upload fails so the bundle stays inspectable in the queue
    Mock::given(method("POST"))
        .and(path("/uploads"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("kern.log");
    append(&log, "boot ok\nkernel: Out of memory: Killed process 4242 (java)\n");

    let config = create_config(
        &mock_server.uri(),
        dir.path(),
        oom_source(&format!("{}/*.log", dir.path().display())),
        json!({}),
    );
    let mut service = MonitorService::new(config, Box::new(FakeProbe::new(0.0))).unwrap();

    let report = service.run_cycle().await;
    assert_eq!(report.files_scanned, 1);
    assert_eq!(report.hits, 1);
    assert_eq!(report.alerts_sent, 1);
    assert_eq!(report.artifacts, 1);
    assert_eq!(report.errors, 0);

    let pending = service.queue().pending().unwrap();
    assert_eq!(pending.len(), 1);
    let bundle = std::fs::File::open(pending[0].with_extension("zip")).unwrap();
    let mut archive = zip::ZipArchive::new(bundle).unwrap();
    let mut tail = String::new();
    archive
        .by_name("logs/0_kern.log")
        .unwrap()
        .read_to_string(&mut tail)
        .unwrap();
    assert!(tail.contains("Out of memory: Killed process 4242"));

    // nothing new, nothing raised
    let report = service.run_cycle().await;
    assert_eq!(report.hits, 0);
    assert_eq!(report.alerts_sent, 0);
}

#[tokio::test]
async fn test_repeated_line_is_suppressed() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    append(&log, "request failed with error 42\n");

    let config = create_config(
        &mock_server.uri(),
        dir.path(),
        oom_source(&format!("{}/*.log", dir.path().display())),
        json!({}),
    );
    let mut service = MonitorService::new(config, Box::new(FakeProbe::new(0.0))).unwrap();

    let report = service.run_cycle().await;
    assert_eq!(report.alerts_sent, 1);
    // medium severity carries no artifact
    assert_eq!(report.artifacts, 0);

    append(&log, "request failed with error 42\n");
    let report = service.run_cycle().await;
    assert_eq!(report.hits, 1);
    assert_eq!(report.suppressed, 1);
    assert_eq!(report.alerts_sent, 0);
}

#[tokio::test]
async fn test_truncated_log_is_read_from_start() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    append(&log, "a fairly long line without anything interesting in it\n");

    let config = create_config(
        &mock_server.uri(),
        dir.path(),
        oom_source(&format!("{}/*.log", dir.path().display())),
        json!({}),
    );
    let mut service = MonitorService::new(config, Box::new(FakeProbe::new(0.0))).unwrap();
    assert_eq!(service.run_cycle().await.hits, 0);

    std::fs::write(&log, "Out of memory\n").unwrap();
    let report = service.run_cycle().await;
    assert_eq!(report.hits, 1);
    assert_eq!(report.alerts_sent, 1);
}

#[tokio::test]
async fn test_unreachable_collector_queues_alerts() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("kern.log");
    append(&log, "Out of memory\n");

    let config = create_config(
        "http://127.0.0.1:9",
        dir.path(),
        oom_source(&format!("{}/*.log", dir.path().display())),
        json!({}),
    );
    let mut service = MonitorService::new(config, Box::new(FakeProbe::new(0.0))).unwrap();

    let report = service.run_cycle().await;
    assert_eq!(report.alerts_sent, 0);
    assert_eq!(report.alerts_queued, 1);
    // alert plus its artifact
    assert_eq!(service.queue().len(), 2);
    assert_eq!(report.retry.remaining, 2);
}

#[test]
fn test_sustained_cpu_warns_once_per_evaluation() {
    let mut evaluator = ResourceEvaluator::new(ThresholdConfig {
        cpu: Some(CpuThresholds {
            warn_pct: Some(70.0),
            warn_window_secs: 30,
            crit_pct: None,
            crit_window_secs: 10,
        }),
        ..Default::default()
    });

    let start = Utc::now();
    for second in 0..31 {
        let snapshot = create_snapshot(start + TimeDelta::seconds(second), 80.0);
        let breaches = evaluator.evaluate(&snapshot);
        assert_eq!(breaches.len(), 1, "second {second}");
        assert_eq!(breaches[0].severity, Severity::Warning);
        assert_eq!(breaches[0].value, 80.0);
    }
}

#[tokio::test]
async fn test_cpu_breach_is_deduplicated_across_cycles() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = create_config(
        &mock_server.uri(),
        dir.path(),
        json!([]),
        json!({ "cpu": { "warn_pct": 70.0, "warn_window_secs": 30 } }),
    );
    let mut service = MonitorService::new(config, Box::new(FakeProbe::new(80.0))).unwrap();

    for cycle in 0..3 {
        let report = service.run_cycle().await;
        assert_eq!(report.breaches, 1);
        assert_eq!(report.alerts_sent, usize::from(cycle == 0));
    }
    assert_eq!(service.stats().cycles, 3);
    assert_eq!(service.stats().alerts_sent, 1);
}

#[tokio::test]
async fn test_run_once_and_shutdown() {
    let mock_server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = create_config(&mock_server.uri(), dir.path(), json!([]), json!({}));
    let mut service = MonitorService::new(config, Box::new(FakeProbe::new(0.0))).unwrap();

    let (_tx, rx) = watch::channel(false);
    service.run(true, rx).await;
    assert_eq!(service.stats().cycles, 1);
    assert_eq!(service.phase(), CyclePhase::Idle);

    let (_tx, rx) = watch::channel(true);
    service.run(false, rx).await;
    assert_eq!(service.stats().cycles, 1);
}

#[tokio::test]
async fn test_shutdown_during_sleep_stops_loop() {
    let mock_server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = create_config(&mock_server.uri(), dir.path(), json!([]), json!({}));
    let mut service = MonitorService::new(config, Box::new(FakeProbe::new(0.0))).unwrap();

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let _ = tx.send(true);
    });

    tokio::time::timeout(std::time::Duration::from_secs(5), service.run(false, rx))
        .await
        .expect("service did not stop");
    assert!(service.stats().cycles >= 1);
}

#[tokio::test]
async fn test_invalid_pattern_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_config(
        "http://127.0.0.1:9",
        dir.path(),
        json!([{ "name": "bad", "paths": ["/tmp/x"], "patterns": [
            { "name": "broken", "regex": "([a-z", "severity": "low" }
        ]}]),
        json!({}),
    );

    let err = MonitorService::new(config, Box::new(FakeProbe::new(0.0)))
        .err()
        .unwrap();
    assert!(err.is_fatal());
}
