//! Delivery and durable queue behaviour against a mock collector

use host_monitoring::upload::Endpoint;
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_send_delivers_with_bearer_token() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .and(header("Authorization", format!("Bearer {API_KEY}").as_str()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = create_queue(&mock_server.uri(), dir.path(), 10);

    assert!(queue.send(Endpoint::Alerts, &json!({"title": "disk"})).await);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_failed_send_is_retried_then_queued() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(500))
        // max_attempts from the helper config
        .expect(2)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = create_queue(&mock_server.uri(), dir.path(), 10);

    assert!(!queue.send(Endpoint::Alerts, &json!({"title": "disk"})).await);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_rejected_credentials_are_not_retried_or_queued() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = create_queue(&mock_server.uri(), dir.path(), 10);

    assert!(!queue.send(Endpoint::Alerts, &json!({})).await);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_unreachable_collector_queues_item() {
    let dir = tempfile::tempdir().unwrap();
    // nothing listens on the discard port
    let queue = create_queue("http://127.0.0.1:9", dir.path(), 10);

    assert!(!queue.send(Endpoint::Metrics, &json!({"samples": []})).await);

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    let name = pending[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("metrics_"));
}

#[tokio::test]
async fn test_retry_queue_drains_on_success() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = create_queue(&mock_server.uri(), dir.path(), 10);
    for n in 0..3 {
        queue.enqueue(Endpoint::Alerts, &json!({"n": n}), None).unwrap();
    }

    let report = queue.retry_queue(10).await;
    assert_eq!(report.delivered, 3);
    assert_eq!(report.remaining, 0);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_retry_queue_keeps_items_while_collector_fails() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("log_1.zip");
    std::fs::write(&artifact, b"PK\x03\x04").unwrap();
    let queue = create_queue(&mock_server.uri(), &dir.path().join("queue"), 10);
    for n in 0..3 {
        queue.enqueue(Endpoint::Alerts, &json!({"n": n}), None).unwrap();
    }
    let upload = queue
        .enqueue(Endpoint::Uploads, &json!({"fingerprint": "abc"}), Some(&artifact))
        .unwrap();

    for _ in 0..5 {
        let report = queue.retry_queue(10).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, 4);
        assert_eq!(report.remaining, 4);
    }
    assert_eq!(std::fs::read(upload.with_extension("zip")).unwrap(), b"PK\x03\x04");
}

#[tokio::test]
async fn test_refused_head_item_does_not_block_drain() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .and(body_string_contains("\"n\":0"))
        .respond_with(ResponseTemplate::new(400))
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .expect(5)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = create_queue(&mock_server.uri(), dir.path(), 10);
    for n in 0..6 {
        queue.enqueue(Endpoint::Alerts, &json!({"n": n}), None).unwrap();
    }

    let report = queue.retry_queue(20).await;
    assert_eq!(report.delivered, 5);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);

    // the refused item stays queued for later cycles
    let report = queue.retry_queue(20).await;
    assert_eq!(report.delivered, 0);
    assert_eq!(report.remaining, 1);
}

#[tokio::test]
async fn test_unreachable_collector_stops_drain() {
    let dir = tempfile::tempdir().unwrap();
    let queue = create_queue("http://127.0.0.1:9", dir.path(), 10);
    for n in 0..3 {
        queue.enqueue(Endpoint::Alerts, &json!({"n": n}), None).unwrap();
    }

    let report = queue.retry_queue(10).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 3);
}

#[tokio::test]
async fn test_retry_queue_is_bounded() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let queue = create_queue(&mock_server.uri(), dir.path(), 10);
    for n in 0..5 {
        queue.enqueue(Endpoint::Alerts, &json!({"n": n}), None).unwrap();
    }

    let report = queue.retry_queue(2).await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.remaining, 3);
}

#[tokio::test]
async fn test_eviction_caps_category() {
    let dir = tempfile::tempdir().unwrap();
    let queue = create_queue("http://127.0.0.1:9", dir.path(), 3);

    for n in 0..6 {
        queue.enqueue(Endpoint::Alerts, &json!({"n": n}), None).unwrap();
    }
    assert_eq!(queue.len(), 3);
}

#[tokio::test]
async fn test_artifact_upload_is_multipart() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/uploads"))
        .and(body_string_contains("name=\"metadata\""))
        .and(body_string_contains("name=\"artifact\""))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("log_1.zip");
    std::fs::write(&artifact, b"PK\x03\x04").unwrap();
    let queue = create_queue(&mock_server.uri(), &dir.path().join("queue"), 10);

    assert!(queue.send_artifact(&json!({"fingerprint": "abc"}), &artifact).await);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_failed_artifact_is_queued_with_copy() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/uploads"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("log_1.zip");
    std::fs::write(&artifact, b"PK\x03\x04").unwrap();
    let queue = create_queue(&mock_server.uri(), &dir.path().join("queue"), 10);

    assert!(!queue.send_artifact(&json!({"fingerprint": "abc"}), &artifact).await);

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    let copy = pending[0].with_extension("zip");
    assert_eq!(std::fs::read(copy).unwrap(), b"PK\x03\x04");

    // once the collector recovers the copy goes out and is cleaned up
    mock_server.reset().await;
    Mock::given(method("POST"))
        .and(path("/uploads"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let report = queue.retry_queue(10).await;
    assert_eq!(report.delivered, 1);
    assert!(!pending[0].with_extension("zip").exists());
}
