use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Certificate, Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{error, instrument, trace, warn};

use crate::config::AlertServerConfig;
use crate::error::AgentResult;

use super::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Collector answered with a status below 300
    Delivered,
    /// Credentials refused; retrying cannot help
    Rejected { status: u16 },
    /// Collector answered with another error status, or the request could
    /// not be built from the item
    Failed(String),
    /// No answer at all: connect error or timeout on the last attempt
    Unreachable(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

#[derive(Debug, Clone)]
pub struct CollectorClient {
    client: Client,
    base_url: String,
    api_key: String,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl CollectorClient {
    pub fn new(config: &AlertServerConfig) -> AgentResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls);

        if let Some(bundle) = &config.ca_bundle {
            let pem = std::fs::read(bundle)?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        })
    }

    pub fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[instrument(skip(self, payload))]
    pub async fn post_json(&self, endpoint: Endpoint, payload: &Value, attempts: u32) -> DeliveryOutcome {
        let url = self.url(endpoint);
        self.deliver(endpoint, attempts, || {
            Ok(self.client.post(&url).bearer_auth(&self.api_key).json(payload))
        })
        .await
    }

    /// Multipart upload with a `metadata` JSON part and an `artifact` zip part.
    #[instrument(skip(self, metadata))]
    pub async fn post_artifact(&self, metadata: &Value, artifact: &Path, attempts: u32) -> DeliveryOutcome {
        let bytes = match tokio::fs::read(artifact).await {
            Ok(bytes) => bytes,
            Err(e) => return DeliveryOutcome::Failed(format!("could not read artifact: {e}")),
        };
        let file_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact.zip".to_string());
        let metadata = metadata.to_string();
        let url = self.url(Endpoint::Uploads);

        // a multipart body is consumed by send, so it is rebuilt per attempt
        self.deliver(Endpoint::Uploads, attempts, || {
            let artifact = Part::bytes(bytes.clone())
                .file_name(file_name.clone())
                .mime_str("application/zip")?;
            let metadata = Part::text(metadata.clone()).mime_str("application/json")?;
            let form = Form::new().part("metadata", metadata).part("artifact", artifact);
            Ok(self.client.post(&url).bearer_auth(&self.api_key).multipart(form))
        })
        .await
    }

    async fn deliver<F>(&self, endpoint: Endpoint, attempts: u32, build: F) -> DeliveryOutcome
    where
        F: Fn() -> reqwest::Result<RequestBuilder>,
    {
        let attempts = attempts.max(1);
        let mut last = DeliveryOutcome::Failed(String::new());

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(self.backoff_base, self.backoff_max, attempt - 1);
                trace!("retrying {endpoint} in {delay:?}");
                tokio::time::sleep(delay).await;
            }

            let request = match build() {
                Ok(request) => request,
                Err(e) => return DeliveryOutcome::Failed(format!("could not build request: {e}")),
            };

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() < 300 {
                        trace!("{endpoint} accepted with {status}");
                        return DeliveryOutcome::Delivered;
                    }
                    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                        error!("collector rejected credentials for {endpoint} ({status}), check alert_server.api_key");
                        return DeliveryOutcome::Rejected {
                            status: status.as_u16(),
                        };
                    }
                    last = DeliveryOutcome::Failed(format!("HTTP error: {status}"));
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last = DeliveryOutcome::Unreachable(describe_http_error(&e));
                }
                Err(e) => last = DeliveryOutcome::Failed(describe_http_error(&e)),
            }

            if let DeliveryOutcome::Failed(reason) | DeliveryOutcome::Unreachable(reason) = &last {
                warn!("attempt {}/{attempts} to {endpoint} failed: {reason}", attempt + 1);
            }
        }

        last
    }
}

/// `base * 2^retry`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

fn describe_http_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timeout".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        format!("HTTP request failed: {error}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(4000));
        assert_eq!(backoff_delay(base, max, 5), max);
        assert_eq!(backoff_delay(base, max, 40), max);
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let config = AlertServerConfig {
            base_url: "https://collector.example/api/".to_string(),
            api_key: "k".to_string(),
            ..Default::default()
        };
        let client = CollectorClient::new(&config).unwrap();
        assert_eq!(client.url(Endpoint::Alerts), "https://collector.example/api/alerts");
    }

    #[test]
    fn test_missing_ca_bundle_fails() {
        let config = AlertServerConfig {
            base_url: "https://collector.example".to_string(),
            api_key: "k".to_string(),
            ca_bundle: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        assert!(CollectorClient::new(&config).is_err());
    }
}
