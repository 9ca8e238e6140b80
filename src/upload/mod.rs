//! Delivery to the remote collector
//!
//! [`client::CollectorClient`] talks HTTP; [`queue::UploadQueue`] wraps it and
//! persists everything that could not be delivered so a later cycle can retry.

pub mod client;
pub mod queue;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use client::{CollectorClient, DeliveryOutcome};
pub use queue::{QueueItem, RetryReport, UploadQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Alerts,
    Metrics,
    Uploads,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Alerts => "/alerts",
            Endpoint::Metrics => "/metrics",
            Endpoint::Uploads => "/uploads",
        }
    }

    /// Prefix of queue files for this endpoint
    pub fn category(self) -> &'static str {
        match self {
            Endpoint::Alerts => "alerts",
            Endpoint::Metrics => "metrics",
            Endpoint::Uploads => "uploads",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}
