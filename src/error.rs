//! Error types for the monitoring engine

use std::io;

use thiserror::Error;

/// Result type alias for engine operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur inside the engine
///
/// Only [`AgentError::Config`] and [`AgentError::InvalidPattern`] are fatal; the
/// service logs and skips everything else per file or per source.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A pattern rule did not compile
    #[error("invalid pattern `{rule}`: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    /// Invalid glob in a source path
    #[error("invalid path glob: {0}")]
    Glob(#[from] glob::PatternError),

    /// I/O error (file access, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration could not be parsed
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Artifact archive could not be written
    #[error("artifact error: {0}")]
    Artifact(#[from] zip::result::ZipError),
}

impl AgentError {
    /// Create a config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        AgentError::Config(msg.into())
    }

    /// Whether the agent must refuse to run
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Config(_) | AgentError::InvalidPattern { .. })
    }
}
