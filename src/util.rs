use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

const API_KEY: &str = "HOSTMON_API_KEY";

pub fn get_api_key() -> Option<String> {
    let key_from_env = std::env::var(API_KEY);
    key_from_env.ok().filter(|key| !key.is_empty())
}

const BASE_URL: &str = "HOSTMON_BASE_URL";

pub fn get_base_url() -> Option<String> {
    let url_from_env = std::env::var(BASE_URL);
    url_from_env.ok().filter(|url| !url.is_empty())
}

const DEFAULT_HOST: &str = "unknown-host";

pub fn get_host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| DEFAULT_HOST.to_string())
}

/// Base directory for state, queue and logs when the config does not name one.
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("hostmon")
}

pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Cut `text` to at most `max` characters, on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
