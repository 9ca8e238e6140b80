use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace};

use crate::Severity;
use crate::error::{AgentError, AgentResult};
use crate::util::{get_api_key, get_base_url, get_data_dir, get_host_name};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Overrides the detected host name in alerts and fingerprints
    pub host: Option<String>,

    #[serde(default = "default_service")]
    pub service: String,

    #[serde(default)]
    pub alert_server: AlertServerConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub thresholds: ThresholdConfig,
}

#[derive(Clone, serde::Deserialize)]
pub struct AlertServerConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    /// PEM bundle with additional trusted roots
    pub ca_bundle: Option<PathBuf>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl Default for AlertServerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            verify_tls: true,
            ca_bundle: None,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

// keeps the api key out of trace output
impl fmt::Debug for AlertServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertServerConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("read_timeout_secs", &self.read_timeout_secs)
            .field("verify_tls", &self.verify_tls)
            .field("ca_bundle", &self.ca_bundle)
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_max_ms", &self.backoff_max_ms)
            .finish()
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_logs_dir")]
    pub logs: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state: PathBuf,
    #[serde(default = "default_queue_dir")]
    pub queue: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs: default_logs_dir(),
            state: default_state_dir(),
            queue: default_queue_dir(),
            temp: default_temp_dir(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Lower bound for the adaptive sleep between cycles
    #[serde(default = "default_min_sleep")]
    pub min_sleep_ms: u64,
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    #[serde(default)]
    pub upload_metrics: bool,
    /// Queue items re-attempted per cycle
    #[serde(default = "default_retry_batch")]
    pub retry_batch: usize,
    /// Maximum queued items per category before the oldest are evicted
    #[serde(default = "default_queue_max_items")]
    pub queue_max_items: usize,
    #[serde(default = "default_max_tail_bytes")]
    pub max_tail_bytes: u64,
    /// Bytes from the end of each file packed into a log artifact
    #[serde(default = "default_artifact_tail_bytes")]
    pub artifact_tail_bytes: u64,
    #[serde(default = "default_top_processes")]
    pub top_processes: usize,
    #[serde(default = "default_process_cpu_floor")]
    pub process_cpu_floor: f64,
    #[serde(default = "default_process_cache_ttl")]
    pub process_cache_ttl_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            min_sleep_ms: default_min_sleep(),
            dedup_window_secs: default_dedup_window(),
            upload_metrics: false,
            retry_batch: default_retry_batch(),
            queue_max_items: default_queue_max_items(),
            max_tail_bytes: default_max_tail_bytes(),
            artifact_tail_bytes: default_artifact_tail_bytes(),
            top_processes: default_top_processes(),
            process_cpu_floor: default_process_cpu_floor(),
            process_cache_ttl_secs: default_process_cache_ttl(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_sleep(&self) -> Duration {
        Duration::from_millis(self.min_sleep_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// File paths, globs allowed
    pub paths: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<PatternRuleConfig>,
    #[serde(default)]
    pub encoding: Encoding,
    /// Files larger than this are skipped entirely
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

impl SourceConfig {
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    #[default]
    #[serde(alias = "utf8")]
    Utf8,
    #[serde(alias = "latin1", alias = "iso-8859-1")]
    Latin1,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PatternRuleConfig {
    pub name: String,
    pub regex: String,
    pub severity: Severity,
    #[serde(default)]
    pub context_lines: usize,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ThresholdConfig {
    pub cpu: Option<CpuThresholds>,
    pub process_cpu: Option<CpuThresholds>,
    pub memory: Option<MemoryThresholds>,
    #[serde(default)]
    pub disk: Vec<DiskRule>,
    pub network: Option<NetworkRule>,
}

impl ThresholdConfig {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none()
            && self.process_cpu.is_none()
            && self.memory.is_none()
            && self.disk.is_empty()
            && self.network.is_none()
    }
}

/// Rolling-average CPU limits in percent. The critical window is usually shorter.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CpuThresholds {
    pub warn_pct: Option<f64>,
    #[serde(default = "default_warn_window")]
    pub warn_window_secs: u64,
    pub crit_pct: Option<f64>,
    #[serde(default = "default_crit_window")]
    pub crit_window_secs: u64,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct MemoryThresholds {
    pub warn_pct: Option<f64>,
    pub crit_pct: Option<f64>,
    pub warn_available_mb: Option<f64>,
    pub crit_available_mb: Option<f64>,
    pub pagefile_warn_pct: Option<f64>,
    pub pagefile_crit_pct: Option<f64>,
}

/// Free-space limits for one mount point, or every mount with `"*"`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DiskRule {
    pub mount: String,
    pub warn_pct: Option<f64>,
    pub crit_pct: Option<f64>,
    /// Critical is downgraded to warning while more than this many GB are free
    pub crit_min_gb: Option<f64>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NetworkRule {
    /// Interfaces to watch, all when empty
    #[serde(default)]
    pub interfaces: Vec<String>,
}

fn default_service() -> String {
    String::from("hostmon")
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    10_000
}

fn default_logs_dir() -> PathBuf {
    get_data_dir().join("logs")
}

fn default_state_dir() -> PathBuf {
    get_data_dir().join("state")
}

fn default_queue_dir() -> PathBuf {
    get_data_dir().join("queue")
}

fn default_temp_dir() -> PathBuf {
    get_data_dir().join("tmp")
}

fn default_interval() -> u64 {
    60
}

fn default_min_sleep() -> u64 {
    1000
}

fn default_dedup_window() -> u64 {
    900
}

fn default_retry_batch() -> usize {
    20
}

fn default_queue_max_items() -> usize {
    1000
}

fn default_max_tail_bytes() -> u64 {
    1024 * 1024
}

fn default_artifact_tail_bytes() -> u64 {
    256 * 1024
}

fn default_top_processes() -> usize {
    50
}

fn default_process_cpu_floor() -> f64 {
    0.5
}

fn default_process_cache_ttl() -> u64 {
    5
}

fn default_max_file_size_mb() -> u64 {
    512
}

fn default_warn_window() -> u64 {
    300
}

fn default_crit_window() -> u64 {
    60
}

impl Config {
    /// Deserialize and validate an already merged configuration value.
    pub fn from_value(value: Value) -> AgentResult<Config> {
        let config: Config = serde_json::from_value(value)
            .map_err(|e| AgentError::config(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `global`, then merge `local` over it. At least one must be given.
    pub fn load_layered(global: Option<&Path>, local: Option<&Path>) -> AgentResult<Config> {
        if global.is_none() && local.is_none() {
            return Err(AgentError::config("no configuration file given"));
        }

        let mut merged = match global {
            Some(path) => read_config_file(path)?,
            None => Value::Object(Default::default()),
        };

        if let Some(path) = local {
            merge_values(&mut merged, read_config_file(path)?);
        }

        let mut config: Config = serde_json::from_value(merged)
            .map_err(|e| AgentError::config(format!("malformed configuration: {e}")))?;
        config.apply_env_overrides();
        config.validate()?;

        trace!("loaded config: {config:?}");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(key) = get_api_key() {
            debug!("using api key from environment");
            self.alert_server.api_key = key;
        }
        if let Some(url) = get_base_url() {
            debug!("using collector url from environment");
            self.alert_server.base_url = url;
        }
    }

    pub fn host_name(&self) -> String {
        self.host.clone().unwrap_or_else(get_host_name)
    }

    pub fn validate(&self) -> AgentResult<()> {
        let server = &self.alert_server;
        if !(server.base_url.starts_with("http://") || server.base_url.starts_with("https://")) {
            return Err(AgentError::config(format!(
                "alert_server.base_url must be an http(s) url, got `{}`",
                server.base_url
            )));
        }
        if server.api_key.trim().is_empty() {
            return Err(AgentError::config("alert_server.api_key is required"));
        }
        if server.max_attempts == 0 {
            return Err(AgentError::config("alert_server.max_attempts must be at least 1"));
        }

        if self.monitor.interval_secs == 0 {
            return Err(AgentError::config("monitor.interval_secs must be positive"));
        }
        if self.monitor.min_sleep_ms == 0 {
            return Err(AgentError::config("monitor.min_sleep_ms must be positive"));
        }
        if self.monitor.max_tail_bytes == 0 {
            return Err(AgentError::config("monitor.max_tail_bytes must be positive"));
        }
        if self.monitor.queue_max_items == 0 {
            return Err(AgentError::config("monitor.queue_max_items must be positive"));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(AgentError::config("source without a name"));
            }
            if !names.insert(source.name.as_str()) {
                return Err(AgentError::config(format!(
                    "duplicate source name `{}`",
                    source.name
                )));
            }
            if source.paths.is_empty() {
                return Err(AgentError::config(format!(
                    "source `{}` has no paths",
                    source.name
                )));
            }
        }

        for (family, limits) in [
            ("cpu", &self.thresholds.cpu),
            ("process_cpu", &self.thresholds.process_cpu),
        ] {
            let Some(limits) = limits else {
                continue;
            };
            if limits.warn_window_secs == 0 || limits.crit_window_secs == 0 {
                return Err(AgentError::config(format!(
                    "thresholds.{family} windows must be positive"
                )));
            }
            check_order(family, limits.warn_pct, limits.crit_pct)?;
        }

        if let Some(memory) = &self.thresholds.memory {
            check_order("memory", memory.warn_pct, memory.crit_pct)?;
            check_order("memory.pagefile", memory.pagefile_warn_pct, memory.pagefile_crit_pct)?;
        }

        for rule in &self.thresholds.disk {
            if rule.mount.is_empty() {
                return Err(AgentError::config("disk rule without a mount"));
            }
            // free space: critical sits below warning
            if let (Some(warn), Some(crit)) = (rule.warn_pct, rule.crit_pct)
                && crit > warn
            {
                return Err(AgentError::config(format!(
                    "disk rule `{}`: crit_pct {crit} is above warn_pct {warn}",
                    rule.mount
                )));
            }
        }

        Ok(())
    }
}

fn check_order(family: &str, warn: Option<f64>, crit: Option<f64>) -> AgentResult<()> {
    if let (Some(warn), Some(crit)) = (warn, crit)
        && warn > crit
    {
        return Err(AgentError::config(format!(
            "thresholds.{family}: warn {warn} is above crit {crit}"
        )));
    }
    Ok(())
}

/// Read a single config layer. `.toml` files are parsed as TOML, everything else as JSON.
pub fn read_config_file(path: &Path) -> AgentResult<Value> {
    let file_content = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    let value = if is_toml {
        toml::from_str::<Value>(&file_content)?
    } else {
        serde_json::from_str::<Value>(&file_content)?
    };

    trace!("read config layer {}", path.display());
    Ok(value)
}

/// Deep merge: objects merge key by key, everything else in `overlay` replaces `base`.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
