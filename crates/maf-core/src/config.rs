//! Configuration surface (§6.3), loaded the way the teacher's
//! `jit-dispatch::Config::from_file` loads TOML, with environment variable
//! overrides layered on top afterward.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_backend_fallback() -> Vec<String> {
    vec!["durable".to_string(), "file".to_string()]
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".maf/store")
}

fn default_lease_secs() -> u64 {
    300
}

fn default_max_lease_secs() -> u64 {
    3_600
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_liveness_timeout_secs() -> u64 {
    90
}

fn default_lease_sweep_interval_secs() -> u64 {
    75
}

fn default_liveness_sweep_interval_secs() -> u64 {
    30
}

fn default_override_signal_name() -> String {
    "MAF_OVERRIDE".to_string()
}

fn default_debug_channel() -> String {
    "debug".to_string()
}

fn default_review_channel() -> String {
    "review".to_string()
}

/// Passthrough thresholds for the external monitor (§6.3): the runtime only
/// surfaces these as events, it never acts on them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MonitorThresholds {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub context_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Preferred backend, tried first.
    #[serde(default = "default_backend_fallback")]
    pub backend_fallback: Vec<String>,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_lease_secs")]
    pub default_lease_secs: u64,
    #[serde(default = "default_max_lease_secs")]
    pub max_lease_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,
    #[serde(default = "default_lease_sweep_interval_secs")]
    pub lease_sweep_interval_secs: u64,
    #[serde(default = "default_liveness_sweep_interval_secs")]
    pub liveness_sweep_interval_secs: u64,
    #[serde(default = "default_override_signal_name")]
    pub override_signal_name: String,
    #[serde(default = "default_debug_channel")]
    pub debug_channel: String,
    #[serde(default = "default_review_channel")]
    pub review_channel: String,
    #[serde(default)]
    pub monitor_thresholds: MonitorThresholds,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            backend_fallback: default_backend_fallback(),
            store_path: default_store_path(),
            default_lease_secs: default_lease_secs(),
            max_lease_secs: default_max_lease_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            lease_sweep_interval_secs: default_lease_sweep_interval_secs(),
            liveness_sweep_interval_secs: default_liveness_sweep_interval_secs(),
            override_signal_name: default_override_signal_name(),
            debug_channel: default_debug_channel(),
            review_channel: default_review_channel(),
            monitor_thresholds: MonitorThresholds::default(),
        }
    }
}

impl RuntimeConfig {
    /// Loads a TOML config file, applying field defaults for anything the
    /// file omits.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config from {path:?}: {e}"))?;
        let config: RuntimeConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config from {path:?}: {e}"))?;
        Ok(config)
    }

    /// Layers environment variable overrides on top of whatever was loaded
    /// (or the defaults, if no file was given).
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("MAF_BACKEND") {
            self.backend_fallback = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("MAF_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MAF_DEFAULT_LEASE_SECS") {
            if let Ok(n) = v.parse() {
                self.default_lease_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MAF_MAX_LEASE_SECS") {
            if let Ok(n) = v.parse() {
                self.max_lease_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MAF_HEARTBEAT_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.heartbeat_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MAF_LIVENESS_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.liveness_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MAF_OVERRIDE_SIGNAL_NAME") {
            self.override_signal_name = v;
        }
        self
    }

    /// True when the environment variable named by `override_signal_name`
    /// is set (to any value), per §4.I step 6.
    pub fn override_active(&self) -> bool {
        std::env::var(&self.override_signal_name).is_ok()
    }
}
