use crate::coordinator::{CoordinatorSettings, RetryPolicy};
use crate::host::HostSettings;
use crate::progress::{MergePolicy, SnapshotPolicy};
use crate::remote::HttpStoreConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Flat application configuration; the on-disk form is sectioned.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "crate::config::defaults::default_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "crate::config::defaults::default_stitch_epsilon_ms")]
    pub stitch_epsilon_ms: u64,
    #[serde(default = "crate::config::defaults::default_debounce_guard_ms")]
    pub debounce_guard_ms: u64,
    #[serde(default = "crate::config::defaults::default_auto_merge_threshold_pct")]
    pub auto_merge_threshold_pct: f64,
    #[serde(default = "crate::config::defaults::default_reset_guard_remote_max_pct")]
    pub reset_guard_remote_max_pct: f64,
    #[serde(default = "crate::config::defaults::default_reset_guard_local_min_pct")]
    pub reset_guard_local_min_pct: f64,
    #[serde(default = "crate::config::defaults::default_reset_override_window_ms")]
    pub reset_override_window_ms: u64,
    #[serde(default = "crate::config::defaults::default_snapshot_min_interval_ms")]
    pub snapshot_min_interval_ms: u64,
    #[serde(default = "crate::config::defaults::default_snapshot_position_epsilon_ms")]
    pub snapshot_position_epsilon_ms: u64,
    #[serde(default = "crate::config::defaults::default_snapshot_fraction_epsilon")]
    pub snapshot_fraction_epsilon: f64,
    #[serde(default = "crate::config::defaults::default_skip_interval_ms")]
    pub skip_interval_ms: u64,
    #[serde(default = "crate::config::defaults::default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "crate::config::defaults::default_end_of_book_margin_ms")]
    pub end_of_book_margin_ms: u64,
    #[serde(default = "crate::config::defaults::default_cache_dir")]
    pub cache_dir: String,
    #[serde(default)]
    pub remote_enabled: bool,
    #[serde(default = "crate::config::defaults::default_remote_base_url")]
    pub remote_base_url: String,
    #[serde(default)]
    pub remote_token: String,
    #[serde(default = "crate::config::defaults::default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        use crate::config::defaults as d;
        Self {
            log_level: d::default_log_level(),
            stitch_epsilon_ms: d::default_stitch_epsilon_ms(),
            debounce_guard_ms: d::default_debounce_guard_ms(),
            auto_merge_threshold_pct: d::default_auto_merge_threshold_pct(),
            reset_guard_remote_max_pct: d::default_reset_guard_remote_max_pct(),
            reset_guard_local_min_pct: d::default_reset_guard_local_min_pct(),
            reset_override_window_ms: d::default_reset_override_window_ms(),
            snapshot_min_interval_ms: d::default_snapshot_min_interval_ms(),
            snapshot_position_epsilon_ms: d::default_snapshot_position_epsilon_ms(),
            snapshot_fraction_epsilon: d::default_snapshot_fraction_epsilon(),
            skip_interval_ms: d::default_skip_interval_ms(),
            max_retry_attempts: d::default_max_retry_attempts(),
            end_of_book_margin_ms: d::default_end_of_book_margin_ms(),
            cache_dir: d::default_cache_dir(),
            remote_enabled: false,
            remote_base_url: d::default_remote_base_url(),
            remote_token: String::new(),
            remote_timeout_secs: d::default_remote_timeout_secs(),
        }
    }
}

impl AppConfig {
    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            debounce_guard_ms: self.debounce_guard_ms,
            auto_merge_threshold_pct: self.auto_merge_threshold_pct.max(0.0),
            reset_guard_remote_max_pct: self.reset_guard_remote_max_pct.clamp(0.0, 100.0),
            reset_guard_local_min_pct: self.reset_guard_local_min_pct.clamp(0.0, 100.0),
            reset_override_window_ms: self.reset_override_window_ms,
        }
    }

    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy {
            min_interval_ms: self.snapshot_min_interval_ms,
            position_epsilon_ms: self.snapshot_position_epsilon_ms,
            fraction_epsilon: self.snapshot_fraction_epsilon.max(0.0),
        }
    }

    pub fn host_settings(&self) -> HostSettings {
        HostSettings {
            stitch_epsilon_ms: self.stitch_epsilon_ms,
            coordinator: CoordinatorSettings {
                skip_interval_ms: self.skip_interval_ms.max(1),
                end_of_book_margin_ms: self.end_of_book_margin_ms,
                retry: RetryPolicy {
                    max_attempts: self.max_retry_attempts,
                },
                merge: self.merge_policy(),
                snapshots: self.snapshot_policy(),
            },
        }
    }

    /// `None` when remote sync is disabled or has no base URL.
    pub fn remote_store_config(&self) -> Option<HttpStoreConfig> {
        if !self.remote_enabled || self.remote_base_url.trim().is_empty() {
            return None;
        }
        Some(HttpStoreConfig {
            base_url: self.remote_base_url.trim().to_string(),
            token: Some(self.remote_token.clone()).filter(|t| !t.trim().is_empty()),
            timeout: Duration::from_secs(self.remote_timeout_secs.max(1)),
        })
    }
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
