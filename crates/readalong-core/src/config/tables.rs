use super::defaults;
use super::models::{AppConfig, LogLevel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub(super) struct ConfigTables {
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    timeline: TimelineConfig,
    #[serde(default)]
    sync: SyncConfig,
    #[serde(default)]
    snapshots: SnapshotConfig,
    #[serde(default)]
    playback: PlaybackConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    remote: RemoteConfig,
}

impl From<ConfigTables> for AppConfig {
    fn from(tables: ConfigTables) -> Self {
        AppConfig {
            log_level: tables.logging.log_level,
            stitch_epsilon_ms: tables.timeline.stitch_epsilon_ms,
            debounce_guard_ms: tables.sync.debounce_guard_ms,
            auto_merge_threshold_pct: tables.sync.auto_merge_threshold_pct,
            reset_guard_remote_max_pct: tables.sync.reset_guard_remote_max_pct,
            reset_guard_local_min_pct: tables.sync.reset_guard_local_min_pct,
            reset_override_window_ms: tables.sync.reset_override_window_ms,
            snapshot_min_interval_ms: tables.snapshots.min_interval_ms,
            snapshot_position_epsilon_ms: tables.snapshots.position_epsilon_ms,
            snapshot_fraction_epsilon: tables.snapshots.fraction_epsilon,
            skip_interval_ms: tables.playback.skip_interval_ms,
            max_retry_attempts: tables.playback.max_retry_attempts,
            end_of_book_margin_ms: tables.playback.end_of_book_margin_ms,
            cache_dir: tables.storage.cache_dir,
            remote_enabled: tables.remote.enabled,
            remote_base_url: tables.remote.base_url,
            remote_token: tables.remote.token,
            remote_timeout_secs: tables.remote.timeout_secs,
        }
    }
}

impl From<&AppConfig> for ConfigTables {
    fn from(config: &AppConfig) -> Self {
        ConfigTables {
            logging: LoggingConfig {
                log_level: config.log_level,
            },
            timeline: TimelineConfig {
                stitch_epsilon_ms: config.stitch_epsilon_ms,
            },
            sync: SyncConfig {
                debounce_guard_ms: config.debounce_guard_ms,
                auto_merge_threshold_pct: config.auto_merge_threshold_pct,
                reset_guard_remote_max_pct: config.reset_guard_remote_max_pct,
                reset_guard_local_min_pct: config.reset_guard_local_min_pct,
                reset_override_window_ms: config.reset_override_window_ms,
            },
            snapshots: SnapshotConfig {
                min_interval_ms: config.snapshot_min_interval_ms,
                position_epsilon_ms: config.snapshot_position_epsilon_ms,
                fraction_epsilon: config.snapshot_fraction_epsilon,
            },
            playback: PlaybackConfig {
                skip_interval_ms: config.skip_interval_ms,
                max_retry_attempts: config.max_retry_attempts,
                end_of_book_margin_ms: config.end_of_book_margin_ms,
            },
            storage: StorageConfig {
                cache_dir: config.cache_dir.clone(),
            },
            remote: RemoteConfig {
                enabled: config.remote_enabled,
                base_url: config.remote_base_url.clone(),
                token: config.remote_token.clone(),
                timeout_secs: config.remote_timeout_secs,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    log_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: defaults::default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct TimelineConfig {
    #[serde(default = "defaults::default_stitch_epsilon_ms")]
    stitch_epsilon_ms: u64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        TimelineConfig {
            stitch_epsilon_ms: defaults::default_stitch_epsilon_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SyncConfig {
    #[serde(default = "defaults::default_debounce_guard_ms")]
    debounce_guard_ms: u64,
    #[serde(default = "defaults::default_auto_merge_threshold_pct")]
    auto_merge_threshold_pct: f64,
    #[serde(default = "defaults::default_reset_guard_remote_max_pct")]
    reset_guard_remote_max_pct: f64,
    #[serde(default = "defaults::default_reset_guard_local_min_pct")]
    reset_guard_local_min_pct: f64,
    #[serde(default = "defaults::default_reset_override_window_ms")]
    reset_override_window_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            debounce_guard_ms: defaults::default_debounce_guard_ms(),
            auto_merge_threshold_pct: defaults::default_auto_merge_threshold_pct(),
            reset_guard_remote_max_pct: defaults::default_reset_guard_remote_max_pct(),
            reset_guard_local_min_pct: defaults::default_reset_guard_local_min_pct(),
            reset_override_window_ms: defaults::default_reset_override_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SnapshotConfig {
    #[serde(default = "defaults::default_snapshot_min_interval_ms")]
    min_interval_ms: u64,
    #[serde(default = "defaults::default_snapshot_position_epsilon_ms")]
    position_epsilon_ms: u64,
    #[serde(default = "defaults::default_snapshot_fraction_epsilon")]
    fraction_epsilon: f64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            min_interval_ms: defaults::default_snapshot_min_interval_ms(),
            position_epsilon_ms: defaults::default_snapshot_position_epsilon_ms(),
            fraction_epsilon: defaults::default_snapshot_fraction_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct PlaybackConfig {
    #[serde(default = "defaults::default_skip_interval_ms")]
    skip_interval_ms: u64,
    #[serde(default = "defaults::default_max_retry_attempts")]
    max_retry_attempts: u32,
    #[serde(default = "defaults::default_end_of_book_margin_ms")]
    end_of_book_margin_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        PlaybackConfig {
            skip_interval_ms: defaults::default_skip_interval_ms(),
            max_retry_attempts: defaults::default_max_retry_attempts(),
            end_of_book_margin_ms: defaults::default_end_of_book_margin_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct StorageConfig {
    #[serde(default = "defaults::default_cache_dir")]
    cache_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            cache_dir: defaults::default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RemoteConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "defaults::default_remote_base_url")]
    base_url: String,
    #[serde(default)]
    token: String,
    #[serde(default = "defaults::default_remote_timeout_secs")]
    timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            enabled: false,
            base_url: defaults::default_remote_base_url(),
            token: String::new(),
            timeout_secs: defaults::default_remote_timeout_secs(),
        }
    }
}
