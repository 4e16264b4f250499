use super::models::LogLevel;

pub(crate) fn default_log_level() -> LogLevel {
    LogLevel::Info
}

pub(crate) fn default_stitch_epsilon_ms() -> u64 {
    crate::timeline::DEFAULT_STITCH_EPSILON_MS
}

pub(crate) fn default_debounce_guard_ms() -> u64 {
    10_000
}

pub(crate) fn default_auto_merge_threshold_pct() -> f64 {
    5.0
}

pub(crate) fn default_reset_guard_remote_max_pct() -> f64 {
    10.0
}

pub(crate) fn default_reset_guard_local_min_pct() -> f64 {
    25.0
}

pub(crate) fn default_reset_override_window_ms() -> u64 {
    5 * 60 * 1000
}

pub(crate) fn default_snapshot_min_interval_ms() -> u64 {
    5_000
}

pub(crate) fn default_snapshot_position_epsilon_ms() -> u64 {
    1_000
}

pub(crate) fn default_snapshot_fraction_epsilon() -> f64 {
    0.001
}

pub(crate) fn default_skip_interval_ms() -> u64 {
    30_000
}

pub(crate) fn default_max_retry_attempts() -> u32 {
    2
}

pub(crate) fn default_end_of_book_margin_ms() -> u64 {
    1_500
}

pub(crate) fn default_cache_dir() -> String {
    crate::cache::DEFAULT_CACHE_DIR.to_string()
}

pub(crate) fn default_remote_base_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}

pub(crate) fn default_remote_timeout_secs() -> u64 {
    10
}
