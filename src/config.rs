use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Timer behaviour knobs
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Completed work intervals before the next break should be a long break.
    pub long_break_interval: u32,
    /// Remaining-time checkpoints (minutes) that get a progress reminder.
    pub progress_checkpoints_minutes: Vec<u64>,
    /// An interruption older than this is no longer offered for resume.
    pub interruption_ttl_secs: i64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            long_break_interval: 4,
            progress_checkpoints_minutes: vec![15, 10, 5],
            interruption_ttl_secs: 60 * 60,
        }
    }
}

/// Ledger transport and offline replay settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub http_timeout_secs: u64,
    /// Sent in X-App-Version for debugging version skew
    pub app_version: String,
    pub sync_interval_secs: u64,
    pub startup_delay_secs: u64,
    /// Entries retried this many times are reported as stuck.
    pub warn_after_retries: i32,
    pub connectivity_probe_urls: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.focus.local/v1".to_string(),
            http_timeout_secs: 30,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            sync_interval_secs: 60,
            startup_delay_secs: 10,
            warn_after_retries: 5,
            connectivity_probe_urls: vec![
                "https://www.cloudflare.com/cdn-cgi/trace".to_string(),
                "https://www.google.com/generate_204".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file: String,
    pub timer: TimerConfig,
    pub sync: SyncConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::temp_dir().join("focus-core"),
            database_file: "focus.db".to_string(),
            timer: TimerConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults overridden by `FOCUS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("FOCUS_DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(url) = std::env::var("FOCUS_API_BASE_URL") {
            if !url.trim().is_empty() {
                config.sync.api_base_url = url;
            }
        }
        if let Some(n) = env_parse::<u32>("FOCUS_LONG_BREAK_INTERVAL") {
            if n > 0 {
                config.timer.long_break_interval = n;
            }
        }
        if let Some(secs) = env_parse::<u64>("FOCUS_SYNC_INTERVAL_SECS") {
            config.sync.sync_interval_secs = secs.max(1);
        }
        if let Some(secs) = env_parse::<i64>("FOCUS_INTERRUPTION_TTL_SECS") {
            config.timer.interruption_ttl_secs = secs.max(0);
        }
        config
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("[CONFIG] Ignoring {}={:?}: not a valid number", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.timer.long_break_interval, 4);
        assert_eq!(config.timer.progress_checkpoints_minutes, vec![15, 10, 5]);
        assert_eq!(config.timer.interruption_ttl_secs, 3600);
        assert!(config.database_path().ends_with("focus.db"));
    }
}
