use std::env;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_f64(key: &str, default: f64) -> Result<f64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<f64>()
            .map_err(|e| anyhow!("{key} invalid float: {e}"))?),
    }
}

fn get_env_usize(key: &str, default: usize) -> Result<usize> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<usize>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

/// Process-level configuration. User preferences (refresh interval, theme,
/// asset selection) are persisted in the store instead, see `preferences`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Storage
    pub store_path: String,
    pub history_cap: usize,

    // Fetching
    pub fetch_timeout_ms: u64,
    pub fallback_jitter_pct: f64,
    pub http_user_agent: String,

    // Alerts
    pub alert_reset_band_pct: f64,

    // Loop timing
    pub auto_backup_secs: u64,
    pub stats_log_every: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: "./data/pricewatch.sqlite".to_string(),
            history_cap: 1000,
            fetch_timeout_ms: 6000,
            fallback_jitter_pct: 0.5,
            http_user_agent: format!("pricewatch/{}", env!("CARGO_PKG_VERSION")),
            alert_reset_band_pct: 1.0,
            auto_backup_secs: 3600,
            stats_log_every: 10,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let d = Self::default();
        let s = Self {
            store_path: get_env_string("STORE_PATH", &d.store_path),
            history_cap: get_env_usize("HISTORY_CAP", d.history_cap)?,
            fetch_timeout_ms: get_env_usize("FETCH_TIMEOUT_MS", d.fetch_timeout_ms as usize)? as u64,
            fallback_jitter_pct: get_env_f64("FALLBACK_JITTER_PCT", d.fallback_jitter_pct)?,
            http_user_agent: get_env_string("HTTP_USER_AGENT", &d.http_user_agent),
            alert_reset_band_pct: get_env_f64("ALERT_RESET_BAND_PCT", d.alert_reset_band_pct)?,
            auto_backup_secs: get_env_usize("AUTO_BACKUP_SECS", d.auto_backup_secs as usize)? as u64,
            stats_log_every: get_env_usize("STATS_LOG_EVERY", d.stats_log_every as usize)? as u64,
        };

        s.validate()?;
        Ok(s)
    }

    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_path.trim().is_empty() {
            return Err(anyhow!("STORE_PATH must not be empty"));
        }
        if self.history_cap < 1 {
            return Err(anyhow!("HISTORY_CAP must be >= 1 (got {})", self.history_cap));
        }
        if self.fetch_timeout_ms < 100 {
            return Err(anyhow!(
                "FETCH_TIMEOUT_MS must be >= 100 (got {})",
                self.fetch_timeout_ms
            ));
        }
        if !self.fallback_jitter_pct.is_finite() || !(0.0..=50.0).contains(&self.fallback_jitter_pct) {
            return Err(anyhow!(
                "FALLBACK_JITTER_PCT must be within 0..=50 (got {})",
                self.fallback_jitter_pct
            ));
        }
        if !self.alert_reset_band_pct.is_finite() || self.alert_reset_band_pct < 0.0 {
            return Err(anyhow!(
                "ALERT_RESET_BAND_PCT must be >= 0 (got {})",
                self.alert_reset_band_pct
            ));
        }
        if self.auto_backup_secs < 60 {
            return Err(anyhow!(
                "AUTO_BACKUP_SECS must be >= 60 (got {})",
                self.auto_backup_secs
            ));
        }
        if self.stats_log_every < 1 {
            return Err(anyhow!(
                "STATS_LOG_EVERY must be >= 1 (got {})",
                self.stats_log_every
            ));
        }
        Ok(())
    }
}
