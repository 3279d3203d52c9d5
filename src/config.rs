use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::FeedSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Telegram bot token; notifications are only logged when unset.
    pub bot_token: Option<String>,

    /// Chat receiving service start/stop alerts.
    pub alert_chat_id: Option<i64>,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,

    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,

    pub initial_interval_secs: Option<u64>,

    #[serde(default = "default_interval_step")]
    pub interval_step_secs: u64,

    #[serde(default = "default_successes_before_speedup")]
    pub successes_before_speedup: u32,

    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,

    #[serde(default = "default_match_workers")]
    pub match_workers: usize,

    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,

    #[serde(default = "default_send_rate")]
    pub send_rate_per_sec: u32,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_dedup_cache_clear")]
    pub dedup_cache_clear_minutes: u64,

    #[serde(default = "default_display_offset")]
    pub display_utc_offset_hours: i32,

    #[serde(default)]
    pub impersonate_hosts: Vec<String>,

    #[serde(default)]
    pub feeds: Vec<FeedSource>,
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feed-notifier");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("notifier.db").to_string_lossy().to_string()
}

fn default_fetch_timeout() -> u64 {
    5
}

fn default_min_interval() -> u64 {
    10
}

fn default_max_interval() -> u64 {
    300
}

fn default_interval_step() -> u64 {
    5
}

fn default_successes_before_speedup() -> u32 {
    10
}

fn default_fetch_workers() -> usize {
    3
}

fn default_match_workers() -> usize {
    5
}

fn default_tick_millis() -> u64 {
    1000
}

fn default_send_rate() -> u32 {
    20
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_dedup_cache_clear() -> u64 {
    60
}

fn default_display_offset() -> i32 {
    8
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bot_token: None,
            alert_chat_id: None,
            fetch_timeout_secs: default_fetch_timeout(),
            min_interval_secs: default_min_interval(),
            max_interval_secs: default_max_interval(),
            initial_interval_secs: None,
            interval_step_secs: default_interval_step(),
            successes_before_speedup: default_successes_before_speedup(),
            fetch_workers: default_fetch_workers(),
            match_workers: default_match_workers(),
            tick_millis: default_tick_millis(),
            send_rate_per_sec: default_send_rate(),
            queue_capacity: default_queue_capacity(),
            dedup_cache_clear_minutes: default_dedup_cache_clear(),
            display_utc_offset_hours: default_display_offset(),
            impersonate_hosts: Vec::new(),
            feeds: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Reads the config at `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&content)?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("feed-notifier")
            .join("config.toml")
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_interval_secs == 0 {
            return Err(AppError::config("min_interval_secs must be positive"));
        }
        if self.min_interval_secs > self.max_interval_secs {
            return Err(AppError::config(format!(
                "min_interval_secs ({}) exceeds max_interval_secs ({})",
                self.min_interval_secs, self.max_interval_secs
            )));
        }
        if self.fetch_workers == 0 || self.match_workers == 0 {
            return Err(AppError::config("worker pools need at least one worker"));
        }
        if self.send_rate_per_sec == 0 {
            return Err(AppError::config("send_rate_per_sec must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(AppError::config("queue_capacity must be positive"));
        }
        if self.fetch_timeout_secs == 0 || self.tick_millis == 0 || self.dedup_cache_clear_minutes == 0 {
            return Err(AppError::config(
                "fetch_timeout_secs, tick_millis and dedup_cache_clear_minutes must be positive",
            ));
        }
        if !(-12..=14).contains(&self.display_utc_offset_hours) {
            return Err(AppError::config("display_utc_offset_hours must be within -12..=14"));
        }
        for feed in &self.feeds {
            if feed.id.trim().is_empty() || feed.url.trim().is_empty() {
                return Err(AppError::config(format!("feed {:?} needs an id and a url", feed.name)));
            }
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    pub fn dedup_cache_clear_every(&self) -> Duration {
        Duration::from_secs(self.dedup_cache_clear_minutes * 60)
    }
}
