use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed parse error: {0}")]
    FeedParse(#[from] feed_rs::parser::ParseFeedError),

    #[error("Feed {feed_id} answered with HTTP {status}")]
    FetchStatus { feed_id: String, status: u16 },

    #[error("Fetching feed {feed_id} timed out after {timeout:?}")]
    FetchTimeout { feed_id: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown feed: {0}")]
    UnknownFeed(String),

    #[error("Notification queue is full, dropped message for chat {chat_id}")]
    QueueFull { chat_id: i64 },

    #[error("Notifier error: {0}")]
    Notifier(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn notifier(message: impl Into<String>) -> Self {
        Self::Notifier(message.into())
    }

    /// Errors a flaky source produces on its own. The polling loop logs these
    /// at warn level and anything else at error level; both back off.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::FeedParse(_) | Self::FetchStatus { .. } | Self::FetchTimeout { .. }
        )
    }
}
