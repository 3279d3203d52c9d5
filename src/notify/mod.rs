mod queue;
mod telegram;

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;

use crate::error::Result;

pub use queue::{NotificationQueue, QueueConsumer};
pub use telegram::{TelegramNotifier, TelegramUpdates};

/// Delivers one message to a chat and returns the platform's message id.
/// `text` is MarkdownV2 as built by [`NotifyMessage`](crate::models::NotifyMessage).
/// Implementations do not rate limit; the queue does.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<i64>;
}

/// Writes notifications to the log. Used when no bot token is configured.
#[derive(Debug, Default)]
pub struct LogNotifier {
    next_id: AtomicI64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, chat_id: i64, text: &str) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(chat_id, message_id = id, "notification: {}", text);
        Ok(id)
    }
}
