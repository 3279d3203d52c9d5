mod repository;
mod schema;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{NotifyRecord, Subscription};

pub use repository::Repository;

/// Durable side of the dedup store.
#[async_trait]
pub trait NotifyLedger: Send + Sync {
    /// Returns the subset of `urls` already recorded for `chat_id`.
    async fn find_notified(&self, chat_id: i64, urls: &[String]) -> Result<HashSet<String>>;

    /// Inserts records, ignoring ones whose `(chat_id, url)` already exists.
    /// Returns how many rows were new.
    async fn insert_notified(&self, records: &[NotifyRecord]) -> Result<usize>;
}

/// Read side used by the subscription index.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Subscriptions on `feed_id`; fails with `UnknownFeed` if the feed is not registered.
    async fn feed_subscriptions(&self, feed_id: &str) -> Result<Vec<Subscription>>;

    async fn active_chat_ids(&self) -> Result<HashSet<i64>>;
}
