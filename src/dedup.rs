//! Duplicate suppression for notifications.
//!
//! The ledger is the source of truth. The in-memory cache only remembers
//! positive answers, and is written after the ledger accepted a record, so
//! losing it costs extra lookups but never a duplicate delivery.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::db::NotifyLedger;
use crate::error::Result;
use crate::models::NotifyRecord;
use crate::shutdown::ShutdownSignal;

const SHARDS: usize = 16;

pub struct DedupStore {
    ledger: Arc<dyn NotifyLedger>,
    shards: Vec<RwLock<HashSet<String>>>,
}

fn cache_key(chat_id: i64, url: &str) -> String {
    format!("{}|{}", chat_id, url)
}

impl DedupStore {
    pub fn new(ledger: Arc<dyn NotifyLedger>) -> Self {
        Self {
            ledger,
            shards: (0..SHARDS).map(|_| RwLock::new(HashSet::new())).collect(),
        }
    }

    fn shard(&self, chat_id: i64) -> &RwLock<HashSet<String>> {
        let mut hasher = DefaultHasher::new();
        chat_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    fn remember<'a>(&self, chat_id: i64, urls: impl IntoIterator<Item = &'a String>) {
        let mut shard = self.shard(chat_id).write().unwrap_or_else(PoisonError::into_inner);
        for url in urls {
            shard.insert(cache_key(chat_id, url));
        }
    }

    pub async fn exists(&self, chat_id: i64, url: &str) -> Result<bool> {
        let seen = self.exists_batch(chat_id, &[url.to_string()]).await?;
        Ok(seen.get(url).copied().unwrap_or(false))
    }

    /// Maps every url in `urls` to whether it was already delivered to `chat_id`.
    pub async fn exists_batch(&self, chat_id: i64, urls: &[String]) -> Result<HashMap<String, bool>> {
        let mut result: HashMap<String, bool> = urls.iter().map(|u| (u.clone(), false)).collect();

        let uncached: Vec<String> = {
            let shard = self.shard(chat_id).read().unwrap_or_else(PoisonError::into_inner);
            urls.iter()
                .filter(|url| {
                    let hit = shard.contains(&cache_key(chat_id, url));
                    if hit {
                        result.insert((*url).clone(), true);
                    }
                    !hit
                })
                .cloned()
                .collect()
        };

        if uncached.is_empty() {
            return Ok(result);
        }

        let found = self.ledger.find_notified(chat_id, &uncached).await?;
        self.remember(chat_id, found.iter());
        for url in found {
            result.insert(url, true);
        }

        Ok(result)
    }

    pub async fn record(&self, chat_id: i64, url: &str, title: &str) -> Result<()> {
        self.record_batch(&[NotifyRecord::new(chat_id, url, title)]).await
    }

    /// Persists records first; the cache only learns about them once stored.
    pub async fn record_batch(&self, records: &[NotifyRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let inserted = self.ledger.insert_notified(records).await?;
        tracing::debug!(records = records.len(), inserted, "notify records stored");

        let mut by_chat: HashMap<i64, Vec<&String>> = HashMap::new();
        for record in records {
            by_chat.entry(record.chat_id).or_default().push(&record.url);
        }
        for (chat_id, urls) in by_chat {
            self.remember(chat_id, urls);
        }
        Ok(())
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    pub fn cached_len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Clears the cache every `every` until shutdown.
    pub fn spawn_cleaner(self: Arc<Self>, every: Duration, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let dropped = self.cached_len();
                        self.clear();
                        tracing::debug!(dropped, "dedup cache cleared");
                    }
                    _ = shutdown.triggered() => break,
                }
            }
        })
    }
}
