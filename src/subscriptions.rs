//! Read-mostly view of who subscribes to what.
//!
//! Keyword rules are cached per feed and reloaded lazily after invalidation.
//! Subscriber status is read fresh on every lookup, since pausing a chat must
//! take effect on the very next fetch cycle.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::db::SubscriptionStore;
use crate::error::Result;
use crate::models::Subscription;

const SHARDS: usize = 16;

/// Cache slot of one feed. `version` moves on every invalidation of that
/// feed, so a load that overlapped one can tell its snapshot is stale.
#[derive(Default)]
struct Slot {
    version: u64,
    subscriptions: Option<Arc<[Subscription]>>,
}

pub struct SubscriptionIndex {
    store: Arc<dyn SubscriptionStore>,
    shards: Vec<RwLock<HashMap<String, Slot>>>,
    epoch: AtomicU64,
}

impl SubscriptionIndex {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self {
            store,
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            epoch: AtomicU64::new(0),
        }
    }

    fn shard(&self, feed_id: &str) -> &RwLock<HashMap<String, Slot>> {
        let mut hasher = DefaultHasher::new();
        feed_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// All subscriptions on `feed_id`, from cache when possible.
    pub async fn subscriptions(&self, feed_id: &str) -> Result<Arc<[Subscription]>> {
        let shard = self.shard(feed_id);
        let epoch = self.epoch.load(Ordering::Acquire);
        let version = {
            let feeds = shard.read().unwrap_or_else(PoisonError::into_inner);
            match feeds.get(feed_id) {
                Some(Slot {
                    subscriptions: Some(cached),
                    ..
                }) => return Ok(Arc::clone(cached)),
                Some(slot) => slot.version,
                None => 0,
            }
        };

        let loaded: Arc<[Subscription]> = self.store.feed_subscriptions(feed_id).await?.into();
        tracing::debug!(feed_id, subscriptions = loaded.len(), "subscription index reloaded");

        // An invalidation during the load makes it stale; hand it out once but don't keep it.
        let mut feeds = shard.write().unwrap_or_else(PoisonError::into_inner);
        let slot = feeds.entry(feed_id.to_string()).or_default();
        if slot.version == version && self.epoch.load(Ordering::Acquire) == epoch {
            slot.subscriptions = Some(Arc::clone(&loaded));
        }
        Ok(loaded)
    }

    /// Subscriptions on `feed_id` whose chat is active and has at least one rule.
    pub async fn active_subscriptions(&self, feed_id: &str) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions(feed_id).await?;
        if subscriptions.is_empty() {
            return Ok(Vec::new());
        }

        let active = self.store.active_chat_ids().await?;
        Ok(subscriptions
            .iter()
            .filter(|s| !s.keywords.is_empty() && active.contains(&s.chat_id))
            .cloned()
            .collect())
    }

    pub fn invalidate_feed(&self, feed_id: &str) {
        let mut feeds = self.shard(feed_id).write().unwrap_or_else(PoisonError::into_inner);
        let slot = feeds.entry(feed_id.to_string()).or_default();
        slot.version = slot.version.wrapping_add(1);
        slot.subscriptions = None;
    }

    pub fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        for shard in &self.shards {
            let mut feeds = shard.write().unwrap_or_else(PoisonError::into_inner);
            for slot in feeds.values_mut() {
                slot.subscriptions = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::db::Repository;
    use crate::models::{FeedSource, SubscriberStatus};

    async fn setup() -> (Arc<Repository>, SubscriptionIndex) {
        let repo = Arc::new(Repository::in_memory().await.unwrap());
        repo.upsert_feed_source(FeedSource {
            id: "ns".into(),
            name: "NodeSeek".into(),
            url: "https://rss.nodeseek.com".into(),
        })
        .await
        .unwrap();
        for chat_id in [1, 2, 3] {
            repo.ensure_subscriber(chat_id, "chat").await.unwrap();
            repo.save_subscription(&Subscription {
                chat_id,
                feed_id: "ns".into(),
                keywords: if chat_id == 3 { vec![] } else { vec!["vps".into()] },
            })
            .await
            .unwrap();
        }
        let index = SubscriptionIndex::new(repo.clone());
        (repo, index)
    }

    #[tokio::test]
    async fn filters_inactive_and_ruleless_subscriptions() {
        let (repo, index) = setup().await;
        repo.set_subscriber_status(2, SubscriberStatus::Paused).await.unwrap();

        let active = index.active_subscriptions("ns").await.unwrap();
        assert_eq!(active.iter().map(|s| s.chat_id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn status_changes_apply_without_invalidation() {
        let (repo, index) = setup().await;
        assert_eq!(index.active_subscriptions("ns").await.unwrap().len(), 2);

        repo.set_subscriber_status(1, SubscriberStatus::Quit).await.unwrap();
        assert_eq!(index.active_subscriptions("ns").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rule_changes_need_invalidation() {
        let (repo, index) = setup().await;
        index.subscriptions("ns").await.unwrap();

        repo.save_subscription(&Subscription {
            chat_id: 1,
            feed_id: "ns".into(),
            keywords: vec!["bgp".into()],
        })
        .await
        .unwrap();
        let cached = index.subscriptions("ns").await.unwrap();
        assert_eq!(cached[0].keywords, vec!["vps"]);

        index.invalidate_feed("ns");
        let fresh = index.subscriptions("ns").await.unwrap();
        assert_eq!(fresh[0].keywords, vec!["bgp"]);

        repo.save_subscription(&Subscription {
            chat_id: 1,
            feed_id: "ns".into(),
            keywords: vec!["nat".into()],
        })
        .await
        .unwrap();
        index.invalidate_all();
        assert_eq!(index.subscriptions("ns").await.unwrap()[0].keywords, vec!["nat"]);
    }

    #[tokio::test]
    async fn unknown_feed_propagates() {
        let (_, index) = setup().await;
        assert!(index.active_subscriptions("missing").await.is_err());
    }

    /// Snapshots the rules when a load starts, then holds the first load until released.
    struct GatedStore {
        keywords: Mutex<Vec<String>>,
        gate_open: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedStore {
        fn new(keywords: &[&str]) -> Self {
            Self {
                keywords: Mutex::new(keywords.iter().map(|k| k.to_string()).collect()),
                gate_open: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl SubscriptionStore for GatedStore {
        async fn feed_subscriptions(&self, feed_id: &str) -> Result<Vec<Subscription>> {
            let snapshot = self.keywords.lock().unwrap().clone();
            if !self.gate_open.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(vec![Subscription {
                chat_id: 1,
                feed_id: feed_id.to_string(),
                keywords: snapshot,
            }])
        }

        async fn active_chat_ids(&self) -> Result<HashSet<i64>> {
            Ok(HashSet::from([1]))
        }
    }

    async fn edit_during_first_load(invalidate: impl FnOnce(&SubscriptionIndex)) -> Vec<String> {
        let store = Arc::new(GatedStore::new(&["old"]));
        let index = Arc::new(SubscriptionIndex::new(store.clone()));

        let loader = {
            let index = Arc::clone(&index);
            tokio::spawn(async move { index.subscriptions("ns").await.unwrap() })
        };
        store.entered.notified().await;

        *store.keywords.lock().unwrap() = vec!["new".to_string()];
        invalidate(&index);
        store.release.notify_one();

        let overlapped = loader.await.unwrap();
        assert_eq!(overlapped[0].keywords, vec!["old"]);

        index.subscriptions("ns").await.unwrap()[0].keywords.clone()
    }

    #[tokio::test]
    async fn feed_invalidation_during_a_load_is_not_lost() {
        let keywords = edit_during_first_load(|index| index.invalidate_feed("ns")).await;
        assert_eq!(keywords, vec!["new"]);
    }

    #[tokio::test]
    async fn full_invalidation_during_a_load_is_not_lost() {
        let keywords = edit_during_first_load(SubscriptionIndex::invalidate_all).await;
        assert_eq!(keywords, vec!["new"]);
    }

    #[tokio::test]
    async fn invalidating_one_feed_keeps_the_others_cached() {
        let (repo, index) = setup().await;
        repo.upsert_feed_source(FeedSource {
            id: "hs".into(),
            name: "HostLoc".into(),
            url: "https://hostloc.com/rss".into(),
        })
        .await
        .unwrap();
        index.subscriptions("ns").await.unwrap();
        let before = index.subscriptions("hs").await.unwrap();

        index.invalidate_feed("ns");
        let after = index.subscriptions("hs").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }
}
