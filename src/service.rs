use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, FixedOffset, Utc};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::Config;
use crate::db::Repository;
use crate::dedup::DedupStore;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{AppError, Result};
use crate::feed::FeedFetch;
use crate::matcher::KeywordMatcher;
use crate::models::{FeedSource, NotifyMessage, Subscriber, SubscriberStatus, Subscription};
use crate::notify::{NotificationQueue, Notifier};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::subscriptions::SubscriptionIndex;

pub const DEFAULT_FEED_ID: &str = "ns";
pub const DEFAULT_FEED_NAME: &str = "NodeSeek";
pub const DEFAULT_FEED_URL: &str = "https://rss.nodeseek.com";

/// Everything the command layer and `main` talk to.
pub struct FeedService {
    repository: Arc<Repository>,
    index: Arc<SubscriptionIndex>,
    dedup: Arc<DedupStore>,
    queue: NotificationQueue,
    scheduler: Scheduler,
    seed_feeds: Vec<FeedSource>,
    alert_chat_id: Option<i64>,
    dedup_clear_every: std::time::Duration,
    queue_stop: Shutdown,
    background: Mutex<Background>,
}

#[derive(Default)]
struct Background {
    consumer: Option<JoinHandle<usize>>,
    cleaner: Option<JoinHandle<()>>,
}

impl FeedService {
    pub fn new(
        config: &Config,
        repository: Arc<Repository>,
        fetcher: Arc<dyn FeedFetch>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let display_offset = FixedOffset::east_opt(config.display_utc_offset_hours * 3600).ok_or_else(|| {
            AppError::config(format!(
                "display_utc_offset_hours {} is out of range",
                config.display_utc_offset_hours
            ))
        })?;

        let index = Arc::new(SubscriptionIndex::new(repository.clone()));
        let dedup = Arc::new(DedupStore::new(repository.clone()));
        let (queue, consumer) = NotificationQueue::new(config.queue_capacity, notifier, config.send_rate_per_sec);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&index),
            Arc::clone(&dedup),
            Arc::new(KeywordMatcher::new()),
            queue.clone(),
            config.match_workers,
            display_offset,
        ));
        let scheduler = Scheduler::new(SchedulerSettings::from_config(config), fetcher, dispatcher);

        let queue_stop = Shutdown::new();
        let consumer = consumer.spawn(queue_stop.signal());

        Ok(Self {
            repository,
            index,
            dedup,
            queue,
            scheduler,
            seed_feeds: config.feeds.clone(),
            alert_chat_id: config.alert_chat_id,
            dedup_clear_every: config.dedup_cache_clear_every(),
            queue_stop,
            background: Mutex::new(Background {
                consumer: Some(consumer),
                cleaner: None,
            }),
        })
    }

    // Feed sources

    /// Registers a source, or updates name and url of an existing id.
    pub async fn add_feed_source(&self, name: &str, url: &str, feed_id: &str) -> Result<FeedSource> {
        let feed_id = feed_id.trim();
        if feed_id.is_empty() {
            return Err(AppError::config("feed id must not be empty"));
        }
        let url = Url::parse(url.trim())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::config(format!("unsupported feed url scheme: {}", url.scheme())));
        }

        let source = FeedSource {
            id: feed_id.to_string(),
            name: name.trim().to_string(),
            url: url.to_string(),
        };
        self.repository.upsert_feed_source(source.clone()).await?;
        self.index.invalidate_feed(feed_id);
        self.scheduler.upsert_source(source.clone());
        tracing::info!(feed_id, url = %source.url, "feed source saved");
        Ok(source)
    }

    pub async fn list_feed_sources(&self) -> Result<Vec<FeedSource>> {
        self.repository.list_feed_sources().await
    }

    pub async fn get_feed_source(&self, feed_id: &str) -> Result<Option<FeedSource>> {
        self.repository.get_feed_source(feed_id).await
    }

    /// Upserts the configured feeds, falling back to the built-in default
    /// when the store ends up empty.
    pub async fn seed_feeds(&self) -> Result<usize> {
        let mut seeded = 0;
        for feed in &self.seed_feeds {
            self.add_feed_source(&feed.name, &feed.url, &feed.id).await?;
            seeded += 1;
        }
        if self.repository.list_feed_sources().await?.is_empty() {
            self.add_feed_source(DEFAULT_FEED_NAME, DEFAULT_FEED_URL, DEFAULT_FEED_ID)
                .await?;
            seeded += 1;
        }
        Ok(seeded)
    }

    // Subscriptions

    /// Adds keywords to the chat's subscription on `feed_id`, creating it if
    /// needed. Returns the resulting keyword list.
    pub async fn add_or_update_subscription_keywords(
        &self,
        chat_id: i64,
        feed_id: &str,
        keywords: &[String],
    ) -> Result<Vec<String>> {
        if self.repository.get_feed_source(feed_id).await?.is_none() {
            return Err(AppError::UnknownFeed(feed_id.to_string()));
        }

        let mut subscription = self
            .repository
            .get_subscription(chat_id, feed_id)
            .await?
            .unwrap_or_else(|| Subscription {
                chat_id,
                feed_id: feed_id.to_string(),
                keywords: Vec::new(),
            });
        let added = subscription.add_keywords(keywords);
        self.repository.save_subscription(&subscription).await?;
        self.index.invalidate_feed(feed_id);

        tracing::info!(chat_id, feed_id, added, "subscription keywords added");
        Ok(subscription.keywords)
    }

    /// Removes keywords; unknown keywords and missing subscriptions are no-ops.
    pub async fn remove_subscription_keywords(
        &self,
        chat_id: i64,
        feed_id: &str,
        keywords: &[String],
    ) -> Result<Vec<String>> {
        let Some(mut subscription) = self.repository.get_subscription(chat_id, feed_id).await? else {
            return Ok(Vec::new());
        };
        let removed = subscription.remove_keywords(keywords);
        if removed > 0 {
            self.repository.save_subscription(&subscription).await?;
            self.index.invalidate_feed(feed_id);
            tracing::info!(chat_id, feed_id, removed, "subscription keywords removed");
        }
        Ok(subscription.keywords)
    }

    /// Keywords of every subscription the chat holds, by feed id.
    pub async fn list_subscription_keywords(&self, chat_id: i64) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self
            .repository
            .list_chat_subscriptions(chat_id)
            .await?
            .into_iter()
            .map(|s| (s.feed_id, s.keywords))
            .collect())
    }

    // Subscribers

    pub async fn ensure_subscriber(&self, chat_id: i64, name: &str) -> Result<Subscriber> {
        self.repository.ensure_subscriber(chat_id, name).await
    }

    pub async fn get_subscriber(&self, chat_id: i64) -> Result<Option<Subscriber>> {
        self.repository.get_subscriber(chat_id).await
    }

    pub async fn set_subscriber_status(&self, chat_id: i64, status: SubscriberStatus) -> Result<bool> {
        let changed = self.repository.set_subscriber_status(chat_id, status).await?;
        if changed {
            self.index.invalidate_all();
            tracing::info!(chat_id, status = status.as_str(), "subscriber status changed");
        }
        Ok(changed)
    }

    pub async fn list_subscribers(&self) -> Result<Vec<Subscriber>> {
        self.repository.list_subscribers().await
    }

    pub fn invalidate_subscriptions(&self) {
        self.index.invalidate_all();
    }

    // Status

    /// Notifications recorded in `[start, end)`.
    pub async fn notify_count_since(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<i64> {
        self.repository.count_notified_between(start, end).await
    }

    /// Queues a plain-text message, e.g. a reply or an alert.
    pub fn notify(&self, chat_id: i64, text: impl AsRef<str>) -> Result<()> {
        self.queue.enqueue(NotifyMessage::new(chat_id, text))
    }

    /// Best-effort message to the configured alert chat.
    pub fn alert(&self, text: &str) {
        if let Some(chat_id) = self.alert_chat_id {
            if let Err(e) = self.notify(chat_id, text) {
                tracing::warn!(chat_id, error = %e, "failed to queue alert");
            }
        }
    }

    // Lifecycle

    /// Starts polling every registered source until `signal` fires. Calling
    /// it again only picks up sources that have no loop yet.
    pub async fn start_scheduler(&self, signal: ShutdownSignal) -> Result<usize> {
        let sources = self.repository.list_feed_sources().await?;
        let started = self.scheduler.start(sources, signal.clone());

        let mut background = self.background();
        if background.cleaner.is_none() && self.scheduler.is_started() {
            background.cleaner = Some(Arc::clone(&self.dedup).spawn_cleaner(self.dedup_clear_every, signal));
        }
        Ok(started)
    }

    /// One fetch of every source through the whole pipeline.
    pub async fn run_once(&self) -> Result<DispatchReport> {
        let sources = self.repository.list_feed_sources().await?;
        let report = self.scheduler.fetch_all_once(sources).await;
        tracing::info!(
            matched = report.matched,
            enqueued = report.enqueued,
            failed = report.failed_tasks,
            "one-shot run finished"
        );
        Ok(report)
    }

    /// Waits for the scheduler to wind down after its signal fired, then
    /// flushes the notification queue. Returns how many messages were sent.
    pub async fn shutdown(&self) -> usize {
        self.scheduler.join().await;

        let (consumer, cleaner) = {
            let mut background = self.background();
            (background.consumer.take(), background.cleaner.take())
        };
        if let Some(cleaner) = cleaner {
            cleaner.abort();
        }

        self.queue_stop.trigger();
        match consumer {
            Some(consumer) => consumer.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "notification consumer ended abnormally");
                0
            }),
            None => 0,
        }
    }

    fn background(&self) -> std::sync::MutexGuard<'_, Background> {
        self.background.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeedItem;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    struct StaticFetcher(Vec<FeedItem>);

    #[async_trait]
    impl FeedFetch for StaticFetcher {
        async fn fetch(&self, _: &FeedSource, _: Duration) -> Result<Vec<FeedItem>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct Recorder(std::sync::Mutex<Vec<(i64, String)>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, chat_id: i64, text: &str) -> Result<i64> {
            let mut sent = self.0.lock().unwrap();
            sent.push((chat_id, text.to_string()));
            Ok(sent.len() as i64)
        }
    }

    async fn service(items: Vec<FeedItem>, config: Config) -> (FeedService, Arc<Recorder>) {
        let repo = Arc::new(Repository::in_memory().await.unwrap());
        let recorder = Arc::new(Recorder::default());
        let service = FeedService::new(&config, repo, Arc::new(StaticFetcher(items)), recorder.clone()).unwrap();
        (service, recorder)
    }

    fn keywords(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn feed_sources_are_upserted_by_id() {
        let (service, _) = service(vec![], Config::default()).await;

        service.add_feed_source("NodeSeek", "https://rss.nodeseek.com", "ns").await.unwrap();
        service
            .add_feed_source("NodeSeek mirror", "https://mirror.example.com/rss", "ns")
            .await
            .unwrap();

        let feeds = service.list_feed_sources().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].name, "NodeSeek mirror");
        assert!(service.get_feed_source("missing").await.unwrap().is_none());
        assert!(service.add_feed_source("bad", "not a url", "x").await.is_err());
        assert!(service.add_feed_source("bad", "ftp://example.com/rss", "x").await.is_err());
    }

    #[tokio::test]
    async fn default_feed_is_seeded_into_an_empty_store() {
        let (service, _) = service(vec![], Config::default()).await;

        assert_eq!(service.seed_feeds().await.unwrap(), 1);
        assert_eq!(service.seed_feeds().await.unwrap(), 0);
        let feed = service.get_feed_source(DEFAULT_FEED_ID).await.unwrap().unwrap();
        assert_eq!(feed.name, DEFAULT_FEED_NAME);
    }

    #[tokio::test]
    async fn keywords_are_added_and_removed_per_feed() {
        let (service, _) = service(vec![], Config::default()).await;
        service.seed_feeds().await.unwrap();

        let err = service
            .add_or_update_subscription_keywords(1, "missing", &keywords(&["vps"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownFeed(_)));

        service
            .add_or_update_subscription_keywords(1, "ns", &keywords(&["vps", "港仔~收"]))
            .await
            .unwrap();
        let after = service
            .add_or_update_subscription_keywords(1, "ns", &keywords(&["vps", "bgp"]))
            .await
            .unwrap();
        assert_eq!(after, keywords(&["vps", "港仔~收", "bgp"]));

        let after = service
            .remove_subscription_keywords(1, "ns", &keywords(&["vps", "nothing"]))
            .await
            .unwrap();
        assert_eq!(after, keywords(&["港仔~收", "bgp"]));
        assert!(service
            .remove_subscription_keywords(2, "ns", &keywords(&["vps"]))
            .await
            .unwrap()
            .is_empty());

        let listed = service.list_subscription_keywords(1).await.unwrap();
        assert_eq!(listed.get("ns"), Some(&keywords(&["港仔~收", "bgp"])));
    }

    #[tokio::test]
    async fn run_once_notifies_and_counts() {
        let items = vec![FeedItem {
            title: "HK VPS".into(),
            url: "https://www.nodeseek.com/post-9#top".into(),
            published_at: None,
        }];
        let (service, recorder) = service(items, Config::default()).await;
        service.seed_feeds().await.unwrap();
        service.ensure_subscriber(7, "alice").await.unwrap();
        service
            .add_or_update_subscription_keywords(7, "ns", &keywords(&["vps"]))
            .await
            .unwrap();

        let first = service.run_once().await.unwrap();
        let second = service.run_once().await.unwrap();
        assert_eq!(first.enqueued, 1);
        assert_eq!(second.enqueued, 0);

        let now = Utc::now();
        let count = service
            .notify_count_since(now - ChronoDuration::hours(1), now + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(count, 1);

        assert_eq!(service.shutdown().await, 1);
        assert_eq!(recorder.0.lock().unwrap()[0].0, 7);
    }

    #[tokio::test]
    async fn paused_subscribers_are_skipped_until_resumed() {
        let items = vec![FeedItem {
            title: "HK VPS".into(),
            url: "https://www.nodeseek.com/post-10".into(),
            published_at: None,
        }];
        let (service, _) = service(items, Config::default()).await;
        service.seed_feeds().await.unwrap();
        service.ensure_subscriber(7, "alice").await.unwrap();
        service
            .add_or_update_subscription_keywords(7, "ns", &keywords(&["vps"]))
            .await
            .unwrap();

        assert!(service.set_subscriber_status(7, SubscriberStatus::Paused).await.unwrap());
        assert_eq!(service.run_once().await.unwrap().enqueued, 0);

        service.set_subscriber_status(7, SubscriberStatus::Active).await.unwrap();
        assert_eq!(service.run_once().await.unwrap().enqueued, 1);
    }

    #[tokio::test]
    async fn start_scheduler_twice_starts_each_source_once() {
        let (service, _) = service(vec![], Config::default()).await;
        service.seed_feeds().await.unwrap();
        let shutdown = Shutdown::new();

        assert_eq!(service.start_scheduler(shutdown.signal()).await.unwrap(), 1);
        assert_eq!(service.start_scheduler(shutdown.signal()).await.unwrap(), 0);

        shutdown.trigger();
        service.shutdown().await;
    }

    #[tokio::test]
    async fn alerts_go_to_the_configured_chat() {
        let config = Config {
            alert_chat_id: Some(42),
            ..Config::default()
        };
        let (service, recorder) = service(vec![], config).await;

        service.alert("service started");
        service.shutdown().await;

        let sent = recorder.0.lock().unwrap();
        assert_eq!(sent.as_slice(), &[(42, "service started".to_string())]);
    }
}
