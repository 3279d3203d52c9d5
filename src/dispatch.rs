//! Match/dispatch pool.
//!
//! One fetch result fans out into one task per active subscription. A fixed
//! number of workers drains the tasks; the cycle ends once all of them have.

use std::collections::HashSet;
use std::ops::AddAssign;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::FixedOffset;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::dedup::DedupStore;
use crate::error::AppError;
use crate::matcher::KeywordMatcher;
use crate::models::{normalize_item_url, FeedItem, NotifyMessage, NotifyRecord, Subscription};
use crate::notify::NotificationQueue;
use crate::subscriptions::SubscriptionIndex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub tasks: usize,
    pub matched: usize,
    pub enqueued: usize,
    pub failed_tasks: usize,
}

impl AddAssign for DispatchReport {
    fn add_assign(&mut self, other: Self) {
        self.tasks += other.tasks;
        self.matched += other.matched;
        self.enqueued += other.enqueued;
        self.failed_tasks += other.failed_tasks;
    }
}

struct MatchTask {
    subscription: Subscription,
    items: Arc<[FeedItem]>,
}

pub struct Dispatcher {
    index: Arc<SubscriptionIndex>,
    dedup: Arc<DedupStore>,
    matcher: Arc<KeywordMatcher>,
    queue: NotificationQueue,
    workers: usize,
    display_offset: FixedOffset,
}

impl Dispatcher {
    pub fn new(
        index: Arc<SubscriptionIndex>,
        dedup: Arc<DedupStore>,
        matcher: Arc<KeywordMatcher>,
        queue: NotificationQueue,
        workers: usize,
        display_offset: FixedOffset,
    ) -> Self {
        Self {
            index,
            dedup,
            matcher,
            queue,
            workers: workers.max(1),
            display_offset,
        }
    }

    /// Runs one fetch cycle's matching to completion.
    pub async fn dispatch(self: &Arc<Self>, feed_id: &str, items: Arc<[FeedItem]>) -> DispatchReport {
        if items.is_empty() {
            return DispatchReport::default();
        }

        let subscriptions = match self.index.active_subscriptions(feed_id).await {
            Ok(subscriptions) => subscriptions,
            Err(AppError::UnknownFeed(_)) => {
                tracing::warn!(feed_id, "items fetched for an unregistered feed, skipping");
                return DispatchReport::default();
            }
            Err(e) => {
                tracing::error!(feed_id, error = %e, "failed to load subscriptions");
                return DispatchReport::default();
            }
        };
        if subscriptions.is_empty() {
            return DispatchReport::default();
        }

        let (tx, rx) = mpsc::channel(subscriptions.len());
        for subscription in subscriptions {
            let task = MatchTask {
                subscription,
                items: Arc::clone(&items),
            };
            if tx.try_send(task).is_err() {
                tracing::error!(feed_id, "match task channel rejected a task");
            }
        }
        drop(tx);

        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let this = Arc::clone(self);
            let rx = Arc::clone(&rx);
            workers.spawn(async move { this.work(rx).await });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(partial) => report += partial,
                Err(e) => tracing::error!(feed_id, error = %e, "match worker died"),
            }
        }

        if report.enqueued > 0 || report.failed_tasks > 0 {
            tracing::info!(
                feed_id,
                tasks = report.tasks,
                matched = report.matched,
                enqueued = report.enqueued,
                failed = report.failed_tasks,
                "dispatch cycle finished"
            );
        }
        report
    }

    async fn work(&self, rx: Arc<Mutex<mpsc::Receiver<MatchTask>>>) -> DispatchReport {
        let mut report = DispatchReport::default();
        loop {
            let Some(task) = rx.lock().await.recv().await else {
                break;
            };
            let chat_id = task.subscription.chat_id;
            report.tasks += 1;

            match AssertUnwindSafe(self.run_task(task)).catch_unwind().await {
                Ok(partial) => {
                    report.matched += partial.matched;
                    report.enqueued += partial.enqueued;
                }
                Err(_) => {
                    tracing::error!(chat_id, "match task panicked");
                    report.failed_tasks += 1;
                }
            }
        }
        report
    }

    async fn run_task(&self, task: MatchTask) -> DispatchReport {
        let MatchTask { subscription, items } = task;
        let chat_id = subscription.chat_id;
        let mut report = DispatchReport::default();

        let rules = self.matcher.rules(&subscription.keywords);
        if rules.is_empty() {
            return report;
        }

        let mut seen_this_cycle = HashSet::new();
        let candidates: Vec<(&FeedItem, String)> = items
            .iter()
            .filter_map(|item| normalize_item_url(&item.url).map(|url| (item, url)))
            .filter(|(_, url)| seen_this_cycle.insert(url.clone()))
            .collect();
        if candidates.is_empty() {
            return report;
        }

        let urls: Vec<String> = candidates.iter().map(|(_, url)| url.clone()).collect();
        let notified = match self.dedup.exists_batch(chat_id, &urls).await {
            Ok(notified) => notified,
            Err(e) => {
                tracing::error!(
                    chat_id,
                    feed_id = %subscription.feed_id,
                    error = %e,
                    "dedup lookup failed, treating items as not yet notified"
                );
                Default::default()
            }
        };

        let mut records = Vec::new();
        let mut messages = Vec::new();
        for (item, url) in candidates {
            if notified.get(&url).copied().unwrap_or(false) || !rules.is_match(&item.title) {
                continue;
            }
            messages.push(NotifyMessage::for_item(chat_id, item, &url, self.display_offset));
            records.push(NotifyRecord::new(chat_id, url, item.title.clone()));
        }
        report.matched = records.len();
        if records.is_empty() {
            return report;
        }

        if let Err(e) = self.dedup.record_batch(&records).await {
            tracing::error!(
                chat_id,
                feed_id = %subscription.feed_id,
                error = %e,
                "failed to record notifications, delivering anyway"
            );
        }

        for message in messages {
            if self.queue.enqueue(message).is_ok() {
                report.enqueued += 1;
            } else {
                tracing::warn!(chat_id, feed_id = %subscription.feed_id, "notification dropped");
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NotifyLedger, Repository};
    use crate::models::FeedSource;
    use crate::notify::{Notifier, QueueConsumer};
    use crate::shutdown::Shutdown;
    use crate::Result;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Sink {
        sent: std::sync::Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Notifier for Sink {
        async fn send(&self, chat_id: i64, text: &str) -> Result<i64> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((chat_id, text.to_string()));
            Ok(sent.len() as i64)
        }
    }

    struct Harness {
        repo: Arc<Repository>,
        dispatcher: Arc<Dispatcher>,
        consumer: QueueConsumer,
        sink: Arc<Sink>,
    }

    async fn harness_with_ledger(ledger: Option<Arc<dyn NotifyLedger>>) -> Harness {
        let repo = Arc::new(Repository::in_memory().await.unwrap());
        repo.upsert_feed_source(FeedSource {
            id: "ns".into(),
            name: "NodeSeek".into(),
            url: "https://rss.nodeseek.com".into(),
        })
        .await
        .unwrap();

        let sink = Arc::new(Sink::default());
        let (queue, consumer) = NotificationQueue::new(100, sink.clone(), 1000);
        let ledger = ledger.unwrap_or_else(|| repo.clone() as Arc<dyn NotifyLedger>);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(SubscriptionIndex::new(repo.clone())),
            Arc::new(DedupStore::new(ledger)),
            Arc::new(KeywordMatcher::new()),
            queue,
            5,
            FixedOffset::east_opt(0).unwrap(),
        ));
        Harness {
            repo,
            dispatcher,
            consumer,
            sink,
        }
    }

    async fn subscribe(repo: &Repository, chat_id: i64, keywords: &[&str]) {
        repo.ensure_subscriber(chat_id, "chat").await.unwrap();
        repo.save_subscription(&Subscription {
            chat_id,
            feed_id: "ns".into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        })
        .await
        .unwrap();
    }

    fn items(list: &[(&str, &str)]) -> Arc<[FeedItem]> {
        list.iter()
            .map(|(title, url)| FeedItem {
                title: title.to_string(),
                url: url.to_string(),
                published_at: None,
            })
            .collect::<Vec<_>>()
            .into()
    }

    async fn drain(consumer: QueueConsumer) {
        let stop = Shutdown::new();
        stop.trigger();
        consumer.run(stop.signal()).await;
    }

    #[tokio::test]
    async fn only_matching_subscribers_are_notified_once() {
        let h = harness_with_ledger(None).await;
        subscribe(&h.repo, 1, &["港仔~收"]).await;
        subscribe(&h.repo, 2, &["收"]).await;
        let batch = items(&[("港仔出NAT", "https://www.nodeseek.com/post-1#0")]);

        let first = h.dispatcher.dispatch("ns", Arc::clone(&batch)).await;
        let second = h.dispatcher.dispatch("ns", batch).await;
        drain(h.consumer).await;

        assert_eq!(first.tasks, 2);
        assert_eq!(first.enqueued, 1);
        assert_eq!(second.enqueued, 0);
        let sent = h.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 1);
        assert!(sent[0].1.ends_with(r"https://www\.nodeseek\.com/post\-1"));
        assert!(!sent[0].1.contains("#0"));
    }

    #[tokio::test]
    async fn fragment_variants_are_one_item() {
        let h = harness_with_ledger(None).await;
        subscribe(&h.repo, 1, &["vps"]).await;

        let report = h
            .dispatcher
            .dispatch("ns", items(&[("VPS a", "https://x/y#a"), ("VPS b", "https://x/y#b"), ("VPS c", "")]))
            .await;

        assert_eq!(report.enqueued, 1);
        drain(h.consumer).await;
        assert!(h.sink.sent.lock().unwrap()[0].1.contains("VPS a"));
    }

    #[tokio::test]
    async fn paused_subscribers_get_nothing() {
        let h = harness_with_ledger(None).await;
        subscribe(&h.repo, 1, &["vps"]).await;
        h.repo
            .set_subscriber_status(1, crate::models::SubscriberStatus::Paused)
            .await
            .unwrap();

        let report = h.dispatcher.dispatch("ns", items(&[("VPS", "https://x/1")])).await;
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn unknown_feed_is_skipped() {
        let h = harness_with_ledger(None).await;
        let report = h.dispatcher.dispatch("ghost", items(&[("VPS", "https://x/1")])).await;
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn many_subscribers_share_the_pool() {
        let h = harness_with_ledger(None).await;
        for chat_id in 1..=23 {
            subscribe(&h.repo, chat_id, &["vps"]).await;
        }

        let report = h.dispatcher.dispatch("ns", items(&[("VPS", "https://x/1"), ("other", "https://x/2")])).await;

        assert_eq!(report.tasks, 23);
        assert_eq!(report.enqueued, 23);
    }

    struct BrokenLedger;

    #[async_trait]
    impl NotifyLedger for BrokenLedger {
        async fn find_notified(&self, _: i64, _: &[String]) -> Result<HashSet<String>> {
            Err(AppError::config("store unavailable"))
        }

        async fn insert_notified(&self, _: &[NotifyRecord]) -> Result<usize> {
            Err(AppError::config("store unavailable"))
        }
    }

    #[tokio::test]
    async fn persistence_failures_favor_delivery() {
        let h = harness_with_ledger(Some(Arc::new(BrokenLedger))).await;
        subscribe(&h.repo, 1, &["vps"]).await;

        let report = h.dispatcher.dispatch("ns", items(&[("VPS", "https://x/1")])).await;

        assert_eq!(report.enqueued, 1);
        assert_eq!(report.failed_tasks, 0);
    }
}
