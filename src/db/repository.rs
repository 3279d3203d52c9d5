use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{FeedSource, NotifyRecord, Subscriber, SubscriberStatus, Subscription};

use super::schema::SCHEMA;
use super::{NotifyLedger, SubscriptionStore};

// Stays well under SQLite's bound-parameter limit.
const URL_CHUNK: usize = 500;

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Feed source operations

    /// Inserts the source, or updates name and url of an existing id.
    pub async fn upsert_feed_source(&self, source: FeedSource) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO feed_sources (id, name, url) VALUES (?1, ?2, ?3)
                       ON CONFLICT(id) DO UPDATE SET
                           name = excluded.name,
                           url = excluded.url,
                           updated_at = datetime('now')"#,
                    params![source.id, source.name, source.url],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_feed_sources(&self) -> Result<Vec<FeedSource>> {
        let sources = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, name, url FROM feed_sources ORDER BY id")?;
                let sources = stmt
                    .query_map([], feed_source_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(sources)
            })
            .await?;
        Ok(sources)
    }

    pub async fn get_feed_source(&self, feed_id: &str) -> Result<Option<FeedSource>> {
        let feed_id = feed_id.to_string();
        let source = self
            .conn
            .call(move |conn| {
                let source = conn
                    .query_row(
                        "SELECT id, name, url FROM feed_sources WHERE id = ?1",
                        params![feed_id],
                        feed_source_from_row,
                    )
                    .optional()?;
                Ok(source)
            })
            .await?;
        Ok(source)
    }

    // Subscriber operations

    /// Creates the subscriber as active if it does not exist yet.
    pub async fn ensure_subscriber(&self, chat_id: i64, name: &str) -> Result<Subscriber> {
        let name = name.to_string();
        let subscriber = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO subscribers (chat_id, name, status) VALUES (?1, ?2, ?3)",
                    params![chat_id, name, SubscriberStatus::Active.as_str()],
                )?;
                let subscriber = conn.query_row(
                    "SELECT chat_id, name, status, created_at FROM subscribers WHERE chat_id = ?1",
                    params![chat_id],
                    subscriber_from_row,
                )?;
                Ok(subscriber)
            })
            .await?;
        Ok(subscriber)
    }

    pub async fn get_subscriber(&self, chat_id: i64) -> Result<Option<Subscriber>> {
        let subscriber = self
            .conn
            .call(move |conn| {
                let subscriber = conn
                    .query_row(
                        "SELECT chat_id, name, status, created_at FROM subscribers WHERE chat_id = ?1",
                        params![chat_id],
                        subscriber_from_row,
                    )
                    .optional()?;
                Ok(subscriber)
            })
            .await?;
        Ok(subscriber)
    }

    pub async fn list_subscribers(&self) -> Result<Vec<Subscriber>> {
        let subscribers = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT chat_id, name, status, created_at FROM subscribers ORDER BY chat_id",
                )?;
                let subscribers = stmt
                    .query_map([], subscriber_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(subscribers)
            })
            .await?;
        Ok(subscribers)
    }

    /// Returns false when no such subscriber exists.
    pub async fn set_subscriber_status(&self, chat_id: i64, status: SubscriberStatus) -> Result<bool> {
        let updated = self
            .conn
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE subscribers SET status = ?1, updated_at = datetime('now') WHERE chat_id = ?2",
                    params![status.as_str(), chat_id],
                )?;
                Ok(updated)
            })
            .await?;
        Ok(updated > 0)
    }

    // Subscription operations

    pub async fn get_subscription(&self, chat_id: i64, feed_id: &str) -> Result<Option<Subscription>> {
        let feed_id = feed_id.to_string();
        let subscription = self
            .conn
            .call(move |conn| {
                let subscription = conn
                    .query_row(
                        "SELECT chat_id, feed_id, keywords FROM subscriptions WHERE chat_id = ?1 AND feed_id = ?2",
                        params![chat_id, feed_id],
                        subscription_from_row,
                    )
                    .optional()?;
                Ok(subscription)
            })
            .await?;
        Ok(subscription)
    }

    pub async fn save_subscription(&self, subscription: &Subscription) -> Result<()> {
        let keywords = serde_json::to_string(&subscription.keywords)?;
        let chat_id = subscription.chat_id;
        let feed_id = subscription.feed_id.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO subscriptions (chat_id, feed_id, keywords) VALUES (?1, ?2, ?3)
                       ON CONFLICT(chat_id, feed_id) DO UPDATE SET
                           keywords = excluded.keywords,
                           updated_at = datetime('now')"#,
                    params![chat_id, feed_id, keywords],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn list_chat_subscriptions(&self, chat_id: i64) -> Result<Vec<Subscription>> {
        let subscriptions = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT chat_id, feed_id, keywords FROM subscriptions WHERE chat_id = ?1 ORDER BY feed_id",
                )?;
                let subscriptions = stmt
                    .query_map(params![chat_id], subscription_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(subscriptions)
            })
            .await?;
        Ok(subscriptions)
    }

    // Notify record operations

    /// Counts records with `start <= created_at < end`.
    pub async fn count_notified_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<i64> {
        let (start, end) = (timestamp(&start), timestamp(&end));
        let count = self
            .conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM notify_records WHERE created_at >= ?1 AND created_at < ?2",
                    params![start, end],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl NotifyLedger for Repository {
    async fn find_notified(&self, chat_id: i64, urls: &[String]) -> Result<HashSet<String>> {
        if urls.is_empty() {
            return Ok(HashSet::new());
        }

        let urls = urls.to_vec();
        let found = self
            .conn
            .call(move |conn| {
                let mut found = HashSet::new();
                for chunk in urls.chunks(URL_CHUNK) {
                    let placeholders = vec!["?"; chunk.len()].join(", ");
                    let sql = format!(
                        "SELECT url FROM notify_records WHERE chat_id = ? AND url IN ({})",
                        placeholders
                    );
                    let values = std::iter::once(Value::Integer(chat_id))
                        .chain(chunk.iter().cloned().map(Value::Text));

                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;
                    for url in rows {
                        found.insert(url?);
                    }
                }
                Ok(found)
            })
            .await?;
        Ok(found)
    }

    async fn insert_notified(&self, records: &[NotifyRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let records = records.to_vec();
        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut inserted = 0;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO notify_records (chat_id, url, title, created_at) VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for record in &records {
                        inserted += stmt.execute(params![
                            record.chat_id,
                            record.url,
                            record.title,
                            timestamp(&record.created_at),
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await?;
        Ok(inserted)
    }
}

#[async_trait]
impl SubscriptionStore for Repository {
    async fn feed_subscriptions(&self, feed_id: &str) -> Result<Vec<Subscription>> {
        let id = feed_id.to_string();
        let subscriptions = self
            .conn
            .call(move |conn| {
                let known: Option<i64> = conn
                    .query_row("SELECT 1 FROM feed_sources WHERE id = ?1", params![id], |row| row.get(0))
                    .optional()?;
                if known.is_none() {
                    return Ok(None);
                }

                let mut stmt = conn.prepare(
                    "SELECT chat_id, feed_id, keywords FROM subscriptions WHERE feed_id = ?1 ORDER BY chat_id",
                )?;
                let subscriptions = stmt
                    .query_map(params![id], subscription_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Some(subscriptions))
            })
            .await?;

        subscriptions.ok_or_else(|| AppError::UnknownFeed(feed_id.to_string()))
    }

    async fn active_chat_ids(&self) -> Result<HashSet<i64>> {
        let subscribers = self.list_subscribers().await?;
        Ok(subscribers
            .into_iter()
            .filter(Subscriber::is_active)
            .map(|s| s.chat_id)
            .collect())
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // SQLite datetime('now') format
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn feed_source_from_row(row: &Row) -> rusqlite::Result<FeedSource> {
    Ok(FeedSource {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
    })
}

fn subscriber_from_row(row: &Row) -> rusqlite::Result<Subscriber> {
    Ok(Subscriber {
        chat_id: row.get(0)?,
        name: row.get(1)?,
        status: SubscriberStatus::parse(&row.get::<_, String>(2)?),
        created_at: row
            .get::<_, String>(3)
            .ok()
            .and_then(|s| parse_datetime(&s))
            .unwrap_or_else(Utc::now),
    })
}

fn subscription_from_row(row: &Row) -> rusqlite::Result<Subscription> {
    let raw: String = row.get(2)?;
    let keywords = if raw.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?
    };

    Ok(Subscription {
        chat_id: row.get(0)?,
        feed_id: row.get(1)?,
        keywords,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn repo_with_feed() -> Repository {
        let repo = Repository::in_memory().await.unwrap();
        repo.upsert_feed_source(FeedSource {
            id: "ns".into(),
            name: "NodeSeek".into(),
            url: "https://rss.nodeseek.com".into(),
        })
        .await
        .unwrap();
        repo
    }

    #[tokio::test]
    async fn feed_sources_upsert_by_id() {
        let repo = repo_with_feed().await;
        repo.upsert_feed_source(FeedSource {
            id: "ns".into(),
            name: "NodeSeek RSS".into(),
            url: "https://rss.nodeseek.com/".into(),
        })
        .await
        .unwrap();

        let sources = repo.list_feed_sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name, "NodeSeek RSS");
        assert!(repo.get_feed_source("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subscriptions_round_trip_keywords_in_order() {
        let repo = repo_with_feed().await;
        let sub = Subscription {
            chat_id: 7,
            feed_id: "ns".into(),
            keywords: vec!["港仔~收".into(), "bgp".into()],
        };
        repo.save_subscription(&sub).await.unwrap();

        let loaded = repo.get_subscription(7, "ns").await.unwrap().unwrap();
        assert_eq!(loaded, sub);
        assert_eq!(repo.feed_subscriptions("ns").await.unwrap(), vec![sub.clone()]);
        assert_eq!(repo.list_chat_subscriptions(7).await.unwrap(), vec![sub]);
    }

    #[tokio::test]
    async fn unknown_feed_is_a_configuration_error() {
        let repo = Repository::in_memory().await.unwrap();
        let err = repo.feed_subscriptions("nope").await.unwrap_err();
        assert!(matches!(err, AppError::UnknownFeed(id) if id == "nope"));
    }

    #[tokio::test]
    async fn only_active_subscribers_are_listed_as_active() {
        let repo = Repository::in_memory().await.unwrap();
        repo.ensure_subscriber(1, "a").await.unwrap();
        repo.ensure_subscriber(2, "b").await.unwrap();
        repo.ensure_subscriber(3, "c").await.unwrap();
        assert!(repo.set_subscriber_status(2, SubscriberStatus::Paused).await.unwrap());
        assert!(repo.set_subscriber_status(3, SubscriberStatus::Quit).await.unwrap());
        assert!(!repo.set_subscriber_status(4, SubscriberStatus::Paused).await.unwrap());

        let active = repo.active_chat_ids().await.unwrap();
        assert_eq!(active, HashSet::from([1]));
    }

    #[tokio::test]
    async fn ensure_subscriber_keeps_existing_status() {
        let repo = Repository::in_memory().await.unwrap();
        repo.ensure_subscriber(1, "a").await.unwrap();
        repo.set_subscriber_status(1, SubscriberStatus::Paused).await.unwrap();

        let again = repo.ensure_subscriber(1, "renamed").await.unwrap();
        assert_eq!(again.status, SubscriberStatus::Paused);
        assert_eq!(again.name, "a");
    }

    #[tokio::test]
    async fn duplicate_records_are_ignored() {
        let repo = Repository::in_memory().await.unwrap();
        let record = NotifyRecord::new(1, "https://x/1", "t");

        assert_eq!(repo.insert_notified(&[record.clone()]).await.unwrap(), 1);
        assert_eq!(repo.insert_notified(&[record.clone(), record]).await.unwrap(), 0);

        let urls = vec!["https://x/1".to_string(), "https://x/2".to_string()];
        let found = repo.find_notified(1, &urls).await.unwrap();
        assert_eq!(found, HashSet::from(["https://x/1".to_string()]));
        assert!(repo.find_notified(2, &urls).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_url_batches_are_chunked() {
        let repo = Repository::in_memory().await.unwrap();
        let records: Vec<_> = (0..1200)
            .map(|i| NotifyRecord::new(9, format!("https://x/{i}"), "t"))
            .collect();
        repo.insert_notified(&records).await.unwrap();

        let urls: Vec<_> = records.iter().map(|r| r.url.clone()).collect();
        assert_eq!(repo.find_notified(9, &urls).await.unwrap().len(), 1200);
    }

    #[tokio::test]
    async fn counts_records_in_half_open_range() {
        let repo = Repository::in_memory().await.unwrap();
        let now = Utc::now();
        let mut old = NotifyRecord::new(1, "https://x/old", "t");
        old.created_at = now - Duration::days(2);
        let fresh = NotifyRecord::new(1, "https://x/new", "t");
        repo.insert_notified(&[old, fresh]).await.unwrap();

        let day_ago = now - Duration::days(1);
        let later = Utc::now() + Duration::seconds(1);
        assert_eq!(repo.count_notified_between(day_ago, later).await.unwrap(), 1);
        assert_eq!(repo.count_notified_between(now - Duration::days(3), later).await.unwrap(), 2);
        assert_eq!(repo.count_notified_between(later, later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifier.db");
        let path = path.to_str().unwrap();

        {
            let repo = Repository::new(path).await.unwrap();
            repo.insert_notified(&[NotifyRecord::new(5, "https://x/1", "t")])
                .await
                .unwrap();
        }

        let reopened = Repository::new(path).await.unwrap();
        let found = reopened
            .find_notified(5, &["https://x/1".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
