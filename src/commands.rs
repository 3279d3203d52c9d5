//! Chat commands and button callbacks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::models::{ChatKind, InboundEvent, SubscriberStatus};
use crate::service::FeedService;
use crate::shutdown::ShutdownSignal;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// A stream of inbound chat events, e.g. a bot API long poll.
#[async_trait]
pub trait UpdateSource: Send {
    /// Waits for the next batch. An empty batch is fine.
    async fn next_events(&mut self) -> Result<Vec<InboundEvent>>;
}

const HELP: &str = "\
/feed - list feeds
/list - show your keyword rules
/add <feedId> <rule...> - add rules to a feed
/del <feedId> <rule...> - remove rules from a feed
/on - resume notifications
/off - pause notifications
/help - this message

Rules: a|b matches either, a+b needs both, a~b needs a without b.";

#[derive(Debug, Deserialize)]
struct CallbackPayload {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "d", default)]
    data: Option<CallbackData>,
}

#[derive(Debug, Deserialize)]
struct CallbackData {
    #[serde(rename = "i")]
    feed_id: Option<String>,
}

pub struct CommandHandler {
    service: Arc<FeedService>,
}

impl CommandHandler {
    pub fn new(service: Arc<FeedService>) -> Self {
        Self { service }
    }

    /// Answers events from `source` until `shutdown` fires. Replies go through
    /// the notification queue like any other message.
    pub fn serve<S>(self: Arc<Self>, mut source: S, mut shutdown: ShutdownSignal) -> JoinHandle<()>
    where
        S: UpdateSource + 'static,
    {
        tokio::spawn(async move {
            loop {
                let batch = tokio::select! {
                    biased;
                    _ = shutdown.triggered() => break,
                    batch = source.next_events() => batch,
                };
                match batch {
                    Ok(events) => {
                        for event in &events {
                            self.reply_to(event).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read chat updates, retrying");
                        tokio::select! {
                            biased;
                            _ = shutdown.triggered() => break,
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                        }
                    }
                }
            }
            tracing::debug!("command loop stopped");
        })
    }

    async fn reply_to(&self, event: &InboundEvent) {
        let chat_id = event.chat_id();
        let reply = match self.handle(event).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(chat_id, error = %e, "command failed");
                "something went wrong, try again later".to_string()
            }
        };
        if let Err(e) = self.service.notify(chat_id, reply) {
            tracing::warn!(chat_id, error = %e, "failed to queue reply");
        }
    }

    /// Handles one inbound event and returns the reply text, if any.
    pub async fn handle(&self, event: &InboundEvent) -> Result<Option<String>> {
        let chat_id = event.chat_id();
        let subscriber = self.service.ensure_subscriber(chat_id, event.sender_name()).await?;
        if subscriber.status == SubscriberStatus::Quit {
            tracing::debug!(chat_id, "ignoring event from a chat that quit");
            return Ok(None);
        }

        match event {
            InboundEvent::Message { kind, .. } => self.handle_command(*kind, chat_id, event.body()).await,
            InboundEvent::Callback { .. } => self.handle_callback(chat_id, event.body()).await,
        }
    }

    async fn handle_command(&self, kind: ChatKind, chat_id: i64, text: &str) -> Result<Option<String>> {
        let mut words = text.split_whitespace();
        let Some(command) = words.next().filter(|w| w.starts_with('/')) else {
            return Ok((kind == ChatKind::Direct).then(|| HELP.to_string()));
        };
        // "/add@my_bot" in groups
        let command = command.split('@').next().unwrap_or(command);
        let args: Vec<String> = words.map(str::to_string).collect();

        let reply = match command {
            "/start" | "/help" => HELP.to_string(),
            "/feed" => self.describe_feeds().await?,
            "/list" => self.describe_keywords(chat_id, None).await?,
            "/add" | "/del" => {
                let Some((feed_id, rules)) = args.split_first() else {
                    return Ok(Some(format!("usage: {command} <feedId> <rule...>")));
                };
                if rules.is_empty() {
                    return Ok(Some(format!("usage: {command} {feed_id} <rule...>")));
                }
                let result = if command == "/add" {
                    self.service
                        .add_or_update_subscription_keywords(chat_id, feed_id, rules)
                        .await
                } else {
                    self.service.remove_subscription_keywords(chat_id, feed_id, rules).await
                };
                match result {
                    Ok(keywords) if keywords.is_empty() => format!("{feed_id}: no rules"),
                    Ok(keywords) => format!("{feed_id}: {}", keywords.join(", ")),
                    Err(AppError::UnknownFeed(id)) => format!("unknown feed: {id}"),
                    Err(e) => return Err(e),
                }
            }
            "/on" => self.set_status(chat_id, SubscriberStatus::Active).await?,
            "/off" => self.set_status(chat_id, SubscriberStatus::Paused).await?,
            _ if kind == ChatKind::Direct => HELP.to_string(),
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }

    async fn handle_callback(&self, chat_id: i64, data: &str) -> Result<Option<String>> {
        let payload: CallbackPayload = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(chat_id, error = %e, "unreadable callback payload");
                return Ok(None);
            }
        };

        let reply = match payload.event.as_str() {
            "01" => {
                let Some(feed_id) = payload.data.and_then(|d| d.feed_id) else {
                    return Ok(None);
                };
                self.describe_keywords(chat_id, Some(&feed_id)).await?
            }
            "06" => self.set_status(chat_id, SubscriberStatus::Active).await?,
            "07" => self.set_status(chat_id, SubscriberStatus::Paused).await?,
            other => {
                tracing::debug!(chat_id, event = other, "unhandled callback event");
                return Ok(None);
            }
        };
        Ok(Some(reply))
    }

    async fn describe_feeds(&self) -> Result<String> {
        let feeds = self.service.list_feed_sources().await?;
        if feeds.is_empty() {
            return Ok("no feeds".to_string());
        }
        Ok(feeds
            .iter()
            .map(|f| format!("{} - {} ({})", f.id, f.name, f.url))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn describe_keywords(&self, chat_id: i64, only: Option<&str>) -> Result<String> {
        let subscriptions = self.service.list_subscription_keywords(chat_id).await?;
        let lines: Vec<String> = subscriptions
            .iter()
            .filter(|(feed_id, keywords)| !keywords.is_empty() && only.map_or(true, |id| id == feed_id.as_str()))
            .map(|(feed_id, keywords)| format!("{feed_id}: {}", keywords.join(", ")))
            .collect();

        if lines.is_empty() {
            return Ok(match only {
                Some(feed_id) => format!("{feed_id}: no rules"),
                None => "no rules yet, try /add".to_string(),
            });
        }
        Ok(lines.join("\n"))
    }

    async fn set_status(&self, chat_id: i64, status: SubscriberStatus) -> Result<String> {
        self.service.set_subscriber_status(chat_id, status).await?;
        Ok(match status {
            SubscriberStatus::Active => "notifications on".to_string(),
            _ => "notifications off".to_string(),
        })
    }
}
