use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::commands::UpdateSource;
use crate::error::{AppError, Result};
use crate::models::{ChatKind, InboundEvent};

use super::Notifier;

const API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_SECS: u64 = 25;

fn bot_base(base: &str, token: &str) -> Result<String> {
    if token.trim().is_empty() {
        return Err(AppError::config("bot_token is empty"));
    }
    Ok(format!("{}/bot{}", base.trim_end_matches('/'), token.trim()))
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
}

impl TelegramNotifier {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_api_base(API_BASE, token)
    }

    pub fn with_api_base(base: &str, token: &str) -> Result<Self> {
        let bot = bot_base(base, token)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{bot}/sendMessage"),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, chat_id: i64, text: &str) -> Result<i64> {
        let body = SendMessageRequest {
            chat_id,
            text,
            parse_mode: "MarkdownV2",
            disable_web_page_preview: false,
        };

        let response: ApiResponse<SentMessage> = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            return Err(AppError::notifier(
                response
                    .description
                    .unwrap_or_else(|| "sendMessage failed".to_string()),
            ));
        }

        response
            .result
            .map(|m| m.message_id)
            .ok_or_else(|| AppError::notifier("sendMessage returned no message"))
    }
}

#[derive(Serialize)]
struct GetUpdatesRequest {
    offset: i64,
    timeout: u64,
    allowed_updates: &'static [&'static str],
}

#[derive(Serialize)]
struct AnswerCallbackRequest<'a> {
    callback_query_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
    channel_post: Option<Message>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    title: Option<String>,
    username: Option<String>,
    first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    username: Option<String>,
    first_name: String,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    from: User,
    message: Option<Message>,
    data: Option<String>,
}

impl Chat {
    fn kind(&self) -> ChatKind {
        match self.kind.as_str() {
            "channel" => ChatKind::Channel,
            "group" | "supergroup" => ChatKind::Group,
            _ => ChatKind::Direct,
        }
    }

    fn name(&self) -> String {
        self.title
            .as_ref()
            .or(self.username.as_ref())
            .or(self.first_name.as_ref())
            .cloned()
            .unwrap_or_default()
    }
}

impl Update {
    /// Text messages and button presses; everything else is skipped.
    fn into_event(self) -> Option<InboundEvent> {
        if let Some(query) = self.callback_query {
            let chat_id = query.message.as_ref().map_or(query.from.id, |m| m.chat.id);
            return Some(InboundEvent::Callback {
                chat_id,
                from: query.from.username.unwrap_or(query.from.first_name),
                data: query.data?,
            });
        }

        let message = self.message.or(self.channel_post)?;
        let text = message.text?;
        Some(InboundEvent::Message {
            kind: message.chat.kind(),
            chat_id: message.chat.id,
            name: message.chat.name(),
            text,
        })
    }
}

/// Long-polls `getUpdates`, acknowledging each batch through the offset.
pub struct TelegramUpdates {
    client: Client,
    bot: String,
    offset: i64,
}

impl TelegramUpdates {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_api_base(API_BASE, token)
    }

    pub fn with_api_base(base: &str, token: &str) -> Result<Self> {
        let bot = bot_base(base, token)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 10))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, bot, offset: 0 })
    }

    async fn answer_callback(&self, id: &str) {
        let result = self
            .client
            .post(format!("{}/answerCallbackQuery", self.bot))
            .json(&AnswerCallbackRequest { callback_query_id: id })
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(error = %e, "answerCallbackQuery failed");
        }
    }
}

#[async_trait]
impl UpdateSource for TelegramUpdates {
    async fn next_events(&mut self) -> Result<Vec<InboundEvent>> {
        let request = GetUpdatesRequest {
            offset: self.offset,
            timeout: LONG_POLL_SECS,
            allowed_updates: &["message", "channel_post", "callback_query"],
        };
        let response: ApiResponse<Vec<Update>> = self
            .client
            .post(format!("{}/getUpdates", self.bot))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        if !response.ok {
            return Err(AppError::notifier(
                response.description.unwrap_or_else(|| "getUpdates failed".to_string()),
            ));
        }

        let updates = response.result.unwrap_or_default();
        if let Some(last) = updates.iter().map(|u| u.update_id).max() {
            self.offset = last + 1;
        }

        let mut events = Vec::with_capacity(updates.len());
        for update in updates {
            if let Some(query) = &update.callback_query {
                self.answer_callback(&query.id).await;
            }
            events.extend(update.into_event());
        }
        Ok(events)
    }
}
