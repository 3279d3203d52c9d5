use chrono::{DateTime, FixedOffset, Utc};

use super::FeedItem;

/// A row of the dedup ledger: `url` was delivered to `chat_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRecord {
    pub chat_id: i64,
    pub url: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl NotifyRecord {
    pub fn new(chat_id: i64, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            chat_id,
            url: url.into(),
            title: title.into(),
            created_at: Utc::now(),
        }
    }
}

// Telegram MarkdownV2 reserved characters.
const MARKDOWN_RESERVED: &[char] = &[
    '\\', '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Escapes literal text for Telegram's MarkdownV2 parse mode.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 16);
    for c in text.chars() {
        if MARKDOWN_RESERVED.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// An outgoing message. `text` is MarkdownV2, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMessage {
    pub chat_id: i64,
    pub text: String,
}

impl NotifyMessage {
    /// A message showing `text` literally.
    pub fn new(chat_id: i64, text: impl AsRef<str>) -> Self {
        Self::markdown(chat_id, escape_markdown(text.as_ref()))
    }

    /// A message whose text is already MarkdownV2.
    pub fn markdown(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
        }
    }

    /// Formats a matched item with a bold title; `url` is the normalized link.
    pub fn for_item(chat_id: i64, item: &FeedItem, url: &str, offset: FixedOffset) -> Self {
        let published = item
            .published_at
            .map(|dt| dt.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());

        Self::markdown(
            chat_id,
            format!(
                "📢  *{}*\n\n🕐 {}\n\n👉 {}",
                escape_markdown(&item.title),
                escape_markdown(&published),
                escape_markdown(url)
            ),
        )
    }
}
