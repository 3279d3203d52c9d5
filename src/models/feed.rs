use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// One entry of a fetched feed. Shared read-only between match workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Canonical item link used as the dedup key: the URL without its fragment.
///
/// Returns `None` for empty links. Links that do not parse as absolute URLs
/// are still accepted, with anything after `#` cut off.
pub fn normalize_item_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let normalized = match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.split('#').next().unwrap_or_default().to_string(),
    };

    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}
