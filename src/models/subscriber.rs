use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubscriberStatus {
    #[default]
    Active,
    Paused,
    Quit,
}

impl SubscriberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "on",
            Self::Paused => "off",
            Self::Quit => "quit",
        }
    }

    /// Stored values are lenient: blank counts as active, unknown values as paused.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "" | "on" | "active" => Self::Active,
            "quit" => Self::Quit,
            _ => Self::Paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub chat_id: i64,
    pub name: String,
    pub status: SubscriberStatus,
    pub created_at: DateTime<Utc>,
}

impl Subscriber {
    pub fn is_active(&self) -> bool {
        self.status == SubscriberStatus::Active
    }
}

/// Keyword rules of one chat for one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub chat_id: i64,
    pub feed_id: String,
    pub keywords: Vec<String>,
}

impl Subscription {
    /// Appends rules not already present, keeping first-seen order.
    pub fn add_keywords<I, S>(&mut self, keywords: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let before = self.keywords.len();
        for keyword in keywords {
            let keyword = keyword.as_ref().trim();
            if keyword.is_empty() || self.keywords.iter().any(|k| k == keyword) {
                continue;
            }
            self.keywords.push(keyword.to_string());
        }
        self.keywords.len() - before
    }

    pub fn remove_keywords<I, S>(&mut self, keywords: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let before = self.keywords.len();
        let doomed: Vec<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .collect();
        self.keywords.retain(|k| !doomed.contains(k));
        before - self.keywords.len()
    }
}
