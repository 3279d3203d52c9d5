use std::time::Duration;

use async_trait::async_trait;
use feed_rs::parser;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{FeedItem, FeedSource};

use super::FeedFetch;

const FEED_USER_AGENT: &str = "feed-notifier/1.0";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub struct FeedFetcher {
    client: Client,
    browser: Client,
    impersonate_hosts: Vec<String>,
}

impl FeedFetcher {
    /// `impersonate_hosts` are fetched with browser-like headers and a cookie jar,
    /// for sites that turn away plain feed readers.
    pub fn new(impersonate_hosts: Vec<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(FEED_USER_AGENT)
            .build()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
        let browser = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(headers)
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            browser,
            impersonate_hosts: impersonate_hosts
                .into_iter()
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        })
    }

    fn wants_browser(&self, url: &str) -> bool {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_lowercase)) else {
            return false;
        };
        self.impersonate_hosts
            .iter()
            .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
    }

    async fn fetch_items(&self, source: &FeedSource) -> Result<Vec<FeedItem>> {
        let client = if self.wants_browser(&source.url) {
            &self.browser
        } else {
            &self.client
        };

        let response = client.get(&source.url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::FetchStatus {
                feed_id: source.id.clone(),
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        parse_items(&bytes)
    }
}

#[async_trait]
impl FeedFetch for FeedFetcher {
    async fn fetch(&self, source: &FeedSource, timeout: Duration) -> Result<Vec<FeedItem>> {
        match tokio::time::timeout(timeout, self.fetch_items(source)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::FetchTimeout {
                feed_id: source.id.clone(),
                timeout,
            }),
        }
    }
}

/// Parses an RSS/Atom document into items.
pub fn parse_items(bytes: &[u8]) -> Result<Vec<FeedItem>> {
    let feed = parser::parse(bytes)?;

    Ok(feed
        .entries
        .into_iter()
        .map(|entry| FeedItem {
            title: entry
                .title
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default(),
            url: entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default(),
            published_at: entry.published.or(entry.updated),
        })
        .collect())
}
