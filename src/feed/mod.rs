mod fetcher;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{FeedItem, FeedSource};

pub use fetcher::{parse_items, FeedFetcher};

/// Retrieves the current items of one source.
///
/// Any transport, status, parse or timeout failure is an error; `Ok` with an
/// empty list means the feed really had no items.
#[async_trait]
pub trait FeedFetch: Send + Sync {
    async fn fetch(&self, source: &FeedSource, timeout: Duration) -> Result<Vec<FeedItem>>;
}
