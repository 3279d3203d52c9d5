mod event;
mod feed;
mod notify;
mod subscriber;

pub use event::{ChatKind, InboundEvent};
pub use feed::{normalize_item_url, FeedItem, FeedSource};
pub use notify::{escape_markdown, NotifyMessage, NotifyRecord};
pub use subscriber::{Subscriber, SubscriberStatus, Subscription};
