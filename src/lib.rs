//! Feed polling and keyword notification pipeline.
//!
//! Sources are polled by [`scheduler::Scheduler`] with an adaptive interval,
//! new items are matched against each subscriber's keyword rules by
//! [`dispatch::Dispatcher`], and hits are delivered through a rate-limited
//! [`notify::NotificationQueue`]. [`service::FeedService`] ties it together.

pub mod commands;
pub mod config;
pub mod db;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod matcher;
pub mod models;
pub mod notify;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod subscriptions;

pub use error::{AppError, Result};
