//! Rate-limited delivery path to the notifier.
//!
//! Producers never block: a full buffer drops the message. A single consumer
//! sends at most `rate_per_sec` messages per second and idles on an empty
//! buffer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{AppError, Result};
use crate::models::NotifyMessage;
use crate::shutdown::ShutdownSignal;

use super::Notifier;

#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<NotifyMessage>,
}

pub struct QueueConsumer {
    rx: mpsc::Receiver<NotifyMessage>,
    notifier: Arc<dyn Notifier>,
    spacing: Duration,
}

impl NotificationQueue {
    pub fn new(capacity: usize, notifier: Arc<dyn Notifier>, rate_per_sec: u32) -> (Self, QueueConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let spacing = Duration::from_secs(1) / rate_per_sec.max(1);
        (
            Self { tx },
            QueueConsumer {
                rx,
                notifier,
                spacing,
            },
        )
    }

    pub fn enqueue(&self, message: NotifyMessage) -> Result<()> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                tracing::warn!(chat_id = message.chat_id, "notification queue full, dropping message");
                Err(AppError::QueueFull {
                    chat_id: message.chat_id,
                })
            }
            Err(TrySendError::Closed(message)) => {
                tracing::warn!(chat_id = message.chat_id, "notification queue closed, dropping message");
                Err(AppError::notifier("notification queue is closed"))
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

impl QueueConsumer {
    pub fn spawn(self, stop: ShutdownSignal) -> JoinHandle<usize> {
        tokio::spawn(self.run(stop))
    }

    /// Delivers until `stop` fires or every producer is gone, then flushes
    /// what is still buffered. Returns the number of messages sent.
    pub async fn run(mut self, mut stop: ShutdownSignal) -> usize {
        let mut pacer = tokio::time::interval(self.spacing);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0;

        loop {
            let message = tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => message,
                    None => return sent,
                },
                _ = stop.triggered() => break,
            };
            pacer.tick().await;
            sent += self.deliver(message).await;
        }

        self.rx.close();
        let mut flushed = 0;
        while let Some(message) = self.rx.recv().await {
            pacer.tick().await;
            flushed += self.deliver(message).await;
        }
        if flushed > 0 {
            tracing::info!(flushed, "flushed notification queue");
        }
        sent + flushed
    }

    async fn deliver(&self, message: NotifyMessage) -> usize {
        match self.notifier.send(message.chat_id, &message.text).await {
            Ok(message_id) => {
                tracing::debug!(chat_id = message.chat_id, message_id, "notification sent");
                1
            }
            Err(e) => {
                tracing::error!(chat_id = message.chat_id, error = %e, "failed to send notification");
                0
            }
        }
    }
}
