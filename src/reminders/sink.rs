//! Notification sinks: where delivered reminders go.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use super::model::Notification;
use crate::error::DeliveryError;

/// Platform notification surface. Pure I/O, no scheduling logic.
///
/// The delivery agent decides *when* to notify; the sink only renders.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Sink name (e.g. "log", "channel").
    fn name(&self) -> &str;

    /// Show one notification to the user.
    async fn notify(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Writes each notification to the log. Used when no platform sink is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, notification: &Notification) -> Result<(), DeliveryError> {
        info!(
            user_id = %notification.user_id,
            reminder_id = %notification.reminder_id,
            tag = %notification.payload.tag,
            route = %notification.route(),
            "🔔 {}: {}",
            notification.payload.title,
            notification.payload.body
        );
        Ok(())
    }
}

/// Forwards notifications to a host-side consumer over an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Notification>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    /// Create a sink with its receiving end.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn notify(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.tx
            .send(notification.clone())
            .await
            .map_err(|_| DeliveryError::SinkUnavailable {
                reason: "notification consumer has gone away".to_string(),
            })
    }
}
