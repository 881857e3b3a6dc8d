use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::AppResult;

/// A named notification, e.g. `assignments:linked`, with its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Fire-and-forget side channel used by the planning services.
///
/// `notify` must never block nor fail the calling operation.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, event: &str, payload: serde_json::Value);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotificationSink;

impl NotificationSink for NoopNotificationSink {
    fn notify(&self, event: &str, _payload: serde_json::Value) {
        tracing::trace!("Dropping notification {}", event);
    }
}

/// Sink that pushes onto an unbounded channel drained by [`run_dispatcher`].
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotificationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotificationSink {
    fn notify(&self, event: &str, payload: serde_json::Value) {
        let notification = Notification {
            event: event.to_string(),
            payload,
        };
        if self.tx.send(notification).is_err() {
            tracing::warn!("Notification dispatcher is gone; dropping {}", event);
        }
    }
}

/// Outbound delivery of a notification to the platform's push channel.
#[async_trait]
pub trait NotificationTransport: Send + Sync + 'static {
    async fn send(&self, notification: &Notification) -> AppResult<()>;
}

/// Transport that only writes the notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(&self, notification: &Notification) -> AppResult<()> {
        tracing::info!(
            event = %notification.event,
            payload = %notification.payload,
            "Notification"
        );
        Ok(())
    }
}

/// Drain `rx` and hand each notification to `transport` until shutdown or
/// until every sender is dropped. A failed send is logged and dropped.
pub async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    transport: Arc<dyn NotificationTransport>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Notification dispatcher shutting down");
                break;
            }
            next = rx.recv() => {
                let Some(notification) = next else {
                    tracing::info!("Notification channel closed");
                    break;
                };
                if let Err(e) = transport.send(&notification).await {
                    tracing::warn!("Failed to send notification {}: {:?}", notification.event, e);
                }
            }
        }
    }
}

/// Sink keeping every notification in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    sent: std::sync::Mutex<Vec<Notification>>,
}

#[cfg(test)]
impl RecordingNotificationSink {
    pub fn events(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.event.clone())
            .collect()
    }

    pub fn last(&self, event: &str) -> Option<Notification> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|n| n.event == event)
            .cloned()
    }
}

#[cfg(test)]
impl NotificationSink for RecordingNotificationSink {
    fn notify(&self, event: &str, payload: serde_json::Value) {
        self.sent.lock().unwrap().push(Notification {
            event: event.to_string(),
            payload,
        });
    }
}
