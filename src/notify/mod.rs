//! Fire-and-forget lifecycle notifications
//!
//! Strategies call [`Notifier::emit`], which never blocks the trading loop: the
//! event goes into a bounded channel with `try_send` and is dropped (and
//! counted) when the channel is full. A background [`NotificationWorker`]
//! drains the channel and delivers batches to the configured endpoint.
//!
//! ```text
//!   strategy ──emit()──► [bounded queue] ──recv()──► worker ──POST──► endpoint
//!              try_send                     batch / timer / urgent
//! ```

mod worker;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::tracking::now_millis;

pub use worker::{spawn_worker, EventTransport, HttpTransport, NotificationWorker};

/// Lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    OrderFilled,
    OrderPlaced,
    OrderCancelled,
    BalanceLow,
    BotStarted,
    BotStopped,
    BotError,
    GridPlaced,
    GridAdjusted,
}

impl EventKind {
    /// Delivered immediately instead of waiting for a full batch or the timer
    pub fn is_urgent(&self) -> bool {
        matches!(self, EventKind::BalanceLow | EventKind::BotError | EventKind::BotStopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderFilled => "ORDER_FILLED",
            EventKind::OrderPlaced => "ORDER_PLACED",
            EventKind::OrderCancelled => "ORDER_CANCELLED",
            EventKind::BalanceLow => "BALANCE_LOW",
            EventKind::BotStarted => "BOT_STARTED",
            EventKind::BotStopped => "BOT_STOPPED",
            EventKind::BotError => "BOT_ERROR",
            EventKind::GridPlaced => "GRID_PLACED",
            EventKind::GridAdjusted => "GRID_ADJUSTED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub instance_id: String,
    /// ms since epoch
    pub timestamp: u64,
    pub payload: Value,
}

/// Messages carried by the notification channel
#[derive(Debug)]
pub(crate) enum SinkMessage {
    Event(BotEvent),
    /// Deliver everything received so far, then acknowledge
    Flush(oneshot::Sender<()>),
    /// Deliver everything received so far and stop
    Shutdown,
}

/// Receiving half of the notification channel
#[derive(Debug)]
pub struct NotificationQueue {
    receiver: mpsc::Receiver<SinkMessage>,
}

impl NotificationQueue {
    pub(crate) async fn recv(&mut self) -> Option<SinkMessage> {
        self.receiver.recv().await
    }

    /// Next queued event, if one is ready
    pub fn try_next_event(&mut self) -> Option<BotEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(SinkMessage::Event(event)) => return Some(event),
                Ok(SinkMessage::Flush(done)) => {
                    let _ = done.send(());
                }
                Ok(SinkMessage::Shutdown) => {}
                Err(_) => return None,
            }
        }
    }

    /// Every event currently queued
    pub fn drain_events(&mut self) -> Vec<BotEvent> {
        std::iter::from_fn(|| self.try_next_event()).collect()
    }
}

/// Cheap-to-clone handle used to emit events
#[derive(Debug, Clone)]
pub struct Notifier {
    instance_id: Arc<str>,
    sender: Option<mpsc::Sender<SinkMessage>>,
    dropped: Arc<AtomicU64>,
}

impl Notifier {
    /// Create a notifier and the queue its events land in
    pub fn channel(instance_id: &str, capacity: usize) -> (Self, NotificationQueue) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let notifier = Self {
            instance_id: Arc::from(instance_id),
            sender: Some(sender),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (notifier, NotificationQueue { receiver })
    }

    /// A notifier that only logs
    pub fn disabled(instance_id: &str) -> Self {
        Self {
            instance_id: Arc::from(instance_id),
            sender: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Events dropped because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue an event without waiting
    pub fn emit(&self, kind: EventKind, payload: Value) {
        debug!("event {}: {}", kind, payload);
        let Some(sender) = &self.sender else {
            return;
        };

        let event = BotEvent {
            id: Uuid::new_v4(),
            kind,
            instance_id: self.instance_id.to_string(),
            timestamp: now_millis(),
            payload,
        };
        match sender.try_send(SinkMessage::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Notification queue full, dropped {} event ({} total)", kind, dropped);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Notification worker stopped, {} event discarded", kind);
            }
        }
    }

    /// Wait until every event emitted so far has been handed to the transport
    pub async fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (done, acknowledged) = oneshot::channel();
        if sender.send(SinkMessage::Flush(done)).await.is_err() {
            return;
        }
        let _ = acknowledged.await;
    }

    /// Ask the worker to deliver what it has and exit
    pub async fn shutdown(&self) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(SinkMessage::Shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_wire_name() {
        assert_eq!(serde_json::to_value(EventKind::BalanceLow).unwrap(), json!("BALANCE_LOW"));
        assert_eq!(EventKind::GridAdjusted.to_string(), "GRID_ADJUSTED");
        assert!(EventKind::BotError.is_urgent());
        assert!(!EventKind::OrderFilled.is_urgent());
    }

    #[test]
    fn test_full_queue_drops_new_events() {
        let (notifier, mut queue) = Notifier::channel("bot-1", 2);

        notifier.emit(EventKind::OrderPlaced, json!({"n": 1}));
        notifier.emit(EventKind::OrderFilled, json!({"n": 2}));
        notifier.emit(EventKind::BotError, json!({"n": 3}));

        assert_eq!(notifier.dropped_count(), 1);
        let kinds: Vec<EventKind> = queue.drain_events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::OrderPlaced, EventKind::OrderFilled]);
    }

    #[test]
    fn test_event_carries_instance_id() {
        let (notifier, mut queue) = Notifier::channel("bot-7", 8);
        notifier.emit(EventKind::BotStarted, json!({}));

        let event = queue.try_next_event().unwrap();
        assert_eq!(event.instance_id, "bot-7");
        assert!(queue.try_next_event().is_none());
    }

    #[tokio::test]
    async fn test_disabled_notifier() {
        let notifier = Notifier::disabled("bot-1");
        notifier.emit(EventKind::BotStarted, json!({}));
        notifier.flush().await;
        assert!(!notifier.is_enabled());
        assert_eq!(notifier.dropped_count(), 0);
    }
}
