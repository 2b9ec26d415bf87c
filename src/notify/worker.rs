//! Background delivery of queued notifications

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{BotEvent, NotificationQueue, SinkMessage};
use crate::config::NotificationSettings;
use crate::errors::{BotError, BotResult};
use crate::market::RetryPolicy;

/// Where batches of events end up
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn deliver(&self, batch: &[BotEvent]) -> BotResult<()>;
}

#[derive(Serialize)]
struct EventBatch<'a> {
    events: &'a [BotEvent],
}

/// POSTs `{"events": [...]}` to an HTTP endpoint
pub struct HttpTransport {
    http: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout_secs: u64) -> BotResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn deliver(&self, batch: &[BotEvent]) -> BotResult<()> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&EventBatch { events: batch })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BotError::Notification(format!(
                "endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Drains the notification queue into a transport
pub struct NotificationWorker {
    queue: NotificationQueue,
    transport: Arc<dyn EventTransport>,
    batch_size: usize,
    flush_interval: Duration,
    retry: RetryPolicy,
    pending: Vec<BotEvent>,
}

impl NotificationWorker {
    pub fn new(
        queue: NotificationQueue,
        transport: Arc<dyn EventTransport>,
        settings: &NotificationSettings,
    ) -> Self {
        Self {
            queue,
            transport,
            batch_size: settings.batch_size.max(1),
            flush_interval: Duration::from_secs(settings.flush_interval_secs.max(1)),
            retry: RetryPolicy::new(settings.max_retries, settings.retry_base_delay_ms),
            pending: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.queue.recv() => match message {
                    Some(SinkMessage::Event(event)) => {
                        let urgent = event.kind.is_urgent();
                        self.pending.push(event);
                        if urgent || self.pending.len() >= self.batch_size {
                            self.deliver_pending().await;
                        }
                    }
                    Some(SinkMessage::Flush(done)) => {
                        self.deliver_pending().await;
                        let _ = done.send(());
                    }
                    Some(SinkMessage::Shutdown) | None => {
                        self.deliver_pending().await;
                        break;
                    }
                },
                _ = ticker.tick() => self.deliver_pending().await,
            }
        }

        info!("Notification worker stopped");
    }

    /// Deliver pending events in batches; a batch that exhausts its retries is dropped
    async fn deliver_pending(&mut self) {
        while !self.pending.is_empty() {
            let take = self.pending.len().min(self.batch_size);
            let batch: Vec<BotEvent> = self.pending.drain(..take).collect();
            let transport = &self.transport;

            match self
                .retry
                .run("notification delivery", || transport.deliver(&batch))
                .await
            {
                Ok(()) => debug!("Delivered {} events", batch.len()),
                Err(e) => warn!("Dropping {} events: {}", batch.len(), e),
            }
        }
    }
}

/// Spawn the worker on the current runtime
pub fn spawn_worker(
    queue: NotificationQueue,
    transport: Arc<dyn EventTransport>,
    settings: &NotificationSettings,
) -> JoinHandle<()> {
    tokio::spawn(NotificationWorker::new(queue, transport, settings).run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{EventKind, Notifier};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        batches: Mutex<Vec<Vec<BotEvent>>>,
        attempts: AtomicU32,
        always_fail: bool,
    }

    #[async_trait]
    impl EventTransport for RecordingTransport {
        async fn deliver(&self, batch: &[BotEvent]) -> BotResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.always_fail {
                return Err(BotError::Notification("endpoint down".into()));
            }
            self.batches.lock().await.push(batch.to_vec());
            Ok(())
        }
    }

    fn settings(batch_size: usize) -> NotificationSettings {
        NotificationSettings {
            endpoint: Some("http://localhost/events".into()),
            queue_capacity: 64,
            batch_size,
            flush_interval_secs: 3600,
            max_retries: 2,
            retry_base_delay_ms: 1,
            timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_flush_delivers_in_batches() {
        let transport = Arc::new(RecordingTransport::default());
        let (notifier, queue) = Notifier::channel("bot-1", 64);
        let handle = spawn_worker(queue, transport.clone(), &settings(2));

        for n in 0..5 {
            notifier.emit(EventKind::OrderPlaced, json!({ "n": n }));
        }
        notifier.flush().await;

        let sizes: Vec<usize> = transport.batches.lock().await.iter().map(Vec::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 5);
        assert!(sizes.iter().all(|s| *s <= 2));

        notifier.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_urgent_event_delivered_without_flush() {
        let transport = Arc::new(RecordingTransport::default());
        let (notifier, queue) = Notifier::channel("bot-1", 64);
        let handle = spawn_worker(queue, transport.clone(), &settings(20));

        notifier.emit(EventKind::BalanceLow, json!({ "token": "XPR" }));

        let mut delivered = false;
        for _ in 0..100 {
            if !transport.batches.lock().await.is_empty() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(delivered);

        notifier.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_batch_dropped_after_retries() {
        let transport = Arc::new(RecordingTransport {
            always_fail: true,
            ..RecordingTransport::default()
        });
        let (notifier, queue) = Notifier::channel("bot-1", 64);
        let handle = spawn_worker(queue, transport.clone(), &settings(20));

        notifier.emit(EventKind::OrderFilled, json!({}));
        notifier.flush().await;

        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
        assert!(transport.batches.lock().await.is_empty());

        notifier.shutdown().await;
        handle.await.unwrap();
    }
}
