use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Error, Result};

pub const INITIATOR: &str = "proctoring.lifecycle";

/// Fan-out transport for lifecycle events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, message: &JsonValue) -> Result<()>;
}

/// POSTs each event to a webhook, signed the same way as inbound callbacks.
pub struct WebhookPublisher {
    client: Client,
    target_url: String,
    secret: String,
}

impl WebhookPublisher {
    pub fn new(target_url: String, secret: String) -> Self {
        Self {
            client: Client::new(),
            target_url,
            secret,
        }
    }
}

#[async_trait]
impl EventPublisher for WebhookPublisher {
    async fn publish(&self, message: &JsonValue) -> Result<()> {
        let resp = self
            .client
            .post(&self.target_url)
            .header("X-Webhook-Secret", &self.secret)
            .timeout(Duration::from_secs(10))
            .json(message)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Internal(format!(
                "webhook responded with {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// In-process fan-out. Events sent while nobody listens are dropped.
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<JsonValue>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JsonValue> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, message: &JsonValue) -> Result<()> {
        if self.sender.send(message.clone()).is_err() {
            tracing::debug!("no broadcast subscribers for lifecycle event");
        }
        Ok(())
    }
}

/// Bounded retry: the first retry is immediate, each later one waits
/// `interval_step` longer, never more than `interval_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval_start: Duration,
    pub interval_step: Duration,
    pub interval_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval_start: Duration::ZERO,
            interval_step: Duration::from_secs(2),
            interval_max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            interval_start: Duration::ZERO,
            interval_step: Duration::ZERO,
            interval_max: Duration::ZERO,
        }
    }

    /// Delay before retry `n` (1-based).
    pub fn delay_before_retry(&self, n: u32) -> Duration {
        let step = self.interval_step * n.saturating_sub(1);
        (self.interval_start + step).min(self.interval_max)
    }
}

#[derive(Clone)]
pub struct NotificationService {
    publisher: Arc<dyn EventPublisher>,
    subscribers: HashSet<String>,
    retry: RetryPolicy,
}

impl NotificationService {
    pub fn new(publisher: Arc<dyn EventPublisher>, subscribers: HashSet<String>) -> Self {
        Self {
            publisher,
            subscribers,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Publishes `event` enriched with `initiator`, `created` and a unique
    /// `event_id` consumers can dedupe redeliveries on. When
    /// `provider_name` is given and is not a known subscriber the call is a no-op.
    pub async fn publish(
        &self,
        mut event: Map<String, JsonValue>,
        provider_name: Option<&str>,
    ) -> Result<()> {
        if let Some(provider) = provider_name {
            if !self.subscribers.contains(provider) {
                tracing::debug!(provider, "provider is not a notification subscriber");
                return Ok(());
            }
        }

        event.insert("event_id".into(), Uuid::new_v4().to_string().into());
        event.insert("initiator".into(), INITIATOR.into());
        event.insert("created".into(), serde_json::to_value(Utc::now())?);
        let message = JsonValue::Object(event);
        tracing::info!(event = %message, "publishing notification");

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                let delay = self.retry.delay_before_retry(attempt - 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            match self.publisher.publish(&message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "notification publish failed");
                    last_error = e.to_string();
                }
            }
        }

        tracing::error!(
            attempts = self.retry.max_attempts,
            "notification retries exhausted"
        );
        Err(Error::NotificationDeliveryFailed {
            attempts: self.retry.max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event() -> Map<String, JsonValue> {
        let mut map = Map::new();
        map.insert("event_type".into(), json!("credit_status_update"));
        map
    }

    fn subscribers() -> HashSet<String> {
        HashSet::from(["WEB_ASSISTANT".to_string()])
    }

    #[test]
    fn retry_delays_grow_by_two_seconds_and_cap_at_five() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay_before_retry(n).as_secs())
            .collect();
        assert_eq!(delays, vec![0, 2, 4, 5, 5]);
    }

    #[tokio::test]
    async fn enriches_event_before_publishing() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|msg| {
                msg["initiator"] == json!(INITIATOR)
                    && msg.get("created").is_some()
                    && msg["event_id"].is_string()
                    && msg["event_type"] == json!("credit_status_update")
            })
            .times(1)
            .returning(|_| Ok(()));

        let service = NotificationService::new(Arc::new(publisher), subscribers());
        service.publish(event(), None).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_provider_is_a_silent_no_op() {
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish().times(0);

        let service = NotificationService::new(Arc::new(publisher), subscribers());
        service.publish(event(), Some("software_secure")).await.unwrap();
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut publisher = MockEventPublisher::new();
        publisher.expect_publish().times(3).returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Internal("broker unavailable".into()))
            } else {
                Ok(())
            }
        });

        let service = NotificationService::new(Arc::new(publisher), subscribers())
            .with_retry(RetryPolicy::immediate(10));
        service
            .publish(event(), Some("WEB_ASSISTANT"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_delivery_failure() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .times(10)
            .returning(|_| Err(Error::Internal("broker unavailable".into())));

        let service = NotificationService::new(Arc::new(publisher), subscribers())
            .with_retry(RetryPolicy::immediate(10));
        let err = service.publish(event(), None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::NotificationDeliveryFailed { attempts: 10, .. }
        ));
    }

    #[tokio::test]
    async fn broadcast_publisher_fans_out() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();
        publisher.publish(&json!({"k": 1})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!({"k": 1}));
    }
}
