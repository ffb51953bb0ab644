//! Realtime events and user notifications.
//!
//! Both are fire-and-forget from the engine's point of view: they run after
//! the commit and their failures are counted and logged, never returned.
//!
//! # Topics
//!
//! - `host:{host_id}:{session_type}` - channel and waitlist updates
//! - `notifications` - notification requests for the notification dispatcher

use crate::errors::ScError;
use crate::models::SessionType;
use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

pub const EVENT_WAITLIST_UPDATED: &str = "waitlist.updated";
pub const EVENT_CHANNEL_UPDATED: &str = "channel.updated";
pub const EVENT_BALANCE_LOW: &str = "balance.low";
pub const EVENT_WAITTIME_UPDATED: &str = "waittime.updated";

const NOTIFICATION_TOPIC: &str = "notifications";

#[must_use]
pub fn channel_topic(host_id: &str, session_type: SessionType) -> String {
    format!("host:{host_id}:{session_type}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ChannelStarted,
    ChannelEnded,
    SessionRequested,
    SessionAccepted,
    SessionRejected,
    SessionEnded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub recipient_id: String,
    pub host_id: String,
    pub session_type: SessionType,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    event: &'a str,
    payload: &'a Value,
}

/// Realtime pub/sub (enables mocking).
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, event: &str, payload: &Value) -> Result<(), ScError>;
}

/// Notification dispatch (enables mocking).
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), ScError>;
}

/// Redis PUBLISH-backed events and notifications.
#[derive(Clone)]
pub struct RedisEventBus {
    connection: MultiplexedConnection,
}

impl RedisEventBus {
    #[must_use]
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    async fn publish_raw(&self, topic: &str, message: String) -> Result<(), ScError> {
        let mut conn = self.connection.clone();
        let receivers: i64 = conn.publish(topic, message).await.map_err(|e| {
            warn!(target: "sc.services.events", error = %e, topic = %topic, "Publish failed");
            ScError::from(e)
        })?;
        debug!(target: "sc.services.events", topic = %topic, receivers, "Published");
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventPublisher for RedisEventBus {
    #[instrument(skip_all, fields(topic = %topic, event = %event))]
    async fn publish(&self, topic: &str, event: &str, payload: &Value) -> Result<(), ScError> {
        let message = serde_json::to_string(&Envelope { event, payload })?;
        self.publish_raw(topic, message).await
    }
}

#[async_trait::async_trait]
impl Notifier for RedisEventBus {
    #[instrument(skip_all, fields(kind = ?notification.kind))]
    async fn notify(&self, notification: &Notification) -> Result<(), ScError> {
        let message = serde_json::to_string(notification)?;
        self.publish_raw(NOTIFICATION_TOPIC, message).await
    }
}

/// Events and notifications that are only logged.
///
/// Used with the in-memory store backend, where no Redis is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyEventBus;

#[async_trait::async_trait]
impl EventPublisher for LogOnlyEventBus {
    async fn publish(&self, topic: &str, event: &str, _payload: &Value) -> Result<(), ScError> {
        info!(target: "sc.services.events", topic = %topic, event = %event, "Event (not delivered)");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Notifier for LogOnlyEventBus {
    async fn notify(&self, notification: &Notification) -> Result<(), ScError> {
        info!(
            target: "sc.services.events",
            kind = ?notification.kind,
            recipient_id = %notification.recipient_id,
            "Notification (not delivered)"
        );
        Ok(())
    }
}

/// Recording publisher and notifier for tests.
pub mod mock {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub struct PublishedEvent {
        pub topic: String,
        pub event: String,
        pub payload: Value,
    }

    #[derive(Default)]
    pub struct MockEventBus {
        events: Mutex<Vec<PublishedEvent>>,
        notifications: Mutex<Vec<Notification>>,
    }

    impl MockEventBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events(&self) -> Vec<PublishedEvent> {
            self.events.lock().await.clone()
        }

        /// Events with the given name, in publish order.
        pub async fn events_named(&self, event: &str) -> Vec<PublishedEvent> {
            self.events
                .lock()
                .await
                .iter()
                .filter(|e| e.event == event)
                .cloned()
                .collect()
        }

        pub async fn notifications(&self) -> Vec<Notification> {
            self.notifications.lock().await.clone()
        }
    }

    #[async_trait::async_trait]
    impl EventPublisher for MockEventBus {
        async fn publish(&self, topic: &str, event: &str, payload: &Value) -> Result<(), ScError> {
            self.events.lock().await.push(PublishedEvent {
                topic: topic.to_string(),
                event: event.to_string(),
                payload: payload.clone(),
            });
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Notifier for MockEventBus {
        async fn notify(&self, notification: &Notification) -> Result<(), ScError> {
            self.notifications.lock().await.push(notification.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_topic() {
        assert_eq!(channel_topic("h1", SessionType::Call), "host:h1:call");
    }

    #[test]
    fn test_envelope_shape() {
        let payload = serde_json::json!({"count": 2});
        let json = serde_json::to_value(Envelope {
            event: EVENT_WAITLIST_UPDATED,
            payload: &payload,
        })
        .unwrap();
        assert_eq!(json["event"], "waitlist.updated");
        assert_eq!(json["payload"]["count"], 2);
    }

    #[tokio::test]
    async fn test_mock_filters_by_name() {
        let bus = mock::MockEventBus::new();
        bus.publish("t", EVENT_BALANCE_LOW, &Value::Null).await.unwrap();
        bus.publish("t", EVENT_WAITLIST_UPDATED, &Value::Null)
            .await
            .unwrap();
        assert_eq!(bus.events_named(EVENT_BALANCE_LOW).await.len(), 1);
        assert_eq!(bus.events().await.len(), 2);
    }
}
