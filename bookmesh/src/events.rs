//! Fire-and-forget domain events.
//!
//! Events travel on the same connection as RPC traffic but expect no reply.
//! Delivery is only as durable as the broker: there is no outbox and no
//! retry once the publish buffer has drained or the drain wait has lapsed.

use futures_util::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{
    ConsumeOptions, DeliveryStream, ExchangeKind, MessageProperties, PublishStatus, QueueOptions,
};
use crate::connection::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::message::DomainEvent;

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventOptions {
    /// Ask the broker to write the message to disk
    pub persistent: bool,
}

impl Default for EventOptions {
    fn default() -> Self {
        Self { persistent: true }
    }
}

#[derive(Debug, Default)]
struct EventCounters {
    published: AtomicU64,
    drain_waits: AtomicU64,
    drain_timeouts: AtomicU64,
}

/// Publishes domain events to named exchanges
#[derive(Clone)]
pub struct EventPublisher {
    connection: Arc<ConnectionManager>,
    drain_timeout: Duration,
    counters: Arc<EventCounters>,
}

impl EventPublisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            counters: Arc::new(EventCounters::default()),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Declare `exchange` and publish `payload` as a [`DomainEvent`] tagged
    /// with `routing_key`.
    ///
    /// When the broker reports back-pressure this waits once for the buffer
    /// to drain, for at most the drain timeout. Running out of time is logged
    /// and the call still succeeds.
    pub async fn publish_event(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        routing_key: &str,
        payload: impl Serialize,
        options: EventOptions,
    ) -> Result<()> {
        let event = DomainEvent::new(routing_key, payload)?;
        let body = event.to_bytes()?;

        let channel = self.connection.channel().await?;
        channel
            .declare_exchange(exchange, kind, true)
            .await
            .map_err(|e| BridgeError::publish_error(exchange, e))?;

        let properties = MessageProperties::json().with_persistent(options.persistent);
        let status = channel
            .publish(exchange, routing_key, body, properties)
            .await
            .map_err(|e| match e {
                BridgeError::Publish { .. } => e,
                other => BridgeError::publish_error(exchange, other),
            })?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        if let PublishStatus::Buffered(signal) = status {
            self.counters.drain_waits.fetch_add(1, Ordering::Relaxed);
            debug!("Publish to {} buffered, waiting for drain signal", exchange);
            match tokio::time::timeout(self.drain_timeout, signal.drained()).await {
                Ok(result) => result?,
                Err(_) => {
                    self.counters.drain_timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Publish buffer for {} did not drain within {}ms; event {} left to the broker",
                        exchange,
                        self.drain_timeout.as_millis(),
                        routing_key
                    );
                }
            }
        }

        info!("Published event {} to {}", routing_key, exchange);
        Ok(())
    }

    /// Bind `queue` to `exchange` and start receiving its events.
    ///
    /// An empty `queue` gets a broker-named exclusive queue that disappears
    /// with the subscriber.
    pub async fn subscribe(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        binding_key: &str,
    ) -> Result<EventSubscription> {
        let channel = self.connection.channel().await?;
        channel.declare_exchange(exchange, kind, true).await?;

        let options = if queue.is_empty() {
            QueueOptions::reply()
        } else {
            QueueOptions::operation(true)
        };
        let queue = channel.declare_queue(queue, options).await?;
        channel.bind_queue(&queue, exchange, binding_key).await?;

        let consumer_tag = format!("{}-events-{}", queue, Uuid::new_v4());
        let deliveries = channel
            .consume(&queue, &consumer_tag, ConsumeOptions::auto_ack())
            .await?;

        info!(
            "Subscribed {} to {} with binding key '{}'",
            queue, exchange, binding_key
        );
        Ok(EventSubscription { queue, deliveries })
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            published: self.counters.published.load(Ordering::Relaxed),
            drain_waits: self.counters.drain_waits.load(Ordering::Relaxed),
            drain_timeouts: self.counters.drain_timeouts.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStats {
    pub published: u64,
    /// Publishes that waited for a drain signal. Over AMQP with publisher
    /// confirms this is every publish, since the confirm is the signal.
    pub drain_waits: u64,
    pub drain_timeouts: u64,
}

/// A queue bound to an exchange, yielding decoded events
pub struct EventSubscription {
    queue: String,
    deliveries: DeliveryStream,
}

impl EventSubscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next event, or `None` once the consumer is gone
    pub async fn next_event(&mut self) -> Option<Result<DomainEvent>> {
        let delivery = self.deliveries.next().await?;
        Some(delivery.and_then(|d| DomainEvent::from_bytes(&d.data)))
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::naming::exchange_name;
    use serde_json::json;

    async fn publisher(broker: &MemoryBroker) -> EventPublisher {
        let connection = Arc::new(ConnectionManager::in_memory(broker.clone()));
        connection.connect().await.unwrap();
        EventPublisher::new(connection)
    }

    async fn next(subscription: &mut EventSubscription) -> DomainEvent {
        tokio::time::timeout(Duration::from_secs(1), subscription.next_event())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_bound_queue() {
        let broker = MemoryBroker::new();
        let events = publisher(&broker).await;
        let exchange = exchange_name("doctor");

        let mut notifications = events
            .subscribe(&exchange, ExchangeKind::Fanout, "notification.doctor_events", "")
            .await
            .unwrap();
        let mut search = events
            .subscribe(&exchange, ExchangeKind::Fanout, "search.doctor_events", "")
            .await
            .unwrap();

        let channel = events.connection.channel().await.unwrap();
        channel
            .declare_queue("audit.unbound", QueueOptions::operation(true))
            .await
            .unwrap();

        events
            .publish_event(
                &exchange,
                ExchangeKind::Fanout,
                "doctor.registered",
                json!({ "doctorId": "D1" }),
                EventOptions::default(),
            )
            .await
            .unwrap();

        for subscription in [&mut notifications, &mut search] {
            let event = next(subscription).await;
            assert_eq!(event.event, "doctor.registered");
            assert_eq!(event.payload.get("doctorId"), Some(&json!("D1")));
        }

        assert_eq!(broker.queue_stats("notification.doctor_events").unwrap().published, 1);
        assert_eq!(broker.queue_stats("search.doctor_events").unwrap().published, 1);
        assert_eq!(broker.queue_stats("audit.unbound").unwrap().published, 0);
        assert_eq!(events.stats().published, 1);
    }

    #[tokio::test]
    async fn test_topic_routing_by_binding_key() {
        let broker = MemoryBroker::new();
        let events = publisher(&broker).await;
        let exchange = exchange_name("appointment");

        let mut created = events
            .subscribe(&exchange, ExchangeKind::Topic, "", "appointment.created")
            .await
            .unwrap();
        let mut everything = events
            .subscribe(&exchange, ExchangeKind::Topic, "", "appointment.#")
            .await
            .unwrap();

        for key in ["appointment.cancelled", "appointment.created"] {
            events
                .publish_event(
                    &exchange,
                    ExchangeKind::Topic,
                    key,
                    json!({ "appointmentId": "A1" }),
                    EventOptions { persistent: false },
                )
                .await
                .unwrap();
        }

        assert_eq!(next(&mut created).await.event, "appointment.created");
        assert_eq!(next(&mut everything).await.event, "appointment.cancelled");
        assert_eq!(next(&mut everything).await.event, "appointment.created");
        assert_eq!(broker.queue_stats(created.queue()).unwrap().published, 1);
    }

    #[tokio::test]
    async fn test_undrained_buffer_still_succeeds() {
        let broker = MemoryBroker::with_queue_capacity(1);
        let events = publisher(&broker)
            .await
            .with_drain_timeout(Duration::from_millis(100));
        let exchange = exchange_name("rating");

        let channel = events.connection.channel().await.unwrap();
        channel
            .declare_exchange(&exchange, ExchangeKind::Fanout, true)
            .await
            .unwrap();
        channel
            .declare_queue("doctor.rating_events", QueueOptions::operation(true))
            .await
            .unwrap();
        channel
            .bind_queue("doctor.rating_events", &exchange, "")
            .await
            .unwrap();

        let started = std::time::Instant::now();
        events
            .publish_event(
                &exchange,
                ExchangeKind::Fanout,
                "rating.created",
                json!({ "stars": 5 }),
                EventOptions::default(),
            )
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(100));
        let stats = events.stats();
        assert_eq!(stats.drain_waits, 1);
        assert_eq!(stats.drain_timeouts, 1);
        assert_eq!(broker.queue_stats("doctor.rating_events").unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_buffer_drains_when_consumer_attaches() {
        let broker = MemoryBroker::with_queue_capacity(1);
        let events = publisher(&broker).await;
        let exchange = exchange_name("user");

        let channel = events.connection.channel().await.unwrap();
        channel
            .declare_exchange(&exchange, ExchangeKind::Fanout, true)
            .await
            .unwrap();
        channel
            .declare_queue("notification.user_events", QueueOptions::operation(true))
            .await
            .unwrap();
        channel
            .bind_queue("notification.user_events", &exchange, "")
            .await
            .unwrap();

        let late_consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            channel
                .consume("notification.user_events", "late", ConsumeOptions::auto_ack())
                .await
                .unwrap()
        });

        events
            .publish_event(
                &exchange,
                ExchangeKind::Fanout,
                "user.registered",
                json!({ "userId": "U1" }),
                EventOptions::default(),
            )
            .await
            .unwrap();

        let _deliveries = late_consumer.await.unwrap();
        let stats = events.stats();
        assert_eq!(stats.drain_waits, 1);
        assert_eq!(stats.drain_timeouts, 0);
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let connection = Arc::new(ConnectionManager::in_memory(MemoryBroker::new()));
        let events = EventPublisher::new(connection);
        let result = events
            .publish_event(
                "doctor.exchange",
                ExchangeKind::Fanout,
                "doctor.registered",
                json!({}),
                EventOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(BridgeError::ChannelNotInitialized)));
    }

    #[tokio::test]
    async fn test_exchange_kind_conflict_is_publish_error() {
        let broker = MemoryBroker::new();
        let events = publisher(&broker).await;
        events
            .publish_event(
                "doctor.exchange",
                ExchangeKind::Fanout,
                "doctor.registered",
                json!({}),
                EventOptions::default(),
            )
            .await
            .unwrap();

        let result = events
            .publish_event(
                "doctor.exchange",
                ExchangeKind::Topic,
                "doctor.registered",
                json!({}),
                EventOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(BridgeError::Publish { .. })));
    }
}
