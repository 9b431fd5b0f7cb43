//! Broker channel abstraction.
//!
//! A [`BrokerChannel`] is the single handle a service uses to declare queues
//! and exchanges, publish, and consume. The AMQP backend wraps a `lapin`
//! channel; the in-memory backend gives the same routing semantics inside one
//! process so the bridge can be exercised without a running broker.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;

/// Content type stamped on every JSON body the bridge publishes
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// The AMQP default exchange, which routes by queue name
pub const DEFAULT_EXCHANGE: &str = "";

/// Shared channel handle
pub type SharedChannel = Arc<dyn BrokerChannel>;

/// Stream of deliveries from a consumer
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Queue declaration flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Private per-call reply queue: visible only to the declaring channel and
    /// removed once its consumer goes away.
    pub fn reply() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Well-known operation queue shared by every replica of a handler
    pub fn operation(durable: bool) -> Self {
        Self {
            durable,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Exchange routing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumer flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    /// Broker considers messages acknowledged on delivery
    pub no_ack: bool,
    pub exclusive: bool,
}

impl ConsumeOptions {
    pub fn manual_ack() -> Self {
        Self {
            no_ack: false,
            exclusive: false,
        }
    }

    pub fn auto_ack() -> Self {
        Self {
            no_ack: true,
            exclusive: false,
        }
    }
}

/// Broker-level message properties the bridge reads and writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    /// Delivery mode 2 when set
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Backend-specific acknowledgement of a single delivery
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Acknowledgement handle carried by a [`Delivery`].
///
/// Deliveries from an auto-ack consumer carry an empty acker; acking them is
/// a no-op.
pub struct Acker(Option<Box<dyn Acknowledge>>);

impl Acker {
    pub fn new(inner: impl Acknowledge + 'static) -> Self {
        Self(Some(Box::new(inner)))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub async fn ack(&self) -> Result<()> {
        match &self.0 {
            Some(inner) => inner.ack().await,
            None => Ok(()),
        }
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        match &self.0 {
            Some(inner) => inner.nack(requeue).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Acker")
            .field(&if self.0.is_some() { "manual" } else { "auto" })
            .finish()
    }
}

/// A message handed to a consumer
#[derive(Debug)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    pub acker: Acker,
}

/// Future resolving once the broker client has flushed its publish buffer
pub struct DrainSignal(Pin<Box<dyn Future<Output = Result<()>> + Send>>);

impl DrainSignal {
    pub fn new(fut: impl Future<Output = Result<()>> + Send + 'static) -> Self {
        Self(Box::pin(fut))
    }

    pub async fn drained(self) -> Result<()> {
        self.0.await
    }
}

impl fmt::Debug for DrainSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DrainSignal")
    }
}

/// Outcome of handing a message to the broker client
#[derive(Debug)]
pub enum PublishStatus {
    /// Accepted without back-pressure
    Flushed,
    /// Buffer is full; the signal fires once it drains
    Buffered(DrainSignal),
}

impl PublishStatus {
    pub fn is_buffered(&self) -> bool {
        matches!(self, Self::Buffered(_))
    }
}

/// The one channel a service process uses for all broker traffic.
///
/// Structural operations (`declare_*`, `bind_queue`) are idempotent;
/// `publish` may be called concurrently. Every operation fails with
/// [`BridgeError::ChannelClosed`](crate::BridgeError::ChannelClosed) once the
/// channel is gone.
#[async_trait]
pub trait BrokerChannel: Send + Sync + fmt::Debug {
    /// Declare a queue and return its name. An empty `name` asks the broker
    /// to generate a unique one.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishStatus>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream>;

    /// Cancel a consumer. Unknown tags are ignored.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}
