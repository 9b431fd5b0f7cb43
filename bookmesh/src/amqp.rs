//! AMQP backend built on `lapin`.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::*,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::{
    Acker, Acknowledge, BrokerChannel, ConsumeOptions, Delivery, DeliveryStream, DrainSignal,
    ExchangeKind, MessageProperties, PublishStatus, QueueOptions,
};
use crate::connection::ConnectionConfig;
use crate::error::{BridgeError, Result};

/// Open one AMQP connection, bounded by the configured connect timeout
pub(crate) async fn open_connection(config: &ConnectionConfig, name: &str) -> Result<Connection> {
    debug!("Attempting to connect to {}", config.display_url());

    let connect = Connection::connect(
        &config.url,
        ConnectionProperties::default().with_connection_name(name.to_string().into()),
    );

    match tokio::time::timeout(Duration::from_millis(config.connection_timeout_ms), connect).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(BridgeError::internal_error(format!(
            "connect to {} timed out after {}ms",
            config.display_url(), config.connection_timeout_ms
        ))),
    }
}

/// `lapin` channel adapter
#[derive(Debug, Clone)]
pub struct AmqpChannel {
    channel: Channel,
    confirms: bool,
}

impl AmqpChannel {
    /// Create the service's channel and apply QoS and confirm mode
    pub(crate) async fn open(connection: &Connection, config: &ConnectionConfig) -> Result<Self> {
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await?;

        if config.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
        }

        debug!(
            "Created channel (prefetch: {}, confirms: {})",
            config.prefetch_count, config.publisher_confirms
        );

        Ok(Self {
            channel,
            confirms: config.publisher_confirms,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.channel.status().connected() {
            Ok(())
        } else {
            Err(BridgeError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.ensure_open()?;

        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(queue.name().as_str().to_string())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.ensure_open()?;

        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };

        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;

        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishStatus> {
        self.ensure_open()?;

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                to_basic_properties(&properties),
            )
            .await?;

        if !self.confirms {
            return Ok(PublishStatus::Flushed);
        }

        let target = format!("{}/{}", exchange, routing_key);
        Ok(PublishStatus::Buffered(DrainSignal::new(async move {
            let confirmation = confirm.await?;
            if confirmation.is_nack() {
                return Err(BridgeError::publish_error(target, "broker nacked publish"));
            }
            Ok(())
        })))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let no_ack = options.no_ack;
        Ok(consumer
            .map(move |delivery| {
                delivery
                    .map(|d| from_lapin_delivery(d, no_ack))
                    .map_err(BridgeError::from)
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "bridge shutdown").await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

struct AmqpAcker(LapinAcker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.as_str().into());
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(2);
    }
    if !properties.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &properties.headers {
            table.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(value.as_str().into()),
            );
        }
        basic = basic.with_headers(table);
    }

    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let mut properties = MessageProperties {
        correlation_id: basic.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: basic.reply_to().as_ref().map(|s| s.as_str().to_string()),
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
        persistent: *basic.delivery_mode() == Some(2),
        ..Default::default()
    };

    if let Some(headers) = basic.headers() {
        for (key, value) in headers.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                AMQPValue::LongLongInt(n) => n.to_string(),
                AMQPValue::LongInt(n) => n.to_string(),
                other => {
                    warn!("Ignoring non-string header {}: {:?}", key.as_str(), other);
                    continue;
                }
            };
            properties.headers.insert(key.as_str().to_string(), value);
        }
    }

    properties
}

fn from_lapin_delivery(delivery: lapin::message::Delivery, no_ack: bool) -> Delivery {
    let properties = from_basic_properties(&delivery.properties);
    let acker = if no_ack {
        Acker::none()
    } else {
        Acker::new(AmqpAcker(delivery.acker))
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        data: delivery.data,
        properties,
        acker,
    }
}
