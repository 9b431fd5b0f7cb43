//! In-process broker.
//!
//! Follows the AMQP 0-9-1 behaviour the bridge relies on: the default
//! exchange routes by queue name, `""` queue names are generated by the
//! broker, exclusive queues die with their channel, auto-delete queues die
//! with their last consumer, messages without a route are dropped, and
//! unacknowledged messages are requeued when their channel closes.

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::broker::{
    Acker, Acknowledge, BrokerChannel, ConsumeOptions, Delivery, DeliveryStream, DrainSignal,
    ExchangeKind, MessageProperties, PublishStatus, QueueOptions, DEFAULT_EXCHANGE,
};
use crate::error::{BridgeError, Result};

type SharedState = Arc<Mutex<BrokerState>>;

/// Handle to an in-process broker. Clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: SharedState,
    next_channel: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker whose queues report back-pressure once `capacity` messages are
    /// waiting for a consumer
    pub fn with_queue_capacity(capacity: usize) -> Self {
        let broker = Self::default();
        broker.state.lock().queue_capacity = Some(capacity.max(1));
        broker
    }

    /// Open a new channel on this broker
    pub fn channel(&self) -> MemoryChannel {
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Opened in-memory channel {}", id);
        MemoryChannel {
            id,
            state: self.state.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        self.state.lock().queues.get(name).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            consumers: q.consumers.len(),
            published: q.published,
            acked: q.acked,
            nacked: q.nacked,
        })
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("queues", &self.queue_names())
            .finish()
    }
}

/// Per-queue counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
    pub published: u64,
    pub acked: u64,
    pub nacked: u64,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    data: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct Consumer {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Unacked {
    channel_id: u64,
    message: StoredMessage,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
    depth: watch::Sender<usize>,
    published: u64,
    acked: u64,
    nacked: u64,
}

impl QueueState {
    fn new(options: QueueOptions, owner: Option<u64>) -> Self {
        let (depth, _) = watch::channel(0);
        Self {
            options,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            unacked: HashMap::new(),
            depth,
            published: 0,
            acked: 0,
            nacked: 0,
        }
    }

    fn publish_depth(&self) {
        self.depth.send_replace(self.ready.len());
    }
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    next_delivery_tag: u64,
    next_consumer_tag: u64,
    queue_capacity: Option<usize>,
}

impl BrokerState {
    fn declare_queue(&mut self, channel_id: u64, name: &str, options: QueueOptions) -> Result<String> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = self.queues.get(&name) {
            if existing.owner.is_some() && existing.owner != Some(channel_id) {
                return Err(BridgeError::internal_error(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another channel",
                    name
                )));
            }
            return Ok(name);
        }

        let owner = options.exclusive.then_some(channel_id);
        self.queues.insert(name.clone(), QueueState::new(options, owner));
        trace!("Declared in-memory queue {}", name);
        Ok(name)
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|b| b.queue != name);
            }
            debug!("Deleted in-memory queue {}", name);
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let state = self.exchanges.get(exchange).ok_or_else(|| {
            BridgeError::publish_error(exchange, "NOT_FOUND - no exchange with that name")
        })?;

        let mut targets: Vec<String> = Vec::new();
        for binding in &state.bindings {
            let matched = match state.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn dispatch(&mut self, name: &str, handle: &SharedState) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            let idx = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = idx + 1;

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let no_ack = queue.consumers[idx].no_ack;
            let channel_id = queue.consumers[idx].channel_id;

            let acker = if no_ack {
                Acker::none()
            } else {
                Acker::new(MemoryAcker {
                    state: handle.clone(),
                    queue: name.to_string(),
                    delivery_tag,
                })
            };

            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                data: message.data.clone(),
                properties: message.properties.clone(),
                acker,
            };

            if queue.consumers[idx].tx.send(delivery).is_err() {
                // Stream dropped without cancel; its guard finishes the cleanup
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }

            if !no_ack {
                queue.unacked.insert(delivery_tag, Unacked { channel_id, message });
            }
        }

        queue.publish_depth();
    }

    fn add_consumer(
        &mut self,
        channel_id: u64,
        queue_name: &str,
        tag: &str,
        options: ConsumeOptions,
        tx: mpsc::UnboundedSender<Delivery>,
        handle: &SharedState,
    ) -> Result<String> {
        let tag = if tag.is_empty() {
            self.next_consumer_tag += 1;
            format!("amq.ctag-{}", self.next_consumer_tag)
        } else {
            tag.to_string()
        };

        let queue = self.queues.get_mut(queue_name).ok_or_else(|| {
            BridgeError::internal_error(format!("NOT_FOUND - no queue '{}'", queue_name))
        })?;

        if queue.owner.is_some() && queue.owner != Some(channel_id) {
            return Err(BridgeError::internal_error(format!(
                "RESOURCE_LOCKED - queue '{}' is exclusive to another channel",
                queue_name
            )));
        }
        if queue.consumers.iter().any(|c| c.tag == tag) {
            return Err(BridgeError::internal_error(format!(
                "NOT_ALLOWED - consumer tag '{}' already in use",
                tag
            )));
        }

        queue.consumers.push(Consumer {
            tag: tag.clone(),
            channel_id,
            no_ack: options.no_ack,
            tx,
        });
        self.dispatch(queue_name, handle);
        Ok(tag)
    }

    fn remove_consumer(&mut self, queue_name: &str, tag: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        let before = queue.consumers.len();
        queue.consumers.retain(|c| c.tag != tag);
        let removed = queue.consumers.len() != before;

        if removed && queue.consumers.is_empty() && queue.options.auto_delete {
            self.delete_queue(queue_name);
        }
    }

    fn close_channel(&mut self, channel_id: u64, handle: &SharedState) {
        let names: Vec<String> = self.queues.keys().cloned().collect();

        for name in names {
            let Some(queue) = self.queues.get_mut(&name) else {
                continue;
            };

            if queue.owner == Some(channel_id) {
                self.delete_queue(&name);
                continue;
            }

            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel_id != channel_id);
            let lost_consumers = queue.consumers.len() != before;

            let orphaned: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in orphaned {
                if let Some(mut unacked) = queue.unacked.remove(&tag) {
                    unacked.message.redelivered = true;
                    queue.ready.push_front(unacked.message);
                }
            }

            if lost_consumers && queue.consumers.is_empty() && queue.options.auto_delete {
                self.delete_queue(&name);
            } else {
                self.dispatch(&name, handle);
            }
        }
    }

    fn settle(&mut self, queue_name: &str, delivery_tag: u64) -> Result<Option<StoredMessage>> {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            // Queue already gone; nothing left to settle
            return Ok(None);
        };

        queue
            .unacked
            .remove(&delivery_tag)
            .map(|u| Some(u.message))
            .ok_or_else(|| {
                BridgeError::internal_error(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                ))
            })
    }
}

/// Topic pattern match: `*` is exactly one word, `#` zero or more words
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some((&"*", rest)), Some((_, key_rest))) => matches(rest, key_rest),
            (Some((word, rest)), Some((k, key_rest))) => word == k && matches(rest, key_rest),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches(&pattern, &key)
}

struct MemoryAcker {
    state: SharedState,
    queue: String,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.settle(&self.queue, self.delivery_tag)?.is_some() {
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.acked += 1;
            }
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut state = self.state.lock();
        let Some(mut message) = state.settle(&self.queue, self.delivery_tag)? else {
            return Ok(());
        };

        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.nacked += 1;
            if requeue {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        if requeue {
            state.dispatch(&self.queue, &self.state);
        }
        Ok(())
    }
}

/// Removes the consumer when its delivery stream is dropped
struct ConsumerGuard {
    state: SharedState,
    queue: String,
    tag: String,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.state.lock().remove_consumer(&self.queue, &self.tag);
    }
}

/// Channel on a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryChannel {
    id: u64,
    state: SharedState,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BridgeError::ChannelClosed)
        }
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.ensure_open()?;
        self.state.lock().declare_queue(self.id, name, options)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BridgeError::internal_error(format!(
                "PRECONDITION_FAILED - exchange '{}' already declared as {}",
                name, existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BridgeError::internal_error(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let exchange_state = state.exchanges.get_mut(exchange).ok_or_else(|| {
            BridgeError::internal_error(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let exists = exchange_state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            exchange_state.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
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
        let mut state = self.state.lock();

        let targets = state.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!("Dropping unroutable message for {}/{}", exchange, routing_key);
            return Ok(PublishStatus::Flushed);
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            data: body,
            properties,
            redelivered: false,
        };

        let capacity = state.queue_capacity;
        let mut pressure = None;
        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
                queue.published += 1;
            }
            state.dispatch(&target, &self.state);

            if let (Some(limit), Some(queue)) = (capacity, state.queues.get(&target)) {
                if pressure.is_none() && queue.ready.len() >= limit {
                    pressure = Some((limit, queue.depth.subscribe()));
                }
            }
        }

        Ok(match pressure {
            None => PublishStatus::Flushed,
            Some((limit, mut depth)) => PublishStatus::Buffered(DrainSignal::new(async move {
                // A dropped sender means the queue was deleted, which also drains it
                let _ = depth.wait_for(|ready| *ready < limit).await;
                Ok(())
            })),
        })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let tag = self
            .state
            .lock()
            .add_consumer(self.id, queue, consumer_tag, options, tx, &self.state)?;

        let guard = ConsumerGuard {
            state: self.state.clone(),
            queue: queue.to_string(),
            tag,
        };

        Ok(futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), (rx, guard)))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.state.lock();
        let queue = state.queues.iter().find_map(|(name, q)| {
            q.consumers
                .iter()
                .any(|c| c.tag == consumer_tag && c.channel_id == self.id)
                .then(|| name.clone())
        });
        if let Some(queue) = queue {
            state.remove_consumer(&queue, consumer_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.state.lock().close_channel(self.id, &self.state);
            debug!("Closed in-memory channel {}", self.id);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
