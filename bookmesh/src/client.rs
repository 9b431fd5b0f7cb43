use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::broker::{ConsumeOptions, MessageProperties, QueueOptions, DEFAULT_EXCHANGE};
use crate::connection::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::message::{CorrelationId, Deadline, Reply, DEADLINE_HEADER};

/// Timeout applied by [`RpcClient::call`]
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Lifecycle of one outgoing call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    Created,
    AwaitingReply,
    Fulfilled,
    TimedOut,
}

struct Slot {
    state: CallState,
    tx: Option<oneshot::Sender<Result<Reply>>>,
}

/// An in-flight call. Its result slot is assigned exactly once, either by
/// the reply listener or by the deadline.
pub(crate) struct PendingCall {
    correlation_id: CorrelationId,
    queue: String,
    timeout: Duration,
    slot: Mutex<Slot>,
}

impl PendingCall {
    fn new(
        correlation_id: CorrelationId,
        queue: &str,
        timeout: Duration,
        tx: oneshot::Sender<Result<Reply>>,
    ) -> Self {
        Self {
            correlation_id,
            queue: queue.to_string(),
            timeout,
            slot: Mutex::new(Slot {
                state: CallState::Created,
                tx: Some(tx),
            }),
        }
    }

    fn state(&self) -> CallState {
        self.slot.lock().state
    }

    fn mark_awaiting(&self) {
        let mut slot = self.slot.lock();
        if slot.state == CallState::Created {
            slot.state = CallState::AwaitingReply;
        }
    }

    /// Resolve with a reply (or a listener failure). Returns false if the
    /// call was already resolved.
    fn fulfil(&self, result: Result<Reply>) -> bool {
        let mut slot = self.slot.lock();
        match slot.tx.take() {
            Some(tx) => {
                slot.state = CallState::Fulfilled;
                // Receiver is held by the caller until resolution
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Resolve as timed out. Returns false if a reply won the race.
    fn expire(&self) -> bool {
        let mut slot = self.slot.lock();
        match slot.tx.take() {
            Some(_) => {
                slot.state = CallState::TimedOut;
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("correlation_id", &self.correlation_id)
            .field("queue", &self.queue)
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    fulfilled: AtomicU64,
    timed_out: AtomicU64,
}

/// Request/reply client.
///
/// Every call gets its own exclusive, auto-deleting reply queue and a fresh
/// correlation id. There is no automatic retry.
///
/// ```rust,no_run
/// # use bookmesh::{ConnectionManager, RpcClient};
/// # use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() -> bookmesh::Result<()> {
/// let connection = Arc::new(ConnectionManager::new("amqp://localhost:5672"));
/// connection.connect().await?;
///
/// let client = RpcClient::new(connection);
/// let reply = client
///     .call("auth.verify_token", serde_json::json!({ "token": "abc" }))
///     .await?;
/// if reply.is_failure() {
///     // treat the auth service as unavailable
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    connection: Arc<ConnectionManager>,
    default_timeout: Duration,
    pending: Arc<Mutex<HashMap<CorrelationId, Arc<PendingCall>>>>,
    counters: Arc<CallCounters>,
}

impl RpcClient {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            default_timeout: DEFAULT_RPC_TIMEOUT,
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(CallCounters::default()),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Call an operation with the default timeout
    pub async fn call(&self, queue: &str, payload: impl Serialize) -> Result<Reply> {
        self.call_with_timeout(queue, payload, self.default_timeout)
            .await
    }

    /// Call an operation with a custom timeout
    pub async fn call_with_timeout(
        &self,
        queue: &str,
        payload: impl Serialize,
        timeout: Duration,
    ) -> Result<Reply> {
        let body = serde_json::to_vec(&payload)?;
        self.invoke(queue, body, timeout, None).await
    }

    /// Call an operation within an absolute deadline and propagate the
    /// deadline to the handler, which can pass it on to nested calls.
    pub async fn call_within(
        &self,
        queue: &str,
        payload: impl Serialize,
        deadline: Deadline,
    ) -> Result<Reply> {
        if deadline.is_expired() {
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            return Err(BridgeError::Timeout {
                queue: queue.to_string(),
                timeout_ms: 0,
            });
        }

        let body = serde_json::to_vec(&payload)?;
        self.invoke(queue, body, deadline.remaining(), Some(deadline))
            .await
    }

    async fn invoke(
        &self,
        queue: &str,
        body: Vec<u8>,
        timeout: Duration,
        deadline: Option<Deadline>,
    ) -> Result<Reply> {
        let channel = self.connection.channel().await?;

        let reply_queue = channel.declare_queue("", QueueOptions::reply()).await?;
        let correlation_id = CorrelationId::new();
        let consumer_tag = format!("bookmesh-reply-{}", correlation_id);

        let mut replies = channel
            .consume(
                &reply_queue,
                &consumer_tag,
                ConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                },
            )
            .await?;

        let (tx, mut rx) = oneshot::channel();
        let call = Arc::new(PendingCall::new(
            correlation_id.clone(),
            queue,
            timeout,
            tx,
        ));
        self.pending
            .lock()
            .insert(correlation_id.clone(), call.clone());

        let listener_call = call.clone();
        let listener = tokio::spawn(async move {
            while let Some(delivery) = replies.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!("Reply consumer failed: {}", e);
                        break;
                    }
                };

                if delivery.properties.correlation_id.as_deref()
                    != Some(listener_call.correlation_id.as_str())
                {
                    debug!(
                        "Discarding reply with foreign correlation_id {:?}",
                        delivery.properties.correlation_id
                    );
                    continue;
                }

                listener_call.fulfil(Reply::from_bytes(&delivery.data));
                return;
            }
            // Consumer ended before a reply: the channel went away
            listener_call.fulfil(Err(BridgeError::ChannelClosed));
        });

        let mut properties = MessageProperties::json()
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(reply_queue.as_str());
        if let Some(deadline) = deadline {
            properties = properties.with_header(DEADLINE_HEADER, deadline.epoch_millis().to_string());
        }

        let outcome = match channel
            .publish(DEFAULT_EXCHANGE, queue, body, properties)
            .await
        {
            Ok(_) => {
                call.mark_awaiting();
                debug!(
                    "Sent RPC request to {} (correlation_id: {}, timeout: {:?})",
                    queue, correlation_id, timeout
                );
                self.await_reply(&call, &mut rx).await
            }
            Err(e) => Err(e),
        };

        listener.abort();
        if let Err(e) = channel.cancel(&consumer_tag).await {
            debug!("Failed to cancel reply consumer {}: {}", consumer_tag, e);
        }
        self.pending.lock().remove(&correlation_id);

        outcome
    }

    async fn await_reply(
        &self,
        call: &PendingCall,
        rx: &mut oneshot::Receiver<Result<Reply>>,
    ) -> Result<Reply> {
        match tokio::time::timeout(call.timeout, &mut *rx).await {
            Ok(Ok(result)) => {
                self.counters.fulfilled.fetch_add(1, Ordering::Relaxed);
                result
            }
            Ok(Err(_)) => Err(BridgeError::internal_error("Reply slot dropped")),
            Err(_) if call.expire() => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "RPC call to {} timed out after {:?} (correlation_id: {})",
                    call.queue, call.timeout, call.correlation_id
                );
                Err(BridgeError::Timeout {
                    queue: call.queue.clone(),
                    timeout_ms: call.timeout.as_millis() as u64,
                })
            }
            Err(_) => {
                // Reply landed between the timer firing and expire()
                self.counters.fulfilled.fetch_add(1, Ordering::Relaxed);
                rx.try_recv()
                    .unwrap_or_else(|_| Err(BridgeError::internal_error("Reply slot dropped")))
            }
        }
    }

    /// Calls currently awaiting a reply
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> RpcStats {
        RpcStats {
            pending_calls: self.pending_calls(),
            fulfilled: self.counters.fulfilled.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            default_timeout_ms: self.default_timeout.as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("default_timeout", &self.default_timeout)
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

/// Client statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct RpcStats {
    pub pending_calls: usize,
    pub fulfilled: u64,
    pub timed_out: u64,
    pub default_timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Delivery, SharedChannel};
    use crate::memory::MemoryBroker;
    use serde_json::{json, Value};

    async fn connected(broker: &MemoryBroker) -> Arc<ConnectionManager> {
        let connection = Arc::new(ConnectionManager::in_memory(broker.clone()));
        connection.connect().await.unwrap();
        connection
    }

    async fn reply_to(channel: &SharedChannel, request: &Delivery, correlation_id: &str, body: Value) {
        channel
            .publish(
                "",
                request.properties.reply_to.as_deref().unwrap(),
                serde_json::to_vec(&body).unwrap(),
                MessageProperties::json().with_correlation_id(correlation_id),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_call_before_connect_fails() {
        let client = RpcClient::new(Arc::new(ConnectionManager::in_memory(MemoryBroker::new())));
        let err = client.call("auth.verify_token", json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::ChannelNotInitialized));
    }

    #[tokio::test]
    async fn test_unreachable_operation_times_out() {
        let broker = MemoryBroker::new();
        let client = RpcClient::new(connected(&broker).await);

        let started = std::time::Instant::now();
        let err = client
            .call_with_timeout("ghost.operation", json!({}), Duration::from_millis(200))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, BridgeError::Timeout { timeout_ms: 200, .. }));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(1_000), "took {:?}", elapsed);
        assert_eq!(client.stats().timed_out, 1);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_correlation_integrity_with_out_of_order_replies() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let responder = connection.channel().await.unwrap();
        responder
            .declare_queue("doctor.check_schedule", QueueOptions::operation(true))
            .await
            .unwrap();
        let mut requests = responder
            .consume("doctor.check_schedule", "responder", ConsumeOptions::auto_ack())
            .await
            .unwrap();

        let client = RpcClient::new(connection.clone());
        let calls = (0..5).map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_with_timeout(
                        "doctor.check_schedule",
                        json!({ "n": n }),
                        Duration::from_secs(2),
                    )
                    .await
            })
        });
        let calls: Vec<_> = calls.collect();

        let mut received = Vec::new();
        for _ in 0..5 {
            received.push(requests.next().await.unwrap().unwrap());
        }

        // Answer in reverse order, each preceded by a decoy with a foreign id
        for request in received.iter().rev() {
            let body: Value = serde_json::from_slice(&request.data).unwrap();
            let correlation_id = request.properties.correlation_id.clone().unwrap();
            reply_to(&responder, request, "not-yours", json!({ "n": -1 })).await;
            reply_to(&responder, request, &correlation_id, json!({ "n": body["n"] })).await;
        }

        for (n, call) in calls.into_iter().enumerate() {
            let reply = call.await.unwrap().unwrap();
            assert_eq!(reply.into_value(), json!({ "n": n }));
        }
        assert_eq!(client.stats().fulfilled, 5);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_does_not_resolve_timed_out_call() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let responder = connection.channel().await.unwrap();
        responder
            .declare_queue("rating.aggregate", QueueOptions::operation(true))
            .await
            .unwrap();
        let mut requests = responder
            .consume("rating.aggregate", "slow", ConsumeOptions::auto_ack())
            .await
            .unwrap();

        let client = RpcClient::new(connection.clone());
        let err = client
            .call_with_timeout("rating.aggregate", json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));

        // The slow handler answers into a reply queue that no longer exists
        let request = requests.next().await.unwrap().unwrap();
        let reply_queue = request.properties.reply_to.clone().unwrap();
        assert!(!broker.queue_exists(&reply_queue));
        let correlation_id = request.properties.correlation_id.clone().unwrap();
        reply_to(&responder, &request, &correlation_id, json!({ "avg": 4.5 })).await;

        let stats = client.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.fulfilled, 0);
    }

    #[tokio::test]
    async fn test_pending_call_resolves_once() {
        let (tx, mut rx) = oneshot::channel();
        let call = PendingCall::new(
            CorrelationId::new(),
            "auth.verify_token",
            Duration::from_millis(10),
            tx,
        );
        assert_eq!(call.state(), CallState::Created);
        call.mark_awaiting();
        assert_eq!(call.state(), CallState::AwaitingReply);

        assert!(call.expire());
        assert!(!call.fulfil(Ok(Reply::new(json!(1)))));
        assert!(!call.expire());
        assert_eq!(call.state(), CallState::TimedOut);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deadline_is_propagated_in_header() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let responder = connection.channel().await.unwrap();
        responder
            .declare_queue("auth.verify_token", QueueOptions::operation(true))
            .await
            .unwrap();
        let mut requests = responder
            .consume("auth.verify_token", "auth", ConsumeOptions::auto_ack())
            .await
            .unwrap();

        let client = RpcClient::new(connection.clone());
        let deadline = Deadline::after(Duration::from_secs(2));
        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_within("auth.verify_token", json!({ "token": "t" }), deadline)
                    .await
            })
        };

        let request = requests.next().await.unwrap().unwrap();
        assert_eq!(
            request.properties.header(DEADLINE_HEADER),
            Some(deadline.epoch_millis().to_string().as_str())
        );
        let correlation_id = request.properties.correlation_id.clone().unwrap();
        reply_to(&responder, &request, &correlation_id, json!({ "valid": true })).await;

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.value(), &json!({ "valid": true }));
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_without_publishing() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let channel = connection.channel().await.unwrap();
        channel
            .declare_queue("auth.verify_token", QueueOptions::operation(true))
            .await
            .unwrap();

        let client = RpcClient::new(connection);
        let expired = Deadline::from_epoch_millis(0).unwrap();
        let err = client
            .call_within("auth.verify_token", json!({}), expired)
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Timeout { timeout_ms: 0, .. }));
        assert_eq!(broker.queue_stats("auth.verify_token").unwrap().published, 0);
    }

    #[tokio::test]
    async fn test_channel_loss_resolves_pending_call() {
        let broker = MemoryBroker::new();
        let connection = connected(&broker).await;
        let client = RpcClient::new(connection.clone());

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_with_timeout("ghost.operation", json!({}), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        connection.close().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("call should resolve when the channel closes")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::ChannelClosed));
    }
}
