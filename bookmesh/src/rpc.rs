use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{
    ConsumeOptions, Delivery, DeliveryStream, MessageProperties, QueueOptions, DEFAULT_EXCHANGE,
};
use crate::connection::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::message::{HandlerFailure, HandlerOutcome, ReplyFormat, Request};
use crate::naming::validate_operation;

/// Trait for implementing RPC handlers.
///
/// Handlers may run concurrently for several requests on the same queue and
/// may issue nested calls of their own.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle a decoded request and produce a JSON result
    async fn handle(&self, request: Request) -> Result<Value>;

    /// Get handler name for debugging
    fn name(&self) -> &str {
        "RpcHandler"
    }
}

/// Closure-based RPC handler
pub struct FunctionHandler<F> {
    name: String,
    handler: F,
}

impl<F> FunctionHandler<F> {
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut, T> RpcHandler for FunctionHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
    T: Serialize + Send,
{
    async fn handle(&self, request: Request) -> Result<Value> {
        let result = (self.handler)(request).await?;
        Ok(serde_json::to_value(result)?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handler-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Upper bound on handler invocations running at once, per operation
    /// queue. Queues never share permits, so a handler that calls a sibling
    /// operation on the same server cannot starve it.
    pub max_concurrent_requests: usize,
    /// Encoding of handler failures in replies
    pub reply_format: ReplyFormat,
    /// Declare operation queues as durable
    pub durable_queues: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 100,
            reply_format: ReplyFormat::Sentinel,
            durable_queues: true,
        }
    }
}

#[derive(Debug, Default)]
struct ServerCounters {
    handled: AtomicU64,
    failed: AtomicU64,
}

struct Registration {
    queue: String,
    consumer_tag: String,
    limiter: Arc<Semaphore>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct Dispatch {
    queue: Arc<str>,
    handler: Arc<dyn RpcHandler>,
    connection: Arc<ConnectionManager>,
    reply_format: ReplyFormat,
    counters: Arc<ServerCounters>,
}

/// Binds handlers to operation queues and answers their requests.
///
/// Every request is acknowledged exactly once, whether the handler succeeds
/// or fails; failures are answered with the configured sentinel instead of
/// being redelivered.
pub struct RpcServer {
    connection: Arc<ConnectionManager>,
    config: ServerConfig,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn RpcHandler>>>>,
    registrations: Mutex<Vec<Registration>>,
    counters: Arc<ServerCounters>,
}

impl RpcServer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self::with_config(connection, ServerConfig::default())
    }

    pub fn with_config(connection: Arc<ConnectionManager>, config: ServerConfig) -> Self {
        Self {
            connection,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            registrations: Mutex::new(Vec::new()),
            counters: Arc::new(ServerCounters::default()),
        }
    }

    /// Declare `queue` and start answering its requests with `handler`.
    ///
    /// Declaring is idempotent, so replicas of the same service may all
    /// register the same queue and share its load. Within one process a
    /// queue can only be registered once.
    pub async fn register_handler<H>(&self, queue: &str, handler: H) -> Result<()>
    where
        H: RpcHandler + 'static,
    {
        validate_operation(queue)?;

        let handler: Arc<dyn RpcHandler> = Arc::new(handler);
        {
            let mut handlers = self.handlers.write().await;
            if handlers.contains_key(queue) {
                return Err(BridgeError::config_error(format!(
                    "handler already registered for '{}'",
                    queue
                )));
            }
            handlers.insert(queue.to_string(), handler.clone());
        }

        let deliveries = match self.start_consumer(queue).await {
            Ok(started) => started,
            Err(e) => {
                self.handlers.write().await.remove(queue);
                return Err(e);
            }
        };
        let (consumer_tag, deliveries) = deliveries;

        let dispatch = Dispatch {
            queue: Arc::from(queue),
            handler: handler.clone(),
            connection: self.connection.clone(),
            reply_format: self.config.reply_format,
            counters: self.counters.clone(),
        };
        let limiter = Arc::new(Semaphore::new(self.permits_per_queue()));
        let task = tokio::spawn(consume_loop(dispatch, deliveries, limiter.clone()));

        self.registrations.lock().push(Registration {
            queue: queue.to_string(),
            consumer_tag,
            limiter,
            task,
        });

        info!(
            "Registered RPC handler '{}' for queue: {}",
            handler.name(),
            queue
        );
        Ok(())
    }

    /// Register a closure-based handler
    pub async fn register_function<F, Fut, T>(&self, queue: &str, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.register_handler(queue, FunctionHandler::new(queue, handler))
            .await
    }

    async fn start_consumer(&self, queue: &str) -> Result<(String, DeliveryStream)> {
        let channel = self.connection.channel().await?;
        channel
            .declare_queue(queue, QueueOptions::operation(self.config.durable_queues))
            .await?;

        let consumer_tag = format!("{}-requests-{}", queue, Uuid::new_v4());
        let deliveries = channel
            .consume(queue, &consumer_tag, ConsumeOptions::manual_ack())
            .await?;
        debug!("Created consumer {} for queue: {}", consumer_tag, queue);
        Ok((consumer_tag, deliveries))
    }

    /// Stop consuming every registered queue
    pub async fn shutdown(&self) {
        let registrations: Vec<Registration> = self.registrations.lock().drain(..).collect();
        let channel = self.connection.channel().await.ok();

        for registration in registrations {
            if let Some(channel) = &channel {
                if let Err(e) = channel.cancel(&registration.consumer_tag).await {
                    warn!(
                        "Failed to cancel consumer for {}: {}",
                        registration.queue, e
                    );
                }
            }
            registration.task.abort();
            debug!("Stopped request processor for {}", registration.queue);
        }
        self.handlers.write().await.clear();
    }

    fn permits_per_queue(&self) -> usize {
        self.config.max_concurrent_requests.max(1)
    }

    pub async fn stats(&self) -> RpcServerStats {
        let permits = self.permits_per_queue();
        let in_flight = self
            .registrations
            .lock()
            .iter()
            .map(|r| permits.saturating_sub(r.limiter.available_permits()))
            .sum();

        RpcServerStats {
            registered_handlers: self.handlers.read().await.len(),
            handled: self.counters.handled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("config", &self.config)
            .finish()
    }
}

/// Handler statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct RpcServerStats {
    pub registered_handlers: usize,
    pub handled: u64,
    pub failed: u64,
    pub in_flight: usize,
}

/// Spawns a task per delivery; the task waits for a permit, so the loop
/// keeps taking deliveries while handlers are saturated.
async fn consume_loop(dispatch: Dispatch, mut deliveries: DeliveryStream, limiter: Arc<Semaphore>) {
    info!("Request processor started for {}", dispatch.queue);

    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => {
                let dispatch = dispatch.clone();
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    // The semaphore is never closed
                    let Ok(_permit) = limiter.acquire_owned().await else {
                        return;
                    };
                    process_request(&dispatch, delivery).await;
                });
            }
            Err(e) => {
                error!("Error receiving request on {}: {}", dispatch.queue, e);
            }
        }
    }

    warn!("Request processor stopped for {}", dispatch.queue);
}

/// Run the handler, publish its reply, then ack. The ack happens on every
/// path so a failing request is never redelivered.
async fn process_request(dispatch: &Dispatch, delivery: Delivery) {
    let started = Instant::now();
    let outcome = run_handler(dispatch, &delivery).await;

    dispatch.counters.handled.fetch_add(1, Ordering::Relaxed);
    if outcome.is_err() {
        dispatch.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    if let Err(e) = send_reply(dispatch, &delivery, &outcome).await {
        error!("Failed to publish reply for {}: {}", dispatch.queue, e);
    }

    if let Err(e) = delivery.acker.ack().await {
        error!(
            "Failed to acknowledge request on {}: {}",
            dispatch.queue, e
        );
    }

    debug!(
        "Completed RPC request on {} ({}ms, ok: {})",
        dispatch.queue,
        started.elapsed().as_millis(),
        outcome.is_ok()
    );
}

async fn run_handler(dispatch: &Dispatch, delivery: &Delivery) -> HandlerOutcome {
    let request = match Request::from_delivery(&dispatch.queue, delivery) {
        Ok(request) => request,
        Err(e) => {
            warn!("Undecodable request on {}: {}", dispatch.queue, e);
            return Err(HandlerFailure::from(&e));
        }
    };

    match AssertUnwindSafe(dispatch.handler.handle(request))
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            error!("Handler error for {}: {}", dispatch.queue, e);
            Err(HandlerFailure::from(&e))
        }
        Err(_) => {
            error!("Handler for {} panicked", dispatch.queue);
            Err(HandlerFailure::new("handler panicked"))
        }
    }
}

async fn send_reply(dispatch: &Dispatch, delivery: &Delivery, outcome: &HandlerOutcome) -> Result<()> {
    let Some(reply_to) = delivery.properties.reply_to.as_deref() else {
        warn!(
            "Request on {} has no replyTo; skipping reply",
            dispatch.queue
        );
        return Ok(());
    };

    let mut properties = MessageProperties::json();
    match &delivery.properties.correlation_id {
        Some(correlation_id) => {
            properties = properties.with_correlation_id(correlation_id.as_str());
        }
        None => warn!(
            "Request on {} has no correlation id; reply cannot be matched",
            dispatch.queue
        ),
    }

    let body = dispatch.reply_format.encode(outcome)?;
    let channel = dispatch.connection.channel().await?;
    channel
        .publish(DEFAULT_EXCHANGE, reply_to, body, properties)
        .await?;
    Ok(())
}
