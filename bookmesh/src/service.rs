use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{RpcClient, RpcStats, DEFAULT_RPC_TIMEOUT};
use crate::connection::{env_var, ConnectionConfig, ConnectionManager, ConnectionState, ConnectionStats};
use crate::error::Result;
use crate::events::{EventPublisher, EventStats, DEFAULT_DRAIN_TIMEOUT};
use crate::memory::MemoryBroker;
use crate::message::{ReplyFormat, Request};
use crate::rpc::{RpcHandler, RpcServer, RpcServerStats, ServerConfig};

/// Configuration for a service process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, reported to the broker as the connection name
    pub service_name: String,
    /// Broker connection configuration
    pub connection: ConnectionConfig,
    /// Default timeout for outgoing calls in milliseconds
    pub rpc_timeout_ms: u64,
    /// Maximum concurrent handler invocations per operation queue
    pub max_concurrent_requests: usize,
    /// Encoding of handler failures in replies
    pub reply_format: ReplyFormat,
    /// Declare operation queues as durable
    pub durable_queues: bool,
    /// Bound on the single drain wait after a back-pressured event publish
    pub drain_timeout_ms: u64,
    /// Health check interval in seconds
    pub health_check_interval_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            service_name: "bookmesh-service".to_string(),
            connection: ConnectionConfig::default(),
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT.as_millis() as u64,
            max_concurrent_requests: server.max_concurrent_requests,
            reply_format: server.reply_format,
            durable_queues: server.durable_queues,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT.as_millis() as u64,
            health_check_interval_seconds: 30,
        }
    }
}

impl ServiceConfig {
    pub fn new(service_name: impl Into<String>, broker_url: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            connection: ConnectionConfig::new(broker_url),
            ..Default::default()
        }
    }

    /// Defaults overridden by `RABBITMQ_URL`, `BOOKMESH_PREFETCH`,
    /// `BOOKMESH_RPC_TIMEOUT_MS` and `BOOKMESH_MAX_CONCURRENT`
    pub fn from_env(service_name: impl Into<String>) -> Result<Self> {
        let mut config = Self {
            service_name: service_name.into(),
            connection: ConnectionConfig::from_env()?,
            ..Default::default()
        };
        if let Some(timeout_ms) = env_var("BOOKMESH_RPC_TIMEOUT_MS")? {
            config.rpc_timeout_ms = timeout_ms;
        }
        if let Some(max_concurrent) = env_var("BOOKMESH_MAX_CONCURRENT")? {
            config.max_concurrent_requests = max_concurrent;
        }
        Ok(config)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_concurrent_requests: self.max_concurrent_requests,
            reply_format: self.reply_format,
            durable_queues: self.durable_queues,
        }
    }
}

/// Service operational status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ServiceStatus {
    /// Created, not yet connected
    Starting,
    /// Connected and answering requests
    Running,
    /// Shutdown in progress
    ShuttingDown,
    /// Service has stopped
    Stopped,
    /// Connecting failed
    Error(String),
}

/// One per process: the broker connection plus everything that shares it.
///
/// Handlers can only be registered once [`Service::connect`] has succeeded.
#[derive(Debug)]
pub struct Service {
    config: ServiceConfig,
    connection: Arc<ConnectionManager>,
    client: RpcClient,
    server: RpcServer,
    events: EventPublisher,
    status: Arc<RwLock<ServiceStatus>>,
    health_check: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Self {
        let connection = ConnectionManager::with_config(config.connection.clone())
            .with_name(config.service_name.clone());
        Self::build(config, connection)
    }

    /// Service on a shared in-process broker
    pub fn in_memory(service_name: impl Into<String>, broker: MemoryBroker) -> Self {
        let config = ServiceConfig::new(service_name, crate::connection::MEMORY_SCHEME);
        let connection = ConnectionManager::in_memory(broker).with_name(config.service_name.clone());
        Self::build(config, connection)
    }

    fn build(config: ServiceConfig, connection: ConnectionManager) -> Self {
        info!("Creating service: {}", config.service_name);

        let connection = Arc::new(connection);
        let client = RpcClient::new(connection.clone()).with_default_timeout(config.rpc_timeout());
        let server = RpcServer::with_config(connection.clone(), config.server_config());
        let events = EventPublisher::new(connection.clone())
            .with_drain_timeout(Duration::from_millis(config.drain_timeout_ms));

        Self {
            config,
            connection,
            client,
            server,
            events,
            status: Arc::new(RwLock::new(ServiceStatus::Starting)),
            health_check: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Connect to the broker and start the health check.
    ///
    /// A failure here is fatal for the process; nothing retries it later.
    pub async fn connect(&self) -> Result<()> {
        info!("Starting service: {}", self.config.service_name);

        if let Err(e) = self.connection.connect().await {
            error!("Service {} failed to connect: {}", self.config.service_name, e);
            *self.status.write().await = ServiceStatus::Error(e.to_string());
            return Err(e);
        }

        *self.status.write().await = ServiceStatus::Running;
        let task = self.start_health_check_task();
        if let Some(previous) = self.health_check.lock().replace(task) {
            previous.abort();
        }

        info!(
            "Service {} is running (max concurrent requests per queue: {})",
            self.config.service_name, self.config.max_concurrent_requests
        );
        Ok(())
    }

    /// Register an RPC handler for an operation queue
    pub async fn register_handler<H>(&self, queue: &str, handler: H) -> Result<()>
    where
        H: RpcHandler + 'static,
    {
        self.server.register_handler(queue, handler).await
    }

    /// Register a function-based handler
    pub async fn register_function<F, Fut, T>(&self, queue: &str, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.server.register_function(queue, handler).await
    }

    /// Client for calling other services' operations
    pub fn client(&self) -> RpcClient {
        self.client.clone()
    }

    pub fn events(&self) -> EventPublisher {
        self.events.clone()
    }

    pub fn connection(&self) -> Arc<ConnectionManager> {
        self.connection.clone()
    }

    fn start_health_check_task(&self) -> JoinHandle<()> {
        let mut state = self.connection.subscribe_state();
        let service_name = self.config.service_name.clone();
        let interval = Duration::from_secs(self.config.health_check_interval_seconds.max(1));

        tokio::spawn(async move {
            debug!("Health check task started for {}", service_name);
            let mut ticker = tokio::time::interval(interval);
            let mut current = *state.borrow_and_update();

            loop {
                tokio::select! {
                    _ = ticker.tick() => match current {
                        ConnectionState::Connected => debug!("Health check OK for {}", service_name),
                        other => warn!("Service {} has no broker connection ({:?})", service_name, other),
                    },
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        current = *state.borrow_and_update();
                        if current == ConnectionState::Closed {
                            error!("Service {} lost its broker connection", service_name);
                        }
                    }
                }
            }
        })
    }

    /// Stop handlers, the health check and the connection
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down service: {}", self.config.service_name);
        *self.status.write().await = ServiceStatus::ShuttingDown;

        self.server.shutdown().await;
        if let Some(task) = self.health_check.lock().take() {
            task.abort();
        }
        let result = self.connection.close().await;

        *self.status.write().await = ServiceStatus::Stopped;
        info!("Service {} stopped", self.config.service_name);
        result
    }

    /// Serve until `signal` completes, then shut down
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown().await
    }

    pub async fn status(&self) -> ServiceStatus {
        self.status.read().await.clone()
    }

    /// Get service statistics
    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            service_name: self.config.service_name.clone(),
            status: self.status().await,
            connection: self.connection.stats().await,
            client: self.client.stats(),
            server: self.server.stats().await,
            events: self.events.stats(),
        }
    }

    /// Check if service is healthy
    pub async fn is_healthy(&self) -> bool {
        matches!(*self.status.read().await, ServiceStatus::Running)
            && self.connection.is_connected().await
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if let Some(task) = self.health_check.get_mut().take() {
            task.abort();
        }
    }
}

/// Service statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub service_name: String,
    pub status: ServiceStatus,
    pub connection: ConnectionStats,
    pub client: RpcStats,
    pub server: RpcServerStats,
    pub events: EventStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ExchangeKind;
    use crate::error::BridgeError;
    use crate::events::EventOptions;
    use crate::naming::{exchange_name, AUTH_VERIFY_TOKEN, DOCTOR_CHECK_SCHEDULE};
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config = ServiceConfig::new("doctor-service", "memory://");
        assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_concurrent_requests, 100);
        assert_eq!(config.reply_format, ReplyFormat::Sentinel);
        assert!(config.connection.is_memory());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ServiceConfig = serde_json::from_value(json!({
            "service_name": "auth-service",
            "rpc_timeout_ms": 1500,
            "reply_format": "tagged"
        }))
        .unwrap();
        assert_eq!(config.rpc_timeout(), Duration::from_millis(1500));
        assert_eq!(config.reply_format, ReplyFormat::Tagged);
        assert_eq!(config.connection.url, "amqp://localhost:5672");
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let service = Service::in_memory("doctor-service", MemoryBroker::new());
        assert_eq!(service.status().await, ServiceStatus::Starting);
        assert!(!service.is_healthy().await);

        let early = service
            .register_function(DOCTOR_CHECK_SCHEDULE, |_request: Request| async move {
                Ok(json!(null))
            })
            .await;
        assert!(matches!(early, Err(BridgeError::ChannelNotInitialized)));

        service.connect().await.unwrap();
        assert!(service.is_healthy().await);

        service.shutdown().await.unwrap();
        assert_eq!(service.status().await, ServiceStatus::Stopped);
        assert!(!service.is_healthy().await);
        assert!(matches!(
            service.client().call(AUTH_VERIFY_TOKEN, json!({})).await,
            Err(BridgeError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_services_talk_over_shared_broker() {
        let broker = MemoryBroker::new();

        let auth = Service::in_memory("auth-service", broker.clone());
        auth.connect().await.unwrap();
        auth.register_function(AUTH_VERIFY_TOKEN, |request: Request| async move {
            match request.field("token").and_then(|t| t.as_str()) {
                Some("valid") => Ok(json!({ "userId": "U1", "role": "doctor" })),
                _ => Err(BridgeError::handler_error("invalid token")),
            }
        })
        .await
        .unwrap();

        let doctor = Service::in_memory("doctor-service", broker.clone());
        doctor.connect().await.unwrap();
        let mut registrations = doctor
            .events()
            .subscribe(&exchange_name("doctor"), ExchangeKind::Fanout, "", "")
            .await
            .unwrap();

        let client = doctor.client();
        let claims = client
            .call(AUTH_VERIFY_TOKEN, json!({ "token": "valid" }))
            .await
            .unwrap();
        assert_eq!(claims.into_value()["userId"], "U1");

        let rejected = client
            .call(AUTH_VERIFY_TOKEN, json!({ "token": "forged" }))
            .await
            .unwrap();
        assert!(rejected.is_failure());

        doctor
            .events()
            .publish_event(
                &exchange_name("doctor"),
                ExchangeKind::Fanout,
                "doctor.registered",
                json!({ "doctorId": "D1" }),
                EventOptions::default(),
            )
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), registrations.next_event())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.event, "doctor.registered");

        let auth_stats = auth.stats().await;
        assert_eq!(auth_stats.server.registered_handlers, 1);
        assert_eq!(auth_stats.server.handled, 2);
        assert_eq!(auth_stats.server.failed, 1);

        let doctor_stats = doctor.stats().await;
        assert_eq!(doctor_stats.client.fulfilled, 2);
        assert_eq!(doctor_stats.events.published, 1);
        assert_eq!(doctor_stats.connection.backend, "memory");
    }

    #[tokio::test]
    async fn test_run_until_shuts_down() {
        let service = Service::in_memory("schedule-service", MemoryBroker::new());
        service.connect().await.unwrap();
        service
            .run_until(tokio::time::sleep(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(service.status().await, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_unreachable_broker_marks_error() {
        let mut config = ServiceConfig::new("rating-service", "amqp://127.0.0.1:1");
        config.connection.max_retries = 1;
        config.connection.connection_timeout_ms = 500;
        let service = Service::new(config);

        let result = service.connect().await;
        assert!(matches!(result, Err(BridgeError::ConnectFailed { attempts: 1, .. })));
        assert!(matches!(service.status().await, ServiceStatus::Error(_)));
    }

    /// Round trip against a real broker; runs only when `RABBITMQ_URL` is set.
    #[tokio::test]
    async fn test_live_broker_round_trip() {
        let Ok(url) = std::env::var("RABBITMQ_URL") else {
            return;
        };

        let mut config = ServiceConfig::new("bookmesh-live-test", url);
        config.durable_queues = false;
        config.connection.publisher_confirms = true;
        let service = Service::new(config);
        service.connect().await.unwrap();

        let queue = format!("bookmesh_live.check_{}", uuid::Uuid::new_v4().simple());
        service
            .register_function(&queue, |request: Request| async move {
                Ok(json!({ "schedule": { "id": request.field("scheduleId"), "isAvailable": true } }))
            })
            .await
            .unwrap();

        let reply = service
            .client()
            .call(&queue, json!({ "scheduleId": "S1" }))
            .await
            .unwrap();
        assert_eq!(
            reply.into_value(),
            json!({ "schedule": { "id": "S1", "isAvailable": true } })
        );

        let missing = service
            .client()
            .call_with_timeout("bookmesh_live.nobody_home", json!({}), Duration::from_millis(200))
            .await;
        assert!(matches!(missing, Err(BridgeError::Timeout { .. })));

        service
            .events()
            .publish_event(
                "bookmesh_live.exchange",
                ExchangeKind::Fanout,
                "bookmesh_live.checked",
                json!({ "scheduleId": "S1" }),
                EventOptions { persistent: false },
            )
            .await
            .unwrap();
        let events = service.stats().await.events;
        assert_eq!(events.published, 1);
        assert_eq!(events.drain_waits, 1);
        assert_eq!(events.drain_timeouts, 0);

        service.shutdown().await.unwrap();
    }
}
