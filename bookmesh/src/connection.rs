use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::amqp::{self, AmqpChannel};
use crate::broker::SharedChannel;
use crate::error::{BridgeError, Result};
use crate::memory::MemoryBroker;

/// Broker URL used when `RABBITMQ_URL` is unset
pub const DEFAULT_BROKER_URL: &str = "amqp://localhost:5672";

/// URL scheme selecting the in-process broker
pub const MEMORY_SCHEME: &str = "memory://";

/// Configuration for the broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker URL (e.g., "amqp://localhost:5672" or "memory://")
    pub url: String,
    /// Timeout for a single connect attempt in milliseconds
    pub connection_timeout_ms: u64,
    /// Number of connect attempts before giving up
    pub max_retries: u32,
    /// Delay between connect attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Channel prefetch count for load balancing between handler replicas
    pub prefetch_count: u16,
    /// Enable publisher confirms.
    ///
    /// The AMQP backend has no other back-pressure signal. With confirms on,
    /// every publish is reported as buffered and its drain signal is the
    /// broker's confirm, so each event publish waits once for it. With
    /// confirms off, publishes never wait.
    pub publisher_confirms: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.to_string(),
            connection_timeout_ms: 10_000,
            max_retries: 5,
            retry_delay_ms: 1_000,
            prefetch_count: 10,
            publisher_confirms: false,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Read overrides from `RABBITMQ_URL` and `BOOKMESH_PREFETCH`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = env_var::<String>("RABBITMQ_URL")? {
            config.url = url;
        }
        if let Some(prefetch) = env_var("BOOKMESH_PREFETCH")? {
            config.prefetch_count = prefetch;
        }
        Ok(config)
    }

    pub fn is_memory(&self) -> bool {
        self.url.starts_with(MEMORY_SCHEME)
    }

    /// URL with any credentials removed, safe to log
    pub fn display_url(&self) -> String {
        match (self.url.find("://"), self.url.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}***{}", &self.url[..scheme_end + 3], &self.url[at..])
            }
            _ => self.url.clone(),
        }
    }
}

/// Parse an optional environment variable
pub(crate) fn env_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| BridgeError::config_error(format!("{}: {}", key, e))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(BridgeError::config_error(format!("{}: {}", key, e))),
    }
}

/// Lifecycle of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

enum Backend {
    Amqp,
    Memory(MemoryBroker),
}

struct Session {
    channel: SharedChannel,
    amqp: Option<lapin::Connection>,
}

/// Owns the service's broker connection and its single shared channel.
///
/// The state is observable through [`ConnectionManager::subscribe_state`].
/// A dropped connection moves to [`ConnectionState::Closed`] and stays there;
/// nothing reconnects automatically, so callers re-acquire the channel via
/// [`ConnectionManager::channel`] on every operation.
pub struct ConnectionManager {
    config: ConnectionConfig,
    name: String,
    backend: Backend,
    state: Arc<watch::Sender<ConnectionState>>,
    session: RwLock<Option<Session>>,
}

impl ConnectionManager {
    /// Create a new connection manager with default configuration
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(ConnectionConfig::new(url))
    }

    /// Create a new connection manager with custom configuration.
    ///
    /// A `memory://` URL gets a private in-process broker; use
    /// [`ConnectionManager::in_memory`] to share one between managers.
    pub fn with_config(config: ConnectionConfig) -> Self {
        let backend = if config.is_memory() {
            Backend::Memory(MemoryBroker::new())
        } else {
            Backend::Amqp
        };
        Self::build(config, backend)
    }

    /// Connection manager bound to an existing in-process broker
    pub fn in_memory(broker: MemoryBroker) -> Self {
        Self::build(ConnectionConfig::new(MEMORY_SCHEME), Backend::Memory(broker))
    }

    fn build(config: ConnectionConfig, backend: Backend) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            name: format!("bookmesh-{}", uuid::Uuid::new_v4()),
            backend,
            state: Arc::new(state),
            session: RwLock::new(None),
        }
    }

    /// Set the connection name reported to the broker
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connect and open the shared channel.
    ///
    /// Retries up to `max_retries` times, then fails with
    /// [`BridgeError::ConnectFailed`]; the owning service should treat that as
    /// fatal. Calling this while connected is a no-op.
    pub async fn connect(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.state.send_replace(ConnectionState::Connecting);
        let max_retries = self.config.max_retries.max(1);
        let mut attempts = 0;

        loop {
            match self.try_connect().await {
                Ok(session) => {
                    *self.session.write().await = Some(session);
                    self.state.send_replace(ConnectionState::Connected);
                    info!("Connected to broker at {}", self.config.display_url());
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= max_retries {
                        error!(
                            "Failed to connect to broker after {} attempts: {}",
                            attempts, e
                        );
                        self.state.send_replace(ConnectionState::Disconnected);
                        return Err(BridgeError::ConnectFailed {
                            url: self.config.display_url(),
                            attempts,
                            reason: e.to_string(),
                        });
                    }

                    warn!(
                        "Connection attempt {} failed, retrying in {}ms: {}",
                        attempts, self.config.retry_delay_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<Session> {
        match &self.backend {
            Backend::Memory(broker) => {
                debug!("Opening in-memory broker channel");
                Ok(Session {
                    channel: Arc::new(broker.channel()),
                    amqp: None,
                })
            }
            Backend::Amqp => {
                let connection = amqp::open_connection(&self.config, &self.name).await?;

                let state = self.state.clone();
                connection.on_error(move |err| {
                    error!("Broker connection error: {}", err);
                    state.send_replace(ConnectionState::Closed);
                });

                let channel = AmqpChannel::open(&connection, &self.config).await?;
                debug!("AMQP connection established");
                Ok(Session {
                    channel: Arc::new(channel),
                    amqp: Some(connection),
                })
            }
        }
    }

    /// Current channel, or an error if the bridge is not usable.
    ///
    /// Fails with [`BridgeError::ChannelNotInitialized`] before `connect`
    /// completes and with [`BridgeError::ChannelClosed`] after a disconnect.
    pub async fn channel(&self) -> Result<SharedChannel> {
        let state = self.state();
        match state {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(BridgeError::ChannelNotInitialized)
            }
            ConnectionState::Closed => return Err(BridgeError::ChannelClosed),
            ConnectionState::Connected => {}
        }

        let channel = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or(BridgeError::ChannelNotInitialized)?;

        if !channel.is_open() {
            warn!("Broker channel closed underneath the connection");
            self.state.send_replace(ConnectionState::Closed);
            return Err(BridgeError::ChannelClosed);
        }

        Ok(channel)
    }

    /// Tear down the channel and the connection
    pub async fn close(&self) -> Result<()> {
        let session = self.session.write().await.take();
        self.state.send_replace(ConnectionState::Closed);

        if let Some(session) = session {
            if let Err(e) = session.channel.close().await {
                warn!("Error closing broker channel: {}", e);
            }
            if let Some(connection) = session.amqp {
                connection.close(200, "bridge shutdown").await?;
            }
            info!("Broker connection closed");
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Check if connection is healthy
    pub async fn is_connected(&self) -> bool {
        self.channel().await.is_ok()
    }

    /// Get connection statistics for monitoring
    pub async fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            state: self.state(),
            is_connected: self.is_connected().await,
            backend: match self.backend {
                Backend::Amqp => "amqp",
                Backend::Memory(_) => "memory",
            },
            url: self.config.display_url(),
        }
    }
}

/// Connection statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub is_connected: bool,
    pub backend: &'static str,
    pub url: String,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.display_url())
            .field("state", &self.state())
            .finish()
    }
}
