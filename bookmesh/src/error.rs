use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Error types surfaced by the broker bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Broker unreachable or the AMQP transport failed
    #[error("AMQP connection error: {0}")]
    Connection(#[from] lapin::Error),

    /// Broker could not be reached after every connect attempt
    #[error("Failed to connect to broker at {url} after {attempts} attempts: {reason}")]
    ConnectFailed {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// Bridge used before `connect` completed
    #[error("Broker channel not initialized; call connect() first")]
    ChannelNotInitialized,

    /// Connection or channel went away after it was established
    #[error("Broker channel is closed")]
    ChannelClosed,

    /// Message serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No matching reply arrived before the deadline
    #[error("RPC call to '{queue}' timed out after {timeout_ms}ms")]
    Timeout { queue: String, timeout_ms: u64 },

    /// Broker refused or dropped a publish
    #[error("Publish to '{target}' failed: {reason}")]
    Publish { target: String, reason: String },

    /// A registered handler failed
    #[error("Handler error: {0}")]
    Handler(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal bridge errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Business logic errors from handlers
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Create a new handler error
    pub fn handler_error<T: ToString>(message: T) -> Self {
        Self::Handler(message.to_string())
    }

    /// Create a new config error
    pub fn config_error<T: ToString>(message: T) -> Self {
        Self::Config(message.to_string())
    }

    /// Create a new internal error
    pub fn internal_error<T: ToString>(message: T) -> Self {
        Self::Internal(message.to_string())
    }

    pub fn publish_error(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Publish {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if the caller may reasonably retry the operation.
    ///
    /// Timeouts are recoverable from the caller's point of view; the bridge
    /// itself never retries.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Publish { .. })
    }

    /// Errors meaning the bridge itself is unusable (as opposed to a slow or
    /// failing peer).
    pub fn is_bridge_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::ConnectFailed { .. }
                | Self::ChannelNotInitialized
                | Self::ChannelClosed
        )
    }
}
