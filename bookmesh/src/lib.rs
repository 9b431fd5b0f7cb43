//! # Bookmesh - request/reply over a message broker
//!
//! Bookmesh lets the booking platform's services call each other
//! synchronously without knowing each other's addresses. Each operation is a
//! named queue (`<domain>.<action>`); a call publishes a correlated request
//! to that queue and waits, bounded by a timeout, for the reply on a
//! temporary queue of its own. The same connection also carries
//! fire-and-forget domain events.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bookmesh::{Request, Service, ServiceConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Service::new(ServiceConfig::from_env("doctor-service")?);
//!     service.connect().await?;
//!
//!     service.register_function("doctor.check_schedule", |request: Request| async move {
//!         Ok(json!({ "schedule": { "id": request.field("scheduleId"), "isAvailable": true } }))
//!     }).await?;
//!
//!     let claims = service
//!         .client()
//!         .call("auth.verify_token", json!({ "token": "..." }))
//!         .await?;
//!     if claims.is_failure() {
//!         // null reply: the handler failed or found nothing
//!     }
//!     Ok(())
//! }
//! ```
//!
//! A `memory://` broker URL runs everything in-process, which is what the
//! test suite uses.

mod amqp;
pub mod broker;
pub mod client;
pub mod connection;
pub mod error;
pub mod events;
pub mod memory;
pub mod message;
pub mod naming;
pub mod rpc;
pub mod service;

pub use broker::{BrokerChannel, Delivery, ExchangeKind, MessageProperties, PublishStatus};
pub use client::{RpcClient, RpcStats};
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use error::{BridgeError, Result};
pub use events::{EventOptions, EventPublisher, EventSubscription};
pub use memory::MemoryBroker;
pub use message::{CorrelationId, Deadline, DomainEvent, Reply, ReplyFormat, Request};
pub use rpc::{FunctionHandler, RpcHandler, RpcServer, ServerConfig};
pub use service::{Service, ServiceConfig, ServiceStats, ServiceStatus};
