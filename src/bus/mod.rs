//! Event bus over RabbitMQ.
//!
//! This module contains:
//! - `EventBus`: publish, delayed publish, subscribe and consumer recovery
//! - `EventHandler` trait: For processing events
//! - Routing metadata (`ExchangeDescriptor`, `EventMetadata`)
//! - Connection providers: AMQP (RabbitMQ) and an in-memory broker

use std::sync::Arc;

use tracing::info;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod catalog;
pub mod connection;
pub mod dispatch;
pub mod event;
pub mod event_bus;
pub mod handler;
pub mod memory;
pub mod serializer;
pub mod subscriptions;
pub mod topology;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnection;
pub use connection::{BrokerChannel, ConnectionProvider, Delivery, MessageProperties};
pub use dispatch::{DispatchCache, DispatchResult};
pub use event::{
    Event, EventMetadata, ExchangeDescriptor, ExchangeKind, FieldTable, FieldValue, HandlingKind,
    Qos,
};
pub use event_bus::{EventBus, EventBusBuilder, PublishOptions};
pub use handler::{EventHandler, FactoryResolver, HandlerError, HandlerId, HandlerResolver};
pub use memory::InMemoryBroker;
pub use serializer::{BusSerializer, JsonSerializer};
pub use subscriptions::{InMemorySubscriptions, Subscription, SubscriptionsManager};

use crate::config::BusConfig;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("Channel fault: {0}")]
    ChannelFault(String),

    #[error("Event bus is shut down")]
    ShutDown,
}

impl BusError {
    /// Broker hiccups worth retrying. Everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::Publish(_))
    }
}

/// Connect to the configured broker and start a bus builder with the
/// configuration already applied.
#[cfg(feature = "amqp")]
pub async fn connect(config: &BusConfig) -> Result<EventBusBuilder> {
    let connection = AmqpConnection::new(&config.amqp).await?;
    info!(url = %config.amqp.url, "Event bus connection initialized");
    Ok(EventBus::builder(Arc::new(connection)).config(config))
}

/// Bus builder over an in-memory broker, for tests and local runs.
pub fn in_memory(config: &BusConfig) -> (InMemoryBroker, EventBusBuilder) {
    let broker = InMemoryBroker::new();
    let builder = EventBus::builder(Arc::new(broker.clone())).config(config);
    info!("In-memory event bus initialized");
    (broker, builder)
}
