//! rabbitbus - typed event bus over RabbitMQ
//!
//! Publishes domain events to AMQP exchanges and dispatches received
//! messages to registered handlers, rebuilding consumers when a broker
//! channel faults.

pub mod bus;
pub mod config;
pub mod utils;

pub use bus::{
    BusError, Event, EventBus, EventBusBuilder, EventHandler, EventMetadata, ExchangeDescriptor,
    ExchangeKind, HandlerError, HandlingKind, Result,
};
pub use config::BusConfig;
