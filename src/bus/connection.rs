//! Broker connection contracts.
//!
//! The bus never talks to a broker client directly. It leases channels from
//! a [`ConnectionProvider`] and drives them through [`BrokerChannel`].

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::event::{ExchangeKind, FieldTable, Qos};
use super::Result;

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT: u8 = 2;

/// Properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub delivery_mode: u8,
    pub priority: u8,
    pub headers: Option<FieldTable>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn persistent(priority: u8) -> Self {
        Self {
            delivery_mode: PERSISTENT,
            priority,
            ..Default::default()
        }
    }

    pub fn header(&self, key: &str) -> Option<&super::event::FieldValue> {
        self.headers.as_ref().and_then(|h| h.get(key))
    }
}

/// A message pushed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Deliveries for one consumer. Ends (or yields an error) when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// One broker channel. Never shared between two logical operations.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_closed(&self) -> bool;

    /// Declare a durable exchange. Never called for [`ExchangeKind::None`].
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        arguments: &FieldTable,
    ) -> Result<()>;

    /// Declare a durable queue.
    async fn queue_declare(&self, queue: &str, arguments: &FieldTable) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn basic_qos(&self, qos: Qos) -> Result<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<()>;

    /// Start a manual-ack consumer on `queue`.
    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    /// Close the channel. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<()>;
}

/// Owns the broker connection and hands out channels.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Re-establish the connection. `Ok(false)` when the broker is still unreachable.
    async fn try_connect(&self) -> Result<bool>;

    async fn get_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    /// Give a publish channel back for reuse. Closed channels are dropped.
    async fn return_channel(&self, channel: Box<dyn BrokerChannel>);
}
