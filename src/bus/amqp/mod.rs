//! AMQP (RabbitMQ) connection provider.
//!
//! Connections come from a deadpool-lapin pool; publish channels are kept in
//! an idle list and reused. Every channel runs in publisher-confirm mode so a
//! broker nack surfaces as a publish error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable as AmqpTable, LongString, ShortString},
    BasicProperties, Channel,
};
use tracing::{debug, info, warn};

use super::connection::{
    BrokerChannel, ConnectionProvider, Delivery, DeliveryStream, MessageProperties,
};
use super::event::{ExchangeKind, FieldTable, FieldValue, Qos};
use super::{BusError, Result};
use crate::config::AmqpConfig;

/// RabbitMQ connection provider backed by a connection pool.
pub struct AmqpConnection {
    pool: Pool,
    url: String,
    connected: AtomicBool,
    idle: Mutex<Vec<Box<dyn BrokerChannel>>>,
    max_idle: usize,
}

impl AmqpConnection {
    /// Create the pool and verify the broker is reachable.
    pub async fn new(config: &AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.connection_pool_size.max(1))
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        pool.get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        info!(url = %config.url, "Connected to AMQP");

        Ok(Self {
            pool,
            url: config.url.clone(),
            connected: AtomicBool::new(true),
            idle: Mutex::new(Vec::new()),
            max_idle: config.channel_pool_size,
        })
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Box<dyn BrokerChannel>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a fresh confirm-mode channel on a pooled connection.
    async fn open_channel(&self) -> Result<AmqpChannel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;

        debug!(channel = channel.id(), "Opened AMQP channel");
        Ok(AmqpChannel { channel })
    }
}

#[async_trait]
impl ConnectionProvider for AmqpConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn try_connect(&self) -> Result<bool> {
        let connected = match self.pool.get().await {
            Ok(conn) => conn.status().connected(),
            Err(e) => {
                warn!(url = %self.url, error = %e, "AMQP connection attempt failed");
                false
            }
        };
        self.connected.store(connected, Ordering::Release);
        if connected {
            info!(url = %self.url, "AMQP connection established");
        }
        Ok(connected)
    }

    async fn get_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        loop {
            let idle = self.idle().pop();
            match idle {
                Some(channel) if !channel.is_closed() => return Ok(channel),
                Some(_) => continue,
                None => break,
            }
        }
        match self.open_channel().await {
            Ok(channel) => Ok(Box::new(channel)),
            Err(e) => {
                self.connected.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn return_channel(&self, channel: Box<dyn BrokerChannel>) {
        if channel.is_closed() {
            return;
        }
        let mut idle = self.idle();
        if idle.len() < self.max_idle {
            idle.push(channel);
        }
    }
}

/// One lapin channel.
pub struct AmqpChannel {
    channel: Channel,
}

/// Connection-level failures are worth retrying; anything else means the
/// channel itself is gone.
fn classify(error: lapin::Error, context: &str) -> BusError {
    let message = format!("{}: {}", context, error);
    if matches!(
        error,
        lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::MissingHeartbeatError
    ) {
        BusError::Connection(message)
    } else {
        BusError::ChannelFault(message)
    }
}

fn exchange_type(kind: ExchangeKind) -> Result<lapin::ExchangeKind> {
    kind.broker_type()
        .map(|t| lapin::ExchangeKind::Custom(t.to_string()))
        .ok_or_else(|| BusError::Configuration("the default exchange cannot be declared".into()))
}

fn to_amqp_value(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::Bool(v) => AMQPValue::Boolean(*v),
        FieldValue::Int(v) => AMQPValue::LongLongInt(*v),
        FieldValue::Str(v) => AMQPValue::LongString(LongString::from(v.as_str())),
    }
}

fn to_amqp_table(table: &FieldTable) -> AmqpTable {
    let mut out = AmqpTable::default();
    for (key, value) in table {
        out.insert(ShortString::from(key.as_str()), to_amqp_value(value));
    }
    out
}

fn from_amqp_value(value: &AMQPValue) -> Option<FieldValue> {
    let value = match value {
        AMQPValue::Boolean(v) => FieldValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => FieldValue::Int(*v),
        AMQPValue::ShortString(v) => FieldValue::Str(v.as_str().to_string()),
        AMQPValue::LongString(v) => {
            FieldValue::Str(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        _ => return None,
    };
    Some(value)
}

fn from_amqp_table(table: &AmqpTable) -> FieldTable {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| Some((key.as_str().to_string(), from_amqp_value(value)?)))
        .collect()
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default()
        .with_delivery_mode(properties.delivery_mode)
        .with_priority(properties.priority);
    if let Some(headers) = &properties.headers {
        out = out.with_headers(to_amqp_table(headers));
    }
    if let Some(id) = &properties.message_id {
        out = out.with_message_id(ShortString::from(id.as_str()));
    }
    if let Some(content_type) = &properties.content_type {
        out = out.with_content_type(ShortString::from(content_type.as_str()));
    }
    out
}

fn from_delivery(mut delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let properties = MessageProperties {
        delivery_mode: properties.delivery_mode().unwrap_or_default(),
        priority: properties.priority().unwrap_or_default(),
        headers: properties.headers().as_ref().map(from_amqp_table),
        message_id: properties.message_id().as_ref().map(|v| v.as_str().to_string()),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|v| v.as_str().to_string()),
    };
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties,
        body: std::mem::take(&mut delivery.data),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_closed(&self) -> bool {
        !self.channel.status().connected()
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        arguments: &FieldTable,
    ) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                exchange_type(kind)?,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                to_amqp_table(arguments),
            )
            .await
            .map_err(|e| classify(e, "Failed to declare exchange"))
    }

    async fn queue_declare(&self, queue: &str, arguments: &FieldTable) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                to_amqp_table(arguments),
            )
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "Failed to declare queue"))
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                AmqpTable::default(),
            )
            .await
            .map_err(|e| classify(e, "Failed to bind queue"))
    }

    async fn basic_qos(&self, qos: Qos) -> Result<()> {
        if qos.prefetch_size != 0 {
            debug!(
                prefetch_size = qos.prefetch_size,
                "Prefetch size is not supported by the client, ignoring"
            );
        }
        self.channel
            .basic_qos(
                qos.prefetch_count,
                BasicQosOptions {
                    global: qos.global,
                },
            )
            .await
            .map_err(|e| classify(e, "Failed to set prefetch"))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;
        if confirmation.is_nack() {
            return Err(BusError::Publish("Broker rejected the message".to_string()));
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                AmqpTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(from_delivery)
                    .map_err(|e| BusError::ChannelFault(format!("Consumer delivery error: {}", e)))
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| classify(e, "Failed to ack message"))
    }

    async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| classify(e, "Failed to close channel"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::connection::PERSISTENT;

    #[test]
    fn test_exchange_type_mapping() {
        assert!(matches!(
            exchange_type(ExchangeKind::Delayed),
            Ok(lapin::ExchangeKind::Custom(ref t)) if t == "x-delayed-message"
        ));
        assert!(matches!(
            exchange_type(ExchangeKind::Topic),
            Ok(lapin::ExchangeKind::Custom(ref t)) if t == "topic"
        ));
        assert!(matches!(
            exchange_type(ExchangeKind::None),
            Err(BusError::Configuration(_))
        ));
    }

    #[test]
    fn test_header_table_conversion() {
        let mut headers = FieldTable::new();
        headers.insert("x-delay".into(), FieldValue::Int(1_500));
        headers.insert("tenant".into(), FieldValue::from("acme"));
        headers.insert("replayed".into(), FieldValue::Bool(true));

        let amqp = to_amqp_table(&headers);
        assert!(matches!(
            amqp.inner().get(&ShortString::from("x-delay")),
            Some(AMQPValue::LongLongInt(1_500))
        ));

        assert_eq!(from_amqp_table(&amqp), headers);
    }

    #[test]
    fn test_narrow_broker_integers_widen() {
        let mut amqp = AmqpTable::default();
        amqp.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(10));
        amqp.insert("x-death".into(), AMQPValue::Void);

        let table = from_amqp_table(&amqp);
        assert_eq!(table.get("x-max-priority"), Some(&FieldValue::Int(10)));
        // Unsupported values are dropped
        assert!(!table.contains_key("x-death"));
    }

    #[test]
    fn test_basic_properties() {
        let mut headers = FieldTable::new();
        headers.insert("tenant".into(), FieldValue::from("acme"));
        let properties = MessageProperties {
            headers: Some(headers),
            message_id: Some("42".into()),
            content_type: Some("application/json".into()),
            ..MessageProperties::persistent(5)
        };

        let basic = to_basic_properties(&properties);
        assert_eq!(*basic.delivery_mode(), Some(PERSISTENT));
        assert_eq!(*basic.priority(), Some(5));
        assert_eq!(basic.message_id().as_ref().map(|v| v.as_str()), Some("42"));
        assert!(basic.headers().is_some());
    }

    #[test]
    fn test_classify_errors() {
        let io = lapin::Error::IOError(std::sync::Arc::new(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset,
        )));
        assert!(classify(io, "publish").is_transient());

        let channel = lapin::Error::InvalidChannel(7);
        assert!(matches!(
            classify(channel, "ack"),
            BusError::ChannelFault(_)
        ));
    }
}
