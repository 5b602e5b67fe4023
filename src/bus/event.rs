//! Event types and per-event-type routing metadata.
//!
//! Routing is described by an [`EventMetadata`] record registered once per
//! event type with the bus builder, never by the event instance itself.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A domain event that can travel over the bus.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique id of this event instance. Used for tracing only.
    fn event_id(&self) -> Uuid;

    /// Name used as the subscription key. Defaults to the bare type name.
    fn name() -> &'static str {
        short_type_name::<Self>()
    }

    /// Headers contributed by this instance, merged over the static
    /// headers of the event type.
    fn headers(&self) -> FieldTable {
        FieldTable::new()
    }
}

/// Last path segment of a type name (`orders::OrderCreated` -> `OrderCreated`).
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Value stored in AMQP header and argument tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// Ordered header/argument table.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// Routing algorithm of an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Default exchange: no declaration, routed to the queue named by the routing key.
    None,
    #[default]
    Direct,
    Topic,
    Fanout,
    /// Delayed-message plugin exchange (`x-delayed-message`).
    Delayed,
}

impl ExchangeKind {
    /// Exchange type string sent to the broker, `None` for the default exchange.
    pub fn broker_type(&self) -> Option<&'static str> {
        match self {
            ExchangeKind::None => None,
            ExchangeKind::Direct => Some("direct"),
            ExchangeKind::Topic => Some("topic"),
            ExchangeKind::Fanout => Some("fanout"),
            ExchangeKind::Delayed => Some("x-delayed-message"),
        }
    }
}

/// Whether a subscription consumes normal or delayed deliveries of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandlingKind {
    Normal,
    Delayed,
}

impl std::fmt::Display for HandlingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlingKind::Normal => f.write_str("normal"),
            HandlingKind::Delayed => f.write_str("delayed"),
        }
    }
}

fn default_enable() -> bool {
    true
}

/// Exchange, queue and routing for one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDescriptor {
    /// Exchange name. Empty for [`ExchangeKind::None`].
    #[serde(default)]
    pub exchange: String,
    /// Work model of the exchange.
    #[serde(default)]
    pub kind: ExchangeKind,
    /// Queue consumed by subscribers.
    pub queue: String,
    /// Routing key used for publishing and binding.
    #[serde(default)]
    pub routing_key: String,
    /// Disabled event types are never published or consumed.
    #[serde(default = "default_enable")]
    pub enable: bool,
    /// Attach a dead-letter exchange to the queue.
    #[serde(default)]
    pub dead_letter: bool,
}

impl ExchangeDescriptor {
    pub fn new(kind: ExchangeKind, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            kind,
            queue: queue.into(),
            routing_key: String::new(),
            enable: true,
            dead_letter: false,
        }
    }

    /// Descriptor for the default exchange. Messages route straight to `queue`.
    pub fn default_exchange(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            routing_key: queue.clone(),
            ..Self::new(ExchangeKind::None, "", queue)
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enable = false;
        self
    }

    pub fn handling_kind(&self) -> HandlingKind {
        match self.kind {
            ExchangeKind::Delayed => HandlingKind::Delayed,
            _ => HandlingKind::Normal,
        }
    }

    /// Name of the dead-letter exchange attached to this queue.
    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.queue)
    }

    /// Name of the queue (and routing key) receiving dead letters.
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.queue)
    }
}

/// Consumer prefetch settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qos {
    #[serde(default)]
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    #[serde(default)]
    pub global: bool,
}

/// Everything the bus needs to know about an event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub exchange: ExchangeDescriptor,
    #[serde(default)]
    pub qos: Option<Qos>,
    /// Static headers attached to every published message.
    #[serde(default)]
    pub headers: FieldTable,
    /// Arguments passed to exchange declaration.
    #[serde(default)]
    pub exchange_args: FieldTable,
    /// Arguments passed to queue declaration.
    #[serde(default)]
    pub queue_args: FieldTable,
}

impl EventMetadata {
    pub fn new(exchange: ExchangeDescriptor) -> Self {
        Self {
            exchange,
            qos: None,
            headers: FieldTable::new(),
            exchange_args: FieldTable::new(),
            queue_args: FieldTable::new(),
        }
    }

    pub fn with_qos(mut self, prefetch_count: u16) -> Self {
        self.qos = Some(Qos {
            prefetch_count,
            ..Default::default()
        });
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_exchange_arg(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.exchange_args.insert(key.into(), value.into());
        self
    }

    pub fn with_queue_arg(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.queue_args.insert(key.into(), value.into());
        self
    }
}

impl From<ExchangeDescriptor> for EventMetadata {
    fn from(exchange: ExchangeDescriptor) -> Self {
        Self::new(exchange)
    }
}
