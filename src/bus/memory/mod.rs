//! In-memory broker for tests and local runs.
//!
//! Implements [`ConnectionProvider`] with RabbitMQ's routing rules: default,
//! direct, topic, fanout and delayed-message exchanges, manual acks, prefetch,
//! and redelivery of unacknowledged messages when their channel closes.
//!
//! Every broker call is recorded as a [`BrokerOp`] so tests can assert on
//! exactly what reached the broker. Faults can be injected on publish, on
//! connect and on consumer channels.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::connection::{
    BrokerChannel, ConnectionProvider, Delivery, DeliveryStream, MessageProperties,
};
use super::event::{ExchangeKind, FieldTable, Qos};
use super::topology::{DEFAULT_DELAYED_TYPE, X_DELAY, X_DELAYED_TYPE};
use super::{BusError, Result};

/// A broker call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    OpenChannel(u16),
    ExchangeDeclare {
        exchange: String,
        kind: ExchangeKind,
        arguments: FieldTable,
    },
    QueueDeclare {
        queue: String,
        arguments: FieldTable,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Qos {
        channel: u16,
        prefetch_count: u16,
    },
    Publish {
        exchange: String,
        routing_key: String,
    },
    Consume {
        queue: String,
        consumer_tag: String,
    },
    Ack {
        channel: u16,
        delivery_tag: u64,
    },
    CloseChannel(u16),
}

/// A message accepted by `basic_publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct DeclaredExchange {
    kind: ExchangeKind,
    arguments: FieldTable,
}

struct QueueConsumer {
    channel: u16,
    tag: String,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Default)]
struct QueueState {
    arguments: FieldTable,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<QueueConsumer>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct ChannelState {
    next_tag: u64,
    prefetch: u16,
    unacked: BTreeMap<u64, Unacked>,
}

struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct BrokerState {
    connected: bool,
    next_channel_id: u16,
    channels_opened: usize,
    channels: HashMap<u16, ChannelState>,
    exchanges: HashMap<String, DeclaredExchange>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    ops: Vec<BrokerOp>,
    fail_publishes: usize,
    fail_connects: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            connected: true,
            next_channel_id: 0,
            channels_opened: 0,
            channels: HashMap::new(),
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            published: Vec::new(),
            ops: Vec::new(),
            fail_publishes: 0,
            fail_connects: 0,
        }
    }
}

impl BrokerState {
    /// Queues a message published to `exchange` with `routing_key` lands in.
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }
        let Some(declared) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        let algorithm = match declared.kind {
            ExchangeKind::Delayed => declared
                .arguments
                .get(X_DELAYED_TYPE)
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_DELAYED_TYPE),
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct | ExchangeKind::None => "direct",
        };

        let mut queues: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match algorithm {
                "fanout" => true,
                "topic" => topic_matches(&binding.routing_key, routing_key),
                _ => binding.routing_key == routing_key,
            };
            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        queues
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_back(message);
            self.pump(queue);
        }
    }

    /// Push ready messages to consumers with prefetch capacity, round robin.
    fn pump(&mut self, queue: &str) {
        let Self {
            queues, channels, ..
        } = self;
        let Some(state) = queues.get_mut(queue) else {
            return;
        };

        while !state.ready.is_empty() && !state.consumers.is_empty() {
            let count = state.consumers.len();
            let chosen = (0..count)
                .map(|offset| (state.next_consumer + offset) % count)
                .find(|&index| {
                    channels
                        .get(&state.consumers[index].channel)
                        .is_some_and(|c| c.prefetch == 0 || c.unacked.len() < c.prefetch as usize)
                });
            let Some(index) = chosen else {
                break;
            };
            state.next_consumer = (index + 1) % count;

            let Some(message) = state.ready.pop_front() else {
                break;
            };
            let consumer = &state.consumers[index];
            let Some(channel) = channels.get_mut(&consumer.channel) else {
                state.ready.push_front(message);
                break;
            };
            channel.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: channel.next_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            if consumer.sender.send(Ok(delivery)).is_err() {
                debug!(queue, consumer_tag = %consumer.tag, "Consumer gone, dropping it");
                state.ready.push_front(message);
                state.consumers.remove(index);
                state.next_consumer = 0;
                continue;
            }
            channel.unacked.insert(
                channel.next_tag,
                Unacked {
                    queue: queue.to_string(),
                    message,
                },
            );
        }
    }

    /// Close a channel: drop its consumers and requeue its unacked messages
    /// at the head of their queues, flagged as redelivered.
    fn close_channel(&mut self, id: u16) -> bool {
        let Some(channel) = self.channels.remove(&id) else {
            return false;
        };
        self.ops.push(BrokerOp::CloseChannel(id));

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != id);
            queue.next_consumer = 0;
        }

        let mut touched: Vec<String> = Vec::new();
        for (_, unacked) in channel.unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(StoredMessage {
                    redelivered: true,
                    ..unacked.message
                });
            }
            if !touched.contains(&unacked.queue) {
                touched.push(unacked.queue);
            }
        }
        for queue in touched {
            self.pump(&queue);
        }
        true
    }

    /// Fail every consumer stream on `id`, then close the channel.
    fn fault_channel(&mut self, id: u16, reason: &str) {
        for queue in self.queues.values() {
            for consumer in queue.consumers.iter().filter(|c| c.channel == id) {
                let _ = consumer
                    .sender
                    .send(Err(BusError::ChannelFault(reason.to_string())));
            }
        }
        self.close_channel(id);
    }
}

/// AMQP topic match: `*` is exactly one word, `#` is zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(actual)) if word == actual => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Shared in-memory broker. Clones talk to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    /// Ids of open channels handed back for reuse.
    idle: Arc<Mutex<Vec<u16>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn idle(&self) -> MutexGuard<'_, Vec<u16>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every broker call so far.
    pub fn ops(&self) -> Vec<BrokerOp> {
        self.lock().ops.clone()
    }

    pub fn op_count(&self) -> usize {
        self.lock().ops.len()
    }

    /// Messages accepted by publish, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn channels_opened(&self) -> usize {
        self.lock().channels_opened
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Declared type and arguments of `exchange`.
    pub fn exchange(&self, exchange: &str) -> Option<(ExchangeKind, FieldTable)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| (e.kind, e.arguments.clone()))
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.lock().queues.get(queue).map(|q| q.arguments.clone())
    }

    /// Routing keys binding `queue` to `exchange`.
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.queue == queue)
            .map(|b| b.routing_key.clone())
            .collect()
    }

    /// Messages waiting in `queue` (not delivered to any consumer).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Delivered but unacknowledged messages across all channels.
    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    /// Make the next `count` publishes fail with a transient error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().fail_publishes = count;
    }

    /// Make the next `count` connection attempts report the broker unreachable.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().fail_connects = count;
    }

    /// Fault the channels consuming `queue`, as if the broker closed them.
    pub fn fault_consumers(&self, queue: &str) {
        let mut state = self.lock();
        let channels: Vec<u16> = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.channel).collect())
            .unwrap_or_default();
        warn!(queue, channels = channels.len(), "Injecting consumer channel fault");
        for id in channels {
            state.fault_channel(id, "channel closed by broker");
        }
    }

    /// Drop the connection: every channel faults and new channels are refused
    /// until the next successful connect.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        let ids: Vec<u16> = state.channels.keys().copied().collect();
        for id in ids {
            state.fault_channel(id, "connection lost");
        }
    }

    fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let mut state = self.lock();
        if !state.connected {
            return Err(BusError::Connection("broker connection is down".to_string()));
        }
        state.next_channel_id = state.next_channel_id.wrapping_add(1);
        let id = state.next_channel_id;
        state.channels_opened += 1;
        state.channels.insert(id, ChannelState::default());
        state.ops.push(BrokerOp::OpenChannel(id));
        Ok(Box::new(MemoryChannel {
            id,
            broker: self.clone(),
        }))
    }

    fn publish(&self, exchange: &str, routing_key: &str, message: StoredMessage) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(BusError::Publish("injected publish failure".to_string()));
            }
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(BusError::ChannelFault(format!("no exchange '{exchange}'")));
            }
            state.ops.push(BrokerOp::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
            state.published.push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: message.properties.clone(),
                body: message.body.clone(),
            });

            let delayed = state
                .exchanges
                .get(exchange)
                .is_some_and(|e| e.kind == ExchangeKind::Delayed);
            let delay = message
                .properties
                .header(X_DELAY)
                .and_then(|v| v.as_int())
                .filter(|&ms| delayed && ms > 0);
            if delay.is_none() {
                for queue in state.route(exchange, routing_key) {
                    state.enqueue(&queue, message.clone());
                }
                return Ok(());
            }
            delay
        };

        if let Some(ms) = delay {
            let broker = self.clone();
            let (exchange, routing_key) = (exchange.to_string(), routing_key.to_string());
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms.unsigned_abs())).await;
                let mut state = broker.lock();
                for queue in state.route(&exchange, &routing_key) {
                    state.enqueue(&queue, message.clone());
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionProvider for InMemoryBroker {
    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn try_connect(&self) -> Result<bool> {
        let mut state = self.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Ok(false);
        }
        state.connected = true;
        Ok(true)
    }

    async fn get_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        loop {
            let idle = self.idle().pop();
            match idle {
                Some(id) if self.lock().channels.contains_key(&id) => {
                    return Ok(Box::new(MemoryChannel {
                        id,
                        broker: self.clone(),
                    }));
                }
                Some(_) => continue,
                None => return self.open_channel(),
            }
        }
    }

    async fn return_channel(&self, channel: Box<dyn BrokerChannel>) {
        if !channel.is_closed() {
            self.idle().push(channel.id());
        }
    }
}

struct MemoryChannel {
    id: u16,
    broker: InMemoryBroker,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if state.channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(BusError::ChannelFault(format!("channel {} is closed", self.id)))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_closed(&self) -> bool {
        !self.broker.lock().channels.contains_key(&self.id)
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        arguments: &FieldTable,
    ) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(existing) = state.exchanges.get(exchange) {
            if existing.kind != kind {
                return Err(BusError::ChannelFault(format!(
                    "exchange '{exchange}' already declared as {:?}",
                    existing.kind
                )));
            }
        } else {
            state.exchanges.insert(
                exchange.to_string(),
                DeclaredExchange {
                    kind,
                    arguments: arguments.clone(),
                },
            );
        }
        state.ops.push(BrokerOp::ExchangeDeclare {
            exchange: exchange.to_string(),
            kind,
            arguments: arguments.clone(),
        });
        Ok(())
    }

    async fn queue_declare(&self, queue: &str, arguments: &FieldTable) -> Result<()> {
        let mut state = self.open_state()?;
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState {
                arguments: arguments.clone(),
                ..Default::default()
            });
        state.ops.push(BrokerOp::QueueDeclare {
            queue: queue.to_string(),
            arguments: arguments.clone(),
        });
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(BusError::ChannelFault(format!("no queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::ChannelFault(format!("no exchange '{exchange}'")));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        state.ops.push(BrokerOp::QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn basic_qos(&self, qos: Qos) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = qos.prefetch_count;
        }
        state.ops.push(BrokerOp::Qos {
            channel: self.id,
            prefetch_count: qos.prefetch_count,
        });
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<()> {
        drop(self.open_state()?);
        self.broker.publish(
            exchange,
            routing_key,
            StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                properties: properties.clone(),
                body: body.to_vec(),
                redelivered: false,
            },
        )
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.open_state()?;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let Some(target) = state.queues.get_mut(queue) else {
            return Err(BusError::Subscribe(format!("no queue '{queue}'")));
        };
        target.consumers.push(QueueConsumer {
            channel: self.id,
            tag: consumer_tag.to_string(),
            sender,
        });
        state.ops.push(BrokerOp::Consume {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
        });
        state.pump(queue);

        Ok(futures::stream::poll_fn(move |cx| receiver.poll_recv(cx)).boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.open_state()?;
        let queue = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag))
            .map(|u| u.queue)
            .ok_or_else(|| {
                BusError::ChannelFault(format!("unknown delivery tag {delivery_tag}"))
            })?;
        state.ops.push(BrokerOp::Ack {
            channel: self.id,
            delivery_tag,
        });
        state.pump(&queue);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}
