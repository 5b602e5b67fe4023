use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::*;
use crate::bus::event::{ExchangeDescriptor, FieldTable, FieldValue};
use crate::bus::handler::{EventHandler, HandlerError};
use crate::bus::memory::{BrokerOp, InMemoryBroker};
use crate::bus::topology::{X_DELAY, X_DELAYED_TYPE};
use crate::config::BusConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderCreated {
    id: Uuid,
    sku: String,
}

impl Event for OrderCreated {
    fn event_id(&self) -> Uuid {
        self.id
    }

    fn headers(&self) -> FieldTable {
        FieldTable::from([("sku".to_string(), FieldValue::from(self.sku.as_str()))])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReminderDue {
    id: Uuid,
}

impl Event for ReminderDue {
    fn event_id(&self) -> Uuid {
        self.id
    }
}

struct AuditHandler;

#[async_trait]
impl EventHandler<OrderCreated> for AuditHandler {
    async fn handle(&self, _event: &OrderCreated) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

mod billing {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use crate::bus::event::Event;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OrderCreated {
        pub id: Uuid,
    }

    impl Event for OrderCreated {
        fn event_id(&self) -> Uuid {
            self.id
        }
    }
}

mod invoicing {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use crate::bus::event::Event;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OrderCreated {
        pub id: Uuid,
    }

    impl Event for OrderCreated {
        fn event_id(&self) -> Uuid {
            self.id
        }

        fn name() -> &'static str {
            "InvoiceOrderCreated"
        }
    }
}

#[async_trait]
impl EventHandler<billing::OrderCreated> for AuditHandler {
    async fn handle(&self, _event: &billing::OrderCreated) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

#[async_trait]
impl EventHandler<invoicing::OrderCreated> for AuditHandler {
    async fn handle(&self, _event: &invoicing::OrderCreated) -> std::result::Result<(), HandlerError> {
        Ok(())
    }
}

/// Never finishes a message.
struct StuckHandler {
    started: Arc<AtomicBool>,
}

#[async_trait]
impl EventHandler<OrderCreated> for StuckHandler {
    async fn handle(&self, _event: &OrderCreated) -> std::result::Result<(), HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        futures::future::pending::<()>().await;
        Ok(())
    }
}

fn order() -> OrderCreated {
    OrderCreated {
        id: Uuid::new_v4(),
        sku: "sku-1".to_string(),
    }
}

fn orders_descriptor() -> ExchangeDescriptor {
    ExchangeDescriptor::new(ExchangeKind::Direct, "orders", "orders.created")
        .with_routing_key("created")
}

fn reminders_descriptor() -> ExchangeDescriptor {
    ExchangeDescriptor::new(ExchangeKind::Delayed, "reminders", "reminders.due")
        .with_routing_key("due")
}

fn fast_policy(max_retries: usize) -> ResiliencePolicy {
    ResiliencePolicy::new(max_retries, Duration::from_millis(1))
}

fn bus_with(
    broker: &InMemoryBroker,
    configure: impl FnOnce(EventBusBuilder) -> EventBusBuilder,
) -> EventBus {
    configure(EventBus::builder(Arc::new(broker.clone())).resilience(fast_policy(3))).build()
}

fn count_ops(broker: &InMemoryBroker, predicate: impl Fn(&BrokerOp) -> bool) -> usize {
    broker.ops().iter().filter(|op| predicate(op)).count()
}

#[tokio::test]
async fn test_publish_declares_exchange_and_sets_properties() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| {
        b.event::<OrderCreated>(EventMetadata::new(orders_descriptor()).with_header("source", "shop"))
    });
    let event = order();

    bus.publish_with(&event, PublishOptions::new().priority(5))
        .await
        .unwrap();

    let (kind, _) = broker.exchange("orders").unwrap();
    assert_eq!(kind, ExchangeKind::Direct);

    let published = broker.published();
    assert_eq!(published.len(), 1);
    let message = &published[0];
    assert_eq!(message.exchange, "orders");
    assert_eq!(message.routing_key, "created");
    assert_eq!(message.properties.priority, 5);
    assert_eq!(message.properties.delivery_mode, crate::bus::connection::PERSISTENT);
    assert_eq!(message.properties.message_id, Some(event.id.to_string()));
    assert_eq!(
        message.properties.header("source").and_then(FieldValue::as_str),
        Some("shop")
    );
    assert_eq!(
        message.properties.header("sku").and_then(FieldValue::as_str),
        Some("sku-1")
    );

    let decoded: OrderCreated = serde_json::from_slice(&message.body).unwrap();
    assert_eq!(decoded.id, event.id);
}

#[tokio::test]
async fn test_publish_disabled_event_touches_nothing() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| {
        b.event::<OrderCreated>(orders_descriptor().disabled())
    });

    bus.publish(&order()).await.unwrap();

    assert_eq!(broker.op_count(), 0);
    assert_eq!(broker.channels_opened(), 0);
}

#[tokio::test]
async fn test_publish_unregistered_event_is_configuration_error() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| b);

    let result = bus.publish(&order()).await;

    assert!(matches!(result, Err(BusError::Configuration(_))));
    assert_eq!(broker.op_count(), 0);
}

#[tokio::test]
async fn test_publish_default_exchange_skips_declaration() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| {
        b.event::<OrderCreated>(ExchangeDescriptor::default_exchange("orders.created"))
    });

    bus.publish(&order()).await.unwrap();

    assert_eq!(
        count_ops(&broker, |op| matches!(op, BrokerOp::ExchangeDeclare { .. })),
        0
    );
    let published = broker.published();
    assert_eq!(published[0].exchange, "");
    assert_eq!(published[0].routing_key, "orders.created");
}

#[tokio::test]
async fn test_publish_routing_key_override() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| b.event::<OrderCreated>(orders_descriptor()));

    bus.publish_with(&order(), PublishOptions::new().routing_key("created.eu"))
        .await
        .unwrap();

    assert_eq!(broker.published()[0].routing_key, "created.eu");
}

#[tokio::test]
async fn test_publish_delayed_requires_delayed_exchange() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| b.event::<OrderCreated>(orders_descriptor()));

    let result = bus
        .publish_delayed(&order(), 1_000, PublishOptions::default())
        .await;

    assert!(matches!(result, Err(BusError::Configuration(_))));
    assert_eq!(broker.op_count(), 0);
}

#[tokio::test]
async fn test_publish_delayed_sets_delay_and_delayed_type() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| b.event::<ReminderDue>(reminders_descriptor()));

    bus.publish_delayed(&ReminderDue { id: Uuid::new_v4() }, 1_500, PublishOptions::default())
        .await
        .unwrap();

    let (kind, arguments) = broker.exchange("reminders").unwrap();
    assert_eq!(kind, ExchangeKind::Delayed);
    assert_eq!(
        arguments.get(X_DELAYED_TYPE).and_then(FieldValue::as_str),
        Some("direct")
    );
    let published = broker.published();
    assert_eq!(
        published[0].properties.header(X_DELAY).and_then(FieldValue::as_int),
        Some(1_500)
    );
}

#[tokio::test]
async fn test_publish_delayed_keeps_explicit_delayed_type() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| {
        b.event::<ReminderDue>(
            EventMetadata::new(reminders_descriptor()).with_exchange_arg(X_DELAYED_TYPE, "topic"),
        )
    });

    bus.publish_delayed(&ReminderDue { id: Uuid::new_v4() }, 10, PublishOptions::default())
        .await
        .unwrap();

    let (_, arguments) = broker.exchange("reminders").unwrap();
    assert_eq!(
        arguments.get(X_DELAYED_TYPE).and_then(FieldValue::as_str),
        Some("topic")
    );
}

#[tokio::test]
async fn test_publish_delayed_zero_ttl_keeps_configured_delay() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| {
        b.event::<ReminderDue>(EventMetadata::new(reminders_descriptor()).with_header(X_DELAY, 3_000u32))
    });
    let event = ReminderDue { id: Uuid::new_v4() };

    bus.publish_delayed(&event, 0, PublishOptions::default())
        .await
        .unwrap();
    bus.publish_delayed(&event, 250, PublishOptions::default())
        .await
        .unwrap();

    let delays: Vec<_> = broker
        .published()
        .iter()
        .map(|m| m.properties.header(X_DELAY).and_then(FieldValue::as_int))
        .collect();
    assert_eq!(delays, vec![Some(3_000), Some(250)]);
}

#[tokio::test]
async fn test_cancelled_publish_returns_ok_and_releases_channel() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| b.event::<OrderCreated>(orders_descriptor()));
    let token = CancellationToken::new();
    token.cancel();

    bus.publish_with(&order(), PublishOptions::new().cancellation(token))
        .await
        .unwrap();

    assert!(broker.published().is_empty());
    assert_eq!(
        count_ops(&broker, |op| matches!(op, BrokerOp::ExchangeDeclare { .. })),
        1
    );

    bus.publish(&order()).await.unwrap();
    assert_eq!(broker.channels_opened(), 1);
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_publish_retries_transient_failures() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| b.event::<OrderCreated>(orders_descriptor()));
    broker.fail_next_publishes(2);

    bus.publish(&order()).await.unwrap();

    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_publish_gives_up_after_max_retries() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| b.event::<OrderCreated>(orders_descriptor()));
    broker.fail_next_publishes(10);

    let result = bus.publish(&order()).await;

    assert!(matches!(result, Err(BusError::Publish(_))));
    assert!(broker.published().is_empty());
    // Channel still handed back after the failure
    assert_eq!(broker.open_channels(), 1);
}

#[tokio::test]
async fn test_publish_reconnects_dropped_connection() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| b.event::<OrderCreated>(orders_descriptor()));
    broker.disconnect();
    broker.fail_next_connects(1);

    bus.publish(&order()).await.unwrap();

    assert!(broker.is_connected());
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn test_publish_fails_when_broker_stays_unreachable() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| b.event::<OrderCreated>(orders_descriptor()));
    broker.disconnect();
    broker.fail_next_connects(100);

    let result = bus.publish(&order()).await;

    assert!(matches!(result, Err(BusError::Connection(_))));
}

#[tokio::test]
async fn test_publish_after_shutdown_fails() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| b.event::<OrderCreated>(orders_descriptor()));

    bus.shutdown().await;
    bus.shutdown().await;

    assert!(bus.is_shut_down());
    assert!(matches!(bus.publish(&order()).await, Err(BusError::ShutDown)));
    assert!(matches!(bus.subscribe().await, Err(BusError::ShutDown)));
}

#[tokio::test]
async fn test_config_overrides_registered_descriptor() {
    let broker = InMemoryBroker::new();
    let config = BusConfig::from_yaml(
        r#"
retry:
  max_retries: 1
  base_delay_ms: 1
exchanges:
  OrderCreated:
    exchange: orders.v2
    kind: topic
    queue: orders.v2.created
    routing_key: orders.created
"#,
    )
    .unwrap();
    let bus = EventBus::builder(Arc::new(broker.clone()))
        .event::<OrderCreated>(orders_descriptor())
        .config(&config)
        .build();

    bus.publish(&order()).await.unwrap();

    let (kind, _) = broker.exchange("orders.v2").unwrap();
    assert_eq!(kind, ExchangeKind::Topic);
    assert_eq!(broker.published()[0].routing_key, "orders.created");
}

#[tokio::test]
async fn test_excluded_handler_is_not_subscribed() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| {
        b.event::<OrderCreated>(orders_descriptor())
            .handler::<OrderCreated, _, _>(|| AuditHandler)
            .exclude_handler::<AuditHandler>()
    });

    let started = bus.subscribe().await.unwrap();

    assert_eq!(started, 0);
    assert!(bus.subscriptions().is_empty());
    assert_eq!(broker.consumer_count("orders.created"), 0);
}

fn billing_descriptor() -> ExchangeDescriptor {
    ExchangeDescriptor::new(ExchangeKind::Direct, "billing", "billing.created")
        .with_routing_key("created")
}

#[tokio::test]
async fn test_same_event_name_in_two_modules_fails_subscribe() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| {
        b.event::<OrderCreated>(orders_descriptor())
            .event::<billing::OrderCreated>(billing_descriptor())
            .handler::<OrderCreated, _, _>(|| AuditHandler)
            .handler::<billing::OrderCreated, _, _>(|| AuditHandler)
    });

    let result = bus.subscribe().await;

    assert!(matches!(result, Err(BusError::Configuration(_))));
    assert!(bus.subscriptions().is_empty());
    assert_eq!(broker.consumer_count("orders.created"), 0);
    assert_eq!(broker.consumer_count("billing.created"), 0);
}

#[tokio::test]
async fn test_same_event_name_in_two_modules_fails_publish() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| {
        b.event::<OrderCreated>(orders_descriptor())
            .event::<billing::OrderCreated>(billing_descriptor())
    });

    let result = bus.publish(&billing::OrderCreated { id: Uuid::new_v4() }).await;

    assert!(matches!(result, Err(BusError::Configuration(_))));
    assert_eq!(broker.op_count(), 0);
}

#[tokio::test]
async fn test_renamed_event_subscribes_alongside_same_type_name() {
    let broker = InMemoryBroker::new();
    let bus = bus_with(&broker, |b| {
        b.event::<OrderCreated>(orders_descriptor())
            .event::<invoicing::OrderCreated>(billing_descriptor())
            .handler::<OrderCreated, _, _>(|| AuditHandler)
            .handler::<invoicing::OrderCreated, _, _>(|| AuditHandler)
    });

    assert_eq!(bus.subscribe().await.unwrap(), 2);
    assert_eq!(broker.consumer_count("orders.created"), 1);
    assert_eq!(broker.consumer_count("billing.created"), 1);
}

#[tokio::test]
async fn test_shutdown_gives_up_on_stuck_consumer() {
    let broker = InMemoryBroker::new();
    let started = Arc::new(AtomicBool::new(false));
    let flag = started.clone();
    let bus = bus_with(&broker, |b| {
        b.event::<OrderCreated>(orders_descriptor())
            .handler::<OrderCreated, _, _>(move || StuckHandler {
                started: flag.clone(),
            })
            .shutdown_timeout(Duration::from_millis(50))
    });
    bus.subscribe().await.unwrap();
    bus.publish(&order()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(2), bus.shutdown()).await;

    assert!(finished.is_ok());
    assert!(bus.is_shut_down());
    assert!(bus.subscriptions().is_empty());
}
