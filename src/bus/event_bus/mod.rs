//! The event bus: publish, delayed publish, subscribe and consumer recovery.
//!
//! `EventBus` is a cheap handle over shared state; clone it freely. Consumers
//! run as one background task per subscribed event type, grouped into a
//! generation. A channel fault tears the whole generation down and rebuilds
//! it from the catalog.

mod builder;
mod consumer;

pub use builder::EventBusBuilder;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::catalog::EventCatalog;
use super::connection::{BrokerChannel, ConnectionProvider, MessageProperties};
use super::dispatch::DispatchCache;
use super::event::{Event, EventMetadata, ExchangeKind};
use super::handler::HandlerResolver;
use super::serializer::{BusSerializer, JsonSerializer};
use super::subscriptions::SubscriptionsManager;
use super::topology::{apply_delay, exchange_args, merge_headers, publish_properties};
use super::{BusError, Result};
use crate::utils::retry::ResiliencePolicy;

/// Per-call publish settings.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Overrides the descriptor's routing key.
    pub routing_key: Option<String>,
    /// Message priority, 0 when unset.
    pub priority: u8,
    /// Checked once, right before the message is handed to the broker.
    pub cancellation: Option<CancellationToken>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// Running consumers of one generation.
struct ConsumerGroup {
    generation: u64,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub(crate) struct BusInner<S> {
    connection: Arc<dyn ConnectionProvider>,
    subscriptions: Arc<dyn SubscriptionsManager>,
    resolver: Arc<dyn HandlerResolver>,
    serializer: S,
    catalog: EventCatalog<S>,
    cache: DispatchCache,
    policy: ResiliencePolicy,
    consumer_tag_prefix: String,
    shutdown_timeout: Duration,
    shutdown: CancellationToken,
    consumers: Mutex<ConsumerGroup>,
}

/// Publishes events and runs their consumers.
pub struct EventBus<S: BusSerializer = JsonSerializer> {
    inner: Arc<BusInner<S>>,
}

impl<S: BusSerializer> Clone for EventBus<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl EventBus<JsonSerializer> {
    /// Start building a JSON bus over `connection`.
    pub fn builder(connection: Arc<dyn ConnectionProvider>) -> EventBusBuilder<JsonSerializer> {
        EventBusBuilder::new(connection)
    }
}

impl<S: BusSerializer> EventBus<S> {
    /// Publish `event` to its exchange with default options.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<()> {
        self.publish_with(event, PublishOptions::default()).await
    }

    /// Publish `event` to its exchange.
    ///
    /// Disabled event types are skipped without touching the broker. A
    /// cancelled token makes this return `Ok(())` without publishing.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(event = E::name(), event_id = %event.event_id())
    )]
    pub async fn publish_with<E: Event>(&self, event: &E, options: PublishOptions) -> Result<()> {
        self.publish_inner(event, None, options).await
    }

    /// Publish `event` through a delayed-message exchange, delivered after
    /// `ttl` milliseconds.
    ///
    /// A zero `ttl` keeps an `x-delay` already set in the event's headers.
    /// Fails with [`BusError::Configuration`] unless the event's exchange is
    /// [`ExchangeKind::Delayed`].
    #[tracing::instrument(
        name = "bus.publish_delayed",
        skip_all,
        fields(event = E::name(), event_id = %event.event_id(), ttl = ttl)
    )]
    pub async fn publish_delayed<E: Event>(
        &self,
        event: &E,
        ttl: u32,
        options: PublishOptions,
    ) -> Result<()> {
        self.publish_inner(event, Some(ttl), options).await
    }

    async fn publish_inner<E: Event>(
        &self,
        event: &E,
        ttl: Option<u32>,
        options: PublishOptions,
    ) -> Result<()> {
        let inner = &self.inner;
        let registration = inner.catalog.event::<E>().ok_or_else(|| {
            BusError::Configuration(format!("{} has no exchange metadata registered", E::name()))
        })?;
        inner.catalog.ensure_unique_name(registration)?;
        let metadata = &registration.metadata;
        let descriptor = &metadata.exchange;

        if !descriptor.enable {
            debug!(exchange = %descriptor.exchange, "Event type disabled, skipping publish");
            return Ok(());
        }
        if ttl.is_some() && descriptor.kind != ExchangeKind::Delayed {
            return Err(BusError::Configuration(format!(
                "{} is not routed through a delayed exchange (kind: {:?})",
                E::name(),
                descriptor.kind
            )));
        }
        if inner.shutdown.is_cancelled() {
            return Err(BusError::ShutDown);
        }

        let event_id = event.event_id();
        self.ensure_connected(event_id).await?;

        let mut headers = merge_headers(&metadata.headers, event.headers());
        if let Some(ttl) = ttl {
            apply_delay(&mut headers, ttl);
        }
        let properties = publish_properties(
            options.priority,
            headers,
            event_id.to_string(),
            inner.serializer.content_type(),
        );

        let channel = inner
            .policy
            .execute("get_channel", event_id, || inner.connection.get_channel())
            .await?;
        let result = self
            .publish_on(channel.as_ref(), event, metadata, &properties, &options)
            .await;
        inner.connection.return_channel(channel).await;
        result
    }

    async fn publish_on<E: Event>(
        &self,
        channel: &dyn BrokerChannel,
        event: &E,
        metadata: &EventMetadata,
        properties: &MessageProperties,
        options: &PublishOptions,
    ) -> Result<()> {
        let inner = &self.inner;
        let descriptor = &metadata.exchange;
        let event_id = event.event_id();

        if descriptor.kind != ExchangeKind::None {
            let arguments = exchange_args(metadata);
            let arguments = &arguments;
            inner
                .policy
                .execute("exchange_declare", event_id, move || async move {
                    channel
                        .exchange_declare(&descriptor.exchange, descriptor.kind, arguments)
                        .await
                })
                .await?;
        }

        if options.is_cancelled() {
            debug!("Publish cancelled before reaching the broker");
            return Ok(());
        }

        let body = inner.serializer.serialize(event)?;
        let body = body.as_slice();
        let routing_key = options
            .routing_key
            .as_deref()
            .unwrap_or(&descriptor.routing_key);

        inner
            .policy
            .execute("publish", event_id, move || async move {
                channel
                    .basic_publish(&descriptor.exchange, routing_key, properties, body)
                    .await
            })
            .await?;

        debug!(
            exchange = %descriptor.exchange,
            routing_key = %routing_key,
            priority = properties.priority,
            "Published event"
        );
        Ok(())
    }

    /// Make sure the provider holds a live connection, reconnecting under the
    /// resilience policy.
    async fn ensure_connected(&self, event_id: Uuid) -> Result<()> {
        let connection = &self.inner.connection;
        if connection.is_connected() {
            return Ok(());
        }
        self.inner
            .policy
            .execute("connect", event_id, move || async move {
                if connection.try_connect().await? {
                    Ok(())
                } else {
                    Err(BusError::Connection("broker unreachable".to_string()))
                }
            })
            .await
    }

    /// Stop consuming and clear subscriptions.
    ///
    /// Signals every consumer task and waits, up to the configured shutdown
    /// timeout, for them to finish the delivery they are handling. Consumers
    /// still busy after that are left to finish in the background.
    /// Idempotent; publish afterwards fails with [`BusError::ShutDown`].
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.shutdown.cancel();

        let tasks = std::mem::take(&mut inner.consumers.lock().await.tasks);
        inner.subscriptions.clear();
        inner.cache.clear().await;

        let pending = tasks.len();
        match tokio::time::timeout(inner.shutdown_timeout, futures::future::join_all(tasks)).await {
            Ok(results) => {
                for e in results.into_iter().filter_map(|r| r.err()) {
                    warn!(error = %e, "Consumer task ended abnormally");
                }
            }
            Err(_) => warn!(
                consumers = pending,
                timeout_ms = %inner.shutdown_timeout.as_millis(),
                "Consumers still busy after shutdown timeout, detaching"
            ),
        }
        info!("Event bus shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionsManager> {
        &self.inner.subscriptions
    }

    pub fn dispatch_cache(&self) -> &DispatchCache {
        &self.inner.cache
    }

    pub fn catalog(&self) -> &EventCatalog<S> {
        &self.inner.catalog
    }

    /// Consumer generation, bumped by every recovery.
    pub async fn generation(&self) -> u64 {
        self.inner.consumers.lock().await.generation
    }

    /// Consumer tasks of the current generation still running.
    pub async fn running_consumers(&self) -> usize {
        self.inner
            .consumers
            .lock()
            .await
            .tasks
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }
}

#[cfg(test)]
mod tests;
