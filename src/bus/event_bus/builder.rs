use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{BusInner, ConsumerGroup, EventBus};
use crate::bus::catalog::{EventCatalog, EventRegistration, HandlerRegistration};
use crate::bus::connection::ConnectionProvider;
use crate::bus::dispatch::DispatchCache;
use crate::bus::event::{Event, EventMetadata, ExchangeDescriptor};
use crate::bus::handler::{EventHandler, FactoryResolver, HandlerId, HandlerResolver};
use crate::bus::serializer::{BusSerializer, JsonSerializer};
use crate::bus::subscriptions::{InMemorySubscriptions, SubscriptionsManager};
use crate::config::BusConfig;
use crate::utils::retry::ResiliencePolicy;

/// Assembles an [`EventBus`]: event types, handlers and collaborators.
///
/// ```ignore
/// let bus = EventBus::builder(connection)
///     .event::<OrderCreated>(EventMetadata::new(orders).with_qos(10))
///     .handler::<OrderCreated, _, _>(|| AuditHandler::default())
///     .build();
/// ```
pub struct EventBusBuilder<S: BusSerializer = JsonSerializer> {
    connection: Arc<dyn ConnectionProvider>,
    serializer: S,
    catalog: EventCatalog<S>,
    factories: FactoryResolver,
    excluded: Vec<HandlerId>,
    resolver: Option<Arc<dyn HandlerResolver>>,
    subscriptions: Option<Arc<dyn SubscriptionsManager>>,
    policy: ResiliencePolicy,
    consumer_tag_prefix: String,
    shutdown_timeout: Duration,
    overrides: HashMap<String, ExchangeDescriptor>,
}

impl EventBusBuilder<JsonSerializer> {
    pub fn new(connection: Arc<dyn ConnectionProvider>) -> Self {
        Self::with_serializer(connection, JsonSerializer)
    }
}

impl<S: BusSerializer> EventBusBuilder<S> {
    /// Builder whose bus encodes message bodies with `serializer`.
    pub fn with_serializer(connection: Arc<dyn ConnectionProvider>, serializer: S) -> Self {
        Self {
            connection,
            serializer,
            catalog: EventCatalog::new(),
            factories: FactoryResolver::new(),
            excluded: Vec::new(),
            resolver: None,
            subscriptions: None,
            policy: ResiliencePolicy::default(),
            consumer_tag_prefix: crate::config::ConsumerConfig::default().consumer_tag_prefix,
            shutdown_timeout: Duration::from_millis(
                crate::config::ConsumerConfig::default().shutdown_timeout_ms,
            ),
            overrides: HashMap::new(),
        }
    }

    /// Register event type `E` with its routing metadata.
    pub fn event<E: Event>(mut self, metadata: impl Into<EventMetadata>) -> Self {
        self.catalog
            .register_event(EventRegistration::of::<E>(metadata.into()));
        self
    }

    /// Register handler `H` for event `E`, built by `factory` once per delivery.
    pub fn handler<E, H, F>(mut self, factory: F) -> Self
    where
        E: Event,
        H: EventHandler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.factories.register::<H, F>(factory);
        self.handler_type::<E, H>()
    }

    /// Register handler `H` for event `E` without a factory. The handler must
    /// be resolvable through the resolver set with [`Self::resolver`].
    pub fn handler_type<E, H>(mut self) -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        self.catalog
            .register_handler(HandlerRegistration::of::<E, H>());
        self
    }

    /// Keep handler `H` registered but never subscribe it.
    pub fn exclude_handler<H: 'static>(mut self) -> Self {
        self.excluded.push(HandlerId::of::<H>());
        self
    }

    /// Resolve handler instances through `resolver` instead of the factories.
    pub fn resolver(mut self, resolver: Arc<dyn HandlerResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Share a subscription registry with other components.
    pub fn subscriptions(mut self, subscriptions: Arc<dyn SubscriptionsManager>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    pub fn resilience(mut self, policy: ResiliencePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn consumer_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_tag_prefix = prefix.into();
        self
    }

    /// Upper bound on how long [`EventBus::shutdown`] waits for consumers.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Apply retry, consumer and exchange override settings.
    pub fn config(mut self, config: &BusConfig) -> Self {
        self.policy = ResiliencePolicy::from(&config.retry);
        self.consumer_tag_prefix = config.consumer.consumer_tag_prefix.clone();
        self.shutdown_timeout = Duration::from_millis(config.consumer.shutdown_timeout_ms);
        self.overrides.extend(
            config
                .exchanges
                .iter()
                .map(|(name, descriptor)| (name.to_ascii_lowercase(), descriptor.clone())),
        );
        self
    }

    pub fn build(mut self) -> EventBus<S> {
        let overrides = std::mem::take(&mut self.overrides);
        self.catalog
            .apply_overrides(|name| overrides.get(&name.to_ascii_lowercase()));
        for handler in &self.excluded {
            self.catalog.exclude_handler(*handler);
        }
        for orphan in self.catalog.orphan_handlers() {
            warn!(handler = %orphan.id, "Handler registered for an event type with no metadata");
        }
        if let Err(e) = self.catalog.ensure_unique_names() {
            warn!(error = %e, "Event names collide, subscribe and publish will fail");
        }

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(self.factories) as Arc<dyn HandlerResolver>);
        let subscriptions = self
            .subscriptions
            .unwrap_or_else(|| Arc::new(InMemorySubscriptions::new()));
        let shutdown = CancellationToken::new();
        let consumers = ConsumerGroup {
            generation: 0,
            token: shutdown.child_token(),
            tasks: Vec::new(),
        };

        info!(
            events = self.catalog.events().count(),
            max_retries = self.policy.max_retries,
            "Event bus built"
        );

        EventBus {
            inner: Arc::new(BusInner {
                connection: self.connection,
                subscriptions,
                resolver,
                serializer: self.serializer,
                catalog: self.catalog,
                cache: DispatchCache::new(),
                policy: self.policy,
                consumer_tag_prefix: self.consumer_tag_prefix,
                shutdown_timeout: self.shutdown_timeout,
                shutdown,
                consumers: Mutex::new(consumers),
            }),
        }
    }
}
