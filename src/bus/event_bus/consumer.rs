use std::any::TypeId;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::{ConsumerGroup, EventBus};
use crate::bus::catalog::EventRegistration;
use crate::bus::connection::{BrokerChannel, Delivery, DeliveryStream};
use crate::bus::dispatch::DispatchResult;
use crate::bus::event::{ExchangeKind, FieldTable};
use crate::bus::handler::HandlerError;
use crate::bus::serializer::BusSerializer;
use crate::bus::subscriptions::Subscription;
use crate::bus::topology::{exchange_args, queue_args};
use crate::bus::{BusError, Result};
use crate::utils::retry::reconnect_backoff;

/// One consumer: its channel, delivery stream and the generation it belongs to.
struct Consumer {
    event_type: TypeId,
    channel: Box<dyn BrokerChannel>,
    deliveries: DeliveryStream,
    token: CancellationToken,
    generation: u64,
}

enum ConsumerExit {
    Cancelled,
    Fault(String),
}

impl<S: BusSerializer> EventBus<S> {
    /// Start one consumer per registered, enabled event type that has handlers.
    ///
    /// Event types already in the subscription registry are skipped, so
    /// calling this twice never binds a queue twice. Returns the number of
    /// consumers started.
    #[tracing::instrument(name = "bus.subscribe", skip_all)]
    pub async fn subscribe(&self) -> Result<usize> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::ShutDown);
        }
        self.ensure_connected(Uuid::nil()).await?;
        let mut group = self.inner.consumers.lock().await;
        self.bootstrap(&mut group).await
    }

    async fn bootstrap(&self, group: &mut ConsumerGroup) -> Result<usize> {
        let inner = &self.inner;
        inner.catalog.ensure_unique_names()?;
        let mut started = 0;

        for registration in inner.catalog.events() {
            let descriptor = registration.descriptor();
            if !descriptor.enable {
                debug!(event = registration.name, "Event type disabled, not subscribing");
                continue;
            }
            let handlers: Vec<_> = inner
                .catalog
                .handlers_for(registration.type_id)
                .map(|h| h.id)
                .collect();
            if handlers.is_empty() {
                debug!(event = registration.name, "No handlers registered, not subscribing");
                continue;
            }

            let kind = descriptor.handling_kind();
            let subscription =
                Subscription::new(registration.name, registration.type_id, kind, handlers);
            if !inner.subscriptions.add_subscription(subscription) {
                debug!(event = registration.name, %kind, "Already subscribed");
                continue;
            }

            match self.start_consumer(registration, group).await {
                Ok(()) => started += 1,
                Err(e) => {
                    inner.subscriptions.remove_subscription(registration.name, kind);
                    error!(event = registration.name, error = %e, "Failed to start consumer");
                    return Err(e);
                }
            }
        }

        info!(
            started,
            generation = group.generation,
            "Consumers started"
        );
        Ok(started)
    }

    async fn start_consumer(
        &self,
        registration: &EventRegistration<S>,
        group: &mut ConsumerGroup,
    ) -> Result<()> {
        let channel = self.inner.connection.get_channel().await?;
        let deliveries = match self.declare_consumer(channel.as_ref(), registration).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                let _ = channel.close().await;
                return Err(e);
            }
        };

        let consumer = Consumer {
            event_type: registration.type_id,
            channel,
            deliveries,
            token: group.token.child_token(),
            generation: group.generation,
        };
        let span = tracing::info_span!(
            "bus.consume",
            event = registration.name,
            queue = %registration.descriptor().queue
        );
        let bus = self.clone();
        group
            .tasks
            .push(tokio::spawn(bus.run_consumer(consumer).instrument(span)));
        Ok(())
    }

    /// Declare the exchange, queue, bindings and prefetch, then start consuming.
    async fn declare_consumer(
        &self,
        channel: &dyn BrokerChannel,
        registration: &EventRegistration<S>,
    ) -> Result<DeliveryStream> {
        let metadata = &registration.metadata;
        let descriptor = &metadata.exchange;
        let none = FieldTable::new();

        if descriptor.kind != ExchangeKind::None {
            channel
                .exchange_declare(&descriptor.exchange, descriptor.kind, &exchange_args(metadata))
                .await?;
        }
        if descriptor.dead_letter {
            let exchange = descriptor.dead_letter_exchange();
            let queue = descriptor.dead_letter_queue();
            channel
                .exchange_declare(&exchange, ExchangeKind::Direct, &none)
                .await?;
            channel.queue_declare(&queue, &none).await?;
            channel.queue_bind(&queue, &exchange, &queue).await?;
        }

        channel
            .queue_declare(&descriptor.queue, &queue_args(metadata))
            .await?;
        if descriptor.kind != ExchangeKind::None {
            channel
                .queue_bind(&descriptor.queue, &descriptor.exchange, &descriptor.routing_key)
                .await?;
        }
        if let Some(qos) = metadata.qos {
            channel.basic_qos(qos).await?;
        }

        let tag = format!("{}-{}", self.inner.consumer_tag_prefix, descriptor.queue);
        let deliveries = channel.basic_consume(&descriptor.queue, &tag).await?;
        info!(
            queue = %descriptor.queue,
            exchange = %descriptor.exchange,
            routing_key = %descriptor.routing_key,
            consumer_tag = %tag,
            "Consumer bound to queue"
        );
        Ok(deliveries)
    }

    /// Consume until cancelled or the channel faults. Boxed so consumers
    /// spawned during recovery don't make the future type recursive.
    fn run_consumer(self, consumer: Consumer) -> BoxFuture<'static, ()> {
        async move {
            let Consumer {
                event_type,
                channel,
                mut deliveries,
                token,
                generation,
            } = consumer;

            let exit = loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break ConsumerExit::Cancelled,
                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            self.process_delivery(channel.as_ref(), event_type, &delivery).await;
                        }
                        Some(Err(e)) => break ConsumerExit::Fault(e.to_string()),
                        None => break ConsumerExit::Fault("delivery stream ended".to_string()),
                    },
                }
            };

            drop(deliveries);
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Consumer channel already closed");
            }

            match exit {
                ConsumerExit::Cancelled => debug!("Consumer stopped"),
                ConsumerExit::Fault(reason) => {
                    warn!(%reason, generation, "Consumer channel faulted, rebuilding consumers");
                    self.recover(generation).await;
                }
            }
        }
        .boxed()
    }

    /// Dispatch one delivery and acknowledge it only when every handler succeeded.
    async fn process_delivery(
        &self,
        channel: &dyn BrokerChannel,
        event_type: TypeId,
        delivery: &Delivery,
    ) -> DispatchResult {
        let result = self.dispatch(event_type, delivery).await;
        let tag = delivery.delivery_tag;

        match result {
            DispatchResult::Success => {
                if let Err(e) = channel.basic_ack(tag).await {
                    error!(delivery_tag = tag, error = %e, "Failed to ack message");
                }
            }
            DispatchResult::NoSubscription => {
                error!(delivery_tag = tag, "No subscription for event, message left unacknowledged");
            }
            DispatchResult::DecodeError | DispatchResult::HandlerFailed => {
                warn!(delivery_tag = tag, ?result, "Message left unacknowledged");
            }
        }
        result
    }

    async fn dispatch(&self, event_type: TypeId, delivery: &Delivery) -> DispatchResult {
        let inner = &self.inner;
        let Some(registration) = inner.catalog.event_by_type(event_type) else {
            return DispatchResult::NoSubscription;
        };
        let kind = registration.descriptor().handling_kind();
        let handlers = inner.subscriptions.handlers_for(registration.name, kind);
        if handlers.is_empty() {
            return DispatchResult::NoSubscription;
        }

        let event = match registration.decode(&inner.serializer, &delivery.body) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    event = registration.name,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Failed to decode message"
                );
                return DispatchResult::DecodeError;
            }
        };
        let event_id = delivery
            .properties
            .message_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(Uuid::nil);

        let mut scope = inner.resolver.create_scope();
        let mut result = DispatchResult::Success;

        for handler in handlers {
            let Some(instance) = scope.resolve(&handler) else {
                warn!(handler = %handler, "Handler could not be resolved, skipping");
                continue;
            };
            let Some(binding) = inner.catalog.handler(handler, event_type) else {
                warn!(handler = %handler, "Handler not bound to this event type, skipping");
                continue;
            };
            let invoker = inner
                .cache
                .get_or_build(handler, event_type, || binding.invoker())
                .await;

            let outcome = inner
                .policy
                .execute("handle", event_id, || {
                    let call = invoker(instance.clone(), event.clone());
                    async move {
                        AssertUnwindSafe(call)
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| Err(HandlerError::failed("handler panicked")))
                    }
                })
                .await;

            match outcome {
                Ok(()) => debug!(handler = %handler, event_id = %event_id, "Handler completed"),
                Err(e) => {
                    error!(
                        handler = %handler,
                        event_id = %event_id,
                        delivery_tag = delivery.delivery_tag,
                        redelivered = delivery.redelivered,
                        error = %e,
                        "Handler failed"
                    );
                    result = DispatchResult::HandlerFailed;
                }
            }
        }
        result
    }

    /// Tear down every consumer of `generation` and rebuild from the catalog.
    ///
    /// Only the first fault of a generation rebuilds; later ones find the
    /// generation already bumped and return.
    async fn recover(&self, generation: u64) {
        let inner = &self.inner;
        let mut group = inner.consumers.lock().await;
        if group.generation != generation || inner.shutdown.is_cancelled() {
            return;
        }

        group.token.cancel();
        group.token = inner.shutdown.child_token();
        group.generation += 1;
        group.tasks.retain(|task| !task.is_finished());
        inner.subscriptions.clear();
        inner.cache.clear().await;
        info!(generation = group.generation, "Subscriptions cleared, resubscribing");

        let mut backoff = reconnect_backoff().build();
        loop {
            let attempt = match self.ensure_connected(Uuid::nil()).await {
                Ok(()) => self.bootstrap(&mut group).await,
                Err(e) => Err(e),
            };
            match attempt {
                Ok(started) => {
                    info!(started, generation = group.generation, "Consumers rebuilt");
                    return;
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to rebuild consumers, retrying after backoff"
                    );
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
