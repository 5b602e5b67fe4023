//! Registered event types and handlers.
//!
//! Built once by [`EventBusBuilder`](super::EventBusBuilder) and read-only
//! afterwards. Subscribe walks it to decide which consumers to start.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use super::dispatch::{invoker_for, AnyEvent, Invoker};
use super::event::{Event, EventMetadata, ExchangeDescriptor};
use super::handler::{EventHandler, HandlerId};
use super::serializer::BusSerializer;
use super::{BusError, Result};

type DecodeFn<S> = fn(&S, &[u8]) -> Result<AnyEvent>;

fn decode_event<S: BusSerializer, E: Event>(serializer: &S, body: &[u8]) -> Result<AnyEvent> {
    let event: E = serializer.deserialize(body)?;
    Ok(Arc::new(event))
}

/// An event type and its routing metadata.
pub struct EventRegistration<S> {
    pub type_id: TypeId,
    pub name: &'static str,
    /// Full Rust type name, for diagnostics.
    pub type_name: &'static str,
    pub metadata: EventMetadata,
    decode: DecodeFn<S>,
}

impl<S: BusSerializer> EventRegistration<S> {
    pub fn of<E: Event>(metadata: EventMetadata) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            name: E::name(),
            type_name: std::any::type_name::<E>(),
            metadata,
            decode: decode_event::<S, E>,
        }
    }

    /// Decode a message body into this event type.
    pub fn decode(&self, serializer: &S, body: &[u8]) -> Result<AnyEvent> {
        (self.decode)(serializer, body)
    }

    pub fn descriptor(&self) -> &ExchangeDescriptor {
        &self.metadata.exchange
    }
}

/// A handler type bound to one event type.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub id: HandlerId,
    pub event_type: TypeId,
    pub excluded: bool,
    bind: fn() -> Arc<Invoker>,
}

impl HandlerRegistration {
    pub fn of<E, H>() -> Self
    where
        E: Event,
        H: EventHandler<E>,
    {
        Self {
            id: HandlerId::of::<H>(),
            event_type: TypeId::of::<E>(),
            excluded: false,
            bind: invoker_for::<E, H>,
        }
    }

    /// Fresh invoker for this (handler, event) pair.
    pub fn invoker(&self) -> Arc<Invoker> {
        (self.bind)()
    }
}

/// Every event type and handler known to a bus.
pub struct EventCatalog<S> {
    events: Vec<EventRegistration<S>>,
    index: HashMap<TypeId, usize>,
    handlers: Vec<HandlerRegistration>,
}

impl<S> Default for EventCatalog<S> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            index: HashMap::new(),
            handlers: Vec::new(),
        }
    }
}

impl<S: BusSerializer> EventCatalog<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event type. Registering the same type again replaces its metadata.
    pub fn register_event(&mut self, registration: EventRegistration<S>) {
        match self.index.get(&registration.type_id) {
            Some(&position) => self.events[position] = registration,
            None => {
                self.index.insert(registration.type_id, self.events.len());
                self.events.push(registration);
            }
        }
    }

    /// Register a handler. Duplicate (handler, event) pairs are ignored.
    pub fn register_handler(&mut self, registration: HandlerRegistration) {
        let exists = self
            .handlers
            .iter()
            .any(|h| h.id == registration.id && h.event_type == registration.event_type);
        if !exists {
            self.handlers.push(registration);
        }
    }

    /// Exclude a handler type from discovery for every event it handles.
    pub fn exclude_handler(&mut self, id: HandlerId) {
        for handler in self.handlers.iter_mut().filter(|h| h.id == id) {
            handler.excluded = true;
        }
    }

    pub fn event<E: Event>(&self) -> Option<&EventRegistration<S>> {
        self.event_by_type(TypeId::of::<E>())
    }

    pub fn event_by_type(&self, type_id: TypeId) -> Option<&EventRegistration<S>> {
        self.index.get(&type_id).map(|&position| &self.events[position])
    }

    /// Fails when another registered event type uses the same name.
    ///
    /// The name keys subscriptions, so two types sharing it would leave one
    /// of them without a consumer.
    pub fn ensure_unique_name(&self, registration: &EventRegistration<S>) -> Result<()> {
        let clash = self
            .events
            .iter()
            .find(|other| other.name == registration.name && other.type_id != registration.type_id);
        match clash {
            Some(other) => Err(BusError::Configuration(format!(
                "event name '{}' is used by both {} and {}; override Event::name for one of them",
                registration.name, registration.type_name, other.type_name
            ))),
            None => Ok(()),
        }
    }

    /// Checks every registered event type with [`Self::ensure_unique_name`].
    pub fn ensure_unique_names(&self) -> Result<()> {
        self.events
            .iter()
            .try_for_each(|registration| self.ensure_unique_name(registration))
    }

    /// Event types in registration order.
    pub fn events(&self) -> impl Iterator<Item = &EventRegistration<S>> {
        self.events.iter()
    }

    /// Non-excluded handlers of an event type, in registration order.
    pub fn handlers_for(&self, event_type: TypeId) -> impl Iterator<Item = &HandlerRegistration> {
        self.handlers
            .iter()
            .filter(move |h| h.event_type == event_type && !h.excluded)
    }

    pub fn handler(&self, id: HandlerId, event_type: TypeId) -> Option<&HandlerRegistration> {
        self.handlers
            .iter()
            .find(|h| h.id == id && h.event_type == event_type)
    }

    /// Handlers whose event type was never registered.
    pub fn orphan_handlers(&self) -> impl Iterator<Item = &HandlerRegistration> {
        self.handlers
            .iter()
            .filter(|h| !self.index.contains_key(&h.event_type))
    }

    /// Replace descriptors with configured overrides, looked up by event name.
    pub fn apply_overrides<'a, F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<&'a ExchangeDescriptor>,
    {
        for registration in &mut self.events {
            if let Some(descriptor) = lookup(registration.name) {
                registration.metadata.exchange = descriptor.clone();
            }
        }
    }
}
