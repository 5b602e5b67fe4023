//! Handler dispatch.
//!
//! An [`Invoker`] is built once per (handler type, event type) pair when the
//! handler is registered, and memoized in the [`DispatchCache`] on first use.
//! The cache is dropped wholesale whenever consumers are rebuilt.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use super::event::Event;
use super::handler::{EventHandler, HandlerError, HandlerId, HandlerInstance};

/// Type-erased decoded event.
pub type AnyEvent = Arc<dyn Any + Send + Sync>;

/// Calls a resolved handler instance with a decoded event.
pub type Invoker = dyn Fn(HandlerInstance, AnyEvent) -> BoxFuture<'static, std::result::Result<(), HandlerError>>
    + Send
    + Sync;

/// Build the invoker for handler `H` of event `E`.
pub fn invoker_for<E, H>() -> Arc<Invoker>
where
    E: Event,
    H: EventHandler<E>,
{
    Arc::new(
        |instance: HandlerInstance,
         event: AnyEvent|
         -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            Box::pin(async move {
                let handler = instance.downcast::<H>().map_err(|_| {
                    HandlerError::failed(format!(
                        "resolved instance is not a {}",
                        HandlerId::of::<H>()
                    ))
                })?;
                let event = event
                    .downcast::<E>()
                    .map_err(|_| HandlerError::failed(format!("event is not a {}", E::name())))?;
                handler.handle(&event).await
            })
        },
    )
}

type CacheKey = (HandlerId, TypeId);

/// Memoized invokers keyed by (handler type, event type).
#[derive(Default)]
pub struct DispatchCache {
    entries: RwLock<HashMap<CacheKey, Arc<Invoker>>>,
}

impl DispatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, handler: HandlerId, event: TypeId) -> Option<Arc<Invoker>> {
        self.entries.read().await.get(&(handler, event)).cloned()
    }

    /// Return the cached invoker, building and inserting it on a miss.
    ///
    /// Builders racing on one key insert exactly once; every caller gets the
    /// stored entry.
    pub async fn get_or_build<F>(&self, handler: HandlerId, event: TypeId, build: F) -> Arc<Invoker>
    where
        F: FnOnce() -> Arc<Invoker>,
    {
        if let Some(invoker) = self.get(handler, event).await {
            return invoker;
        }
        let mut entries = self.entries.write().await;
        Arc::clone(entries.entry((handler, event)).or_insert_with(build))
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Result of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Every resolved handler succeeded, safe to acknowledge.
    Success,
    /// One or more handlers failed after retries.
    HandlerFailed,
    /// Payload could not be decoded into the event type.
    DecodeError,
    /// No handlers registered for the event.
    NoSubscription,
}

impl DispatchResult {
    /// Only a fully handled message is acknowledged. Everything else stays
    /// unacked and is redelivered when the channel is rebuilt.
    pub fn should_ack(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
