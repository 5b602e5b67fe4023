//! Subscription registry.
//!
//! Tracks which handler types consume which (event name, handling kind).
//! Shared by every consumer task and by the recovery path.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::event::HandlingKind;
use super::handler::HandlerId;

/// Registry key.
pub type SubscriptionKey = (String, HandlingKind);

/// Handlers bound to one event name and handling kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub event_name: String,
    pub event_type: TypeId,
    pub kind: HandlingKind,
    pub handlers: Vec<HandlerId>,
}

impl Subscription {
    pub fn new(
        event_name: impl Into<String>,
        event_type: TypeId,
        kind: HandlingKind,
        handlers: impl IntoIterator<Item = HandlerId>,
    ) -> Self {
        let mut deduped: Vec<HandlerId> = Vec::new();
        for handler in handlers {
            if !deduped.contains(&handler) {
                deduped.push(handler);
            }
        }
        Self {
            event_name: event_name.into(),
            event_type,
            kind,
            handlers: deduped,
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        (self.event_name.clone(), self.kind)
    }
}

/// Concurrent registry of subscriptions.
pub trait SubscriptionsManager: Send + Sync {
    fn has_subscription(&self, event_name: &str, kind: HandlingKind) -> bool;

    /// Registers the subscription unless its key exists. Returns `false` on no-op.
    fn add_subscription(&self, subscription: Subscription) -> bool;

    fn remove_subscription(&self, event_name: &str, kind: HandlingKind) -> Option<Subscription>;

    /// Handler types for the key, empty when unsubscribed.
    fn handlers_for(&self, event_name: &str, kind: HandlingKind) -> Vec<HandlerId>;

    /// Point-in-time copy of every subscription, ordered by key.
    fn subscriptions(&self) -> Vec<Subscription>;

    fn clear(&self);

    fn is_empty(&self) -> bool;
}

/// [`SubscriptionsManager`] guarded by a single `RwLock`, so a clear is
/// never observed half-done.
#[derive(Debug, Default)]
pub struct InMemorySubscriptions {
    entries: RwLock<HashMap<SubscriptionKey, Subscription>>,
}

impl InMemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionsManager for InMemorySubscriptions {
    fn has_subscription(&self, event_name: &str, kind: HandlingKind) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.contains_key(&(event_name.to_string(), kind))
    }

    fn add_subscription(&self, subscription: Subscription) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = subscription.key();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, subscription);
        true
    }

    fn remove_subscription(&self, event_name: &str, kind: HandlingKind) -> Option<Subscription> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&(event_name.to_string(), kind))
    }

    fn handlers_for(&self, event_name: &str, kind: HandlingKind) -> Vec<HandlerId> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&(event_name.to_string(), kind))
            .map(|s| s.handlers.clone())
            .unwrap_or_default()
    }

    fn subscriptions(&self) -> Vec<Subscription> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Subscription> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        all
    }

    fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}
