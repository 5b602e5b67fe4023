//! Event handlers and the scoped resolver that produces handler instances.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::event::{short_type_name, Event};

/// Handles one event type.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: &E) -> std::result::Result<(), HandlerError>;
}

/// Failure reported by an [`EventHandler`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying (downstream timeout, lost connection).
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn transient(message: impl fmt::Display) -> Self {
        HandlerError::Transient(message.to_string())
    }

    pub fn failed(message: impl fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Identity of a handler type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    type_id: TypeId,
    name: &'static str,
}

impl HandlerId {
    pub fn of<H: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            name: short_type_name::<H>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerId({})", self.name)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Type-erased handler instance handed out by a [`HandlerScope`].
pub type HandlerInstance = Arc<dyn Any + Send + Sync>;

/// Creates a resolution scope per received message.
pub trait HandlerResolver: Send + Sync {
    fn create_scope(&self) -> Box<dyn HandlerScope>;
}

/// Resolves handler instances for the lifetime of one message.
pub trait HandlerScope: Send {
    /// `None` when the handler cannot be resolved; the bus skips it.
    fn resolve(&mut self, handler: &HandlerId) -> Option<HandlerInstance>;
}

type Factory = Arc<dyn Fn() -> HandlerInstance + Send + Sync>;

/// Resolver backed by factories registered alongside the handlers.
///
/// Each scope builds at most one instance per handler type.
#[derive(Clone, Default)]
pub struct FactoryResolver {
    factories: Arc<HashMap<HandlerId, Factory>>,
}

impl FactoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H, F>(&mut self, factory: F)
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || Arc::new(factory()) as HandlerInstance);
        Arc::make_mut(&mut self.factories).insert(HandlerId::of::<H>(), factory);
    }

    pub fn contains(&self, handler: &HandlerId) -> bool {
        self.factories.contains_key(handler)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl HandlerResolver for FactoryResolver {
    fn create_scope(&self) -> Box<dyn HandlerScope> {
        Box::new(FactoryScope {
            factories: Arc::clone(&self.factories),
            resolved: HashMap::new(),
        })
    }
}

struct FactoryScope {
    factories: Arc<HashMap<HandlerId, Factory>>,
    resolved: HashMap<HandlerId, HandlerInstance>,
}

impl HandlerScope for FactoryScope {
    fn resolve(&mut self, handler: &HandlerId) -> Option<HandlerInstance> {
        if let Some(instance) = self.resolved.get(handler) {
            return Some(Arc::clone(instance));
        }
        let instance = (self.factories.get(handler)?)();
        self.resolved.insert(*handler, Arc::clone(&instance));
        Some(instance)
    }
}
