//! Event handler registry and fan-out.
//!
//! Handlers are registered by event name, by event name with a typed
//! decode, or for every event. Publishing spawns one task per matching
//! handler, so a slow handler never holds up frame ingestion.

use conduit_core::record_gateway_event;
use conduit_error::{GatewayError, GatewayErrorKind, GatewayResult};
use derive_getters::Getters;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Instrument, debug, warn};

/// A dispatched event as handed to handlers.
#[derive(Debug, Clone, PartialEq, Getters)]
pub struct GatewayEvent {
    /// Event name, e.g. `MESSAGE_CREATE`
    name: String,
    /// Sequence number
    sequence: Option<u64>,
    /// Shard that received it
    shard: u32,
    /// Raw event data
    data: Value,
}

impl GatewayEvent {
    /// Create an event.
    pub fn new(name: impl Into<String>, sequence: Option<u64>, shard: u32, data: Value) -> Self {
        Self {
            name: name.into(),
            sequence,
            shard,
            data,
        }
    }

    /// Decode the data into `T`.
    ///
    /// # Errors
    ///
    /// Returns `Decode` if the data does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> GatewayResult<T> {
        T::deserialize(&self.data).map_err(|e| {
            GatewayError::new(GatewayErrorKind::Decode(format!("{}: {}", self.name, e)))
        })
    }
}

/// Registration handle, used to remove a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(GatewayEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    by_name: HashMap<String, Vec<(HandlerId, Handler)>>,
    any: Vec<(HandlerId, Handler)>,
}

/// Handlers keyed by event name. Shared by every shard of a client.
#[derive(Default)]
pub struct EventRegistry {
    handlers: RwLock<Handlers>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("EventRegistry")
            .field("events", &handlers.by_name.keys().collect::<Vec<_>>())
            .field("wildcards", &handlers.any.len())
            .finish()
    }
}

impl EventRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn boxed<F, Fut>(handler: F) -> Handler
    where
        F: Fn(GatewayEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Arc::new(move |event| Box::pin(handler(event)))
    }

    /// Run `handler` for every event named `name`.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(GatewayEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id();
        let name = name.into();
        debug!(event = %name, "Registering handler");
        self.handlers
            .write()
            .by_name
            .entry(name)
            .or_default()
            .push((id, Self::boxed(handler)));
        id
    }

    /// Run `handler` with the event data decoded as `T`.
    ///
    /// Events that fail to decode are logged and skipped for this handler
    /// only.
    pub fn on_typed<T, F, Fut>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on(name, move |event: GatewayEvent| {
            let handler = Arc::clone(&handler);
            async move {
                match event.decode::<T>() {
                    Ok(data) => handler(data).await,
                    Err(e) => warn!(
                        event = %event.name(),
                        seq = ?event.sequence(),
                        error = %e,
                        "Event payload did not decode"
                    ),
                }
            }
        })
    }

    /// Run `handler` for every event.
    pub fn on_any<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(GatewayEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id();
        self.handlers.write().any.push((id, Self::boxed(handler)));
        id
    }

    /// Unregister a handler. Returns whether it was registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.any.len();
        handlers.any.retain(|(h, _)| *h != id);
        if handlers.any.len() != before {
            return true;
        }
        let mut removed = false;
        handlers.by_name.retain(|_, list| {
            let len = list.len();
            list.retain(|(h, _)| *h != id);
            removed |= list.len() != len;
            !list.is_empty()
        });
        removed
    }

    /// Handlers that would receive an event named `name`.
    pub fn handler_count(&self, name: &str) -> usize {
        let handlers = self.handlers.read();
        handlers.by_name.get(name).map_or(0, Vec::len) + handlers.any.len()
    }

    /// Hand `event` to every matching handler, each on its own task.
    /// Returns the number of tasks spawned.
    pub fn publish(&self, event: GatewayEvent) -> usize {
        record_gateway_event(*event.shard(), event.name());
        let targets: Vec<Handler> = {
            let handlers = self.handlers.read();
            handlers
                .by_name
                .get(event.name())
                .into_iter()
                .flatten()
                .chain(handlers.any.iter())
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        let span = tracing::debug_span!("event", name = %event.name(), shard = *event.shard());
        for handler in &targets {
            tokio::spawn(handler(event.clone()).instrument(span.clone()));
        }
        targets.len()
    }
}
