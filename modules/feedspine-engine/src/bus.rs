//! In-process pub/sub for lifecycle events.
//!
//! Handlers run concurrently per event on spawned tasks: a slow handler
//! never blocks the publisher, and a failing handler is logged and
//! swallowed. Subscribers needing cross-handler ordering coordinate
//! themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tracing::warn;

use feedspine_core::{EventEnvelope, EventKind};

type Handler = Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Token returned by subscribe; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(u64);

struct Subscriber {
    id: u64,
    /// None subscribes to every event.
    filter: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(Some(kind), handler)
    }

    pub fn subscribe_all<F, Fut>(&self, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(None, handler)
    }

    fn add<F, Fut>(&self, filter: Option<EventKind>, handler: F) -> Subscription
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(move |envelope| Box::pin(handler(envelope)));
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(Subscriber {
                id,
                filter,
                handler,
            });
        Subscription(id)
    }

    pub fn unsubscribe(&self, token: Subscription) {
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .retain(|s| s.id != token.0);
    }

    /// Fan out to every matching handler on its own task. Handler errors
    /// never reach the publisher.
    pub fn publish(&self, envelope: EventEnvelope) {
        let matching: Vec<Handler> = {
            let subscribers = self.subscribers.read().expect("subscriber lock poisoned");
            subscribers
                .iter()
                .filter(|s| s.filter.is_none() || s.filter == Some(envelope.kind()))
                .map(|s| s.handler.clone())
                .collect()
        };
        for handler in matching {
            let envelope = envelope.clone();
            tokio::spawn(async move {
                let kind = envelope.kind();
                if let Err(err) = handler(envelope).await {
                    warn!(?kind, error = %err, "event handler failed");
                }
            });
        }
    }
}
