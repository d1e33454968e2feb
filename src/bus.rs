// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process change notifications.
//!
//! [`ChangeBus`] decouples whoever learns about a change (a mutator, a
//! websocket bridge, a server-sent event listener) from whoever must react
//! to it (sync engines, dependent caches).
//!
//! Delivery is synchronous and best-effort: `publish` calls each handler
//! registered for the topic, in subscription order, on the caller's task.
//! There is no persistence, replay or cross-process delivery. Handlers are
//! invoked outside the registry lock, so they may publish or subscribe.
//!
//! ```
//! use resource_sync::bus::{ChangeBus, ChangeEvent, ChangeKind, RESOURCE_CHANGED};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let bus = ChangeBus::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = seen.clone();
//! let sub = bus.subscribe(RESOURCE_CHANGED, move |_event: &ChangeEvent| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! bus.publish(RESOURCE_CHANGED, &ChangeEvent::new(ChangeKind::Remote));
//! drop(sub); // unsubscribes
//! bus.publish(RESOURCE_CHANGED, &ChangeEvent::new(ChangeKind::Remote));
//!
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! ```

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::types::{Resource, ResourceId, ResourceStatus, ScopeId};

/// Topic for "something in a resource collection changed".
pub const RESOURCE_CHANGED: &str = "resourceChanged";

/// What produced a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    /// Pushed from outside the process (websocket, SSE, webhook relay)
    Remote,
}

/// Payload carried on [`RESOURCE_CHANGED`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    #[serde(default)]
    pub scope: Option<ScopeId>,
    #[serde(default)]
    pub id: Option<ResourceId>,
    #[serde(default)]
    pub status: Option<ResourceStatus>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind) -> Self {
        Self {
            kind,
            scope: None,
            id: None,
            status: None,
            fields: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Event describing a mutation confirmed by the server.
    pub fn for_resource(kind: ChangeKind, scope: &ScopeId, resource: &Resource) -> Self {
        Self {
            kind,
            scope: Some(scope.clone()),
            id: Some(resource.id.clone()),
            status: Some(resource.status),
            fields: resource.fields.clone(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: ScopeId) -> Self {
        self.scope = Some(scope);
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: ResourceId) -> Self {
        self.id = Some(id);
        self
    }

    /// Events without a scope apply to every scope.
    #[must_use]
    pub fn applies_to(&self, scope: &ScopeId) -> bool {
        self.scope.as_ref().map_or(true, |s| s == scope)
    }
}

type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, Handler)>>,
}

/// Synchronous publish/subscribe hub.
#[derive(Default)]
pub struct ChangeBus {
    registry: Arc<RwLock<Registry>>,
}

impl ChangeBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. The handler stays registered until
    /// the returned [`Subscription`] is dropped or unsubscribed.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.write();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        debug!(topic, subscription = id, "Subscribed");
        Subscription {
            topic: topic.to_string(),
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to every handler on `topic`. Returns how many ran.
    pub fn publish(&self, topic: &str, event: &ChangeEvent) -> usize {
        let handlers: Vec<Handler> = {
            let registry = self.registry.read();
            match registry.topics.get(topic) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => Vec::new(),
            }
        };

        for handler in &handlers {
            handler(event);
        }

        debug!(topic, kind = ?event.kind, delivered = handlers.len(), "Published");
        crate::metrics::record_publish(topic, handlers.len());
        handlers.len()
    }

    /// Number of live handlers on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .read()
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }
}

/// Handle returned by [`ChangeBus::subscribe`]; unsubscribes on drop.
pub struct Subscription {
    topic: String,
    id: u64,
    registry: Weak<RwLock<Registry>>,
}

impl Subscription {
    /// Remove the handler now.
    pub fn unsubscribe(self) {
        // Drop does the work
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return; // bus already gone
        };
        let mut registry = registry.write();
        if let Some(list) = registry.topics.get_mut(&self.topic) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                registry.topics.remove(&self.topic);
            }
        }
    }
}
