//! Process-local publish/subscribe with typed topics and a wildcard sink.
//!
//! Delivery is synchronous, depth-first, in subscription order: topic
//! subscribers first, then every global sink. The bus holds no queue;
//! backpressure is the publisher's problem. One instance is constructed at
//! startup and threaded through the component graph.

mod events;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

pub use events::{BusEvent, Topic};

/// An event plus the instant it was published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: BusEvent,
}

type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<Topic, Vec<(SubscriptionId, Callback)>>,
    sinks: Vec<(SubscriptionId, Callback)>,
}

#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .topics
            .entry(topic)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.sinks.push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut registry = self.registry.lock();
        for subs in registry.topics.values_mut() {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
        registry.sinks.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Stamp the event and deliver it to every matching subscriber, then to
    /// every global sink. Each callback runs inside a fault barrier: a
    /// panicking subscriber is logged and later subscribers still run.
    pub fn publish(&self, event: BusEvent) {
        let envelope = Envelope {
            timestamp: Utc::now(),
            event,
        };

        // Snapshot the callbacks so subscribers may themselves subscribe or
        // publish without deadlocking on the registry.
        let callbacks: Vec<Callback> = {
            let registry = self.registry.lock();
            let topic = envelope.event.topic();
            registry
                .topics
                .get(&topic)
                .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)))
                .into_iter()
                .flatten()
                .chain(registry.sinks.iter().map(|(_, cb)| Arc::clone(cb)))
                .collect()
        };

        for callback in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(&envelope)));
            if result.is_err() {
                error!(topic = ?envelope.event.topic(), "Event subscriber panicked");
            }
        }
    }

    pub fn clear(&self) {
        let mut registry = self.registry.lock();
        registry.topics.clear();
        registry.sinks.clear();
    }
}
