use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use ctrd_types::validate_namespace;

use crate::error::{EventError, Result};
use crate::event::{Envelope, Event};

/// Sink that stores publish lifecycle events into.
///
/// Publishing never fails from the caller's point of view: an event that
/// nobody listens to is simply dropped.
pub trait Publisher: Send + Sync {
    fn publish(&self, namespace: &str, event: Event);
}

/// Publisher that discards everything. Used when no exchange is wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPublisher;

impl Publisher for NoopPublisher {
    fn publish(&self, _namespace: &str, _event: Event) {}
}

/// Filter for subscribing to a subset of events.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// If set, only events from these namespaces are delivered.
    pub namespaces: Option<Vec<String>>,
    /// If set, only events whose topic starts with one of these prefixes are delivered.
    pub topics: Option<Vec<String>>,
}

impl EventFilter {
    pub fn topic(prefix: impl Into<String>) -> Self {
        Self {
            namespaces: None,
            topics: Some(vec![prefix.into()]),
        }
    }

    pub fn namespace(ns: impl Into<String>) -> Self {
        Self {
            namespaces: Some(vec![ns.into()]),
            topics: None,
        }
    }

    /// Returns `true` if the given envelope matches this filter.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(ref namespaces) = self.namespaces {
            if !namespaces.contains(&envelope.namespace) {
                return false;
            }
        }
        if let Some(ref topics) = self.topics {
            if !topics.iter().any(|p| envelope.topic.starts_with(p.as_str())) {
                return false;
            }
        }
        true
    }
}

/// A broadcast receiver of envelopes.
pub type EventStream = broadcast::Receiver<Envelope>;

struct Subscriber {
    filter: EventFilter,
    sender: broadcast::Sender<Envelope>,
}

/// Fan-out broadcaster for lifecycle events.
pub struct Exchange {
    subscribers: RwLock<Vec<Subscriber>>,
    capacity: usize,
}

impl Exchange {
    /// Default per-subscriber channel capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber with the given filter.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        let (tx, rx) = broadcast::channel(self.capacity);
        self.subscribers
            .write()
            .expect("lock poisoned")
            .push(Subscriber { filter, sender: tx });
        rx
    }

    /// Re-publish an already stamped envelope, validating it first.
    pub fn forward(&self, envelope: Envelope) -> Result<()> {
        validate_namespace(&envelope.namespace)?;
        validate_topic(&envelope.topic)?;
        if envelope.topic != envelope.event.topic() {
            return Err(EventError::TopicMismatch {
                topic: envelope.topic.clone(),
                expected: envelope.event.topic().to_string(),
            });
        }
        self.route(&envelope);
        Ok(())
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("lock poisoned").len()
    }

    /// Deliver to every matching subscriber, pruning those whose receivers are gone.
    fn route(&self, envelope: &Envelope) {
        let mut subs = self.subscribers.write().expect("lock poisoned");
        subs.retain(|sub| {
            if sub.filter.matches(envelope) {
                sub.sender.send(envelope.clone()).is_ok()
            } else {
                sub.sender.receiver_count() > 0
            }
        });
        trace!(topic = %envelope.topic, subscribers = subs.len(), "event routed");
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for Exchange {
    fn publish(&self, namespace: &str, event: Event) {
        let envelope = Envelope::new(namespace, event);
        debug!(namespace, topic = %envelope.topic, "publish event");
        self.route(&envelope);
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Topics are `/`-separated, start with `/`, and have no empty components.
fn validate_topic(topic: &str) -> Result<()> {
    let invalid = |reason: &str| EventError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    };
    let rest = topic.strip_prefix('/').ok_or_else(|| invalid("must start with '/'"))?;
    if rest.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if rest.split('/').any(str::is_empty) {
        return Err(invalid("must not contain empty components"));
    }
    Ok(())
}
