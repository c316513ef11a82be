use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ctrd_types::{Digest, Labels};

/// A lifecycle notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    NamespaceCreate { name: String, labels: Labels },
    NamespaceUpdate { name: String, labels: Labels },
    NamespaceDelete { name: String },
    ContentDelete { digest: Digest },
    SnapshotPrepare { snapshotter: String, key: String, parent: String },
    SnapshotView { snapshotter: String, key: String, parent: String },
    SnapshotCommit { snapshotter: String, key: String, name: String },
    SnapshotRemove { snapshotter: String, key: String },
    GcComplete { content_removed: usize, snapshots_removed: usize, retained: usize },
}

impl Event {
    /// Topic under which this event is published.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::NamespaceCreate { .. } => "/namespaces/create",
            Self::NamespaceUpdate { .. } => "/namespaces/update",
            Self::NamespaceDelete { .. } => "/namespaces/delete",
            Self::ContentDelete { .. } => "/content/delete",
            Self::SnapshotPrepare { .. } => "/snapshot/prepare",
            Self::SnapshotView { .. } => "/snapshot/view",
            Self::SnapshotCommit { .. } => "/snapshot/commit",
            Self::SnapshotRemove { .. } => "/snapshot/remove",
            Self::GcComplete { .. } => "/gc/complete",
        }
    }
}

/// An event stamped with identity, time, and the namespace it happened in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub namespace: String,
    pub topic: String,
    pub event: Event,
}

impl Envelope {
    pub fn new(namespace: impl Into<String>, event: Event) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            namespace: namespace.into(),
            topic: event.topic().to_string(),
            event,
        }
    }
}
