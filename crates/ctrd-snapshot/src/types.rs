use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ctrd_types::Labels;

/// Lifecycle state of a snapshot. Fixed at creation except for the single
/// active-to-committed transition, which also renames the snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Mutable (or read-only, for views) layer under construction.
    Active,
    /// Immutable layer that may parent new active snapshots.
    Committed,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Committed => f.write_str("committed"),
        }
    }
}

/// Public description of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub kind: Kind,
    /// Key of an active snapshot or name of a committed one.
    pub name: String,
    /// Name of the committed parent; empty for a root layer.
    pub parent: String,
    pub labels: Labels,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Disk usage of a single layer, excluding its parents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Bytes used by regular files.
    pub size: u64,
    /// Number of filesystem entries.
    pub inodes: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.size += other.size;
        self.inodes += other.inodes;
    }
}

/// Description of a mount a caller must perform to use a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Filesystem type, e.g. `bind` or `overlay`.
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

impl Mount {
    /// Whether the mount must be performed read-only.
    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Kind::Committed).unwrap(), "\"committed\"");
        assert_eq!(Kind::Active.to_string(), "active");
    }

    #[test]
    fn mount_readonly_detection() {
        let m = Mount {
            mount_type: "bind".into(),
            source: "/x".into(),
            options: vec!["ro".into(), "rbind".into()],
        };
        assert!(m.is_readonly());
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["type"], "bind");
    }

    #[test]
    fn usage_accumulates() {
        let mut u = Usage::default();
        u.add(Usage { size: 10, inodes: 2 });
        u.add(Usage { size: 5, inodes: 1 });
        assert_eq!(u, Usage { size: 15, inodes: 3 });
    }
}
