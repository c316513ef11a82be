//! Snapshot bookkeeping shared by the filesystem backends.
//!
//! [`MetaStore`] owns the key space, the lifecycle rules and the numeric ids
//! that backends use to name their on-disk directories. Backends run their
//! filesystem work inside [`MetaStore::update`] so that a failed operation
//! leaves the bookkeeping untouched.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use ctrd_types::{apply_fieldpaths, validate_labels, Labels};

use crate::error::{Result, SnapshotError};
use crate::types::{Info, Kind};

const METADATA_FILE: &str = "metadata.json";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Record {
    id: u64,
    kind: Kind,
    #[serde(default)]
    parent: String,
    #[serde(default)]
    readonly: bool,
    #[serde(default)]
    labels: Labels,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

/// Resolved view of one snapshot as a backend needs it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub id: u64,
    pub kind: Kind,
    /// Set for snapshots created by `view`.
    pub readonly: bool,
    /// Ids of the parent chain, nearest parent first.
    pub parent_ids: Vec<u64>,
}

/// The persisted bookkeeping state. Obtained through [`MetaStore::view`] and
/// [`MetaStore::update`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshots {
    next_id: u64,
    snapshots: BTreeMap<String, Record>,
}

impl Snapshots {
    fn record(&self, key: &str) -> Result<&Record> {
        self.snapshots
            .get(key)
            .ok_or_else(|| SnapshotError::NotFound(key.to_string()))
    }

    fn info_of(key: &str, r: &Record) -> Info {
        Info {
            kind: r.kind,
            name: key.to_string(),
            parent: r.parent.clone(),
            labels: r.labels.clone(),
            created: r.created,
            updated: r.updated,
        }
    }

    fn parent_ids<'a>(&'a self, mut parent: &'a str) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        while !parent.is_empty() {
            let r = self.snapshots.get(parent).ok_or_else(|| {
                SnapshotError::FailedPrecondition(format!("parent {parent} is missing"))
            })?;
            ids.push(r.id);
            parent = &r.parent;
        }
        Ok(ids)
    }

    /// Info for an active key or committed name.
    pub fn info(&self, key: &str) -> Result<Info> {
        Ok(Self::info_of(key, self.record(key)?))
    }

    /// Resolve a snapshot with its parent id chain.
    pub fn get(&self, key: &str) -> Result<Snapshot> {
        let r = self.record(key)?;
        Ok(Snapshot {
            id: r.id,
            kind: r.kind,
            readonly: r.readonly,
            parent_ids: self.parent_ids(&r.parent)?,
        })
    }

    /// Resolve an active snapshot; committed snapshots fail the precondition.
    pub fn get_active(&self, key: &str) -> Result<Snapshot> {
        let s = self.get(key)?;
        if s.kind != Kind::Active {
            return Err(SnapshotError::FailedPrecondition(format!(
                "snapshot {key} is not active"
            )));
        }
        Ok(s)
    }

    /// Names of the snapshots whose parent is `key`.
    pub fn children(&self, key: &str) -> Vec<String> {
        self.snapshots
            .iter()
            .filter(|(_, r)| r.parent == key)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Whether any snapshot still uses `id`.
    pub fn contains_id(&self, id: u64) -> bool {
        self.snapshots.values().any(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Create an active snapshot under `key`.
    pub fn create_active(
        &mut self,
        key: &str,
        parent: &str,
        readonly: bool,
        labels: Labels,
    ) -> Result<Snapshot> {
        if key.is_empty() {
            return Err(SnapshotError::InvalidArgument("snapshot key must not be empty".into()));
        }
        validate_labels(&labels)?;
        if self.snapshots.contains_key(key) {
            return Err(SnapshotError::AlreadyExists(key.to_string()));
        }
        if !parent.is_empty() {
            let p = self.record(parent)?;
            if p.kind != Kind::Committed {
                return Err(SnapshotError::FailedPrecondition(format!(
                    "parent {parent} is not committed"
                )));
            }
        }

        self.next_id += 1;
        let id = self.next_id;
        let now = Utc::now();
        self.snapshots.insert(
            key.to_string(),
            Record {
                id,
                kind: Kind::Active,
                parent: parent.to_string(),
                readonly,
                labels,
                created: now,
                updated: now,
            },
        );
        Ok(Snapshot {
            id,
            kind: Kind::Active,
            readonly,
            parent_ids: self.parent_ids(parent)?,
        })
    }

    /// Move the active snapshot `key` to the committed snapshot `name`,
    /// keeping its id and parent. Returns the id.
    pub fn commit_active(&mut self, key: &str, name: &str, labels: Labels) -> Result<u64> {
        if name.is_empty() {
            return Err(SnapshotError::InvalidArgument("snapshot name must not be empty".into()));
        }
        validate_labels(&labels)?;
        let Some(r) = self.snapshots.get(key) else {
            return Err(SnapshotError::FailedPrecondition(format!(
                "active snapshot {key} does not exist"
            )));
        };
        if r.kind != Kind::Active {
            return Err(SnapshotError::FailedPrecondition(format!(
                "snapshot {key} is not active"
            )));
        }
        if r.readonly {
            return Err(SnapshotError::FailedPrecondition(format!(
                "snapshot {key} is a view and cannot be committed"
            )));
        }
        if self.snapshots.contains_key(name) {
            return Err(SnapshotError::AlreadyExists(name.to_string()));
        }

        let mut r = self
            .snapshots
            .remove(key)
            .ok_or_else(|| SnapshotError::NotFound(key.to_string()))?;
        r.kind = Kind::Committed;
        r.labels = labels;
        r.updated = Utc::now();
        let id = r.id;
        self.snapshots.insert(name.to_string(), r);
        Ok(id)
    }

    /// Remove a snapshot that has no children. Returns its id and kind.
    pub fn remove(&mut self, key: &str) -> Result<(u64, Kind)> {
        self.record(key)?;
        let children = self.children(key);
        if !children.is_empty() {
            return Err(SnapshotError::FailedPrecondition(format!(
                "cannot remove snapshot {key} with {} child snapshot(s)",
                children.len()
            )));
        }
        let r = self
            .snapshots
            .remove(key)
            .ok_or_else(|| SnapshotError::NotFound(key.to_string()))?;
        Ok((r.id, r.kind))
    }

    /// Update labels restricted to `fieldpaths`.
    pub fn update_info(&mut self, info: Info, fieldpaths: &[String]) -> Result<Info> {
        let r = self
            .snapshots
            .get_mut(&info.name)
            .ok_or_else(|| SnapshotError::NotFound(info.name.clone()))?;
        if info.kind != r.kind {
            return Err(SnapshotError::InvalidArgument(format!(
                "snapshot {} is {}, not {}",
                info.name, r.kind, info.kind
            )));
        }
        apply_fieldpaths(&mut r.labels, &info.labels, fieldpaths)?;
        r.updated = Utc::now();
        Ok(Self::info_of(&info.name, r))
    }

    /// Visit every snapshot in key order.
    pub fn walk(&self, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        for (key, r) in &self.snapshots {
            f(&Self::info_of(key, r))?;
        }
        Ok(())
    }
}

/// Persistent, lock-protected [`Snapshots`].
///
/// Updates run against a copy of the state; the copy is written to
/// `<root>/metadata.json` and swapped in only if the closure succeeds.
pub struct MetaStore {
    path: PathBuf,
    state: RwLock<Snapshots>,
}

impl MetaStore {
    /// Open (or create) the bookkeeping under `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let path = root.join(METADATA_FILE);
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshots::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    /// Run a read-only closure against the current state.
    pub fn view<T>(&self, f: impl FnOnce(&Snapshots) -> Result<T>) -> Result<T> {
        let state = self.state.read().expect("lock poisoned");
        f(&state)
    }

    /// Run a mutating closure; its changes are persisted and published only
    /// if it returns `Ok`.
    pub fn update<T>(&self, f: impl FnOnce(&mut Snapshots) -> Result<T>) -> Result<T> {
        let mut state = self.state.write().expect("lock poisoned");
        let mut next = state.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(out)
    }

    fn persist(&self, state: &Snapshots) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(state)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| SnapshotError::Io(e.error))?;
        debug!(path = %self.path.display(), snapshots = state.len(), "snapshot metadata saved");
        Ok(())
    }
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore").field("path", &self.path).finish()
    }
}
