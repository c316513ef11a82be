//! Snapshotter view scoped to a namespace.
//!
//! Every namespace has its own key space. The backend sees keys of the form
//! `<namespace>/<seq>/<key>`, where `seq` is allocated from the index so a
//! key reused after removal never collides with a layer GC has not reclaimed
//! yet.
//!
//! Removing a record is always allowed. The backend layer stays in place as
//! long as a live snapshot chains to it and is reclaimed by garbage
//! collection afterwards.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use ctrd_events::Event;
use ctrd_snapshot::{Info, Kind, Mount, SnapshotError, Snapshotter, Usage};
use ctrd_types::{apply_fieldpaths, validate_labels, Labels};

use crate::db::{Txn, DB};
use crate::error::MetadataError;
use crate::namespaces::ensure_namespace;
use crate::records::{self, keys, SnapshotRecord};

type Result<T> = std::result::Result<T, SnapshotError>;

pub struct NamespacedSnapshotter {
    db: Arc<DB>,
    name: String,
    namespace: String,
    backend: Arc<dyn Snapshotter>,
}

impl NamespacedSnapshotter {
    pub(crate) fn new(db: Arc<DB>, name: &str, namespace: &str, backend: Arc<dyn Snapshotter>) -> Self {
        Self {
            db,
            name: name.to_string(),
            namespace: namespace.to_string(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn record_key(&self, key: &str) -> String {
        keys::snapshot(&self.namespace, &self.name, key)
    }

    fn record(&self, key: &str) -> Result<SnapshotRecord> {
        let tx = self.db.begin_read();
        records::read::<SnapshotRecord>(&tx, &self.record_key(key))?
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {key}")))
    }

    fn backend_key(&self, txn: &mut Txn<'_>, key: &str) -> std::result::Result<String, MetadataError> {
        let seq = records::next_snapshot_seq(txn)?;
        Ok(format!("{}/{seq}/{key}", self.namespace))
    }

    fn create(&self, key: &str, parent: &str, labels: Labels, readonly: bool) -> Result<Vec<Mount>> {
        if key.is_empty() {
            return Err(SnapshotError::InvalidArgument("snapshot key must not be empty".into()));
        }
        validate_labels(&labels)?;
        let ns = self.namespace.as_str();

        let mut created = None;
        let res = self.db.update(|txn| {
            ensure_namespace(txn, ns)?;
            let record_key = self.record_key(key);
            if txn.contains(&record_key) {
                return Err(MetadataError::AlreadyExists(format!("snapshot {key}")));
            }

            let backend_parent = if parent.is_empty() {
                String::new()
            } else {
                let rec: SnapshotRecord = records::read_mut(txn, &self.record_key(parent))?
                    .ok_or_else(|| MetadataError::NotFound(format!("parent snapshot {parent}")))?;
                if rec.kind != Kind::Committed {
                    return Err(MetadataError::FailedPrecondition(format!(
                        "parent {parent} is not committed"
                    )));
                }
                rec.backend_key
            };

            let backend_key = self.backend_key(txn, key)?;
            let mounts = if readonly {
                self.backend.view(&backend_key, &backend_parent, Labels::new())?
            } else {
                self.backend.prepare(&backend_key, &backend_parent, Labels::new())?
            };
            created = Some(backend_key.clone());

            let now = Utc::now();
            let rec = SnapshotRecord {
                backend_key,
                kind: Kind::Active,
                parent: parent.to_string(),
                labels,
                created: now,
                updated: now,
            };
            records::write(txn, record_key, &rec)?;

            let (snapshotter, key, parent) = (self.name.clone(), key.to_string(), parent.to_string());
            let event = if readonly {
                Event::SnapshotView { snapshotter, key, parent }
            } else {
                Event::SnapshotPrepare { snapshotter, key, parent }
            };
            txn.publish(ns, event);
            Ok(mounts)
        });

        match res {
            Ok(mounts) => {
                debug!(namespace = ns, snapshotter = %self.name, key, parent, readonly, "snapshot created");
                Ok(mounts)
            }
            Err(e) => {
                if let Some(backend_key) = created {
                    self.discard(&backend_key);
                }
                Err(e.into())
            }
        }
    }

    /// Undo a backend create whose record never made it into the index.
    fn discard(&self, backend_key: &str) {
        if let Err(e) = self.backend.remove(backend_key) {
            warn!(snapshotter = %self.name, key = backend_key, error = %e, "orphaned backend snapshot");
            self.db.mark_orphaned(Some(&self.name));
        }
    }
}

impl std::fmt::Debug for NamespacedSnapshotter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedSnapshotter")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish()
    }
}

fn to_info(name: &str, rec: SnapshotRecord) -> Info {
    Info {
        kind: rec.kind,
        name: name.to_string(),
        parent: rec.parent,
        labels: rec.labels,
        created: rec.created,
        updated: rec.updated,
    }
}

impl Snapshotter for NamespacedSnapshotter {
    fn stat(&self, key: &str) -> Result<Info> {
        Ok(to_info(key, self.record(key)?))
    }

    fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info> {
        let rec = self.db.update(|txn| {
            let record_key = self.record_key(&info.name);
            let mut rec: SnapshotRecord = records::read_mut(txn, &record_key)?
                .ok_or_else(|| MetadataError::NotFound(format!("snapshot {}", info.name)))?;
            let before = rec.labels.clone();
            apply_fieldpaths(&mut rec.labels, &info.labels, fieldpaths)?;
            txn.release_gc_refs(&before, &rec.labels);
            rec.updated = Utc::now();
            records::write(txn, record_key, &rec)?;
            Ok(rec)
        })?;
        Ok(to_info(&info.name, rec))
    }

    fn usage(&self, key: &str) -> Result<Usage> {
        self.backend.usage(&self.record(key)?.backend_key)
    }

    fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        self.backend.mounts(&self.record(key)?.backend_key)
    }

    fn prepare(&self, key: &str, parent: &str, labels: Labels) -> Result<Vec<Mount>> {
        self.create(key, parent, labels, false)
    }

    fn view(&self, key: &str, parent: &str, labels: Labels) -> Result<Vec<Mount>> {
        self.create(key, parent, labels, true)
    }

    fn commit(&self, name: &str, key: &str, labels: Labels) -> Result<()> {
        if name.is_empty() {
            return Err(SnapshotError::InvalidArgument("snapshot name must not be empty".into()));
        }
        validate_labels(&labels)?;
        let ns = self.namespace.as_str();

        let mut committed = false;
        let res = self.db.update(|txn| {
            let active_key = self.record_key(key);
            let active: SnapshotRecord = records::read_mut(txn, &active_key)?
                .ok_or_else(|| MetadataError::FailedPrecondition(format!("snapshot {key} does not exist")))?;
            if active.kind != Kind::Active {
                return Err(MetadataError::FailedPrecondition(format!(
                    "snapshot {key} is not active"
                )));
            }
            let committed_key = self.record_key(name);
            if txn.contains(&committed_key) {
                return Err(MetadataError::AlreadyExists(format!("snapshot {name}")));
            }

            let backend_key = self.backend_key(txn, name)?;
            self.backend.commit(&backend_key, &active.backend_key, Labels::new())?;
            committed = true;

            txn.delete(&active_key);
            let rec = SnapshotRecord {
                backend_key,
                kind: Kind::Committed,
                parent: active.parent,
                labels,
                created: active.created,
                updated: Utc::now(),
            };
            records::write(txn, committed_key, &rec)?;
            txn.publish(
                ns,
                Event::SnapshotCommit {
                    snapshotter: self.name.clone(),
                    key: key.to_string(),
                    name: name.to_string(),
                },
            );
            Ok(())
        });

        match res {
            Ok(()) => {
                debug!(namespace = ns, snapshotter = %self.name, key, name, "snapshot committed");
                Ok(())
            }
            Err(e) => {
                if committed {
                    warn!(namespace = ns, snapshotter = %self.name, name, error = %e, "committed layer not recorded");
                    self.db.mark_orphaned(Some(&self.name));
                }
                Err(e.into())
            }
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        let ns = self.namespace.as_str();
        self.db.update(|txn| {
            if !txn.delete(&self.record_key(key)) {
                return Err(MetadataError::NotFound(format!("snapshot {key}")));
            }
            txn.mark_snapshotter_dirty(&self.name);
            txn.publish(
                ns,
                Event::SnapshotRemove {
                    snapshotter: self.name.clone(),
                    key: key.to_string(),
                },
            );
            Ok(())
        })?;
        debug!(namespace = ns, snapshotter = %self.name, key, "snapshot removed");
        Ok(())
    }

    fn walk(&self, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        let tx = self.db.begin_read();
        let prefix = keys::snapshots(&self.namespace, &self.name);
        for (key, value) in tx.scan(&prefix) {
            let rec: SnapshotRecord = records::decode(value)?;
            f(&to_info(&key[prefix.len()..], rec))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::db::testutil::test_db;
    use ctrd_types::Classify;

    fn source(mounts: &[Mount]) -> PathBuf {
        PathBuf::from(&mounts[0].source)
    }

    fn backend_keys(db: &DB) -> Vec<String> {
        let mut out = Vec::new();
        db.snapshotters["naive"]
            .walk(&mut |info| {
                out.push(info.name.clone());
                Ok(())
            })
            .unwrap();
        out
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn prepare_commit_stat() {
        let (_dir, db) = test_db();
        let sn = db.snapshotter("naive", "default").unwrap();
        sn.prepare("k", "", Labels::new()).unwrap();
        let info = sn.stat("k").unwrap();
        assert_eq!(info.kind, Kind::Active);
        assert_eq!(info.parent, "");

        sn.commit("n", "k", Labels::new()).unwrap();
        assert!(sn.stat("k").unwrap_err().is_not_found());
        let info = sn.stat("n").unwrap();
        assert_eq!(info.kind, Kind::Committed);
        assert_eq!(info.name, "n");
    }

    #[test]
    fn commit_preconditions() {
        let (_dir, db) = test_db();
        let sn = db.snapshotter("naive", "default").unwrap();
        assert!(sn.commit("n", "missing", Labels::new()).unwrap_err().is_failed_precondition());

        sn.prepare("k", "", Labels::new()).unwrap();
        sn.commit("n", "k", Labels::new()).unwrap();
        assert!(sn.commit("n2", "n", Labels::new()).unwrap_err().is_failed_precondition());

        sn.prepare("k2", "", Labels::new()).unwrap();
        assert!(sn.commit("n", "k2", Labels::new()).unwrap_err().is_already_exists());
        // The failed commit left the active snapshot intact.
        assert_eq!(sn.stat("k2").unwrap().kind, Kind::Active);

        sn.view("v", "n", Labels::new()).unwrap();
        assert!(sn.commit("nv", "v", Labels::new()).unwrap_err().is_failed_precondition());
        assert!(sn.stat("nv").unwrap_err().is_not_found());
    }

    #[test]
    fn prepare_preconditions() {
        let (_dir, db) = test_db();
        let sn = db.snapshotter("naive", "default").unwrap();
        sn.prepare("active", "", Labels::new()).unwrap();
        assert!(sn.prepare("active", "", Labels::new()).unwrap_err().is_already_exists());
        assert!(sn.prepare("child", "active", Labels::new()).unwrap_err().is_failed_precondition());
        assert!(sn.prepare("child", "nope", Labels::new()).unwrap_err().is_not_found());

        sn.commit("base", "active", Labels::new()).unwrap();
        // Committed names and active keys share one key space.
        assert!(sn.view("base", "", Labels::new()).unwrap_err().is_already_exists());
        // Failed creates leave no backend layer behind.
        assert_eq!(backend_keys(&db).len(), 1);
    }

    #[test]
    fn layers_chain_through_parents() {
        let (_dir, db) = test_db();
        let sn = db.snapshotter("naive", "default").unwrap();
        let base = source(&sn.prepare("base-active", "", Labels::new()).unwrap());
        fs::write(base.join("hello"), b"world").unwrap();
        sn.commit("base", "base-active", Labels::new()).unwrap();

        let work = sn.prepare("work", "base", Labels::new()).unwrap();
        assert_eq!(fs::read(source(&work).join("hello")).unwrap(), b"world");
        assert_eq!(sn.stat("work").unwrap().parent, "base");
        assert_eq!(sn.mounts("work").unwrap(), work);

        let view = sn.view("ro", "base", Labels::new()).unwrap();
        assert!(view[0].is_readonly());
        assert!(sn.usage("base").unwrap().size >= 5);
    }

    // -----------------------------------------------------------------------
    // Namespacing
    // -----------------------------------------------------------------------

    #[test]
    fn namespaces_have_separate_key_spaces() {
        let (_dir, db) = test_db();
        let a = db.snapshotter("naive", "a").unwrap();
        let b = db.snapshotter("naive", "b").unwrap();
        a.prepare("k", "", Labels::new()).unwrap();
        b.prepare("k", "", Labels::new()).unwrap();
        a.commit("base", "k", Labels::new()).unwrap();
        assert!(b.prepare("child", "base", Labels::new()).unwrap_err().is_not_found());
        assert_eq!(b.stat("k").unwrap().kind, Kind::Active);

        let keys = backend_keys(&db);
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|k| k.starts_with("a/") && k.ends_with("/base")));
        assert!(keys.iter().any(|k| k.starts_with("b/") && k.ends_with("/k")));
    }

    #[test]
    fn walk_lists_namespace_only() {
        let (_dir, db) = test_db();
        let a = db.snapshotter("naive", "a").unwrap();
        a.prepare("one", "", Labels::new()).unwrap();
        a.prepare("two", "", Labels::new()).unwrap();
        db.snapshotter("naive", "b").unwrap().prepare("other", "", Labels::new()).unwrap();

        let mut names = Vec::new();
        a.walk(&mut |info| {
            names.push(info.name.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(names, vec!["one", "two"]);
    }

    // -----------------------------------------------------------------------
    // Labels and removal
    // -----------------------------------------------------------------------

    #[test]
    fn update_labels() {
        let (_dir, db) = test_db();
        let sn = db.snapshotter("naive", "default").unwrap();
        let mut labels = Labels::new();
        labels.insert("stage".into(), "build".into());
        sn.prepare("k", "", labels).unwrap();

        let mut info = sn.stat("k").unwrap();
        info.labels.clear();
        info.labels.insert("owner".into(), "ci".into());
        let info = sn.update(info, &["labels.owner".into()]).unwrap();
        assert_eq!(info.labels.len(), 2);
        assert_eq!(sn.stat("k").unwrap().labels, info.labels);
    }

    #[test]
    fn remove_defers_backend_reclaim() {
        let (_dir, db) = test_db();
        let sn = db.snapshotter("naive", "default").unwrap();
        sn.prepare("k", "", Labels::new()).unwrap();
        sn.commit("base", "k", Labels::new()).unwrap();
        sn.prepare("child", "base", Labels::new()).unwrap();

        // Removing a parent is allowed; its layer lives on under the child.
        sn.remove("base").unwrap();
        assert!(sn.stat("base").unwrap_err().is_not_found());
        assert!(sn.remove("base").unwrap_err().is_not_found());
        assert_eq!(sn.stat("child").unwrap().parent, "base");
        assert_eq!(db.dirty().snapshotter("naive"), 1);
        assert_eq!(backend_keys(&db).len(), 2);
    }
}
