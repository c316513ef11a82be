//! Mark and sweep garbage collection.
//!
//! A pass runs in three steps:
//!
//! 1. With `wlock` held exclusively, capture the dirty set and a read
//!    transaction. The index cannot change between the two.
//! 2. Without any lock, compute the live set from that transaction and walk
//!    the content store and every dirty snapshotter for candidates.
//! 3. With `wlock` held exclusively again, recompute the live set from the
//!    current index and delete the candidates that are still unreferenced.
//!    Anything that became live in between is retained for the next pass,
//!    and the dirty marks of that store are left in place.
//!
//! Readers are never blocked. Writers wait only while steps 1 and 3 run.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use ctrd_content::Manager;
use ctrd_events::Event;
use ctrd_snapshot::Snapshotter;
use ctrd_types::labels::{gc_snapshot_ref, is_gc_content_ref};
use ctrd_types::{Classify, Digest, Labels};

use crate::db::{DirtySet, DB};
use crate::error::Result;
use crate::kv::ReadTx;
use crate::records::{self, keys, BlobRecord, NamespaceRecord, SnapshotRecord};

/// Outcome of one collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub content_removed: usize,
    /// Removed backend snapshots per snapshotter.
    pub snapshots_removed: BTreeMap<String, usize>,
    /// Candidates kept because they became live or failed to delete.
    pub retained: usize,
    pub elapsed: Duration,
}

impl GcStats {
    pub fn snapshots_total(&self) -> usize {
        self.snapshots_removed.values().sum()
    }
}

/// Something that can run a collection pass.
pub trait Collector: Send + Sync {
    fn garbage_collect(&self) -> Result<GcStats>;
}

impl Collector for DB {
    fn garbage_collect(&self) -> Result<GcStats> {
        DB::garbage_collect(self)
    }
}

/// References that keep backend objects alive.
#[derive(Debug, Default)]
struct Roots {
    content: BTreeSet<Digest>,
    /// Backend keys per snapshotter.
    snapshots: BTreeMap<String, BTreeSet<String>>,
}

impl Roots {
    fn collect(tx: &ReadTx) -> Result<Self> {
        let mut roots = Self::default();
        for (key, value) in tx.scan(keys::NAMESPACES) {
            let ns = &key[keys::NAMESPACES.len()..];
            let rec: NamespaceRecord = records::decode(value)?;
            roots.add_labels(tx, ns, &rec.labels)?;
        }
        for (key, value) in tx.scan(keys::DATA) {
            match keys::parse(key) {
                Some(keys::DataKey::Blob { ns, digest }) => {
                    let rec: BlobRecord = records::decode(value)?;
                    if let Some(d) = records::parse_digest(digest) {
                        roots.content.insert(d);
                    }
                    roots.add_labels(tx, ns, &rec.labels)?;
                }
                Some(keys::DataKey::Snapshot { ns, snapshotter, .. }) => {
                    let rec: SnapshotRecord = records::decode(value)?;
                    roots
                        .snapshots
                        .entry(snapshotter.to_string())
                        .or_default()
                        .insert(rec.backend_key);
                    roots.add_labels(tx, ns, &rec.labels)?;
                }
                None => warn!(key, "unrecognized index key"),
            }
        }
        Ok(roots)
    }

    fn add_labels(&mut self, tx: &ReadTx, ns: &str, labels: &Labels) -> Result<()> {
        for (key, value) in labels {
            if is_gc_content_ref(key) {
                match Digest::parse(value) {
                    Ok(d) => {
                        self.content.insert(d);
                    }
                    Err(_) => debug!(namespace = ns, label = %key, "ignoring malformed content reference"),
                }
            } else if let Some(snapshotter) = gc_snapshot_ref(key) {
                let target = keys::snapshot(ns, snapshotter, value);
                if let Some(rec) = records::read::<SnapshotRecord>(tx, &target)? {
                    self.snapshots
                        .entry(snapshotter.to_string())
                        .or_default()
                        .insert(rec.backend_key);
                }
            }
        }
        Ok(())
    }

    fn snapshots(&self, snapshotter: &str) -> BTreeSet<String> {
        self.snapshots.get(snapshotter).cloned().unwrap_or_default()
    }
}

/// Candidates found by the mark step.
#[derive(Debug)]
pub(crate) struct Plan {
    started: Instant,
    dirty: DirtySet,
    content: Vec<Digest>,
    snapshots: BTreeMap<String, Vec<String>>,
}

/// Backend key to parent backend key for every snapshot of a backend.
fn backend_tree(sn: &dyn Snapshotter) -> Result<BTreeMap<String, String>> {
    let mut tree = BTreeMap::new();
    sn.walk(&mut |info| {
        tree.insert(info.name.clone(), info.parent.clone());
        Ok(())
    })?;
    Ok(tree)
}

/// The roots plus every ancestor they chain to.
fn expand(tree: &BTreeMap<String, String>, roots: &BTreeSet<String>) -> BTreeSet<String> {
    let mut live = BTreeSet::new();
    for root in roots {
        let mut cur = root.as_str();
        while !cur.is_empty() && live.insert(cur.to_string()) {
            cur = tree.get(cur).map(String::as_str).unwrap_or("");
        }
    }
    live
}

/// Order `dead` so every snapshot comes before its parent.
fn leaves_first(tree: &BTreeMap<String, String>, dead: &BTreeSet<String>) -> Vec<String> {
    let mut children: BTreeMap<&str, usize> = dead.iter().map(|k| (k.as_str(), 0)).collect();
    for key in dead {
        if let Some(n) = tree.get(key).and_then(|p| children.get_mut(p.as_str())) {
            *n += 1;
        }
    }
    let mut ready: VecDeque<&str> = children
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut order = Vec::with_capacity(dead.len());
    while let Some(key) = ready.pop_front() {
        order.push(key.to_string());
        if let Some(parent) = tree.get(key) {
            if let Some(n) = children.get_mut(parent.as_str()) {
                *n -= 1;
                if *n == 0 {
                    ready.push_back(parent.as_str());
                }
            }
        }
    }
    order
}

impl DB {
    /// Run one collection pass. A clean store makes this a no-op.
    pub fn garbage_collect(&self) -> Result<GcStats> {
        match self.mark()? {
            Some(plan) => self.sweep(plan),
            None => Ok(GcStats::default()),
        }
    }

    pub(crate) fn mark(&self) -> Result<Option<Plan>> {
        let started = Instant::now();
        let (dirty, tx) = {
            let _excl = self.wlock.write().expect("lock poisoned");
            let dirty = self.dirty();
            if dirty.is_empty() {
                return Ok(None);
            }
            (dirty, self.kv.begin_read())
        };
        let roots = Roots::collect(&tx)?;

        let mut content = Vec::new();
        if dirty.content > 0 {
            self.content.walk(&mut |info| {
                if !roots.content.contains(&info.digest) {
                    content.push(info.digest);
                }
                Ok(())
            })?;
        }

        let mut snapshots = BTreeMap::new();
        for name in dirty.snapshotters.keys() {
            let Some(sn) = self.snapshotters.get(name) else {
                continue;
            };
            let tree = backend_tree(sn.as_ref())?;
            let live = expand(&tree, &roots.snapshots(name));
            let dead: Vec<String> = tree.keys().filter(|k| !live.contains(*k)).cloned().collect();
            snapshots.insert(name.clone(), dead);
        }

        debug!(
            content = content.len(),
            snapshots = snapshots.values().map(Vec::len).sum::<usize>(),
            "gc mark complete"
        );
        Ok(Some(Plan { started, dirty, content, snapshots }))
    }

    pub(crate) fn sweep(&self, plan: Plan) -> Result<GcStats> {
        let mut stats = GcStats::default();
        let mut content_retained = 0;
        let mut snapshots_retained: BTreeMap<&str, usize> = BTreeMap::new();
        {
            let _excl = self.wlock.write().expect("lock poisoned");
            let current = Roots::collect(&self.kv.begin_read())?;

            for digest in &plan.content {
                if current.content.contains(digest) {
                    content_retained += 1;
                    continue;
                }
                match self.content.delete(digest) {
                    Ok(()) => stats.content_removed += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(digest = %digest, error = %e, "failed to remove content");
                        content_retained += 1;
                    }
                }
            }

            for (name, candidates) in &plan.snapshots {
                let Some(sn) = self.snapshotters.get(name) else {
                    continue;
                };
                let tree = backend_tree(sn.as_ref())?;
                let live = expand(&tree, &current.snapshots(name));
                let mut retained = 0;
                let mut dead = BTreeSet::new();
                for key in candidates {
                    if live.contains(key) {
                        retained += 1;
                    } else if tree.contains_key(key) {
                        dead.insert(key.clone());
                    }
                }

                let mut removed = 0;
                for key in leaves_first(&tree, &dead) {
                    match sn.remove(&key) {
                        Ok(()) => removed += 1,
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            warn!(snapshotter = %name, key = %key, error = %e, "failed to remove snapshot");
                            retained += 1;
                        }
                    }
                }
                if removed > 0 {
                    stats.snapshots_removed.insert(name.clone(), removed);
                }
                snapshots_retained.insert(name.as_str(), retained);
            }

            self.clear_dirty(&plan.dirty, content_retained, &snapshots_retained);
        }

        stats.retained = content_retained + snapshots_retained.values().sum::<usize>();
        stats.elapsed = plan.started.elapsed();
        self.publisher.publish(
            "",
            Event::GcComplete {
                content_removed: stats.content_removed,
                snapshots_removed: stats.snapshots_total(),
                retained: stats.retained,
            },
        );
        info!(
            content_removed = stats.content_removed,
            snapshots_removed = stats.snapshots_total(),
            retained = stats.retained,
            elapsed = ?stats.elapsed,
            "garbage collection complete"
        );
        Ok(stats)
    }

    /// Subtract the marks this pass covered from every store it fully swept.
    fn clear_dirty(&self, seen: &DirtySet, content_retained: usize, snapshots_retained: &BTreeMap<&str, usize>) {
        let mut dirty = self.dirty.lock().expect("lock poisoned");
        if content_retained == 0 {
            dirty.content = dirty.content.saturating_sub(seen.content);
        }
        for (name, n) in &seen.snapshotters {
            if snapshots_retained.get(name.as_str()).copied().unwrap_or(0) > 0 {
                continue;
            }
            if let Some(current) = dirty.snapshotters.get_mut(name) {
                *current = current.saturating_sub(*n);
                if *current == 0 {
                    dirty.snapshotters.remove(name);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::db::testutil::test_db;
    use ctrd_content::{read_blob, write_blob, Provider, ReaderAt};
    use ctrd_types::labels::{GC_REF_CONTENT, GC_REF_SNAPSHOT};

    fn add_blob(db: &Arc<DB>, ns: &str, data: &[u8]) -> Digest {
        let d = Digest::from_bytes(data);
        write_blob(&db.content_store(ns).unwrap(), "ingest", data, d, Labels::new()).unwrap();
        d
    }

    fn tree(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, p)| (k.to_string(), p.to_string())).collect()
    }

    fn set(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // Liveness helpers
    // -----------------------------------------------------------------------

    #[test]
    fn expand_follows_parent_chains() {
        let t = tree(&[("a", ""), ("b", "a"), ("c", "b"), ("x", "")]);
        assert_eq!(expand(&t, &set(&["c"])), set(&["a", "b", "c"]));
        assert_eq!(expand(&t, &set(&[])), set(&[]));
    }

    #[test]
    fn leaves_come_before_parents() {
        let t = tree(&[("a", ""), ("b", "a"), ("c", "b"), ("d", "a"), ("live", "")]);
        let order = leaves_first(&t, &set(&["a", "b", "c", "d"]));
        let pos = |k: &str| order.iter().position(|o| o == k).unwrap();
        assert_eq!(order.len(), 4);
        assert!(pos("c") < pos("b"));
        assert!(pos("b") < pos("a"));
        assert!(pos("d") < pos("a"));
    }

    // -----------------------------------------------------------------------
    // Content
    // -----------------------------------------------------------------------

    #[test]
    fn clean_store_is_a_noop() {
        let (_dir, db) = test_db();
        let d = add_blob(&db, "default", b"kept");
        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats, GcStats::default());
        assert!(db.content_backend().info(&d).is_ok());
    }

    #[test]
    fn unreferenced_content_is_removed() {
        let (_dir, db) = test_db();
        let gone = add_blob(&db, "default", b"gone");
        let shared = add_blob(&db, "default", b"shared");
        add_blob(&db, "other", b"shared");

        let cs = db.content_store("default").unwrap();
        cs.delete(&gone).unwrap();
        cs.delete(&shared).unwrap();
        assert_eq!(db.dirty().content, 2);

        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats.content_removed, 1);
        assert_eq!(stats.retained, 0);
        assert!(db.dirty().is_empty());
        assert!(db.content_backend().info(&gone).unwrap_err().is_not_found());
        // Still referenced by the other namespace.
        assert_eq!(read_blob(&db.content_store("other").unwrap(), &shared).unwrap(), b"shared");
    }

    #[test]
    fn gc_labels_keep_content_alive() {
        let (_dir, db) = test_db();
        let config = add_blob(&db, "default", b"config");
        let layer = add_blob(&db, "default", b"layer");
        let pinned = add_blob(&db, "default", b"pinned");

        let cs = db.content_store("default").unwrap();
        let mut info = cs.info(&config).unwrap();
        info.labels.insert(format!("{GC_REF_CONTENT}.l0"), layer.to_string());
        cs.update(info, &[]).unwrap();
        db.namespaces().set_label("default", GC_REF_CONTENT, &pinned.to_string()).unwrap();

        cs.delete(&layer).unwrap();
        cs.delete(&pinned).unwrap();
        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats.content_removed, 0);
        assert!(db.content_backend().info(&layer).is_ok());
        assert!(db.content_backend().info(&pinned).is_ok());

        // Dropping the referencing record releases the layer.
        cs.delete(&config).unwrap();
        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats.content_removed, 2);
        assert!(db.content_backend().info(&layer).unwrap_err().is_not_found());
    }

    #[test]
    fn clearing_a_namespace_pin_releases_content() {
        let (_dir, db) = test_db();
        let pinned = add_blob(&db, "default", b"pinned");
        db.namespaces().set_label("default", GC_REF_CONTENT, &pinned.to_string()).unwrap();
        db.content_store("default").unwrap().delete(&pinned).unwrap();
        assert_eq!(db.garbage_collect().unwrap().content_removed, 0);
        assert!(db.dirty().is_empty());

        db.namespaces().set_label("default", "unrelated", "x").unwrap();
        assert!(db.dirty().is_empty());
        db.namespaces().set_label("default", GC_REF_CONTENT, "").unwrap();
        assert_eq!(db.dirty().content, 1);

        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats.content_removed, 1);
        assert!(db.content_backend().info(&pinned).unwrap_err().is_not_found());
    }

    #[test]
    fn retargeting_a_blob_label_releases_the_old_target() {
        let (_dir, db) = test_db();
        let index = add_blob(&db, "default", b"index");
        let old = add_blob(&db, "default", b"old manifest");
        let new = add_blob(&db, "default", b"new manifest");
        let cs = db.content_store("default").unwrap();
        let key = format!("{GC_REF_CONTENT}.m0");

        let mut info = cs.info(&index).unwrap();
        info.labels.insert(key.clone(), old.to_string());
        cs.update(info.clone(), &[]).unwrap();
        cs.delete(&old).unwrap();
        assert_eq!(db.garbage_collect().unwrap().content_removed, 0);

        // Rewriting the same labels releases nothing.
        cs.update(info.clone(), &[]).unwrap();
        assert!(db.dirty().is_empty());

        info.labels.insert(key.clone(), new.to_string());
        cs.update(info, &[format!("labels.{key}")]).unwrap();
        assert_eq!(db.dirty().content, 1);

        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats.content_removed, 1);
        assert!(db.content_backend().info(&old).unwrap_err().is_not_found());
        assert!(db.content_backend().info(&new).is_ok());
    }

    #[test]
    fn dropping_snapshot_labels_marks_the_referenced_stores() {
        let (_dir, db) = test_db();
        let config = add_blob(&db, "default", b"config");
        let sn = db.snapshotter("naive", "default").unwrap();
        sn.prepare("k", "", Labels::new()).unwrap();
        sn.commit("base", "k", Labels::new()).unwrap();
        sn.prepare("work", "", Labels::new()).unwrap();

        let mut info = sn.stat("work").unwrap();
        info.labels.insert(GC_REF_CONTENT.to_string(), config.to_string());
        info.labels.insert(format!("{GC_REF_SNAPSHOT}naive"), "base".to_string());
        sn.update(info.clone(), &[]).unwrap();
        db.content_store("default").unwrap().delete(&config).unwrap();
        db.garbage_collect().unwrap();
        assert!(db.dirty().is_empty());
        assert!(db.content_backend().info(&config).is_ok());

        info.labels.clear();
        sn.update(info, &[]).unwrap();
        assert_eq!(db.dirty().content, 1);
        assert_eq!(db.dirty().snapshotter("naive"), 1);

        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats.content_removed, 1);
        assert_eq!(stats.snapshots_total(), 0);
        assert!(db.dirty().is_empty());
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    #[test]
    fn parent_layers_live_through_children() {
        let (_dir, db) = test_db();
        let sn = db.snapshotter("naive", "default").unwrap();
        sn.prepare("k", "", Labels::new()).unwrap();
        sn.commit("base", "k", Labels::new()).unwrap();
        sn.prepare("child", "base", Labels::new()).unwrap();

        sn.remove("base").unwrap();
        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats.snapshots_total(), 0);
        assert!(db.dirty().is_empty());

        sn.remove("child").unwrap();
        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats.snapshots_removed.get("naive"), Some(&2));
        let mut left = 0;
        db.snapshotters["naive"]
            .walk(&mut |_| {
                left += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn orphaned_backend_layers_are_collected() {
        let (_dir, db) = test_db();
        db.snapshotters["naive"].prepare("stray", "", Labels::new()).unwrap();
        db.snapshotter("naive", "default").unwrap().prepare("kept", "", Labels::new()).unwrap();
        db.mark_orphaned(Some("naive"));

        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats.snapshots_total(), 1);
        assert!(db.snapshotters["naive"].stat("stray").unwrap_err().is_not_found());
        assert!(db.snapshotter("naive", "default").unwrap().mounts("kept").is_ok());
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn reference_created_during_mark_is_retained() {
        let (_dir, db) = test_db();
        let d = add_blob(&db, "default", b"revived");
        db.content_store("default").unwrap().delete(&d).unwrap();

        let plan = db.mark().unwrap().unwrap();
        assert_eq!(plan.content, vec![d]);
        // Re-referenced between mark and sweep.
        add_blob(&db, "default", b"revived");
        let late = add_blob(&db, "default", b"late");
        db.content_store("default").unwrap().delete(&late).unwrap();

        let stats = db.sweep(plan).unwrap();
        assert_eq!(stats.content_removed, 0);
        assert_eq!(stats.retained, 1);
        assert!(db.content_backend().info(&d).is_ok());
        // Neither the retained store nor the late delete was cleared.
        assert_eq!(db.dirty().content, 2);

        let stats = db.garbage_collect().unwrap();
        assert_eq!(stats.content_removed, 1);
        assert!(db.dirty().is_empty());
    }

    #[test]
    fn snapshot_created_during_mark_is_retained() {
        let (_dir, db) = test_db();
        let sn = db.snapshotter("naive", "default").unwrap();
        sn.prepare("k", "", Labels::new()).unwrap();
        sn.commit("base", "k", Labels::new()).unwrap();
        sn.remove("base").unwrap();

        let plan = db.mark().unwrap().unwrap();
        assert_eq!(plan.snapshots["naive"].len(), 1);
        // Referenced again between mark and sweep.
        let backend_key = plan.snapshots["naive"][0].clone();
        db.update(|txn| {
            let now = chrono::Utc::now();
            let rec = SnapshotRecord {
                backend_key,
                kind: ctrd_snapshot::Kind::Committed,
                parent: String::new(),
                labels: Labels::new(),
                created: now,
                updated: now,
            };
            records::write(txn, keys::snapshot("default", "naive", "restored"), &rec)
        })
        .unwrap();

        let stats = db.sweep(plan).unwrap();
        assert_eq!(stats.snapshots_total(), 0);
        assert_eq!(stats.retained, 1);
        assert_eq!(db.dirty().snapshotter("naive"), 1);
        assert_eq!(sn.stat("restored").unwrap().kind, ctrd_snapshot::Kind::Committed);
    }

    #[test]
    fn read_transactions_and_readers_survive_collection() {
        let (_dir, db) = test_db();
        let d = add_blob(&db, "default", b"isolated bytes");
        let cs = db.content_store("default").unwrap();
        let before = db.begin_read();
        let reader = cs.reader_at(&d).unwrap();

        cs.delete(&d).unwrap();
        assert_eq!(db.garbage_collect().unwrap().content_removed, 1);

        assert!(before.contains(&keys::blob("default", &d)));
        assert!(!db.begin_read().contains(&keys::blob("default", &d)));
        let mut buf = vec![0u8; 14];
        assert_eq!(reader.read_at(&mut buf, 0).unwrap(), 14);
        assert_eq!(buf, b"isolated bytes");
    }

    #[test]
    fn concurrent_readers_during_collection() {
        let (_dir, db) = test_db();
        let live = add_blob(&db, "default", b"always readable");
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cs = db.content_store("default").unwrap();
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut reads = 0;
                    loop {
                        assert_eq!(read_blob(&cs, &live).unwrap(), b"always readable");
                        reads += 1;
                        if stop.load(Ordering::Relaxed) {
                            break reads;
                        }
                    }
                })
            })
            .collect();

        for i in 0..20u32 {
            let d = add_blob(&db, "default", format!("garbage {i}").as_bytes());
            db.content_store("default").unwrap().delete(&d).unwrap();
            assert_eq!(db.garbage_collect().unwrap().content_removed, 1);
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            assert!(r.join().unwrap() > 0);
        }
    }
}
