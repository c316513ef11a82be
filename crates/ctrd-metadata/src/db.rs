use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use tracing::{debug, info};

use ctrd_content::ContentStore;
use ctrd_events::{Event, NoopPublisher, Publisher};
use ctrd_snapshot::Snapshotter;
use ctrd_types::labels::{gc_snapshot_ref, is_gc_content_ref};
use ctrd_types::{validate_namespace, Labels};

use crate::content::NamespacedContent;
use crate::error::{MetadataError, Result};
use crate::kv::{KvStore, ReadTx, WriteTx};
use crate::namespaces::NamespaceStore;
use crate::records::{self, keys, SCHEMA_VERSION};
use crate::snapshot::NamespacedSnapshotter;

/// Observer invoked after every committed write transaction with whether
/// anything is now waiting for garbage collection.
pub type MutationCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Stores with deletions not yet reclaimed by garbage collection.
///
/// Counts are the number of deletions since the last pass that covered the
/// store. A pass only subtracts the deletions it saw, so deletions that race
/// with it keep the store dirty for the next pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirtySet {
    pub content: u64,
    pub snapshotters: BTreeMap<String, u64>,
}

impl DirtySet {
    pub fn is_empty(&self) -> bool {
        self.content == 0 && self.snapshotters.is_empty()
    }

    pub fn snapshotter(&self, name: &str) -> u64 {
        self.snapshotters.get(name).copied().unwrap_or(0)
    }
}

/// Side effects of a write transaction, applied only once it commits.
#[derive(Debug, Default)]
pub(crate) struct Mutation {
    content: u64,
    snapshotters: BTreeMap<String, u64>,
    events: Vec<(String, Event)>,
}

/// A write transaction on the index plus its pending side effects.
pub struct Txn<'a> {
    tx: WriteTx<'a>,
    mutation: Mutation,
}

impl Txn<'_> {
    pub(crate) fn mark_content_dirty(&mut self) {
        self.mutation.content += 1;
    }

    pub(crate) fn mark_snapshotter_dirty(&mut self, name: &str) {
        *self.mutation.snapshotters.entry(name.to_string()).or_default() += 1;
    }

    /// Mark dirty every store a gc.ref label in `before` pointed into, when
    /// `after` drops or retargets that label.
    pub(crate) fn release_gc_refs(&mut self, before: &Labels, after: &Labels) {
        for (key, value) in before {
            if after.get(key) == Some(value) {
                continue;
            }
            if is_gc_content_ref(key) {
                self.mark_content_dirty();
            } else if let Some(name) = gc_snapshot_ref(key) {
                self.mark_snapshotter_dirty(name);
            }
        }
    }

    /// Queue an event to publish after commit.
    pub(crate) fn publish(&mut self, namespace: &str, event: Event) {
        self.mutation.events.push((namespace.to_string(), event));
    }
}

impl<'a> Deref for Txn<'a> {
    type Target = WriteTx<'a>;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl DerefMut for Txn<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}

/// The metadata store.
///
/// Owns the namespaced index, the content store underneath it and the
/// named snapshotters. Write transactions take `wlock` shared; garbage
/// collection takes it exclusively while it marks and while it sweeps.
pub struct DB {
    pub(crate) kv: KvStore,
    pub(crate) content: Arc<dyn ContentStore>,
    pub(crate) snapshotters: BTreeMap<String, Arc<dyn Snapshotter>>,
    pub(crate) wlock: RwLock<()>,
    pub(crate) dirty: Mutex<DirtySet>,
    callbacks: RwLock<Vec<MutationCallback>>,
    pub(crate) publisher: Arc<dyn Publisher>,
}

impl DB {
    pub fn new(
        kv: KvStore,
        content: Arc<dyn ContentStore>,
        snapshotters: impl IntoIterator<Item = (String, Arc<dyn Snapshotter>)>,
    ) -> Self {
        Self {
            kv,
            content,
            snapshotters: snapshotters.into_iter().collect(),
            wlock: RwLock::new(()),
            dirty: Mutex::new(DirtySet::default()),
            callbacks: RwLock::new(Vec::new()),
            publisher: Arc::new(NoopPublisher),
        }
    }

    /// Publish lifecycle events to `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Write or check the schema version.
    ///
    /// An index that already existed may hold references to objects that
    /// were deleted by an interrupted run, so every store starts dirty.
    pub fn init(&self) -> Result<()> {
        let existed = self.kv.update(|tx| match records::read_mut::<u32>(tx, keys::VERSION)? {
            Some(found) if found != SCHEMA_VERSION => Err(MetadataError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            }),
            Some(_) => Ok(true),
            None => {
                records::write(tx, keys::VERSION, &SCHEMA_VERSION)?;
                Ok(false)
            }
        })?;
        if existed {
            let mut dirty = self.dirty.lock().expect("lock poisoned");
            dirty.content = dirty.content.max(1);
            for name in self.snapshotters.keys() {
                let n = dirty.snapshotters.entry(name.clone()).or_default();
                *n = (*n).max(1);
            }
            info!("existing index opened, all stores marked for collection");
        }
        Ok(())
    }

    /// Content store view scoped to `namespace`.
    pub fn content_store(self: &Arc<Self>, namespace: &str) -> Result<NamespacedContent> {
        validate_namespace(namespace)?;
        Ok(NamespacedContent::new(Arc::clone(self), namespace))
    }

    /// Snapshotter `name` scoped to `namespace`.
    pub fn snapshotter(self: &Arc<Self>, name: &str, namespace: &str) -> Result<NamespacedSnapshotter> {
        validate_namespace(namespace)?;
        let backend = self
            .snapshotters
            .get(name)
            .ok_or_else(|| MetadataError::SnapshotterNotFound(name.to_string()))?;
        Ok(NamespacedSnapshotter::new(
            Arc::clone(self),
            name,
            namespace,
            Arc::clone(backend),
        ))
    }

    pub fn snapshotter_names(&self) -> Vec<String> {
        self.snapshotters.keys().cloned().collect()
    }

    pub fn namespaces(self: &Arc<Self>) -> NamespaceStore {
        NamespaceStore::new(Arc::clone(self))
    }

    /// The content store the index sits on.
    pub fn content_backend(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    /// Point-in-time view of the index.
    pub fn begin_read(&self) -> ReadTx {
        self.kv.begin_read()
    }

    pub fn view<T>(&self, f: impl FnOnce(&ReadTx) -> Result<T>) -> Result<T> {
        self.kv.view(f)
    }

    /// Register an observer called after each committed write transaction.
    /// Observers run in registration order, outside every store lock.
    pub fn register_mutation_callback(&self, f: impl Fn(bool) + Send + Sync + 'static) {
        self.callbacks.write().expect("lock poisoned").push(Box::new(f));
    }

    pub fn dirty(&self) -> DirtySet {
        self.dirty.lock().expect("lock poisoned").clone()
    }

    /// Take the write-exclusion lock shared, as every index writer does.
    pub(crate) fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.wlock.read().expect("lock poisoned")
    }

    /// Run `f` in a write transaction.
    pub(crate) fn update<T>(&self, f: impl FnOnce(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        self.update_with_guard(self.read_lock(), f)
    }

    /// Run `f` in a write transaction under an already held `wlock` guard.
    ///
    /// Dirty marks are applied before the guard is released, so a GC pass
    /// never sees a deletion in the index without its dirty mark. Events
    /// and callbacks follow after the guard is released.
    pub(crate) fn update_with_guard<T>(
        &self,
        guard: RwLockReadGuard<'_, ()>,
        f: impl FnOnce(&mut Txn<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut txn = Txn {
            tx: self.kv.begin_write(),
            mutation: Mutation::default(),
        };
        let out = f(&mut txn)?;
        let Txn { tx, mutation } = txn;
        tx.commit()?;
        let dirty = self.apply_dirty(&mutation);
        drop(guard);

        for (namespace, event) in mutation.events {
            self.publisher.publish(&namespace, event);
        }
        for cb in self.callbacks.read().expect("lock poisoned").iter() {
            cb(dirty);
        }
        Ok(out)
    }

    fn apply_dirty(&self, mutation: &Mutation) -> bool {
        let mut dirty = self.dirty.lock().expect("lock poisoned");
        dirty.content += mutation.content;
        for (name, n) in &mutation.snapshotters {
            *dirty.snapshotters.entry(name.clone()).or_default() += n;
        }
        if mutation.content > 0 || !mutation.snapshotters.is_empty() {
            debug!(content = dirty.content, snapshotters = ?dirty.snapshotters, "store marked dirty");
        }
        !dirty.is_empty()
    }

    /// Mark a store dirty outside a transaction, for backend objects left
    /// behind when an index update failed after the backend changed.
    pub(crate) fn mark_orphaned(&self, snapshotter: Option<&str>) {
        let mut dirty = self.dirty.lock().expect("lock poisoned");
        match snapshotter {
            Some(name) => *dirty.snapshotters.entry(name.to_string()).or_default() += 1,
            None => dirty.content += 1,
        }
    }
}

impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB")
            .field("kv", &self.kv)
            .field("snapshotters", &self.snapshotter_names())
            .field("dirty", &self.dirty())
            .finish()
    }
}
