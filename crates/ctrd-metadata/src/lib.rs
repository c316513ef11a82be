//! Namespaced metadata for content and snapshots.
//!
//! The [`DB`] keeps an index of which namespace references which blob and
//! which snapshot, on top of one shared content store and a set of named
//! snapshotters. Clients only ever see the namespaced views it hands out:
//! [`NamespacedContent`] and [`NamespacedSnapshotter`] implement the same
//! contracts as the backends underneath them.
//!
//! Deleting through a view only removes the index record and marks the
//! backend dirty. Backend objects are reclaimed by
//! [`DB::garbage_collect`], usually driven by a [`GcScheduler`].
//!
//! # Design Rules
//!
//! 1. Read transactions see a consistent snapshot of the index and never
//!    block, not even during garbage collection.
//! 2. Write transactions are serialized. Their side effects (dirty marks,
//!    events, mutation callbacks) happen only if they commit.
//! 3. Garbage collection never removes an object that is referenced by an
//!    index record or a `gc.ref` label when the sweep runs. Anything whose
//!    liveness changed during the pass is kept for the next one.
//! 4. An index with a different schema version is refused, never migrated
//!    in place.

pub mod content;
pub mod db;
pub mod error;
pub mod gc;
pub mod kv;
pub mod namespaces;
pub mod records;
pub mod scheduler;
pub mod snapshot;

pub use content::NamespacedContent;
pub use db::{DirtySet, MutationCallback, Txn, DB};
pub use error::{MetadataError, Result};
pub use gc::{Collector, GcStats};
pub use kv::{KvStore, ReadTx, WriteTx};
pub use namespaces::NamespaceStore;
pub use records::SCHEMA_VERSION;
pub use scheduler::{GcScheduler, SchedulerConfig, MAX_PAUSE};
pub use snapshot::NamespacedSnapshotter;
