//! Digest-addressed blob storage.
//!
//! Every blob is stored under the [`Digest`](ctrd_types::Digest) of its
//! bytes and is immutable once committed. Data enters the store through an
//! ingest: a [`Writer`] opened under a caller-chosen reference, written to,
//! and finally committed, at which point the accumulated digest is checked
//! against the expected one.
//!
//! # Design Rules
//!
//! 1. Blobs are immutable once committed.
//! 2. At most one writer holds a given ingest reference; a second attempt
//!    fails immediately with an `Unavailable` error instead of blocking.
//! 3. An ingest interrupted part-way can be resumed under the same reference
//!    or aborted, never leaving a half-written blob visible.
//! 4. Readers of committed blobs never block each other.
//!
//! # Storage Backends
//!
//! - [`LocalStore`]: blobs and ingests under a directory tree
//!
//! Labels are kept by a separate [`LabelStore`]; [`MemoryLabelStore`] is the
//! in-process implementation.

pub mod error;
pub mod helpers;
pub mod labels;
pub mod local;
pub mod traits;

pub use error::{ContentError, Result};
pub use helpers::{copy_from, open_writer, read_blob, write_blob, RetryPolicy};
pub use labels::{LabelStore, MemoryLabelStore};
pub use local::LocalStore;
pub use traits::{
    ContentStore, Info, IngestManager, Ingester, Manager, Provider, ReaderAt, Status, Writer,
};
