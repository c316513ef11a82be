use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ctrd_types::{Digest, Labels};

use crate::error::Result;

/// Metadata about a committed blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub digest: Digest,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub labels: Labels,
}

/// Progress of an in-flight ingest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub reference: String,
    /// Bytes written so far.
    pub offset: u64,
    /// Declared total size, `0` if unknown.
    pub total: u64,
    pub expected: Option<Digest>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Random access to a committed blob.
pub trait ReaderAt: Send + Sync {
    /// Read into `buf` starting at `offset`. Returns the number of bytes
    /// read; `0` means `offset` is at or past the end.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn size(&self) -> u64;
}

/// An open ingest.
///
/// Dropping a writer without committing releases its reference; the partial
/// data stays on disk and can be resumed by opening the same reference.
pub trait Writer: Send {
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Digest of the bytes written so far.
    fn digest(&self) -> Digest;

    fn status(&self) -> Result<Status>;

    /// Discard written data. Only truncation to zero is supported.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Verify and publish the written bytes as a blob.
    ///
    /// `size` of `0` skips the size check; `expected` of `None` skips the
    /// digest check.
    fn commit(self: Box<Self>, size: u64, expected: Option<Digest>, labels: Labels) -> Result<()>;
}

/// Read side of the store.
pub trait Provider: Send + Sync {
    fn reader_at(&self, digest: &Digest) -> Result<Box<dyn ReaderAt>>;
}

/// Write side of the store.
pub trait Ingester: Send + Sync {
    /// Open (or resume) the ingest identified by `reference`.
    ///
    /// Fails with `AlreadyExists` when `expected` is already committed and
    /// with `Unavailable` when another writer holds `reference`.
    fn writer(&self, reference: &str, total: u64, expected: Option<Digest>)
        -> Result<Box<dyn Writer>>;
}

/// Metadata management of committed blobs.
pub trait Manager: Send + Sync {
    fn info(&self, digest: &Digest) -> Result<Info>;

    /// Update mutable fields (labels) restricted to `fieldpaths`.
    fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info>;

    /// Visit every committed blob. Returning an error stops the walk.
    fn walk(&self, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()>;

    /// Remove a blob. Intended for garbage collection and explicit deletes.
    fn delete(&self, digest: &Digest) -> Result<()>;
}

/// Management of in-flight ingests.
pub trait IngestManager: Send + Sync {
    fn status(&self, reference: &str) -> Result<Status>;

    /// Statuses of every ingest whose reference starts with `prefix`.
    fn list_statuses(&self, prefix: &str) -> Result<Vec<Status>>;

    /// Drop an ingest and its partial data.
    fn abort(&self, reference: &str) -> Result<()>;
}

/// The full content store contract.
pub trait ContentStore: Manager + Provider + IngestManager + Ingester {}

impl<T: Manager + Provider + IngestManager + Ingester + ?Sized> ContentStore for T {}
