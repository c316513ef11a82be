//! Content store view scoped to a namespace.
//!
//! Blobs are shared by every namespace at the storage level, but a
//! namespace only sees blobs it holds a record for. Writing a blob another
//! namespace already stored commits without copying the bytes again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use ctrd_content::{
    ContentError, Info, IngestManager, Ingester, Manager, Provider, ReaderAt, Status, Writer,
};
use ctrd_events::Event;
use ctrd_types::{apply_fieldpaths, validate_labels, Classify, Digest, Digester, Labels};

use crate::db::DB;
use crate::error::MetadataError;
use crate::namespaces::ensure_namespace;
use crate::records::{self, keys, BlobRecord};

type Result<T> = std::result::Result<T, ContentError>;

/// The content store contract, restricted to one namespace.
#[derive(Debug, Clone)]
pub struct NamespacedContent {
    db: Arc<DB>,
    namespace: String,
}

impl NamespacedContent {
    pub(crate) fn new(db: Arc<DB>, namespace: &str) -> Self {
        Self {
            db,
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn backend_ref(&self, reference: &str) -> String {
        format!("{}/{reference}", self.namespace)
    }

    fn record(&self, digest: &Digest) -> Result<BlobRecord> {
        let tx = self.db.begin_read();
        records::read::<BlobRecord>(&tx, &keys::blob(&self.namespace, digest))?
            .ok_or(ContentError::NotFound(*digest))
    }

    fn strip_status(&self, mut status: Status) -> Status {
        let prefix = format!("{}/", self.namespace);
        if let Some(reference) = status.reference.strip_prefix(&prefix) {
            status.reference = reference.to_string();
        }
        status
    }
}

fn to_info(digest: Digest, rec: BlobRecord) -> Info {
    Info {
        digest,
        size: rec.size,
        created_at: rec.created_at,
        updated_at: rec.updated_at,
        labels: rec.labels,
    }
}

impl Provider for NamespacedContent {
    fn reader_at(&self, digest: &Digest) -> Result<Box<dyn ReaderAt>> {
        self.record(digest)?;
        self.db.content.reader_at(digest)
    }
}

impl Manager for NamespacedContent {
    fn info(&self, digest: &Digest) -> Result<Info> {
        Ok(to_info(*digest, self.record(digest)?))
    }

    fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info> {
        let ns = &self.namespace;
        let updated = self.db.update(|txn| {
            let key = keys::blob(ns, &info.digest);
            let mut rec: BlobRecord = records::read_mut(txn, &key)?
                .ok_or(ContentError::NotFound(info.digest))?;
            let before = rec.labels.clone();
            apply_fieldpaths(&mut rec.labels, &info.labels, fieldpaths)?;
            txn.release_gc_refs(&before, &rec.labels);
            rec.updated_at = Utc::now();
            records::write(txn, key, &rec)?;
            Ok(rec)
        })?;
        Ok(to_info(info.digest, updated))
    }

    fn walk(&self, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        let tx = self.db.begin_read();
        let prefix = keys::blobs(&self.namespace);
        for (key, value) in tx.scan(&prefix) {
            let Some(digest) = records::parse_digest(&key[prefix.len()..]) else {
                continue;
            };
            let rec: BlobRecord = records::decode(value)?;
            f(&to_info(digest, rec))?;
        }
        Ok(())
    }

    /// Remove the namespace's reference. The bytes stay until garbage
    /// collection finds no namespace referencing them.
    fn delete(&self, digest: &Digest) -> Result<()> {
        let ns = &self.namespace;
        self.db.update(|txn| {
            if !txn.delete(&keys::blob(ns, digest)) {
                return Err(ContentError::NotFound(*digest).into());
            }
            txn.mark_content_dirty();
            txn.publish(ns, Event::ContentDelete { digest: *digest });
            Ok(())
        })?;
        debug!(namespace = %ns, digest = %digest, "content reference deleted");
        Ok(())
    }
}

impl IngestManager for NamespacedContent {
    fn status(&self, reference: &str) -> Result<Status> {
        let st = self.db.content.status(&self.backend_ref(reference))?;
        Ok(self.strip_status(st))
    }

    fn list_statuses(&self, prefix: &str) -> Result<Vec<Status>> {
        let statuses = self.db.content.list_statuses(&self.backend_ref(prefix))?;
        Ok(statuses.into_iter().map(|st| self.strip_status(st)).collect())
    }

    fn abort(&self, reference: &str) -> Result<()> {
        self.db.content.abort(&self.backend_ref(reference))
    }
}

impl Ingester for NamespacedContent {
    fn writer(
        &self,
        reference: &str,
        total: u64,
        expected: Option<Digest>,
    ) -> Result<Box<dyn Writer>> {
        if reference.is_empty() {
            return Err(ContentError::InvalidArgument("ingest ref must not be empty".into()));
        }

        let shared = |digest: Digest, size: u64| -> Box<dyn Writer> {
            let now = Utc::now();
            Box::new(NamespacedWriter {
                db: Arc::clone(&self.db),
                namespace: self.namespace.clone(),
                reference: reference.to_string(),
                inner: Inner::Shared {
                    digest,
                    size,
                    total,
                    digester: Digester::new(),
                    offset: 0,
                    started_at: now,
                    updated_at: now,
                },
            })
        };

        if let Some(expected) = expected {
            if self.record(&expected).is_ok() {
                return Err(ContentError::AlreadyExists(expected));
            }
            if let Ok(info) = self.db.content.info(&expected) {
                debug!(namespace = %self.namespace, digest = %expected, "sharing existing content");
                return Ok(shared(expected, info.size));
            }
        }

        match self.db.content.writer(&self.backend_ref(reference), total, expected) {
            Ok(w) => Ok(Box::new(NamespacedWriter {
                db: Arc::clone(&self.db),
                namespace: self.namespace.clone(),
                reference: reference.to_string(),
                inner: Inner::Backend(w),
            })),
            Err(ContentError::AlreadyExists(d)) => {
                let info = self.db.content.info(&d)?;
                Ok(shared(d, info.size))
            }
            Err(e) => Err(e),
        }
    }
}

enum Inner {
    Backend(Box<dyn Writer>),
    /// The blob is already stored; bytes written are only hashed.
    Shared {
        digest: Digest,
        size: u64,
        total: u64,
        digester: Digester,
        offset: u64,
        started_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
}

struct NamespacedWriter {
    db: Arc<DB>,
    namespace: String,
    reference: String,
    inner: Inner,
}

impl Writer for NamespacedWriter {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        match &mut self.inner {
            Inner::Backend(w) => w.write(data),
            Inner::Shared { digester, offset, updated_at, .. } => {
                digester.update(data);
                *offset += data.len() as u64;
                *updated_at = Utc::now();
                Ok(data.len())
            }
        }
    }

    fn digest(&self) -> Digest {
        match &self.inner {
            Inner::Backend(w) => w.digest(),
            Inner::Shared { digester, .. } => digester.digest(),
        }
    }

    fn status(&self) -> Result<Status> {
        match &self.inner {
            Inner::Backend(w) => {
                let mut st = w.status()?;
                st.reference = self.reference.clone();
                Ok(st)
            }
            Inner::Shared { digest, total, offset, started_at, updated_at, .. } => Ok(Status {
                reference: self.reference.clone(),
                offset: *offset,
                total: *total,
                expected: Some(*digest),
                started_at: *started_at,
                updated_at: *updated_at,
            }),
        }
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        match &mut self.inner {
            Inner::Backend(w) => w.truncate(size),
            Inner::Shared { digester, offset, updated_at, .. } => {
                if size != 0 {
                    return Err(ContentError::InvalidArgument(
                        "truncate to a non-zero size is not supported".into(),
                    ));
                }
                digester.reset();
                *offset = 0;
                *updated_at = Utc::now();
                Ok(())
            }
        }
    }

    fn commit(self: Box<Self>, size: u64, expected: Option<Digest>, labels: Labels) -> Result<()> {
        validate_labels(&labels)?;
        let NamespacedWriter { db, namespace, reference, inner } = *self;

        // Held across the backend commit and the index update so a GC
        // sweep cannot reclaim the blob in between.
        let guard = db.read_lock();
        let (digest, blob_size) = match inner {
            Inner::Backend(w) => {
                let actual = w.digest();
                match w.commit(size, expected, Labels::new()) {
                    Ok(()) => {}
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e),
                }
                (actual, db.content.info(&actual)?.size)
            }
            Inner::Shared { digest, size: stored, digester, offset, .. } => {
                if offset > 0 && digester.digest() != digest {
                    return Err(ContentError::DigestMismatch {
                        expected: digest,
                        actual: digester.digest(),
                    });
                }
                if let Some(expected) = expected.filter(|e| *e != digest) {
                    return Err(ContentError::DigestMismatch { expected, actual: digest });
                }
                if size > 0 && size != stored {
                    return Err(ContentError::UnexpectedSize {
                        expected: size,
                        actual: stored,
                    });
                }
                // Still present: a sweep needs the exclusive lock we exclude.
                db.content.info(&digest)?;
                (digest, stored)
            }
        };

        let ns = namespace.as_str();
        let res = db.update_with_guard(guard, |txn| {
            ensure_namespace(txn, ns)?;
            let key = keys::blob(ns, &digest);
            if txn.contains(&key) {
                return Err(ContentError::AlreadyExists(digest).into());
            }
            let now = Utc::now();
            let rec = BlobRecord {
                size: blob_size,
                labels,
                created_at: now,
                updated_at: now,
            };
            records::write(txn, key, &rec)
        });
        match res {
            Ok(()) => {
                debug!(namespace = ns, reference = %reference, digest = %digest, "content committed");
                Ok(())
            }
            Err(e) => {
                if !matches!(e, MetadataError::Content(ContentError::AlreadyExists(_))) {
                    warn!(namespace = ns, digest = %digest, error = %e, "content record not written");
                    db.mark_orphaned(None);
                }
                Err(e.into())
            }
        }
    }
}
