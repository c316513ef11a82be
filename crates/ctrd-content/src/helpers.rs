//! Convenience routines layered over the store traits.

use std::io::{self, Read};
use std::thread;
use std::time::Duration;

use tracing::debug;

use ctrd_types::{Classify, Digest, Labels};

use crate::error::{ContentError, Result};
use crate::traits::{Ingester, Provider, Writer};

/// Bounded exponential backoff used while an ingest ref is held elsewhere.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 40,
            initial: Duration::from_millis(5),
            max: Duration::from_millis(250),
        }
    }
}

/// Open a writer, waiting out another writer that holds the same ref.
///
/// This is how concurrent ingests of one blob converge: the losers wait for
/// the in-flight ingest and then observe `AlreadyExists` once it commits.
/// Gives up with the last `Unavailable` error after `policy.attempts` tries.
pub fn open_writer(
    store: &dyn Ingester,
    reference: &str,
    total: u64,
    expected: Option<Digest>,
    policy: &RetryPolicy,
) -> Result<Box<dyn Writer>> {
    let mut backoff = policy.initial;
    let mut attempt = 0;
    loop {
        match store.writer(reference, total, expected) {
            Err(e) if e.is_unavailable() && attempt + 1 < policy.attempts => {
                attempt += 1;
                debug!(reference, attempt, "ingest ref locked, retrying");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(policy.max);
            }
            other => return other,
        }
    }
}

/// Copy `reader` into `writer` and commit, skipping bytes already written
/// by a previous attempt under the same ref.
pub fn copy_from(
    mut writer: Box<dyn Writer>,
    mut reader: impl Read,
    size: u64,
    expected: Option<Digest>,
    labels: Labels,
) -> Result<()> {
    let offset = writer.status()?.offset;
    if offset > 0 {
        if size > 0 && offset > size {
            writer.truncate(0)?;
        } else {
            let skipped = io::copy(&mut (&mut reader).take(offset), &mut io::sink())?;
            if skipped != offset {
                writer.truncate(0)?;
                return Err(ContentError::InvalidArgument(
                    "source is shorter than the resumed ingest".into(),
                ));
            }
        }
    }

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n])?;
    }
    writer.commit(size, expected, labels)
}

/// Ingest `data` under `reference`.
///
/// Returns `Ok(true)` if this call committed the blob and `Ok(false)` if it
/// was already present (or committed concurrently by someone else).
pub fn write_blob(
    store: &dyn Ingester,
    reference: &str,
    data: &[u8],
    expected: Digest,
    labels: Labels,
) -> Result<bool> {
    let size = data.len() as u64;
    let writer = match open_writer(store, reference, size, Some(expected), &RetryPolicy::default())
    {
        Ok(w) => w,
        Err(e) if e.is_already_exists() => return Ok(false),
        Err(e) => return Err(e),
    };
    match copy_from(writer, data, size, Some(expected), labels) {
        Ok(()) => Ok(true),
        Err(e) if e.is_already_exists() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read a whole blob into memory.
pub fn read_blob(store: &dyn Provider, digest: &Digest) -> Result<Vec<u8>> {
    let ra = store.reader_at(digest)?;
    let mut buf = vec![0u8; ra.size() as usize];
    let mut off = 0;
    while off < buf.len() {
        let n = ra.read_at(&mut buf[off..], off as u64)?;
        if n == 0 {
            return Err(ContentError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("blob {digest} shorter than its recorded size"),
            )));
        }
        off += n;
    }
    Ok(buf)
}
