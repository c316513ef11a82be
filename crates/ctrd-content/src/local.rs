use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use ctrd_types::{apply_fieldpaths, Digest, Digester, Labels, ALGORITHM};

use crate::error::{ContentError, Result};
use crate::labels::LabelStore;
use crate::traits::{Info, IngestManager, Ingester, Manager, Provider, ReaderAt, Status, Writer};

const DATA_FILE: &str = "data";
const REF_FILE: &str = "ref";
const STARTED_FILE: &str = "startedat";
const TOTAL_FILE: &str = "total";
const EXPECTED_FILE: &str = "expected";

/// Content store backed by a directory.
///
/// Layout:
/// ```text
/// <root>/blobs/blake3/<hex>            committed blobs
/// <root>/ingest/<hash(ref)>/data       partial data of an ingest
/// <root>/ingest/<hash(ref)>/ref        the ingest reference
/// <root>/ingest/<hash(ref)>/startedat  RFC 3339 start time
/// <root>/ingest/<hash(ref)>/total      declared size, if any
/// <root>/ingest/<hash(ref)>/expected   declared digest, if any
/// ```
pub struct LocalStore {
    root: PathBuf,
    labels: Option<Arc<dyn LabelStore>>,
    locks: Arc<Mutex<HashSet<String>>>,
    commit_lock: Arc<Mutex<()>>,
}

impl LocalStore {
    /// Open a store without label support.
    ///
    /// Stores used underneath the metadata store keep labels in the
    /// metadata index and should use this constructor.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::build(root.as_ref(), None)
    }

    /// Open a store that keeps labels in `labels`.
    pub fn with_labels(root: impl AsRef<Path>, labels: Arc<dyn LabelStore>) -> Result<Self> {
        Self::build(root.as_ref(), Some(labels))
    }

    fn build(root: &Path, labels: Option<Arc<dyn LabelStore>>) -> Result<Self> {
        fs::create_dir_all(root.join("ingest"))?;
        fs::create_dir_all(root.join("blobs").join(ALGORITHM))?;
        Ok(Self {
            root: root.to_path_buf(),
            labels,
            locks: Arc::new(Mutex::new(HashSet::new())),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(ALGORITHM).join(digest.encoded())
    }

    fn ingest_root(&self, reference: &str) -> PathBuf {
        self.root
            .join("ingest")
            .join(Digest::from_bytes(reference.as_bytes()).encoded())
    }

    fn lock(&self, reference: &str) -> Result<RefLock> {
        let mut locks = self.locks.lock().expect("lock poisoned");
        if !locks.insert(reference.to_string()) {
            return Err(ContentError::Locked(reference.to_string()));
        }
        Ok(RefLock {
            locks: Arc::clone(&self.locks),
            reference: reference.to_string(),
        })
    }

    fn blob_info(&self, digest: Digest, meta: &fs::Metadata) -> Result<Info> {
        let updated_at = file_time(meta.modified());
        let created_at = meta.created().map(DateTime::<Utc>::from).unwrap_or(updated_at);
        let labels = match &self.labels {
            Some(ls) => ls.get(&digest)?,
            None => Labels::new(),
        };
        Ok(Info {
            digest,
            size: meta.len(),
            created_at,
            updated_at,
            labels,
        })
    }

    fn read_status(&self, dir: &Path) -> Result<Status> {
        let reference = fs::read_to_string(dir.join(REF_FILE))?;
        let data = fs::metadata(dir.join(DATA_FILE))?;
        let started_at = fs::read_to_string(dir.join(STARTED_FILE))
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| file_time(data.modified()));
        let total = read_optional(&dir.join(TOTAL_FILE))?
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let expected = read_optional(&dir.join(EXPECTED_FILE))?
            .and_then(|s| Digest::parse(s.trim()).ok());
        Ok(Status {
            reference,
            offset: data.len(),
            total,
            expected,
            started_at,
            updated_at: file_time(data.modified()),
        })
    }
}

impl Provider for LocalStore {
    fn reader_at(&self, digest: &Digest) -> Result<Box<dyn ReaderAt>> {
        let file = File::open(self.blob_path(digest)).map_err(|e| not_found(e, digest))?;
        let size = file.metadata()?.len();
        Ok(Box::new(LocalReader {
            file: Mutex::new(file),
            size,
        }))
    }
}

impl Ingester for LocalStore {
    fn writer(
        &self,
        reference: &str,
        total: u64,
        expected: Option<Digest>,
    ) -> Result<Box<dyn Writer>> {
        if reference.is_empty() {
            return Err(ContentError::InvalidArgument("ingest ref must not be empty".into()));
        }
        if let Some(expected) = expected {
            if self.blob_path(&expected).exists() {
                return Err(ContentError::AlreadyExists(expected));
            }
        }

        let lock = self.lock(reference)?;
        let dir = self.ingest_root(reference);
        let data_path = dir.join(DATA_FILE);

        let mut digester = Digester::new();
        let (fp, offset, started_at, total, expected) = if data_path.exists() {
            let stored_ref = fs::read_to_string(dir.join(REF_FILE))?;
            if stored_ref != reference {
                return Err(ContentError::InvalidArgument(format!(
                    "ingest directory for {reference:?} belongs to {stored_ref:?}"
                )));
            }
            let status = self.read_status(&dir)?;
            let mut fp = OpenOptions::new().read(true).write(true).open(&data_path)?;
            let offset = hash_existing(&mut fp, &mut digester)?;
            let total = if total > 0 { total } else { status.total };
            debug!(reference, offset, "resuming ingest");
            (fp, offset, status.started_at, total, expected.or(status.expected))
        } else {
            fs::create_dir_all(&dir)?;
            let started_at = Utc::now();
            fs::write(dir.join(REF_FILE), reference)?;
            fs::write(dir.join(STARTED_FILE), started_at.to_rfc3339())?;
            if total > 0 {
                fs::write(dir.join(TOTAL_FILE), total.to_string())?;
            }
            if let Some(expected) = expected {
                fs::write(dir.join(EXPECTED_FILE), expected.to_string())?;
            }
            let fp = OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(&data_path)?;
            (fp, 0, started_at, total, expected)
        };

        Ok(Box::new(LocalWriter {
            fp,
            dir,
            blob_dir: self.root.join("blobs").join(ALGORITHM),
            reference: reference.to_string(),
            digester,
            offset,
            total,
            expected,
            started_at,
            updated_at: Utc::now(),
            labels: self.labels.clone(),
            commit_lock: Arc::clone(&self.commit_lock),
            _lock: lock,
        }))
    }
}

impl Manager for LocalStore {
    fn info(&self, digest: &Digest) -> Result<Info> {
        let meta = fs::metadata(self.blob_path(digest)).map_err(|e| not_found(e, digest))?;
        self.blob_info(*digest, &meta)
    }

    fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info> {
        let Some(ls) = &self.labels else {
            return Err(ContentError::NotSupported(
                "update on a store without a label store".into(),
            ));
        };
        let mut current = self.info(&info.digest)?;
        apply_fieldpaths(&mut current.labels, &info.labels, fieldpaths)?;
        ls.set(&info.digest, current.labels.clone())?;
        current.updated_at = Utc::now();
        Ok(current)
    }

    fn walk(&self, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        let root = self.root.join("blobs").join(ALGORITHM);
        for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| ContentError::Io(io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let digest = match Digest::parse(&format!("{ALGORITHM}:{name}")) {
                Ok(d) => d,
                Err(_) => {
                    debug!(path = %entry.path().display(), "skipping unrecognised blob file");
                    continue;
                }
            };
            let meta = entry.metadata().map_err(|e| ContentError::Io(io::Error::other(e)))?;
            f(&self.blob_info(digest, &meta)?)?;
        }
        Ok(())
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        fs::remove_file(self.blob_path(digest)).map_err(|e| not_found(e, digest))?;
        if let Some(ls) = &self.labels {
            ls.set(digest, Labels::new())?;
        }
        debug!(digest = %digest, "content deleted");
        Ok(())
    }
}

impl IngestManager for LocalStore {
    fn status(&self, reference: &str) -> Result<Status> {
        let dir = self.ingest_root(reference);
        if !dir.join(DATA_FILE).exists() {
            return Err(ContentError::IngestNotFound(reference.to_string()));
        }
        self.read_status(&dir)
    }

    fn list_statuses(&self, prefix: &str) -> Result<Vec<Status>> {
        let mut statuses = Vec::new();
        for entry in fs::read_dir(self.root.join("ingest"))? {
            let dir = entry?.path();
            if !dir.join(DATA_FILE).exists() {
                continue;
            }
            match self.read_status(&dir) {
                Ok(st) if st.reference.starts_with(prefix) => statuses.push(st),
                Ok(_) => {}
                Err(e) => warn!(path = %dir.display(), error = %e, "unreadable ingest"),
            }
        }
        statuses.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(statuses)
    }

    fn abort(&self, reference: &str) -> Result<()> {
        let dir = self.ingest_root(reference);
        fs::remove_dir_all(&dir).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ContentError::IngestNotFound(reference.to_string())
            } else {
                ContentError::Io(e)
            }
        })?;
        debug!(reference, "ingest aborted");
        Ok(())
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("root", &self.root)
            .field("labels", &self.labels.is_some())
            .finish()
    }
}

/// Holds an ingest reference for as long as the writer lives.
struct RefLock {
    locks: Arc<Mutex<HashSet<String>>>,
    reference: String,
}

impl Drop for RefLock {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(&self.reference);
        }
    }
}

struct LocalWriter {
    fp: File,
    dir: PathBuf,
    blob_dir: PathBuf,
    reference: String,
    digester: Digester,
    offset: u64,
    total: u64,
    expected: Option<Digest>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    labels: Option<Arc<dyn LabelStore>>,
    commit_lock: Arc<Mutex<()>>,
    _lock: RefLock,
}

impl Writer for LocalWriter {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.fp.seek(SeekFrom::Start(self.offset))?;
        self.fp.write_all(data)?;
        self.digester.update(data);
        self.offset += data.len() as u64;
        self.updated_at = Utc::now();
        Ok(data.len())
    }

    fn digest(&self) -> Digest {
        self.digester.digest()
    }

    fn status(&self) -> Result<Status> {
        Ok(Status {
            reference: self.reference.clone(),
            offset: self.offset,
            total: self.total,
            expected: self.expected,
            started_at: self.started_at,
            updated_at: self.updated_at,
        })
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if size != 0 {
            return Err(ContentError::InvalidArgument(
                "truncate to a non-zero size is not supported".into(),
            ));
        }
        self.fp.set_len(0)?;
        self.fp.seek(SeekFrom::Start(0))?;
        self.digester.reset();
        self.offset = 0;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn commit(self: Box<Self>, size: u64, expected: Option<Digest>, labels: Labels) -> Result<()> {
        let mut this = *self;
        this.fp.flush()?;
        this.fp.sync_all()?;

        if size > 0 && size != this.offset {
            return Err(ContentError::UnexpectedSize {
                expected: size,
                actual: this.offset,
            });
        }
        let actual = this.digester.digest();
        if let Some(expected) = expected.or(this.expected) {
            if expected != actual {
                return Err(ContentError::DigestMismatch { expected, actual });
            }
        }

        let target = this.blob_dir.join(actual.encoded());
        {
            let _guard = this.commit_lock.lock().expect("lock poisoned");
            if target.exists() {
                remove_ingest(&this.dir);
                return Err(ContentError::AlreadyExists(actual));
            }
            fs::create_dir_all(&this.blob_dir)?;
            fs::rename(this.dir.join(DATA_FILE), &target)?;
        }
        remove_ingest(&this.dir);

        let mut perms = fs::metadata(&target)?.permissions();
        perms.set_readonly(true);
        if let Err(e) = fs::set_permissions(&target, perms) {
            warn!(digest = %actual, error = %e, "failed to mark blob read-only");
        }

        if !labels.is_empty() {
            if let Some(ls) = &this.labels {
                ls.set(&actual, labels)?;
            }
        }
        debug!(reference = %this.reference, digest = %actual, size = this.offset, "content committed");
        Ok(())
    }
}

struct LocalReader {
    file: Mutex<File>,
    size: u64,
}

impl ReaderAt for LocalReader {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let mut file = self.file.lock().expect("lock poisoned");
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

fn hash_existing(fp: &mut File, digester: &mut Digester) -> Result<u64> {
    fp.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = fp.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
        total += n as u64;
    }
    Ok(total)
}

fn remove_ingest(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!(path = %dir.display(), error = %e, "failed to clean up ingest directory");
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn file_time(t: io::Result<std::time::SystemTime>) -> DateTime<Utc> {
    t.map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

fn not_found(e: io::Error, digest: &Digest) -> ContentError {
    if e.kind() == io::ErrorKind::NotFound {
        ContentError::NotFound(*digest)
    } else {
        ContentError::Io(e)
    }
}
