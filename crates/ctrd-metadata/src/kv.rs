//! Embedded single-writer key/value engine.
//!
//! Readers take a snapshot of the whole map and never block writers or each
//! other. Writers are serialized; a write transaction records its changes
//! over the snapshot it started from and applies them on commit. Dropping a
//! transaction without committing discards it.
//!
//! A file-backed store keeps two files. The checkpoint holds the full map
//! as of the last compaction and is replaced atomically:
//!
//! ```text
//! [4 bytes: magic "CTRD"]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [8 bytes: payload length (little-endian u64)]
//! [N bytes: payload (bincode-serialized map)]
//! ```
//!
//! Every commit appends one record with its changed keys to the log next to
//! it (`<checkpoint>.log`) and syncs it:
//!
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode-serialized key -> value or tombstone)]
//! ```
//!
//! Opening replays the log over the checkpoint. A torn final record is cut
//! off; a damaged record followed by more data fails the open. Once the log
//! outgrows the compaction threshold the map is checkpointed and the log
//! truncated.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, info, warn};

use crate::error::{MetadataError, Result};

const MAGIC: &[u8; 4] = b"CTRD";
const HEADER_SIZE: usize = 16;
const LOG_HEADER_SIZE: usize = 8;

/// Log size that triggers a checkpoint.
pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 4 * 1024 * 1024;

type Map = BTreeMap<String, Vec<u8>>;

/// Changes of one transaction; `None` deletes the key.
type Batch = BTreeMap<String, Option<Vec<u8>>>;

/// Append side of the log. Holding it is what serializes writers.
struct Journal {
    file: Option<File>,
    len: u64,
}

impl Journal {
    fn append(&mut self, batch: &Batch) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let payload = bincode::serialize(batch)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| MetadataError::InvalidArgument("transaction too large".into()))?;
        let mut buf = Vec::with_capacity(LOG_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);

        if let Err(e) = file.write_all(&buf).and_then(|()| file.sync_data()) {
            // Drop the partial record so later appends stay readable.
            let _ = file.set_len(self.len);
            return Err(e.into());
        }
        self.len += buf.len() as u64;
        Ok(())
    }
}

/// The key/value engine.
pub struct KvStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<Map>>,
    writer: Mutex<Journal>,
    compact_after: u64,
}

impl KvStore {
    /// Open (or create) a file-backed store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut map = match fs::read(path) {
            Ok(bytes) => decode_file(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_checkpoint(path, &Map::new())?;
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };

        let log = log_path(path);
        let bytes = match fs::read(&log) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (batches, good) = decode_log(&bytes)?;
        let replayed = batches.len();
        for batch in batches {
            apply(&mut map, batch);
        }
        let file = OpenOptions::new().create(true).append(true).open(&log)?;
        if good < bytes.len() {
            warn!(path = %log.display(), offset = good, dropped = bytes.len() - good, "truncating torn log tail");
            file.set_len(good as u64)?;
            file.sync_all()?;
        }

        debug!(path = %path.display(), keys = map.len(), replayed, "index opened");
        Ok(Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(Arc::new(map)),
            writer: Mutex::new(Journal {
                file: Some(file),
                len: good as u64,
            }),
            compact_after: DEFAULT_COMPACTION_THRESHOLD,
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(Map::new())),
            writer: Mutex::new(Journal { file: None, len: 0 }),
            compact_after: DEFAULT_COMPACTION_THRESHOLD,
        }
    }

    /// Checkpoint once the log grows past `bytes`.
    pub fn with_compaction_threshold(mut self, bytes: u64) -> Self {
        self.compact_after = bytes;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Bytes in the log since the last checkpoint.
    pub fn log_len(&self) -> u64 {
        self.writer.lock().expect("lock poisoned").len
    }

    /// Start a read transaction on the latest committed state.
    pub fn begin_read(&self) -> ReadTx {
        ReadTx {
            map: Arc::clone(&self.current.read().expect("lock poisoned")),
        }
    }

    /// Start a write transaction. Blocks while another write transaction
    /// is open.
    pub fn begin_write(&self) -> WriteTx<'_> {
        let journal = self.writer.lock().expect("lock poisoned");
        let base = Arc::clone(&self.current.read().expect("lock poisoned"));
        WriteTx {
            store: self,
            base,
            pending: Batch::new(),
            journal,
        }
    }

    /// Run `f` in a read transaction.
    pub fn view<T>(&self, f: impl FnOnce(&ReadTx) -> Result<T>) -> Result<T> {
        f(&self.begin_read())
    }

    /// Run `f` in a write transaction, committing if it returns `Ok`.
    pub fn update<T>(&self, f: impl FnOnce(&mut WriteTx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin_write();
        let out = f(&mut tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Write the current map as the checkpoint and empty the log.
    pub fn compact(&self) -> Result<()> {
        let mut journal = self.writer.lock().expect("lock poisoned");
        self.checkpoint(&mut *journal)
    }

    fn checkpoint(&self, journal: &mut Journal) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let map = Arc::clone(&self.current.read().expect("lock poisoned"));
        write_checkpoint(path, &map)?;
        if let Some(file) = journal.file.as_mut() {
            file.set_len(0)?;
            file.sync_all()?;
        }
        info!(path = %path.display(), keys = map.len(), log_bytes = journal.len, "index checkpointed");
        journal.len = 0;
        Ok(())
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("path", &self.path)
            .field("keys", &self.current.read().expect("lock poisoned").len())
            .finish()
    }
}

fn log_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".log");
    PathBuf::from(name)
}

fn write_checkpoint(path: &Path, map: &Map) -> Result<()> {
    let payload = bincode::serialize(map)?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(&payload);

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&buf)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| MetadataError::Io(e.error))?;
    Ok(())
}

fn decode_file(bytes: &[u8]) -> Result<Map> {
    if bytes.len() < HEADER_SIZE {
        return Err(MetadataError::Corrupt("file shorter than header".into()));
    }
    if &bytes[..4] != MAGIC {
        return Err(MetadataError::Corrupt("bad magic".into()));
    }
    let crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[8..16]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    let payload = bytes
        .get(HEADER_SIZE..HEADER_SIZE + len)
        .ok_or_else(|| MetadataError::Corrupt("truncated payload".into()))?;
    if crc32fast::hash(payload) != crc {
        return Err(MetadataError::Corrupt("checksum mismatch".into()));
    }
    Ok(bincode::deserialize(payload)?)
}

/// Decode log records front to back. Returns the batches and the length of
/// the intact prefix.
fn decode_log(bytes: &[u8]) -> Result<(Vec<Batch>, usize)> {
    let mut batches = Vec::new();
    let mut offset = 0;
    while let Some(header) = bytes.get(offset..offset + LOG_HEADER_SIZE) {
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let end = offset + LOG_HEADER_SIZE + len;
        let Some(payload) = bytes.get(offset + LOG_HEADER_SIZE..end).filter(|_| len > 0) else {
            break;
        };
        if crc32fast::hash(payload) != crc {
            if end == bytes.len() {
                break;
            }
            return Err(MetadataError::Corrupt(format!(
                "checksum mismatch in log record at offset {offset}"
            )));
        }
        batches.push(bincode::deserialize(payload)?);
        offset = end;
    }
    Ok((batches, offset))
}

fn apply(map: &mut Map, batch: Batch) {
    for (key, value) in batch {
        match value {
            Some(v) => {
                map.insert(key, v);
            }
            None => {
                map.remove(&key);
            }
        }
    }
}

/// Point-in-time view of the store. Unaffected by later commits.
#[derive(Clone, Debug)]
pub struct ReadTx {
    map: Arc<Map>,
}

impl ReadTx {
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.map.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn scan<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a [u8])> + 'a {
        scan(&self.map, prefix)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// An open write transaction.
pub struct WriteTx<'a> {
    store: &'a KvStore,
    base: Arc<Map>,
    pending: Batch,
    journal: MutexGuard<'a, Journal>,
}

impl<'a> WriteTx<'a> {
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        match self.pending.get(key) {
            Some(value) => value.as_deref(),
            None => self.base.get(key).map(Vec::as_slice),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Entries whose key starts with `prefix`, this transaction's writes
    /// included, in key order.
    pub fn scan<'b>(&'b self, prefix: &'b str) -> impl Iterator<Item = (&'b str, &'b [u8])> + 'b {
        let mut merged: BTreeMap<&'b str, &'b [u8]> = scan(&self.base, prefix).collect();
        let pending = self
            .pending
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix));
        for (key, value) in pending {
            match value {
                Some(v) => {
                    merged.insert(key.as_str(), v.as_slice());
                }
                None => {
                    merged.remove(key.as_str());
                }
            }
        }
        merged.into_iter()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.pending.insert(key.into(), Some(value));
    }

    /// Returns `true` if the key existed.
    pub fn delete(&mut self, key: &str) -> bool {
        let existed = self.contains(key);
        if existed {
            self.pending.insert(key.to_string(), None);
        }
        existed
    }

    /// Delete every key starting with `prefix`. Returns how many were removed.
    pub fn delete_prefix(&mut self, prefix: &str) -> usize {
        let keys: Vec<String> = self.scan(prefix).map(|(k, _)| k.to_string()).collect();
        for k in &keys {
            self.pending.insert(k.clone(), None);
        }
        keys.len()
    }

    /// Persist and publish the transaction.
    pub fn commit(self) -> Result<()> {
        let WriteTx {
            store,
            base,
            pending,
            mut journal,
        } = self;
        if pending.is_empty() {
            return Ok(());
        }
        drop(base);
        journal.append(&pending)?;

        let changed = pending.len();
        let keys = {
            let mut current = store.current.write().expect("lock poisoned");
            let map = Arc::make_mut(&mut *current);
            apply(map, pending);
            map.len()
        };
        debug!(keys, changed, log_bytes = journal.len, "index transaction committed");

        // The commit is durable in the log; a failed checkpoint is retried
        // on the next commit.
        if store.path.is_some() && journal.len >= store.compact_after {
            if let Err(e) = store.checkpoint(&mut *journal) {
                warn!(error = %e, "index checkpoint failed");
            }
        }
        Ok(())
    }
}

fn scan<'a>(map: &'a Map, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a [u8])> + 'a {
    map.range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.as_str(), v.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctrd_types::Classify;
    use tempfile::TempDir;

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    #[test]
    fn committed_writes_are_visible() {
        let kv = KvStore::in_memory();
        kv.update(|tx| {
            tx.put("a/1", b"one".to_vec());
            tx.put("a/2", b"two".to_vec());
            tx.put("b/1", b"three".to_vec());
            Ok(())
        })
        .unwrap();
        let r = kv.begin_read();
        assert_eq!(r.get("a/1"), Some(&b"one"[..]));
        let keys: Vec<&str> = r.scan("a/").map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let kv = KvStore::in_memory();
        {
            let mut tx = kv.begin_write();
            tx.put("k", b"v".to_vec());
        }
        assert!(!kv.begin_read().contains("k"));

        let err = kv
            .update(|tx| {
                tx.put("k", b"v".to_vec());
                Err::<(), _>(MetadataError::InvalidArgument("abort".into()))
            })
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(!kv.begin_read().contains("k"));
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let kv = KvStore::in_memory();
        kv.update(|tx| {
            tx.put("k", b"old".to_vec());
            Ok(())
        })
        .unwrap();
        let before = kv.begin_read();
        kv.update(|tx| {
            tx.put("k", b"new".to_vec());
            tx.put("k2", b"x".to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(before.get("k"), Some(&b"old"[..]));
        assert!(!before.contains("k2"));
        assert_eq!(kv.begin_read().get("k"), Some(&b"new"[..]));
    }

    #[test]
    fn delete_prefix_removes_matching_keys() {
        let kv = KvStore::in_memory();
        kv.update(|tx| {
            for k in ["ns/a", "ns/b", "nsx/c"] {
                tx.put(k, Vec::new());
            }
            assert_eq!(tx.delete_prefix("ns/"), 2);
            Ok(())
        })
        .unwrap();
        assert_eq!(kv.begin_read().len(), 1);
    }

    #[test]
    fn transaction_sees_its_own_writes() {
        let kv = KvStore::in_memory();
        kv.update(|tx| {
            tx.put("a/1", b"one".to_vec());
            tx.put("a/2", b"two".to_vec());
            Ok(())
        })
        .unwrap();
        kv.update(|tx| {
            tx.put("a/3", b"three".to_vec());
            assert!(tx.delete("a/1"));
            assert!(!tx.delete("a/9"));
            tx.put("a/2", b"TWO".to_vec());
            let seen: Vec<(&str, &[u8])> = tx.scan("a/").collect();
            assert_eq!(seen, vec![("a/2", &b"TWO"[..]), ("a/3", &b"three"[..])]);
            assert_eq!(tx.get("a/1"), None);
            Ok(())
        })
        .unwrap();
        let r = kv.begin_read();
        assert_eq!(r.len(), 2);
        assert_eq!(r.get("a/2"), Some(&b"TWO"[..]));
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    #[test]
    fn reopen_restores_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.db");
        {
            let kv = KvStore::open(&path).unwrap();
            kv.update(|tx| {
                tx.put("k", b"persisted".to_vec());
                Ok(())
            })
            .unwrap();
        }
        let kv = KvStore::open(&path).unwrap();
        assert_eq!(kv.begin_read().get("k"), Some(&b"persisted"[..]));
    }

    #[test]
    fn corrupt_file_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.db");
        {
            let kv = KvStore::open(&path).unwrap();
            kv.update(|tx| {
                tx.put("k", b"value".to_vec());
                Ok(())
            })
            .unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(KvStore::open(&path), Err(MetadataError::Corrupt(_))));

        fs::write(&path, b"nope").unwrap();
        assert!(matches!(KvStore::open(&path), Err(MetadataError::Corrupt(_))));
    }

    #[test]
    fn commits_append_to_the_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.db");
        let kv = KvStore::open(&path).unwrap();
        let checkpoint = fs::read(&path).unwrap();
        for i in 0..50u8 {
            kv.update(|tx| {
                tx.put(format!("k/{i:02}"), vec![i; 16]);
                if i % 10 == 9 {
                    tx.delete(&format!("k/{:02}", i - 1));
                }
                Ok(())
            })
            .unwrap();
        }
        let before = kv.log_len();
        kv.update(|_| Ok(())).unwrap();
        assert_eq!(kv.log_len(), before);

        // Only the log grew.
        assert_eq!(fs::read(&path).unwrap(), checkpoint);
        assert_eq!(fs::metadata(log_path(&path)).unwrap().len(), before);
        drop(kv);

        let kv = KvStore::open(&path).unwrap();
        let r = kv.begin_read();
        assert_eq!(r.len(), 45);
        assert_eq!(r.get("k/49"), Some(&[49u8; 16][..]));
        assert!(!r.contains("k/48"));
    }

    #[test]
    fn log_is_checkpointed_past_the_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.db");
        let kv = KvStore::open(&path).unwrap().with_compaction_threshold(512);
        for i in 0..40u8 {
            kv.update(|tx| {
                tx.put(format!("k/{i:02}"), vec![i; 32]);
                Ok(())
            })
            .unwrap();
            assert!(kv.log_len() < 512);
        }
        assert!(!decode_file(&fs::read(&path).unwrap()).unwrap().is_empty());
        drop(kv);

        let kv = KvStore::open(&path).unwrap();
        assert_eq!(kv.begin_read().len(), 40);
        kv.compact().unwrap();
        assert_eq!(kv.log_len(), 0);
        assert_eq!(fs::metadata(log_path(&path)).unwrap().len(), 0);
        assert_eq!(decode_file(&fs::read(&path).unwrap()).unwrap().len(), 40);
    }

    #[test]
    fn torn_log_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.db");
        {
            let kv = KvStore::open(&path).unwrap();
            for k in ["first", "second"] {
                kv.update(|tx| {
                    tx.put(k, b"v".to_vec());
                    Ok(())
                })
                .unwrap();
            }
        }
        let log = log_path(&path);
        let len = fs::metadata(&log).unwrap().len();
        OpenOptions::new().write(true).open(&log).unwrap().set_len(len - 3).unwrap();

        let kv = KvStore::open(&path).unwrap();
        assert!(kv.begin_read().contains("first"));
        assert!(!kv.begin_read().contains("second"));
        kv.update(|tx| {
            tx.put("third", b"v".to_vec());
            Ok(())
        })
        .unwrap();
        drop(kv);

        let kv = KvStore::open(&path).unwrap();
        let r = kv.begin_read();
        assert!(r.contains("first"));
        assert!(r.contains("third"));
        assert!(!r.contains("second"));
    }

    #[test]
    fn damaged_log_record_refuses_to_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.db");
        {
            let kv = KvStore::open(&path).unwrap();
            for k in ["first", "second"] {
                kv.update(|tx| {
                    tx.put(k, b"v".to_vec());
                    Ok(())
                })
                .unwrap();
            }
        }
        let log = log_path(&path);
        let mut bytes = fs::read(&log).unwrap();
        bytes[LOG_HEADER_SIZE] ^= 0xff;
        fs::write(&log, &bytes).unwrap();
        assert!(matches!(KvStore::open(&path), Err(MetadataError::Corrupt(_))));
    }

    #[test]
    fn concurrent_writers_serialize() {
        use std::thread;

        let kv = Arc::new(KvStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let kv = Arc::clone(&kv);
                thread::spawn(move || {
                    for _ in 0..25 {
                        kv.update(|tx| {
                            let n = tx
                                .get("counter")
                                .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
                                .unwrap_or(0);
                            tx.put("counter", (n + 1).to_le_bytes().to_vec());
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let r = kv.begin_read();
        let n = u64::from_le_bytes(r.get("counter").unwrap().try_into().unwrap());
        assert_eq!(n, 200);
    }
}
