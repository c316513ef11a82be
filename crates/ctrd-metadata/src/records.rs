//! Index layout and record encoding.
//!
//! ```text
//! v1/version                             schema version (u32)
//! v1/seq/snapshot                        backend key sequence (u64)
//! v1/namespaces/<ns>                     NamespaceRecord
//! v1/ns/<ns>/content/blob/<digest>       BlobRecord
//! v1/ns/<ns>/snapshot/<snapshotter>/<key> SnapshotRecord
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use ctrd_snapshot::Kind;
use ctrd_types::{Digest, Labels};

use crate::error::Result;
use crate::kv::{ReadTx, WriteTx};

/// Version of the index layout this crate reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

pub(crate) mod keys {
    use ctrd_types::Digest;

    pub const VERSION: &str = "v1/version";
    pub const SNAPSHOT_SEQ: &str = "v1/seq/snapshot";
    pub const NAMESPACES: &str = "v1/namespaces/";
    pub const DATA: &str = "v1/ns/";

    pub fn namespace(ns: &str) -> String {
        format!("{NAMESPACES}{ns}")
    }

    /// Prefix of everything stored inside a namespace.
    pub fn namespace_data(ns: &str) -> String {
        format!("{DATA}{ns}/")
    }

    pub fn blobs(ns: &str) -> String {
        format!("{DATA}{ns}/content/blob/")
    }

    pub fn blob(ns: &str, digest: &Digest) -> String {
        format!("{}{digest}", blobs(ns))
    }

    pub fn snapshots(ns: &str, snapshotter: &str) -> String {
        format!("{DATA}{ns}/snapshot/{snapshotter}/")
    }

    pub fn snapshot(ns: &str, snapshotter: &str, key: &str) -> String {
        format!("{}{key}", snapshots(ns, snapshotter))
    }

    /// What a data key refers to.
    #[derive(Debug, PartialEq, Eq)]
    pub enum DataKey<'a> {
        Blob { ns: &'a str, digest: &'a str },
        Snapshot { ns: &'a str, snapshotter: &'a str, key: &'a str },
    }

    pub fn parse(key: &str) -> Option<DataKey<'_>> {
        let (ns, rest) = key.strip_prefix(DATA)?.split_once('/')?;
        if let Some(digest) = rest.strip_prefix("content/blob/") {
            return Some(DataKey::Blob { ns, digest });
        }
        let (snapshotter, key) = rest.strip_prefix("snapshot/")?.split_once('/')?;
        Some(DataKey::Snapshot { ns, snapshotter, key })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct NamespaceRecord {
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BlobRecord {
    pub size: u64,
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SnapshotRecord {
    /// Key of the snapshot in the backend snapshotter.
    pub backend_key: String,
    pub kind: Kind,
    /// Name of the parent in this namespace, empty for none.
    pub parent: String,
    pub labels: Labels,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Read and decode a record from a read transaction.
pub(crate) fn read<T: DeserializeOwned>(tx: &ReadTx, key: &str) -> Result<Option<T>> {
    tx.get(key).map(decode).transpose()
}

/// Read and decode a record from a write transaction.
pub(crate) fn read_mut<T: DeserializeOwned>(tx: &WriteTx<'_>, key: &str) -> Result<Option<T>> {
    tx.get(key).map(decode).transpose()
}

pub(crate) fn write<T: Serialize>(tx: &mut WriteTx<'_>, key: impl Into<String>, value: &T) -> Result<()> {
    tx.put(key, encode(value)?);
    Ok(())
}

/// Allocate the next backend key sequence number.
pub(crate) fn next_snapshot_seq(tx: &mut WriteTx<'_>) -> Result<u64> {
    let next = read_mut::<u64>(tx, keys::SNAPSHOT_SEQ)?.unwrap_or(0) + 1;
    write(tx, keys::SNAPSHOT_SEQ, &next)?;
    Ok(next)
}

/// Parse the digest part of a blob key.
pub(crate) fn parse_digest(s: &str) -> Option<Digest> {
    Digest::parse(s).ok()
}

#[cfg(test)]
mod tests {
    use super::keys::*;
    use super::*;

    #[test]
    fn data_keys_round_trip_through_parse() {
        let d = Digest::from_bytes(b"x");
        let blob = blob("default", &d);
        let digest = d.to_string();
        assert_eq!(
            parse(&blob),
            Some(DataKey::Blob { ns: "default", digest: &digest })
        );
        assert_eq!(
            parse(&snapshot("k8s.io", "naive", "layers/one")),
            Some(DataKey::Snapshot { ns: "k8s.io", snapshotter: "naive", key: "layers/one" })
        );
        assert_eq!(parse(&namespace("default")), None);
        assert_eq!(parse("v1/ns/default/unknown/x"), None);
    }

    #[test]
    fn namespace_prefixes_do_not_overlap() {
        assert!(!blob("ab", &Digest::from_bytes(b"x")).starts_with(&namespace_data("a")));
    }

    #[test]
    fn snapshot_record_encodes() {
        let now = Utc::now();
        let rec = SnapshotRecord {
            backend_key: "default/1/k".into(),
            kind: Kind::Committed,
            parent: String::new(),
            labels: Labels::new(),
            created: now,
            updated: now,
        };
        let back: SnapshotRecord = decode(&encode(&rec).unwrap()).unwrap();
        assert_eq!(back, rec);
    }
}
