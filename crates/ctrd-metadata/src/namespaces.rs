use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use ctrd_events::Event;
use ctrd_types::labels::validate_label;
use ctrd_types::{validate_labels, validate_namespace, Labels};

use crate::db::{Txn, DB};
use crate::error::{MetadataError, Result};
use crate::records::{self, keys, NamespaceRecord};

/// Namespace management on top of the index.
///
/// Namespaces are also created implicitly by the first record written into
/// them.
#[derive(Debug, Clone)]
pub struct NamespaceStore {
    db: Arc<DB>,
}

impl NamespaceStore {
    pub(crate) fn new(db: Arc<DB>) -> Self {
        Self { db }
    }

    pub fn create(&self, name: &str, labels: Labels) -> Result<()> {
        validate_namespace(name)?;
        validate_labels(&labels)?;
        self.db.update(|txn| {
            let key = keys::namespace(name);
            if txn.contains(&key) {
                return Err(MetadataError::AlreadyExists(format!("namespace {name}")));
            }
            let now = Utc::now();
            let rec = NamespaceRecord {
                labels: labels.clone(),
                created_at: now,
                updated_at: now,
            };
            records::write(txn, key, &rec)?;
            txn.publish(name, Event::NamespaceCreate { name: name.to_string(), labels });
            Ok(())
        })
    }

    pub fn labels(&self, name: &str) -> Result<Labels> {
        let tx = self.db.begin_read();
        records::read::<NamespaceRecord>(&tx, &keys::namespace(name))?
            .map(|rec| rec.labels)
            .ok_or_else(|| MetadataError::NamespaceNotFound(name.to_string()))
    }

    /// Set one label; an empty value removes it.
    pub fn set_label(&self, name: &str, key: &str, value: &str) -> Result<()> {
        if !value.is_empty() {
            validate_label(key, value)?;
        }
        self.db.update(|txn| {
            let nk = keys::namespace(name);
            let mut rec: NamespaceRecord = records::read_mut(txn, &nk)?
                .ok_or_else(|| MetadataError::NamespaceNotFound(name.to_string()))?;
            let before = rec.labels.clone();
            if value.is_empty() {
                rec.labels.remove(key);
            } else {
                rec.labels.insert(key.to_string(), value.to_string());
            }
            txn.release_gc_refs(&before, &rec.labels);
            rec.updated_at = Utc::now();
            let labels = rec.labels.clone();
            records::write(txn, nk, &rec)?;
            txn.publish(name, Event::NamespaceUpdate { name: name.to_string(), labels });
            Ok(())
        })
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let tx = self.db.begin_read();
        Ok(tx
            .scan(keys::NAMESPACES)
            .map(|(k, _)| k[keys::NAMESPACES.len()..].to_string())
            .collect())
    }

    /// Delete an empty namespace.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.db.update(|txn| {
            if !txn.delete(&keys::namespace(name)) {
                return Err(MetadataError::NamespaceNotFound(name.to_string()));
            }
            let prefix = keys::namespace_data(name);
            let mut held = Vec::new();
            for (key, _) in txn.scan(&prefix) {
                let kind = match keys::parse(key) {
                    Some(keys::DataKey::Blob { .. }) => "content",
                    _ => "snapshots",
                };
                if !held.contains(&kind) {
                    held.push(kind);
                }
            }
            if !held.is_empty() {
                return Err(MetadataError::FailedPrecondition(format!(
                    "namespace {name} must be empty, but it still has {}",
                    held.join(", ")
                )));
            }
            txn.publish(name, Event::NamespaceDelete { name: name.to_string() });
            debug!(namespace = name, "namespace deleted");
            Ok(())
        })
    }
}

/// Create the namespace record if it does not exist yet.
pub(crate) fn ensure_namespace(txn: &mut Txn<'_>, name: &str) -> Result<()> {
    let key = keys::namespace(name);
    if txn.contains(&key) {
        return Ok(());
    }
    let now = Utc::now();
    let rec = NamespaceRecord {
        labels: Labels::new(),
        created_at: now,
        updated_at: now,
    };
    records::write(txn, key, &rec)?;
    txn.publish(name, Event::NamespaceCreate { name: name.to_string(), labels: Labels::new() });
    Ok(())
}
