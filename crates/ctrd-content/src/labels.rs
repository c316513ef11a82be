use std::collections::HashMap;
use std::sync::RwLock;

use ctrd_types::{labels::validate_labels, Digest, Labels};

use crate::error::Result;

/// Mutable labels keyed by blob digest.
pub trait LabelStore: Send + Sync {
    /// All labels for the given digest (empty if none).
    fn get(&self, digest: &Digest) -> Result<Labels>;

    /// Replace all labels for the digest.
    fn set(&self, digest: &Digest, labels: Labels) -> Result<()>;

    /// Merge `update` into the digest's labels; an empty value removes the
    /// key. Returns the resulting labels.
    fn update(&self, digest: &Digest, update: &Labels) -> Result<Labels>;
}

/// In-process label store.
#[derive(Debug, Default)]
pub struct MemoryLabelStore {
    labels: RwLock<HashMap<Digest, Labels>>,
}

impl MemoryLabelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LabelStore for MemoryLabelStore {
    fn get(&self, digest: &Digest) -> Result<Labels> {
        let map = self.labels.read().expect("lock poisoned");
        Ok(map.get(digest).cloned().unwrap_or_default())
    }

    fn set(&self, digest: &Digest, labels: Labels) -> Result<()> {
        validate_labels(&labels)?;
        let mut map = self.labels.write().expect("lock poisoned");
        if labels.is_empty() {
            map.remove(digest);
        } else {
            map.insert(*digest, labels);
        }
        Ok(())
    }

    fn update(&self, digest: &Digest, update: &Labels) -> Result<Labels> {
        let mut map = self.labels.write().expect("lock poisoned");
        let current = map.entry(*digest).or_default();
        for (k, v) in update {
            if v.is_empty() {
                current.remove(k);
            } else {
                current.insert(k.clone(), v.clone());
            }
        }
        validate_labels(current)?;
        let result = current.clone();
        if result.is_empty() {
            map.remove(digest);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_update() {
        let ls = MemoryLabelStore::new();
        let d = Digest::from_bytes(b"blob");
        assert!(ls.get(&d).unwrap().is_empty());

        let mut labels = Labels::new();
        labels.insert("a".into(), "1".into());
        ls.set(&d, labels).unwrap();

        let mut update = Labels::new();
        update.insert("a".into(), String::new());
        update.insert("b".into(), "2".into());
        let merged = ls.update(&d, &update).unwrap();
        assert_eq!(merged.get("b").map(String::as_str), Some("2"));
        assert!(!merged.contains_key("a"));
        assert_eq!(ls.get(&d).unwrap(), merged);
    }

    #[test]
    fn set_empty_clears() {
        let ls = MemoryLabelStore::new();
        let d = Digest::from_bytes(b"blob");
        let mut labels = Labels::new();
        labels.insert("k".into(), "v".into());
        ls.set(&d, labels).unwrap();
        ls.set(&d, Labels::new()).unwrap();
        assert!(ls.get(&d).unwrap().is_empty());
    }
}
