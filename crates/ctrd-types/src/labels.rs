//! Labels: mutable string metadata attached to content and snapshot records.
//!
//! A few label keys carry meaning for garbage collection: a record that
//! holds a `ctrd.io/gc.ref.*` label keeps the referenced object alive for as
//! long as the record itself is alive.

use std::collections::BTreeMap;

use crate::error::TypeError;

/// Ordered label map. Ordering keeps persisted records deterministic.
pub type Labels = BTreeMap<String, String>;

/// Maximum combined size of a label key and value.
pub const MAX_LABEL_SIZE: usize = 4096;

/// Label prefix whose value is a content digest kept alive by the record.
pub const GC_REF_CONTENT: &str = "ctrd.io/gc.ref.content";

/// Label prefix `ctrd.io/gc.ref.snapshot.<snapshotter>` whose value is a
/// snapshot key (in the same namespace) kept alive by the record.
pub const GC_REF_SNAPSHOT: &str = "ctrd.io/gc.ref.snapshot.";

/// Validate a single label.
pub fn validate_label(key: &str, value: &str) -> Result<(), TypeError> {
    if key.is_empty() {
        return Err(TypeError::InvalidLabel {
            key: key.to_string(),
            reason: "label key must not be empty".into(),
        });
    }
    if key.len() + value.len() > MAX_LABEL_SIZE {
        return Err(TypeError::InvalidLabel {
            key: key.to_string(),
            reason: format!("label key and value exceed {MAX_LABEL_SIZE} bytes"),
        });
    }
    Ok(())
}

/// Validate every label in a map.
pub fn validate_labels(labels: &Labels) -> Result<(), TypeError> {
    labels.iter().try_for_each(|(k, v)| validate_label(k, v))
}

/// Extract the snapshotter name from a `ctrd.io/gc.ref.snapshot.<name>[.<suffix>]` key.
pub fn gc_snapshot_ref(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(GC_REF_SNAPSHOT)?;
    let name = rest.split('.').next()?;
    (!name.is_empty()).then_some(name)
}

/// Returns `true` for `ctrd.io/gc.ref.content` and `ctrd.io/gc.ref.content.<suffix>`.
pub fn is_gc_content_ref(key: &str) -> bool {
    key == GC_REF_CONTENT
        || key
            .strip_prefix(GC_REF_CONTENT)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Apply `update` onto `current` restricted to `fieldpaths`.
///
/// Supported paths are `labels` (replace the whole map) and `labels.<key>`
/// (set that key from `update`, or clear it when absent/empty). An empty
/// path list means "replace all labels".
pub fn apply_fieldpaths(
    current: &mut Labels,
    update: &Labels,
    fieldpaths: &[String],
) -> Result<(), TypeError> {
    if fieldpaths.is_empty() {
        validate_labels(update)?;
        *current = update.clone();
        return Ok(());
    }
    for path in fieldpaths {
        if path == "labels" {
            validate_labels(update)?;
            *current = update.clone();
        } else if let Some(key) = path.strip_prefix("labels.") {
            match update.get(key).filter(|v| !v.is_empty()) {
                Some(value) => {
                    validate_label(key, value)?;
                    current.insert(key.to_string(), value.clone());
                }
                None => {
                    current.remove(key);
                }
            }
        } else {
            return Err(TypeError::InvalidFieldPath(path.clone()));
        }
    }
    Ok(())
}
