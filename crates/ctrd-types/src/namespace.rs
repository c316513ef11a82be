//! Namespace name validation.
//!
//! Valid namespace names:
//! - Must be non-empty and at most 76 characters
//! - Consist of ASCII alphanumeric components
//! - Components are joined by a single `.`, `_` or `-`
//! - Must not start or end with a separator

use crate::error::TypeError;

/// Maximum namespace length in bytes.
pub const MAX_NAMESPACE_LEN: usize = 76;

const SEPARATORS: &[char] = &['.', '_', '-'];

/// Validate a namespace name, returning `Ok(())` if valid.
///
/// ```
/// use ctrd_types::validate_namespace;
///
/// assert!(validate_namespace("default").is_ok());
/// assert!(validate_namespace("k8s.io").is_ok());
/// assert!(validate_namespace("").is_err());
/// assert!(validate_namespace("a..b").is_err());
/// ```
pub fn validate_namespace(name: &str) -> Result<(), TypeError> {
    let invalid = |reason: &str| TypeError::InvalidNamespace {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("namespace must not be empty"));
    }
    if name.len() > MAX_NAMESPACE_LEN {
        return Err(invalid("namespace is longer than 76 characters"));
    }

    let mut prev_sep = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            prev_sep = false;
        } else if SEPARATORS.contains(&ch) {
            if prev_sep {
                return Err(invalid("separators must sit between alphanumeric components"));
            }
            prev_sep = true;
        } else {
            return Err(invalid(&format!("contains forbidden character: {ch:?}")));
        }
    }
    if prev_sep {
        return Err(invalid("must not end with a separator"));
    }
    Ok(())
}
