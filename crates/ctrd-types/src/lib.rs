//! Foundation types shared by every ctrd crate.
//!
//! # Key Types
//!
//! - [`Digest`]: algorithm-prefixed content hash identifying a blob
//! - [`Digester`]: incremental hasher producing a [`Digest`]
//! - [`Labels`]: mutable key/value metadata attached to records
//! - [`ErrorKind`] / [`Classify`]: the error classes callers branch on
//!
//! Namespace and label validation live in [`namespace`] and [`labels`].

pub mod digest;
pub mod errdefs;
pub mod error;
pub mod labels;
pub mod namespace;

pub use digest::{Digest, Digester, ALGORITHM};
pub use errdefs::{Classify, ErrorKind};
pub use error::TypeError;
pub use labels::{apply_fieldpaths, validate_labels, Labels};
pub use namespace::validate_namespace;
