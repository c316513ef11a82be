use thiserror::Error;

use crate::errdefs::{Classify, ErrorKind};

/// Errors produced by type parsing and validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid digest {value:?}: {reason}")]
    InvalidDigest { value: String, reason: String },

    #[error("invalid namespace {name:?}: {reason}")]
    InvalidNamespace { name: String, reason: String },

    #[error("invalid label {key:?}: {reason}")]
    InvalidLabel { key: String, reason: String },

    #[error("invalid field path {0:?}")]
    InvalidFieldPath(String),
}

impl Classify for TypeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidArgument
    }
}
