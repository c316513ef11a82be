//! Error classes shared across the daemon.
//!
//! Every crate keeps its own error enum, but each variant maps onto one of
//! these classes so callers (and eventually the transport layer) can react
//! to the class without matching on crate-specific variants.

use std::fmt;

/// Coarse classification of an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller supplied a malformed argument.
    InvalidArgument,
    /// The referenced object does not exist.
    NotFound,
    /// The object being created already exists.
    AlreadyExists,
    /// The object exists but is in the wrong state for the operation.
    FailedPrecondition,
    /// A resource is temporarily unavailable (e.g. a locked ingest ref).
    Unavailable,
    /// The operation is not supported by this implementation.
    NotImplemented,
    /// Anything else: I/O, corruption, serialization.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::FailedPrecondition => "failed precondition",
            Self::Unavailable => "unavailable",
            Self::NotImplemented => "not implemented",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Implemented by every error type in the workspace.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    fn is_failed_precondition(&self) -> bool {
        self.kind() == ErrorKind::FailedPrecondition
    }

    fn is_unavailable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    fn is_invalid_argument(&self) -> bool {
        self.kind() == ErrorKind::InvalidArgument
    }
}

impl Classify for std::io::Error {
    fn kind(&self) -> ErrorKind {
        match std::io::Error::kind(self) {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
            _ => ErrorKind::Internal,
        }
    }
}
