//! Filesystem snapshots for ctrd.
//!
//! A snapshot is a filesystem layer. Active snapshots are under
//! construction and can be mounted; committed snapshots are immutable and
//! serve as parents for new active snapshots.
//!
//! # Design Rules
//!
//! 1. Active keys and committed names share a single key space.
//! 2. Only committed snapshots can be parents.
//! 3. A snapshot's kind changes at most once, from active to committed, and
//!    the commit renames it.
//! 4. A snapshot that still has children cannot be removed, so backends
//!    always reclaim layers leaves-first.
//! 5. Lifecycle violations are reported as `FailedPrecondition`.
//!
//! # Backends
//!
//! - [`NaiveSnapshotter`]: full copies of the parent tree, bind mounts
//! - [`OverlaySnapshotter`]: stacked overlay mounts
//!
//! Both keep their bookkeeping in a [`MetaStore`].

pub mod error;
pub mod naive;
pub mod overlay;
pub mod storage;
pub mod traits;
pub mod types;

pub use error::{Result, SnapshotError};
pub use naive::NaiveSnapshotter;
pub use overlay::OverlaySnapshotter;
pub use storage::{MetaStore, Snapshot, Snapshots};
pub use traits::Snapshotter;
pub use types::{Info, Kind, Mount, Usage};
