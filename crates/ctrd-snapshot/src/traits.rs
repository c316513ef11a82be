use ctrd_types::Labels;

use crate::error::Result;
use crate::types::{Info, Mount, Usage};

/// A filesystem snapshotter.
///
/// Keys of active snapshots and names of committed snapshots share one key
/// space. Only committed snapshots can be parents, so a parent chain is
/// always immutable underneath the active layer on top of it.
pub trait Snapshotter: Send + Sync {
    /// Info for an active key or a committed name.
    fn stat(&self, key: &str) -> Result<Info>;

    /// Update the labels of a snapshot restricted to `fieldpaths`.
    fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info>;

    /// Space used by the snapshot's own layer.
    fn usage(&self, key: &str) -> Result<Usage>;

    /// Mounts for an active snapshot. Committed snapshots are not mountable.
    fn mounts(&self, key: &str) -> Result<Vec<Mount>>;

    /// Create a writable active snapshot on top of the committed `parent`
    /// (empty for none).
    fn prepare(&self, key: &str, parent: &str, labels: Labels) -> Result<Vec<Mount>>;

    /// Like [`prepare`](Self::prepare) but the returned mounts are read-only
    /// and the snapshot can never be committed.
    fn view(&self, key: &str, parent: &str, labels: Labels) -> Result<Vec<Mount>>;

    /// Turn the active snapshot `key` into the committed snapshot `name`.
    fn commit(&self, name: &str, key: &str, labels: Labels) -> Result<()>;

    /// Remove a snapshot in either state. Snapshots with children are refused.
    fn remove(&self, key: &str) -> Result<()>;

    /// Visit every snapshot in key order. Returning an error stops the walk.
    fn walk(&self, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()>;
}
