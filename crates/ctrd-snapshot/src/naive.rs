//! Copy-based snapshotter.
//!
//! Every active snapshot is a full copy of its parent's tree, so it works on
//! any filesystem at the cost of space and prepare time.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use ctrd_types::Labels;

use crate::error::{Result, SnapshotError};
use crate::storage::{MetaStore, Snapshot};
use crate::traits::Snapshotter;
use crate::types::{Info, Mount, Usage};

/// Snapshotter that copies parent layers into place.
///
/// Layout: `<root>/metadata.json` and `<root>/snapshots/<id>`.
#[derive(Debug)]
pub struct NaiveSnapshotter {
    root: PathBuf,
    ms: MetaStore,
}

impl NaiveSnapshotter {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("snapshots"))?;
        let ms = MetaStore::open(&root)?;
        let sn = Self { root, ms };
        sn.cleanup()?;
        Ok(sn)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_dir(&self, id: u64) -> PathBuf {
        self.root.join("snapshots").join(id.to_string())
    }

    /// Remove snapshot directories no record refers to any more.
    ///
    /// Such directories are left behind when a removal was recorded but the
    /// process stopped before the directory itself was deleted.
    pub fn cleanup(&self) -> Result<usize> {
        let orphans = orphan_dirs(&self.root.join("snapshots"), &self.ms)?;
        for dir in &orphans {
            debug!(path = %dir.display(), "removing orphaned snapshot directory");
            fs::remove_dir_all(dir)?;
        }
        Ok(orphans.len())
    }

    fn create(&self, key: &str, parent: &str, readonly: bool, labels: Labels) -> Result<Vec<Mount>> {
        self.ms.update(|state| {
            let s = state.create_active(key, parent, readonly, labels)?;
            let dir = self.snapshot_dir(s.id);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            fs::create_dir_all(&dir)?;
            // Views read the parent in place.
            if let (false, Some(pid)) = (readonly, s.parent_ids.first()) {
                if let Err(e) = copy_dir(&self.snapshot_dir(*pid), &dir) {
                    let _ = fs::remove_dir_all(&dir);
                    return Err(e);
                }
            }
            debug!(key, parent, id = s.id, readonly, "snapshot created");
            Ok(self.mounts_for(&s))
        })
    }

    fn mounts_for(&self, s: &Snapshot) -> Vec<Mount> {
        let (source, mode) = match (s.readonly, s.parent_ids.first()) {
            (true, Some(pid)) => (self.snapshot_dir(*pid), "ro"),
            (true, None) => (self.snapshot_dir(s.id), "ro"),
            (false, _) => (self.snapshot_dir(s.id), "rw"),
        };
        vec![Mount {
            mount_type: "bind".into(),
            source: source.to_string_lossy().into_owned(),
            options: vec![mode.into(), "rbind".into()],
        }]
    }
}

impl Snapshotter for NaiveSnapshotter {
    fn stat(&self, key: &str) -> Result<Info> {
        self.ms.view(|s| s.info(key))
    }

    fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info> {
        self.ms.update(|s| s.update_info(info, fieldpaths))
    }

    fn usage(&self, key: &str) -> Result<Usage> {
        let id = self.ms.view(|s| s.get(key))?.id;
        dir_usage(&self.snapshot_dir(id))
    }

    fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let s = self.ms.view(|s| s.get_active(key))?;
        Ok(self.mounts_for(&s))
    }

    fn prepare(&self, key: &str, parent: &str, labels: Labels) -> Result<Vec<Mount>> {
        self.create(key, parent, false, labels)
    }

    fn view(&self, key: &str, parent: &str, labels: Labels) -> Result<Vec<Mount>> {
        self.create(key, parent, true, labels)
    }

    fn commit(&self, name: &str, key: &str, labels: Labels) -> Result<()> {
        let id = self.ms.update(|s| s.commit_active(key, name, labels))?;
        debug!(name, key, id, "snapshot committed");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let (id, kind) = self.ms.update(|s| s.remove(key))?;
        if let Err(e) = fs::remove_dir_all(self.snapshot_dir(id)) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(key, id, error = %e, "failed to remove snapshot directory");
            }
        }
        debug!(key, id, %kind, "snapshot removed");
        Ok(())
    }

    fn walk(&self, f: &mut dyn FnMut(&Info) -> Result<()>) -> Result<()> {
        self.ms.view(|s| s.walk(f))
    }
}

/// Numeric directories under `dir` that `ms` no longer knows.
pub(crate) fn orphan_dirs(dir: &Path, ms: &MetaStore) -> Result<Vec<PathBuf>> {
    let mut orphans = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) else {
            continue;
        };
        if !ms.view(|s| Ok(s.contains_id(id)))? {
            orphans.push(entry.path());
        }
    }
    Ok(orphans)
}

/// Sum of regular file sizes and entry count under `dir`, excluding `dir`.
pub(crate) fn dir_usage(dir: &Path) -> Result<Usage> {
    let mut usage = Usage::default();
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(walk_err)?;
        usage.inodes += 1;
        if entry.file_type().is_file() {
            usage.size += entry.metadata().map_err(walk_err)?.len();
        }
    }
    Ok(usage)
}

/// Recursively copy the contents of `src` into the existing directory `dst`.
/// Copy the tree under `src` into `dst`. Directory modes are applied once
/// everything has been copied, so read-only directories can be filled.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(walk_err)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| SnapshotError::Io(io::Error::other(e)))?;
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&target)?;
            dirs.push((target, entry.metadata().map_err(walk_err)?.permissions()));
        } else if ft.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    for (dir, perms) in dirs.into_iter().rev() {
        fs::set_permissions(&dir, perms)?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)?;
    Ok(())
}

fn walk_err(e: walkdir::Error) -> SnapshotError {
    SnapshotError::Io(io::Error::other(e))
}
