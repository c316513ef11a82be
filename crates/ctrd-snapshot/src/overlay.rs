//! Overlay filesystem snapshotter.
//!
//! Layers are stacked with overlayfs instead of being copied, so prepare is
//! constant-time. Only the mount descriptions are produced here; performing
//! the mounts is left to the caller.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use ctrd_types::Labels;

use crate::error::Result;
use crate::naive::{dir_usage, orphan_dirs};
use crate::storage::{MetaStore, Snapshot};
use crate::traits::Snapshotter;
use crate::types::{Info, Mount, Usage};

/// Snapshotter that produces overlay mounts.
///
/// Layout: `<root>/metadata.json` and `<root>/snapshots/<id>/{fs,work}`.
#[derive(Debug)]
pub struct OverlaySnapshotter {
    root: PathBuf,
    ms: MetaStore,
}

impl OverlaySnapshotter {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("snapshots"))?;
        let ms = MetaStore::open(&root)?;
        let orphans = orphan_dirs(&root.join("snapshots"), &ms)?;
        for dir in orphans {
            debug!(path = %dir.display(), "removing orphaned snapshot directory");
            fs::remove_dir_all(dir)?;
        }
        Ok(Self { root, ms })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_dir(&self, id: u64) -> PathBuf {
        self.root.join("snapshots").join(id.to_string())
    }

    fn upper_path(&self, id: u64) -> PathBuf {
        self.snapshot_dir(id).join("fs")
    }

    fn work_path(&self, id: u64) -> PathBuf {
        self.snapshot_dir(id).join("work")
    }

    fn create(&self, key: &str, parent: &str, readonly: bool, labels: Labels) -> Result<Vec<Mount>> {
        self.ms.update(|state| {
            let s = state.create_active(key, parent, readonly, labels)?;
            let dir = self.snapshot_dir(s.id);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            fs::create_dir_all(self.upper_path(s.id))?;
            if !readonly {
                fs::create_dir_all(self.work_path(s.id))?;
            }
            debug!(key, parent, id = s.id, readonly, "snapshot created");
            Ok(self.mounts_for(&s))
        })
    }

    fn mounts_for(&self, s: &Snapshot) -> Vec<Mount> {
        let path = |p: PathBuf| p.to_string_lossy().into_owned();

        if s.parent_ids.is_empty() {
            let mode = if s.readonly { "ro" } else { "rw" };
            return vec![Mount {
                mount_type: "bind".into(),
                source: path(self.upper_path(s.id)),
                options: vec![mode.into(), "rbind".into()],
            }];
        }

        if s.readonly && s.parent_ids.len() == 1 {
            return vec![Mount {
                mount_type: "bind".into(),
                source: path(self.upper_path(s.parent_ids[0])),
                options: vec!["ro".into(), "rbind".into()],
            }];
        }

        let lower = s
            .parent_ids
            .iter()
            .map(|id| path(self.upper_path(*id)))
            .collect::<Vec<_>>()
            .join(":");
        let mut options = Vec::new();
        if s.readonly {
            options.push("ro".to_string());
        } else {
            options.push(format!("workdir={}", path(self.work_path(s.id))));
            options.push(format!("upperdir={}", path(self.upper_path(s.id))));
        }
        options.push(format!("lowerdir={lower}"));
        vec![Mount {
            mount_type: "overlay".into(),
            source: "overlay".into(),
            options,
        }]
    }
}

impl Snapshotter for OverlaySnapshotter {
    fn stat(&self, key: &str) -> Result<Info> {
        self.ms.view(|s| s.info(key))
    }

    fn update(&self, info: Info, fieldpaths: &[String]) -> Result<Info> {
        self.ms.update(|s| s.update_info(info, fieldpaths))
    }

    fn usage(&self, key: &str) -> Result<Usage> {
        let id = self.ms.view(|s| s.get(key))?.id;
        dir_usage(&self.upper_path(id))
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
        // The work dir is only needed while the layer is mounted writable.
        if let Err(e) = fs::remove_dir_all(self.work_path(id)) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(name, id, error = %e, "failed to remove work directory");
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use ctrd_types::Classify;
    use tempfile::TempDir;

    fn snapshotter() -> (TempDir, OverlaySnapshotter) {
        let dir = TempDir::new().unwrap();
        let sn = OverlaySnapshotter::open(dir.path()).unwrap();
        (dir, sn)
    }

    fn commit_layer(sn: &OverlaySnapshotter, name: &str, parent: &str) {
        let key = format!("{name}-active");
        sn.prepare(&key, parent, Labels::new()).unwrap();
        sn.commit(name, &key, Labels::new()).unwrap();
    }

    fn option<'a>(m: &'a Mount, prefix: &str) -> Option<&'a str> {
        m.options.iter().find_map(|o| o.strip_prefix(prefix))
    }

    #[test]
    fn root_layer_is_bind_mount() {
        let (_dir, sn) = snapshotter();
        let mounts = sn.prepare("k", "", Labels::new()).unwrap();
        assert_eq!(mounts[0].mount_type, "bind");
        assert_eq!(mounts[0].options, vec!["rw", "rbind"]);
        assert!(Path::new(&mounts[0].source).ends_with("fs"));
    }

    #[test]
    fn child_layer_stacks_parents_nearest_first() {
        let (_dir, sn) = snapshotter();
        commit_layer(&sn, "base", "");
        commit_layer(&sn, "mid", "base");
        let mounts = sn.prepare("top", "mid", Labels::new()).unwrap();
        let m = &mounts[0];
        assert_eq!(m.mount_type, "overlay");
        assert!(option(m, "upperdir=").is_some());
        assert!(option(m, "workdir=").is_some());
        let lower: Vec<&str> = option(m, "lowerdir=").unwrap().split(':').collect();
        assert_eq!(lower.len(), 2);
        assert!(lower[0].ends_with("snapshots/2/fs"));
        assert!(lower[1].ends_with("snapshots/1/fs"));
    }

    #[test]
    fn views_are_read_only() {
        let (_dir, sn) = snapshotter();
        commit_layer(&sn, "base", "");
        let single = sn.view("v1", "base", Labels::new()).unwrap();
        assert_eq!(single[0].mount_type, "bind");
        assert!(single[0].is_readonly());

        commit_layer(&sn, "mid", "base");
        let multi = sn.view("v2", "mid", Labels::new()).unwrap();
        assert_eq!(multi[0].mount_type, "overlay");
        assert!(multi[0].is_readonly());
        assert!(option(&multi[0], "upperdir=").is_none());
        assert!(option(&multi[0], "lowerdir=").is_some());
    }

    #[test]
    fn commit_drops_work_dir_and_remove_drops_layer() {
        let (dir, sn) = snapshotter();
        sn.prepare("k", "", Labels::new()).unwrap();
        let work = dir.path().join("snapshots/1/work");
        assert!(work.exists());
        sn.commit("n", "k", Labels::new()).unwrap();
        assert!(!work.exists());
        assert!(sn.mounts("n").unwrap_err().is_failed_precondition());
        sn.remove("n").unwrap();
        assert!(!dir.path().join("snapshots/1").exists());
    }
}
