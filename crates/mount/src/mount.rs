//! Helpers for interacting with mountpoints
//!
//! Every mount the installer makes is recorded in a ledger so that teardown
//! can undo exactly those mounts, children before parents.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use installer_utils::CommandRunner;

/// Host API filesystems bound into the target, in bind order.
pub const META_FILESYSTEMS: &[&str] = &["/proc", "/sys", "/dev"];

/// Errors from mounting and unmounting.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    /// A mount attempt failed; the target was not recorded.
    #[error("Failed to mount {target}")]
    MountFailed {
        /// The mount point.
        target: Utf8PathBuf,
    },
    /// One or more recorded mounts could not be unmounted.
    #[error("Failed to unmount {}", describe_failures(.failures))]
    UnmountFailed {
        /// Every path which failed, with the reason.
        failures: Vec<(Utf8PathBuf, String)>,
    },
}

fn describe_failures(failures: &[(Utf8PathBuf, String)]) -> String {
    failures
        .iter()
        .map(|(p, e)| format!("{p} ({e})"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// What kind of mount a ledger entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// A filesystem on a block device.
    Filesystem,
    /// A bind of a host directory.
    Bind,
}

/// A path mounted by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// The mount point.
    pub path: Utf8PathBuf,
    /// How it was mounted.
    pub kind: MountKind,
}

/// Mounts filesystems and remembers what it mounted.
///
/// Clones share the same ledger.
#[derive(Debug, Clone)]
pub struct Mounter {
    runner: Arc<dyn CommandRunner>,
    ledger: Arc<Mutex<Vec<LedgerEntry>>>,
}

impl Mounter {
    /// Create a mounter with an empty ledger.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            ledger: Default::default(),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Vec<LedgerEntry>> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, path: &Utf8Path, kind: MountKind) {
        self.ledger().push(LedgerEntry {
            path: path.to_owned(),
            kind,
        });
    }

    /// Mount the filesystem of type `fstype` on `source` at `target`,
    /// creating `target` if needed.
    pub fn mount(&self, source: &Utf8Path, target: &Utf8Path, fstype: &str) -> Result<()> {
        std::fs::create_dir_all(target).with_context(|| format!("Creating {target}"))?;
        self.runner
            .run(&[
                "mount",
                "-t",
                fstype,
                "-o",
                "relatime",
                source.as_str(),
                target.as_str(),
            ])
            .with_context(|| MountError::MountFailed {
                target: target.to_owned(),
            })?;
        tracing::debug!("Mounted {source} at {target}");
        self.record(target, MountKind::Filesystem);
        Ok(())
    }

    /// Bind mount `source` onto `target`, creating `target` if needed.
    pub fn bind(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(target).with_context(|| format!("Creating {target}"))?;
        self.runner
            .run(&["mount", "--bind", source.as_str(), target.as_str()])
            .with_context(|| MountError::MountFailed {
                target: target.to_owned(),
            })?;
        self.record(target, MountKind::Bind);
        Ok(())
    }

    /// Bind the host's API filesystems into `root` so commands can be run
    /// chrooted there.
    #[context("Mounting API filesystems in {root}")]
    pub fn mount_meta_fs(&self, root: &Utf8Path) -> Result<()> {
        for fs in META_FILESYSTEMS {
            let target = root.join(fs.trim_start_matches('/'));
            self.bind(Utf8Path::new(fs), &target)?;
        }
        Ok(())
    }

    /// Everything currently recorded, in mount order.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.ledger().clone()
    }

    /// The recorded filesystem (non-bind) mount points, in mount order.
    pub fn filesystem_mounts(&self) -> Vec<Utf8PathBuf> {
        self.ledger()
            .iter()
            .filter(|e| e.kind == MountKind::Filesystem)
            .map(|e| e.path.clone())
            .collect()
    }

    /// Force-unmount everything recorded, deepest paths first.
    ///
    /// Every entry is attempted even when an earlier one fails, and the
    /// ledger is drained regardless. All failures are returned together.
    pub fn unmount_all(&self) -> Result<(), MountError> {
        let mut paths: Vec<Utf8PathBuf> = self.ledger().drain(..).map(|e| e.path).collect();
        if paths.is_empty() {
            tracing::warn!("unmount_all: nothing was mounted");
            return Ok(());
        }
        // Reverse lexical order puts /a/b before /a.
        paths.sort_by(|a, b| b.as_str().cmp(a.as_str()));
        let mut failures = Vec::new();
        for path in paths {
            tracing::debug!("Unmounting {path}");
            if let Err(e) = self.runner.run(&["umount", "-f", path.as_str()]) {
                tracing::warn!("Failed to unmount {path}: {e:#}");
                failures.push((path, format!("{e:#}")));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MountError::UnmountFailed { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use installer_utils::testing::RecordingRunner;

    use super::*;

    fn setup() -> Result<(tempfile::TempDir, Utf8PathBuf, Arc<RecordingRunner>, Mounter)> {
        let td = tempfile::tempdir()?;
        let root = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        let runner = Arc::new(RecordingRunner::new());
        let mounter = Mounter::new(runner.clone());
        Ok((td, root, runner, mounter))
    }

    #[test]
    fn test_mount_records_and_creates_target() -> Result<()> {
        let (_td, root, runner, mounter) = setup()?;
        let boot = root.join("boot");
        mounter.mount(Utf8Path::new("/dev/sda1"), &boot, "vfat")?;
        assert!(boot.is_dir());
        assert_eq!(
            runner.command_lines(),
            [format!("mount -t vfat -o relatime /dev/sda1 {boot}")]
        );
        assert_eq!(mounter.filesystem_mounts(), [boot]);
        Ok(())
    }

    #[test]
    fn test_failed_mount_not_recorded() -> Result<()> {
        let (_td, root, runner, mounter) = setup()?;
        runner.fail_when(|argv| argv[0] == "mount");
        let err = mounter
            .mount(Utf8Path::new("/dev/sda2"), &root, "ext4")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MountError>(),
            Some(MountError::MountFailed { .. })
        ));
        assert!(mounter.entries().is_empty());
        Ok(())
    }

    #[test]
    fn test_meta_fs_order() -> Result<()> {
        let (_td, root, runner, mounter) = setup()?;
        mounter.mount_meta_fs(&root)?;
        let sources: Vec<String> = runner.calls().into_iter().map(|c| c[2].clone()).collect();
        assert_eq!(sources, ["/proc", "/sys", "/dev"]);
        assert!(mounter.filesystem_mounts().is_empty());
        assert_eq!(mounter.entries().len(), 3);
        assert!(
            mounter
                .entries()
                .iter()
                .all(|e| e.kind == MountKind::Bind)
        );
        Ok(())
    }

    #[test]
    fn test_unmount_deepest_first() -> Result<()> {
        let (_td, root, runner, mounter) = setup()?;
        let x = root.join("x");
        for p in [x.clone(), x.join("boot"), x.join("home")] {
            mounter.mount(Utf8Path::new("/dev/null"), &p, "ext4")?;
        }
        mounter.unmount_all()?;
        let unmounted: Vec<String> = runner
            .calls_to("umount")
            .into_iter()
            .map(|c| c[2].clone())
            .collect();
        assert_eq!(unmounted.len(), 3);
        assert_eq!(unmounted.last().unwrap(), x.as_str());
        assert!(mounter.entries().is_empty());
        Ok(())
    }

    #[test]
    fn test_unmount_attempts_everything() -> Result<()> {
        let (_td, root, runner, mounter) = setup()?;
        for p in ["a", "b", "c"] {
            mounter.mount(Utf8Path::new("/dev/null"), &root.join(p), "ext4")?;
        }
        let bad = root.join("b");
        let bad_str = bad.to_string();
        runner.fail_when(move |argv| argv[0] == "umount" && argv[2] == bad_str);
        let err = mounter.unmount_all().unwrap_err();
        assert_eq!(runner.calls_to("umount").len(), 3);
        match err {
            MountError::UnmountFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, bad);
            }
            o => panic!("unexpected error {o:?}"),
        }
        // Drained even though something failed
        assert!(mounter.entries().is_empty());
        Ok(())
    }

    #[test]
    fn test_unmount_nothing() -> Result<()> {
        let (_td, _root, runner, mounter) = setup()?;
        mounter.unmount_all()?;
        assert!(runner.calls().is_empty());
        Ok(())
    }
}
