//! Mount operations module.
//!
//! This module handles mounting devices into per-device directories under a
//! base directory and unmounting them again, delegating the actual work to
//! the OS `mount`/`umount` utilities.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::stat::stat;
use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::error::{Error, IoResultExt, MountPointInspectSnafu, Result};
use crate::executor::CommandRunner;
use crate::fstype::FilesystemDetector;

/// Substring of `umount` output meaning the target was not mounted.
const NOT_MOUNTED_MARKER: &str = "not mounted";

/// Creates a mount point directory if it doesn't exist.
pub fn create_mount_point(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).mount_point_context(path)?;
    }
    Ok(())
}

/// Returns true if `path` is the root of a mounted filesystem.
///
/// A directory is a mount point when it lives on a different device than its
/// parent, or when it is its own parent (`/`).
pub fn is_mount_point(path: &Path) -> Result<bool> {
    let own = match stat(path) {
        Ok(s) => s,
        Err(nix::Error::ENOENT) => return Ok(false),
        Err(e) => return Err(e).context(MountPointInspectSnafu { path }),
    };
    let parent = path.join("..");
    let up = stat(parent.as_path()).context(MountPointInspectSnafu { path: parent })?;

    Ok(own.st_dev != up.st_dev || own.st_ino == up.st_ino)
}

/// Returns true if `umount` output says the target was not mounted.
fn is_not_mounted_error(output: &str) -> bool {
    output.contains(NOT_MOUNTED_MARKER)
}

/// Runs `mount`/`umount` for the device lifecycle orchestrator.
pub struct MountExecutor {
    runner: Arc<dyn CommandRunner>,
    detector: FilesystemDetector,
    base_dir: PathBuf,
    remove_mountdirs: bool,
}

impl MountExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        detector: FilesystemDetector,
        base_dir: impl Into<PathBuf>,
        remove_mountdirs: bool,
    ) -> Self {
        Self {
            runner,
            detector,
            base_dir: base_dir.into(),
            remove_mountdirs,
        }
    }

    /// Mount path layout: `<base_dir>/<device_name>`.
    pub fn mount_path(&self, device_name: &str) -> PathBuf {
        self.base_dir.join(device_name)
    }

    /// Returns the override filesystem type for `device`, if any.
    pub fn resolve_override(&self, device: &Path) -> Option<String> {
        self.detector.resolve_override(device)
    }

    /// Mounts `device` at `mount_point`, creating the directory on demand.
    ///
    /// Succeeds without running `mount` if `mount_point` is already mounted.
    pub fn mount(&self, device: &Path, mount_point: &Path, fs_type: Option<&str>) -> Result<()> {
        debug!(device = %device.display(), mount_point = %mount_point.display(), "mounting");
        create_mount_point(mount_point)?;

        if is_mount_point(mount_point)? {
            info!(mount_point = %mount_point.display(), "mount path is already mounted");
            return Ok(());
        }

        let device_arg = absolute(device);
        let mount_arg = absolute(mount_point);
        let mut args: Vec<&str> = Vec::new();
        if let Some(fs_type) = fs_type {
            args.extend(["-t", fs_type]);
        }
        args.push(&device_arg);
        args.push(&mount_arg);

        let out = self.runner.run("mount", &args);
        if !out.success() {
            return Err(Error::Mount {
                device: device_arg,
                mount_point: mount_point.to_path_buf(),
                output: out.output,
            });
        }

        info!(device = %device.display(), mount_point = %mount_point.display(), "mounted");
        Ok(())
    }

    /// Unmounts `mount_point`. A target that is not mounted counts as success.
    ///
    /// When configured, the emptied directory is removed afterwards; failing
    /// to remove it is only logged.
    pub fn unmount(&self, mount_point: &Path) -> Result<()> {
        debug!(mount_point = %mount_point.display(), "unmounting");
        let mount_arg = absolute(mount_point);

        let out = self.runner.run("umount", &[mount_arg.as_str()]);
        if out.success() {
            info!(mount_point = %mount_point.display(), "unmounted");
        } else if is_not_mounted_error(&out.output) {
            debug!(mount_point = %mount_point.display(), "mount path was not mounted");
        } else {
            return Err(Error::Unmount {
                path: mount_point.to_path_buf(),
                output: out.output,
            });
        }

        if self.remove_mountdirs {
            match fs::remove_dir(mount_point) {
                Ok(()) => debug!(mount_point = %mount_point.display(), "removed mount directory"),
                Err(e) => warn!(
                    mount_point = %mount_point.display(),
                    error = %e,
                    "failed removing mount directory"
                ),
            }
        }

        Ok(())
    }
}

fn absolute(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandOutput;
    use crate::executor::fake::RecordingRunner;
    use crate::fstype::FsOverrides;

    fn executor(runner: &Arc<RecordingRunner>, base: &Path, remove: bool) -> MountExecutor {
        let detector = FilesystemDetector::new(runner.clone(), "blkid", FsOverrides::default());
        MountExecutor::new(runner.clone(), detector, base, remove)
    }

    #[test]
    fn test_is_not_mounted_error() {
        assert!(is_not_mounted_error("umount: /mnt/x: not mounted."));
        assert!(!is_not_mounted_error("umount: /mnt/x: target is busy."));
    }

    #[test]
    fn test_is_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mount_point(dir.path()).unwrap());
        assert!(!is_mount_point(&dir.path().join("missing")).unwrap());
        assert!(is_mount_point(Path::new("/")).unwrap());
    }

    #[test]
    fn test_mount_creates_directory_and_runs_mount() {
        let base = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let exec = executor(&runner, base.path(), true);
        let mount_point = exec.mount_path("USBKEY");

        exec.mount(Path::new("/dev/disk/by-label/USBKEY"), &mount_point, None)
            .unwrap();

        assert!(mount_point.is_dir());
        assert_eq!(
            runner.calls_to("mount"),
            vec![vec![
                "mount".to_string(),
                "/dev/disk/by-label/USBKEY".to_string(),
                mount_point.display().to_string(),
            ]]
        );
    }

    #[test]
    fn test_mount_with_override_type() {
        let base = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let exec = executor(&runner, base.path(), true);
        let mount_point = exec.mount_path("WIN");

        exec.mount(Path::new("/dev/sdb1"), &mount_point, Some("ntfs3"))
            .unwrap();

        let calls = runner.calls_to("mount");
        assert_eq!(calls[0][1..3], ["-t".to_string(), "ntfs3".to_string()]);
    }

    #[test]
    fn test_mount_failure_carries_output() {
        let base = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("mount", CommandOutput::new(32, "mount: wrong fs type"));
        let exec = executor(&runner, base.path(), true);

        let err = exec
            .mount(Path::new("/dev/sdb1"), &exec.mount_path("BAD"), None)
            .unwrap_err();
        match err {
            Error::Mount { output, .. } => assert_eq!(output, "mount: wrong fs type"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unmount_removes_directory() {
        let base = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let exec = executor(&runner, base.path(), true);
        let mount_point = exec.mount_path("USBKEY");
        fs::create_dir(&mount_point).unwrap();

        exec.unmount(&mount_point).unwrap();
        assert!(!mount_point.exists());
        assert_eq!(runner.calls_to("umount").len(), 1);
    }

    #[test]
    fn test_unmount_keeps_directory_when_configured() {
        let base = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let exec = executor(&runner, base.path(), false);
        let mount_point = exec.mount_path("USBKEY");
        fs::create_dir(&mount_point).unwrap();

        exec.unmount(&mount_point).unwrap();
        assert!(mount_point.exists());
    }

    #[test]
    fn test_unmount_not_mounted_is_success() {
        let base = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("umount", CommandOutput::new(32, "umount: /mnt/x: not mounted."));
        let exec = executor(&runner, base.path(), true);

        // The directory never existed; its removal failure is swallowed too.
        exec.unmount(&exec.mount_path("GONE")).unwrap();
    }

    #[test]
    fn test_unmount_failure() {
        let base = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("umount", CommandOutput::new(32, "umount: /mnt/x: target is busy."));
        let exec = executor(&runner, base.path(), true);
        let mount_point = exec.mount_path("BUSY");
        fs::create_dir(&mount_point).unwrap();

        let err = exec.unmount(&mount_point).unwrap_err();
        assert!(matches!(err, Error::Unmount { .. }));
        assert!(mount_point.exists());
    }
}
