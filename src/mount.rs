//! Scoped mounting of partitions and volumes.

use std::path::Path;

use log::warn;

use crate::error::Result;
use crate::process::Cmd;

/// Mount `device` on a fresh temp directory, run `work` against the mount
/// point, and always unmount afterwards. An unmount failure is logged and
/// does not replace an error returned by `work`.
pub fn with_mount<T>(device: &Path, work: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    let mountdir = tempfile::Builder::new()
        .prefix("disk-builder-mnt-")
        .tempdir()?;

    Cmd::new("mount")
        .arg_path(device)
        .arg_path(mountdir.path())
        .run()?;

    let result = work(mountdir.path());

    if let Err(err) = Cmd::new("umount").arg_path(mountdir.path()).run() {
        warn!("failed to unmount {}: {}", mountdir.path().display(), err);
    }
    result
}
