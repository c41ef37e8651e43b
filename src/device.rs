//! Loopback device lifecycle and device-node readiness.
//!
//! The engine builds on either a loopback device it owns end-to-end (sparse
//! backing file on scratch storage, bound via losetup) or a caller-supplied
//! physical block device it never creates or destroys. Teardown of an
//! engine-owned device runs in strict reverse order of acquisition and is
//! best-effort: failures are logged, never raised, and never mask the error
//! that triggered teardown.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use tempfile::TempDir;

use crate::error::{BuildError, Result};
use crate::process::Cmd;

/// How long to wait for a partition or volume node to appear.
pub const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed polling interval used while waiting for a device node.
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Headroom added to the scratch tmpfs beyond the backing file size, for
/// tmpfs metadata.
const SCRATCH_HEADROOM_MIB: u64 = 64;

/// Stable symlink to a filesystem by its label.
pub fn by_label(label: &str) -> PathBuf {
    Path::new("/dev/disk/by-label").join(label)
}

/// Stable symlink to a partition by its GPT partition label.
pub fn by_partlabel(label: &str) -> PathBuf {
    Path::new("/dev/disk/by-partlabel").join(label)
}

/// Scratch storage holding the loopback backing file.
enum ScratchKind {
    /// Caller-provided directory, presumed already on fast storage and large
    /// enough. Never mounted or removed by the engine.
    Provided(PathBuf),
    /// Engine-mounted tmpfs on a temp directory; unmounted and removed at
    /// teardown.
    TmpfsMount(TempDir),
}

struct ScratchDir {
    kind: ScratchKind,
    released: bool,
}

impl ScratchDir {
    fn acquire(size_mb: u64, preferred: Option<&Path>) -> Result<Self> {
        if let Some(dir) = preferred {
            if dir.is_dir() {
                info!("using {} as scratch directory", dir.display());
                return Ok(Self {
                    kind: ScratchKind::Provided(dir.to_owned()),
                    released: false,
                });
            }
            warn!(
                "scratch directory {} does not exist, mounting a tmpfs instead",
                dir.display()
            );
        }

        let dir = tempfile::Builder::new()
            .prefix("disk-builder-scratch-")
            .tempdir()?;
        let size = size_mb + SCRATCH_HEADROOM_MIB;
        info!("mounting {} MiB tmpfs on {}", size, dir.path().display());
        Cmd::new("mount")
            .args(["-t", "tmpfs", "-o"])
            .arg(format!("size={}M", size))
            .arg("disk-builder-scratch")
            .arg_path(dir.path())
            .run()?;
        Ok(Self {
            kind: ScratchKind::TmpfsMount(dir),
            released: false,
        })
    }

    fn dir(&self) -> &Path {
        match &self.kind {
            ScratchKind::Provided(dir) => dir,
            ScratchKind::TmpfsMount(dir) => dir.path(),
        }
    }

    /// Unmount an engine-mounted tmpfs. Runs at most once; the TempDir
    /// underneath is removed when the value is dropped, after the unmount.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let ScratchKind::TmpfsMount(dir) = &self.kind {
            if let Err(err) = Cmd::new("umount").arg_path(dir.path()).run() {
                warn!("failed to unmount scratch tmpfs: {}", err);
            }
        }
    }
}

impl Drop for ScratchDir {
    // The tmpfs must come down even when acquisition of the loop device
    // fails before any LoopbackDevice owns this value.
    fn drop(&mut self) {
        self.release();
    }
}

/// An engine-owned loop device backed by a sparse file on scratch storage.
pub struct LoopbackDevice {
    path: PathBuf,
    backing: PathBuf,
    scratch: ScratchDir,
    detached: bool,
}

impl LoopbackDevice {
    /// Allocate scratch storage, create a sparse backing file of `size_mb`,
    /// and bind it to the next free loop device.
    pub fn create(size_mb: u64, preferred_scratch: Option<&Path>) -> Result<Self> {
        let scratch = ScratchDir::acquire(size_mb, preferred_scratch)?;

        let backing = scratch.dir().join("disk.img");
        let file = fs::File::create(&backing)?;
        file.set_len(size_mb * 1024 * 1024)?;

        let path = Cmd::new("losetup")
            .args(["--find", "--show"])
            .arg_path(&backing)
            .read_stdout()?;
        if path.is_empty() {
            return Err(BuildError::resource("no free loop device available"));
        }

        info!("using backing file: {}", backing.display());
        info!("using loop device : {}", path);

        Ok(Self {
            path: PathBuf::from(path),
            backing,
            scratch,
            detached: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tear down in strict reverse order: unbind the loop device, delete the
    /// backing file, release the scratch directory. Calling this twice is a
    /// no-op. Failures are logged and swallowed so they cannot mask the
    /// error that led here.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;

        info!("deleting loop device {} and its backing file", self.path.display());
        if let Err(err) = Cmd::new("losetup").arg("-d").arg_path(&self.path).run() {
            warn!("failed to detach {}: {}", self.path.display(), err);
        }
        if let Err(err) = fs::remove_file(&self.backing) {
            warn!("failed to remove {}: {}", self.backing.display(), err);
        }
        self.scratch.release();
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Run `work` against a freshly created loopback device sized for the
/// layout. The device is torn down on every exit path.
pub fn with_loopback_device<T>(
    size_mb: u64,
    preferred_scratch: Option<&Path>,
    work: impl FnOnce(&Path) -> Result<T>,
) -> Result<T> {
    let mut device = LoopbackDevice::create(size_mb, preferred_scratch)?;
    let result = work(device.path());
    device.detach();
    result
}

/// Ensure a caller-supplied block device can hold the computed layout.
/// The device must be strictly larger than the layout's minimum size.
pub fn validate_device_capacity(device: &Path, needed_mib: u64) -> Result<()> {
    let out = Cmd::new("blockdev")
        .arg("--getsize64")
        .arg_path(device)
        .read_stdout()?;
    let bytes: u64 = out.parse().map_err(|_| {
        BuildError::resource(format!(
            "cannot parse size of {} (blockdev said '{}')",
            device.display(),
            out
        ))
    })?;

    let device_mib = bytes / (1024 * 1024);
    if device_mib <= needed_mib {
        return Err(BuildError::resource(format!(
            "device {} too small: layout needs {} MiB, device has {} MiB",
            device.display(),
            needed_mib,
            device_mib
        )));
    }
    Ok(())
}

/// Wait for a device node (or symlink) to appear, polling at a fixed
/// interval up to `timeout`. Raises [`BuildError::DeviceNotReady`] on
/// expiry rather than continuing silently.
pub fn wait_for_device(path: &Path, timeout: Duration) -> Result<()> {
    // Nudge udev so by-label/by-partlabel symlinks show up promptly.
    Cmd::new("udevadm").arg("trigger").allow_fail().run()?;

    let start = Instant::now();
    loop {
        if path.exists() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(BuildError::DeviceNotReady {
                path: path.to_owned(),
                waited_secs: timeout.as_secs(),
            });
        }
        thread::sleep(DEVICE_POLL_INTERVAL);
    }
}
