//! Build orchestration.
//!
//! Sequences validation, device acquisition, provisioning, bootloader
//! installation, image installation, and output conversion, and guarantees
//! teardown on every exit path. The build is fully sequential: each
//! external tool runs to completion before the next is issued, and the only
//! retry loop anywhere is the bounded device-node wait.

use std::env;
use std::path::{Path, PathBuf};

use log::info;

use crate::bootloader::{self, Bootloader, GrubTools, ToolSource};
use crate::device;
use crate::error::{BuildError, Result};
use crate::image;
use crate::layout::PartitionSpec;
use crate::process::Cmd;
use crate::provision;

/// Everything a build needs, resolved before any device is touched.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Rootfs tarball unpacked onto the OS partition.
    pub image_tarball: PathBuf,
    /// Declarative partition layout (JSON array of partition objects).
    pub layout_file: PathBuf,
    /// Where to write the converted disk image. When absent, conversion is
    /// skipped and the caller keeps working with the target device.
    pub outfile: Option<PathBuf>,
    /// Existing block device to build on. When absent, the engine creates
    /// and owns a loopback device sized for the layout.
    pub device: Option<PathBuf>,
    pub bootloader: Bootloader,
    pub grub_tools: ToolSource,
    /// Already-mounted scratch directory for the loopback backing file.
    /// When absent, a tmpfs is mounted for the duration of the build.
    pub scratch_dir: Option<PathBuf>,
}

/// Forward progress of one build. Terminal failure at any state jumps
/// straight to `TornDown` via the teardown path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Created,
    PartitionsReady,
    BootloaderInstalled,
    BootConfigWritten,
    ImageInstalled,
    Converted,
    TornDown,
}

/// Drives a single build from request to torn-down device.
#[derive(Debug)]
pub struct BuildOrchestrator {
    request: BuildRequest,
    spec: PartitionSpec,
    state: BuildState,
}

impl BuildOrchestrator {
    /// Check the request, load the layout file behind the bootloader's
    /// mandatory partitions, and validate it. Nothing here touches a
    /// device.
    pub fn new(request: BuildRequest) -> Result<Self> {
        if !request.image_tarball.is_file() {
            return Err(BuildError::config(format!(
                "missing image tarball: {}",
                request.image_tarball.display()
            )));
        }
        if request.device.is_none() && request.outfile.is_none() {
            return Err(BuildError::config(
                "no output file or target device specified",
            ));
        }

        let spec = PartitionSpec::load(
            &request.layout_file,
            request.bootloader.required_partitions(),
        )?;

        Ok(Self {
            request,
            spec,
            state: BuildState::Created,
        })
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn spec(&self) -> &PartitionSpec {
        &self.spec
    }

    /// Run the build to completion or teardown.
    pub fn run(&mut self) -> Result<()> {
        match self.request.device.clone() {
            Some(dev) => {
                device::validate_device_capacity(&dev, self.spec.total_disk_size_mb())?;
                self.build_on(&dev)
            }
            None => {
                let size_mb = self.spec.total_disk_size_mb();
                let scratch = self.request.scratch_dir.clone();
                info!("creating disk file and loopback device ({} MiB)", size_mb);
                device::with_loopback_device(size_mb, scratch.as_deref(), |dev| {
                    self.build_on(dev)
                })
            }
        }
    }

    /// Run the forward steps, then always deprovision. Partial builds must
    /// not leak LVM state or partition child nodes.
    fn build_on(&mut self, dev: &Path) -> Result<()> {
        let result = self.build_steps(dev);

        info!("deactivating partitions");
        provision::deprovision(dev, &self.spec);
        self.state = BuildState::TornDown;

        result
    }

    fn build_steps(&mut self, dev: &Path) -> Result<()> {
        info!("creating partitions on disk");
        provision::provision(dev, &self.spec)?;
        self.state = BuildState::PartitionsReady;

        info!("installing bootloader on disk");
        {
            let tools = GrubTools::acquire(self.request.grub_tools, self.request.bootloader)?;
            self.request.bootloader.install(dev, &self.spec, &tools)?;
            // Tool scratch dir is removed here, before any further step.
        }
        self.state = BuildState::BootloaderInstalled;

        info!("generating bootloader config");
        bootloader::configure(&self.spec)?;
        self.state = BuildState::BootConfigWritten;

        info!("installing system image on disk partitions");
        image::install_image(&self.spec, &self.request.image_tarball)?;
        self.state = BuildState::ImageInstalled;

        self.convert(dev)
    }

    /// Convert the raw device into the requested output image. Skipped,
    /// not an error, when no output file was requested.
    fn convert(&mut self, dev: &Path) -> Result<()> {
        let Some(outfile) = self.request.outfile.clone() else {
            info!("no output file specified, skipping image conversion");
            return Ok(());
        };

        let format = output_format(&outfile);
        info!(
            "converting {} to {} ({})",
            dev.display(),
            outfile.display(),
            format
        );
        Cmd::new("qemu-img")
            .args(["convert", "-f", "raw", "-O", format])
            .arg_path(dev)
            .arg_path(&outfile)
            .run()?;

        chown_to_invoking_user(&outfile);
        self.state = BuildState::Converted;
        Ok(())
    }
}

/// Output image format, inferred from the output file extension.
fn output_format(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("qcow2") => "qcow2",
        Some("vdi") => "vdi",
        Some("raw") | Some("img") => "raw",
        _ => "vmdk",
    }
}

/// Builds run under sudo; hand the finished image back to the invoking
/// user so it is not left root-owned.
fn chown_to_invoking_user(path: &Path) {
    let (Ok(uid), Ok(gid)) = (env::var("SUDO_UID"), env::var("SUDO_GID")) else {
        return;
    };
    let _ = Cmd::new("chown")
        .arg(format!("{}:{}", uid, gid))
        .arg_path(path)
        .allow_fail()
        .run();
}
