//! Bootloader installation and configuration.
//!
//! GRUB is installed in one of two platform variants (BIOS or UEFI), each a
//! strategy selected by configuration, not a class hierarchy. Both variants
//! share the same shape: obtain the GRUB tool tree (host-installed or
//! downloaded into a disposable scratch dir), generate a boot image with an
//! embedded "search + set prefix" config pointing at the grub_cfg partition,
//! and place it where the platform firmware will find it. The boot menu
//! itself ([`configure`]) is written to the grub_cfg partition and is
//! identical for both variants: entries locate the OS by filesystem label,
//! so they survive device renumbering.

mod bios;
mod uefi;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::info;
use tempfile::TempDir;

use crate::error::{BuildError, Result};
use crate::layout::{Filesystem, PartitionEntry, PartitionSpec};
use crate::mount::with_mount;
use crate::process::Cmd;
use crate::{device, image};

/// GRUB modules common to both platforms: disk, partition table, filesystem,
/// and search-by-label support.
const BIOS_MODULES: &[&str] = &["biosdisk", "ext2", "part_gpt", "search"];
const UEFI_MODULES: &[&str] = &[
    "ext2",
    "fat",
    "part_gpt",
    "search",
    "efi_gop",
    "normal",
    "boot",
    "configfile",
    "linux",
];
const LVM_MODULE: &str = "lvm";

/// Boot firmware variant the image is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootloader {
    Bios,
    Uefi,
}

impl Bootloader {
    /// GRUB's name for the platform target.
    pub fn grub_target(self) -> &'static str {
        match self {
            Bootloader::Bios => "i386-pc",
            Bootloader::Uefi => "x86_64-efi",
        }
    }

    /// Debian package carrying the platform's GRUB binaries.
    fn grub_package(self) -> &'static str {
        match self {
            Bootloader::Bios => "grub-pc-bin",
            Bootloader::Uefi => "grub-efi-amd64-bin",
        }
    }

    /// Partitions the platform needs in addition to the user's layout.
    /// Merged ahead of the user entries before validation.
    pub fn required_partitions(self) -> Vec<PartitionEntry> {
        let grub_cfg = PartitionEntry {
            label: "GRUB_CFG".into(),
            fs: Filesystem::Ext4,
            size_mb: Some(32),
            grub_cfg: true,
            ..Default::default()
        };
        match self {
            Bootloader::Bios => vec![
                PartitionEntry {
                    label: "GRUB_EMBED".into(),
                    fs: Filesystem::Ext4,
                    size_mb: Some(31),
                    flags: [("bios_grub".to_owned(), true)].into(),
                    ..Default::default()
                },
                grub_cfg,
            ],
            Bootloader::Uefi => vec![
                PartitionEntry {
                    label: "ESP".into(),
                    fs: Filesystem::Fat32,
                    size_mb: Some(512),
                    flags: [("boot".to_owned(), true)].into(),
                    esp: true,
                    ..Default::default()
                },
                grub_cfg,
            ],
        }
    }

    /// Install the platform boot image onto the device.
    pub fn install(self, device: &Path, spec: &PartitionSpec, tools: &GrubTools) -> Result<()> {
        match self {
            Bootloader::Bios => bios::install(device, spec, tools),
            Bootloader::Uefi => uefi::install(spec, tools),
        }
    }

    fn modules(self, spec: &PartitionSpec) -> Vec<&'static str> {
        let mut modules = match self {
            Bootloader::Bios => BIOS_MODULES.to_vec(),
            Bootloader::Uefi => UEFI_MODULES.to_vec(),
        };
        if spec.has_lvm() {
            modules.push(LVM_MODULE);
        }
        modules
    }
}

/// Where GRUB tool binaries come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    /// Use the executing host's installed GRUB (`/usr/bin`, `/usr/lib/grub`).
    System,
    /// Download the GRUB packages into a disposable scratch directory.
    Download,
}

/// A GRUB tool tree: either the host root or a scratch directory populated
/// by unpacking downloaded packages. The scratch directory is removed when
/// the value is dropped, on every exit path.
pub struct GrubTools {
    root: PathBuf,
    _scratch: Option<TempDir>,
}

impl GrubTools {
    pub fn acquire(source: ToolSource, loader: Bootloader) -> Result<Self> {
        let tools = match source {
            ToolSource::System => {
                info!("using host-installed grub tools");
                Self {
                    root: PathBuf::from("/"),
                    _scratch: None,
                }
            }
            ToolSource::Download => {
                let scratch = tempfile::Builder::new()
                    .prefix("disk-builder-grub-")
                    .tempdir()?;
                download_grub_packages(scratch.path(), loader)?;
                Self {
                    root: scratch.path().to_owned(),
                    _scratch: Some(scratch),
                }
            }
        };

        let lib_dir = tools.grub_lib_dir(loader.grub_target());
        if !lib_dir.is_dir() {
            return Err(BuildError::resource(format!(
                "grub tools for {} not found (missing {})",
                loader.grub_target(),
                lib_dir.display()
            )));
        }
        Ok(tools)
    }

    pub fn mkimage(&self) -> PathBuf {
        self.root.join("usr/bin/grub-mkimage")
    }

    pub fn grub_lib_dir(&self, target: &str) -> PathBuf {
        self.root.join("usr/lib/grub").join(target)
    }
}

/// Binary paths a [`ToolSource::System`] build will invoke, for preflight.
/// Built through the same [`GrubTools`] accessors the install steps use, so
/// the checked and invoked locations cannot drift apart.
pub fn system_tool_paths(loader: Bootloader) -> Vec<PathBuf> {
    let tools = GrubTools {
        root: PathBuf::from("/"),
        _scratch: None,
    };
    let mut paths = vec![tools.mkimage()];
    if loader == Bootloader::Bios {
        paths.push(tools.grub_lib_dir(loader.grub_target()).join("grub-bios-setup"));
    }
    paths
}

/// Fetch grub-common plus the platform binary package and unpack them into
/// `dir`. Assumes a Debian-family host (apt-get, dpkg-deb).
fn download_grub_packages(dir: &Path, loader: Bootloader) -> Result<()> {
    info!("downloading grub tools (grub-common, {})", loader.grub_package());
    for package in ["grub-common", loader.grub_package()] {
        Cmd::new("apt-get")
            .arg("download")
            .arg(package)
            .current_dir(dir)
            .run()?;
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "deb") {
            Cmd::new("dpkg-deb")
                .arg("--extract")
                .arg_path(&path)
                .arg_path(dir)
                .run()?;
        }
    }
    Ok(())
}

/// Embedded boot-stage config: find the grub_cfg partition by filesystem
/// label and read the menu from its /boot/grub.
fn load_cfg_contents(spec: &PartitionSpec) -> Result<String> {
    let grub = spec.grub_cfg_ref()?;
    Ok(format!(
        "search.fs_label {} root\nset prefix=($root)/boot/grub\n",
        grub.label
    ))
}

/// Generate a platform boot image with `grub-mkimage`, embedding the
/// load.cfg. Raises [`BuildError::MissingArtifact`] if the tool exits zero
/// but the image is absent.
fn make_boot_image(
    tools: &GrubTools,
    loader: Bootloader,
    spec: &PartitionSpec,
    prefix: &str,
    output: &Path,
) -> Result<()> {
    let mut load_cfg = tempfile::Builder::new()
        .prefix("load-cfg-")
        .suffix(".cfg")
        .tempfile()?;
    load_cfg.write_all(load_cfg_contents(spec)?.as_bytes())?;
    load_cfg.flush()?;

    Cmd::new(tools.mkimage())
        .arg(format!("--config={}", load_cfg.path().display()))
        .arg(format!("--output={}", output.display()))
        .arg(format!(
            "--directory={}",
            tools.grub_lib_dir(loader.grub_target()).display()
        ))
        .arg(format!("--prefix={}", prefix))
        .arg(format!("--format={}", loader.grub_target()))
        .args(loader.modules(spec))
        .run()?;

    if !output.exists() {
        return Err(BuildError::MissingArtifact {
            tool: "grub-mkimage".into(),
            path: output.to_owned(),
        });
    }
    Ok(())
}

const GRUB_TIMEOUT_SECS: u32 = 5;
const KERNEL_OPTS_NORMAL: &str = "ro quiet splash";
const KERNEL_OPTS_DEBUG: &str = "ro debug console=tty0";

/// Contents of the boot menu: one normal and one debug entry per
/// OS-designated partition or volume, each located by filesystem label.
pub fn grub_cfg_contents(spec: &PartitionSpec) -> String {
    let mut lines = vec![
        "set default=0".to_owned(),
        "set gfxpayload=1024x768x24".to_owned(),
        format!("set timeout={}", GRUB_TIMEOUT_SECS),
        String::new(),
    ];

    for os in spec.all_os_refs() {
        for (title, opts) in [
            (os.label.to_owned(), KERNEL_OPTS_NORMAL),
            (format!("{} (debug)", os.label), KERNEL_OPTS_DEBUG),
        ] {
            lines.push(format!("# {}", title));
            lines.push(format!("menuentry \"{}\" {{", title));
            lines.push("  insmod ext2".to_owned());
            if spec.has_lvm() {
                lines.push("  insmod lvm".to_owned());
            }
            lines.push(format!(
                "  search  --label --set=root --no-floppy {}",
                os.label
            ));
            lines.push(format!("  linux   /vmlinuz root=LABEL={} {}", os.label, opts));
            lines.push("  initrd  /initrd.img".to_owned());
            lines.push("}".to_owned());
            lines.push(String::new());
        }
    }

    lines.join("\n")
}

/// Write grub.cfg onto the partition marked `grub_cfg`, where both BIOS and
/// UEFI boot stages will look for it.
pub fn configure(spec: &PartitionSpec) -> Result<()> {
    let grub = spec.grub_cfg_ref()?;
    let node = device::by_label(grub.label);

    with_mount(&node, |mountdir| {
        let grub_dir = mountdir.join("boot/grub");
        fs::create_dir_all(&grub_dir)?;
        info!("writing grub.cfg");
        image::write_file_synced(&grub_dir.join("grub.cfg"), &grub_cfg_contents(spec))?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::validate;

    fn os_entry(label: &str, size_mb: u64) -> PartitionEntry {
        PartitionEntry {
            label: label.into(),
            fs: Filesystem::Ext4,
            size_mb: Some(size_mb),
            os: true,
            ..Default::default()
        }
    }

    #[test]
    fn required_partitions_satisfy_validation() {
        for loader in [Bootloader::Bios, Bootloader::Uefi] {
            let mut entries = loader.required_partitions();
            entries.push(os_entry("OS", 768));
            let spec = PartitionSpec::from_entries(entries);
            assert!(validate::validate(&spec).is_ok());
        }
    }

    #[test]
    fn bios_requires_embed_partition_with_flag() {
        let entries = Bootloader::Bios.required_partitions();
        let embed = &entries[0];
        assert_eq!(embed.label, "GRUB_EMBED");
        assert_eq!(embed.flags.get("bios_grub"), Some(&true));
    }

    #[test]
    fn uefi_requires_esp() {
        let entries = Bootloader::Uefi.required_partitions();
        let esp = &entries[0];
        assert_eq!(esp.label, "ESP");
        assert!(esp.esp);
        assert_eq!(esp.fs, Filesystem::Fat32);
        assert_eq!(esp.flags.get("boot"), Some(&true));
    }

    #[test]
    fn load_cfg_searches_grub_cfg_label() {
        let mut entries = Bootloader::Bios.required_partitions();
        entries.push(os_entry("OS", 768));
        let spec = PartitionSpec::from_entries(entries);
        let cfg = load_cfg_contents(&spec).unwrap();
        assert!(cfg.contains("search.fs_label GRUB_CFG root"));
        assert!(cfg.contains("set prefix=($root)/boot/grub"));
    }

    #[test]
    fn grub_cfg_has_normal_and_debug_entry_per_os() {
        let mut entries = Bootloader::Bios.required_partitions();
        entries.push(os_entry("OS_A", 512));
        entries.push(os_entry("OS_B", 512));
        let spec = PartitionSpec::from_entries(entries);
        let cfg = grub_cfg_contents(&spec);

        for label in ["OS_A", "OS_B"] {
            assert!(cfg.contains(&format!("menuentry \"{}\"", label)));
            assert!(cfg.contains(&format!("menuentry \"{} (debug)\"", label)));
            assert!(cfg.contains(&format!(
                "search  --label --set=root --no-floppy {}",
                label
            )));
            assert!(cfg.contains(&format!("root=LABEL={}", label)));
        }
        assert!(cfg.contains("set timeout=5"));
        // Labels, not device paths.
        assert!(!cfg.contains("/dev/"));
    }

    #[test]
    fn system_tool_paths_match_install_locations() {
        let bios = system_tool_paths(Bootloader::Bios);
        assert_eq!(
            bios,
            vec![
                PathBuf::from("/usr/bin/grub-mkimage"),
                // grub-bios-setup is run from the arch lib dir, not PATH.
                PathBuf::from("/usr/lib/grub/i386-pc/grub-bios-setup"),
            ]
        );

        let uefi = system_tool_paths(Bootloader::Uefi);
        assert_eq!(uefi, vec![PathBuf::from("/usr/bin/grub-mkimage")]);
    }

    #[test]
    fn lvm_layout_pulls_in_lvm_module() {
        let mut entries = Bootloader::Bios.required_partitions();
        entries.push(PartitionEntry {
            label: "PV0".into(),
            size_mb: Some(900),
            lvm: Some(crate::layout::LvmSpec {
                vg_name: "vg0".into(),
                volumes: vec![crate::layout::VolumeEntry {
                    label: "OS".into(),
                    fs: Filesystem::Ext4,
                    size_mb: Some(512),
                    os: true,
                    ..Default::default()
                }],
            }),
            ..Default::default()
        });
        let spec = PartitionSpec::from_entries(entries);
        assert!(Bootloader::Bios.modules(&spec).contains(&"lvm"));
        assert!(grub_cfg_contents(&spec).contains("insmod lvm"));

        let plain = PartitionSpec::from_entries({
            let mut v = Bootloader::Bios.required_partitions();
            v.push(os_entry("OS", 512));
            v
        });
        assert!(!Bootloader::Bios.modules(&plain).contains(&"lvm"));
    }
}
