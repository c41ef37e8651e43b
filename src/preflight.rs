//! Host environment checks.
//!
//! Every external tool the build will invoke is resolved up front so a
//! missing binary fails the build before any device is created, not halfway
//! through provisioning.

use std::path::PathBuf;

use log::debug;

use crate::bootloader::{self, Bootloader, ToolSource};
use crate::error::{BuildError, Result};
use crate::layout::{Filesystem, PartitionSpec};

/// Tools every build invokes regardless of layout or bootloader.
const BASE_TOOLS: &[&str] = &[
    "parted", "losetup", "blockdev", "partx", "mount", "umount", "tar", "udevadm", "sync",
];

/// LVM userspace tools, needed only when the layout declares a volume group.
const LVM_TOOLS: &[&str] = &[
    "pvcreate", "vgcreate", "lvcreate", "lvchange", "vgchange", "vgexport",
];

/// Block device work and loopback mounts need root, full stop.
pub fn ensure_root() -> Result<()> {
    // Safe: geteuid has no failure mode.
    if unsafe { libc::geteuid() } != 0 {
        return Err(BuildError::config("this program must be run as root"));
    }
    Ok(())
}

/// Run every host check a particular build depends on.
pub fn check(
    spec: &PartitionSpec,
    bootloader: Bootloader,
    tool_source: ToolSource,
    converting: bool,
) -> Result<()> {
    check_tools(&required_tools(spec, tool_source, converting))?;
    if tool_source == ToolSource::System {
        // Checked at the paths the install step invokes, not on PATH.
        check_files(&bootloader::system_tool_paths(bootloader))?;
    }
    Ok(())
}

/// The formatter a filesystem is created with, if it needs one.
fn mkfs_tool(fs: Filesystem) -> Option<&'static str> {
    match fs {
        Filesystem::Ext4 => Some("mkfs.ext4"),
        Filesystem::Fat32 | Filesystem::Fat16 => Some("mkfs.fat"),
        Filesystem::Swap => Some("mkswap"),
        Filesystem::None => None,
    }
}

/// Compute the PATH-resolved tool set a particular build will invoke.
/// Formatters are included only for filesystems the layout declares.
pub fn required_tools(
    spec: &PartitionSpec,
    tool_source: ToolSource,
    converting: bool,
) -> Vec<&'static str> {
    let mut tools: Vec<&'static str> = BASE_TOOLS.to_vec();

    let mut add = |tool: Option<&'static str>| {
        if let Some(tool) = tool {
            if !tools.contains(&tool) {
                tools.push(tool);
            }
        }
    };
    for entry in spec.entries() {
        add(mkfs_tool(entry.fs));
        if let Some(lvm) = &entry.lvm {
            for volume in &lvm.volumes {
                add(mkfs_tool(volume.fs));
            }
        }
    }

    if spec.has_lvm() {
        tools.extend_from_slice(LVM_TOOLS);
    }
    if tool_source == ToolSource::Download {
        tools.extend_from_slice(&["apt-get", "dpkg-deb"]);
    }
    if converting {
        tools.push("qemu-img");
    }
    tools
}

/// Resolve every named tool on PATH, reporting all missing ones at once.
pub fn check_tools(tools: &[&str]) -> Result<()> {
    let mut missing = Vec::new();
    for tool in tools {
        match which::which(tool) {
            Ok(path) => debug!("found {} at {}", tool, path.display()),
            Err(_) => missing.push(*tool),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(BuildError::config(format!(
            "missing required tools: {}",
            missing.join(", ")
        )))
    }
}

/// Check tools invoked by absolute path rather than PATH lookup.
pub fn check_files(paths: &[PathBuf]) -> Result<()> {
    let missing: Vec<String> = paths
        .iter()
        .filter(|path| !path.is_file())
        .map(|path| path.display().to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(BuildError::config(format!(
            "missing required tools: {}",
            missing.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LvmSpec, PartitionEntry, VolumeEntry};

    fn entry(label: &str, fs: Filesystem, size_mb: Option<u64>) -> PartitionEntry {
        PartitionEntry {
            label: label.into(),
            fs,
            size_mb,
            ..Default::default()
        }
    }

    fn plain_spec() -> PartitionSpec {
        PartitionSpec::from_entries(vec![
            PartitionEntry {
                grub_cfg: true,
                ..entry("GRUB_CFG", Filesystem::Ext4, Some(32))
            },
            PartitionEntry {
                os: true,
                ..entry("OS", Filesystem::Ext4, Some(768))
            },
        ])
    }

    #[test]
    fn lvm_tools_only_when_layout_uses_lvm() {
        let tools = required_tools(&plain_spec(), ToolSource::System, false);
        assert!(!tools.contains(&"vgcreate"));
    }

    #[test]
    fn formatters_follow_declared_filesystems() {
        let tools = required_tools(&plain_spec(), ToolSource::System, false);
        assert!(tools.contains(&"mkfs.ext4"));
        // No FAT or swap entries in this layout.
        assert!(!tools.contains(&"mkfs.fat"));
        assert!(!tools.contains(&"mkswap"));

        let fat_spec = PartitionSpec::from_entries(vec![
            entry("ESP", Filesystem::Fat32, Some(512)),
            entry("SWAP", Filesystem::Swap, Some(256)),
        ]);
        let tools = required_tools(&fat_spec, ToolSource::System, false);
        assert!(tools.contains(&"mkfs.fat"));
        assert!(tools.contains(&"mkswap"));
        assert!(!tools.contains(&"mkfs.ext4"));
    }

    #[test]
    fn formatters_cover_lvm_volumes() {
        let spec = PartitionSpec::from_entries(vec![PartitionEntry {
            lvm: Some(LvmSpec {
                vg_name: "vg0".into(),
                volumes: vec![VolumeEntry {
                    label: "SWAP".into(),
                    fs: Filesystem::Swap,
                    size_mb: Some(256),
                    ..Default::default()
                }],
            }),
            ..entry("PV0", Filesystem::None, Some(512))
        }]);
        let tools = required_tools(&spec, ToolSource::System, false);
        assert!(tools.contains(&"mkswap"));
        assert!(tools.contains(&"vgcreate"));
    }

    #[test]
    fn system_grub_binaries_are_not_path_checked() {
        let tools = required_tools(&plain_spec(), ToolSource::System, false);
        assert!(!tools.contains(&"grub-mkimage"));
        assert!(!tools.contains(&"grub-bios-setup"));
        assert!(!tools.contains(&"apt-get"));
    }

    #[test]
    fn downloaded_tools_need_apt() {
        let tools = required_tools(&plain_spec(), ToolSource::Download, true);
        assert!(tools.contains(&"apt-get"));
        assert!(tools.contains(&"dpkg-deb"));
        assert!(tools.contains(&"qemu-img"));
    }

    #[test]
    fn check_tools_reports_all_missing() {
        let err = check_tools(&["definitely-not-a-tool-1", "definitely-not-a-tool-2"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("definitely-not-a-tool-1"));
        assert!(msg.contains("definitely-not-a-tool-2"));
    }

    #[test]
    fn check_tools_passes_for_coreutils() {
        check_tools(&["ls"]).unwrap();
    }

    #[test]
    fn check_files_wants_the_exact_path() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("grub-mkimage");
        std::fs::write(&present, b"").unwrap();
        check_files(&[present]).unwrap();

        let absent = dir.path().join("grub-bios-setup");
        let err = check_files(&[absent.clone()]).unwrap_err();
        assert!(err.to_string().contains(&absent.display().to_string()));
    }
}
