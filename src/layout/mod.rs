//! Typed partition layout model.
//!
//! A layout is an ordered list of [`PartitionEntry`] values, loaded from a
//! declarative JSON file and merged behind the bootloader's mandatory
//! partitions. Entries may carry an [`LvmSpec`] describing a volume group
//! with nested logical volumes (one level deep, no recursion).
//!
//! The schema is strict: unknown or malformed fields are rejected when the
//! file is parsed, not when some later step happens to read them.

pub mod validate;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{BuildError, Result};

/// Partition table type written to the device.
pub const PARTITION_TABLE_TYPE: &str = "gpt";

/// Offset of the first partition from the start of the disk, in MiB.
pub const FIRST_PARTITION_OFFSET_MIB: u64 = 1;

/// Extra MiB at the end of the disk; parted treats the end position as
/// inclusive.
pub const END_MARGIN_MIB: u64 = 1;

/// Sizing floor for an open-ended entry when computing the minimum disk size.
pub const OPEN_ENDED_FLOOR_MIB: u64 = 1;

/// Slack reserved for LVM metadata when checking volume-group capacity.
/// One default-sized LVM extent.
pub const LVM_METADATA_MARGIN_MIB: u64 = 4;

/// Filesystem placed on a partition or logical volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    Ext4,
    Fat32,
    Fat16,
    Swap,
    #[default]
    None,
}

impl Filesystem {
    /// Filesystem-type hint passed to `parted mkpart`, if any.
    pub fn parted_type(self) -> Option<&'static str> {
        match self {
            Filesystem::Ext4 => Some("ext4"),
            Filesystem::Fat32 => Some("fat32"),
            Filesystem::Fat16 => Some("fat16"),
            Filesystem::Swap => Some("linux-swap"),
            Filesystem::None => None,
        }
    }

    /// Type name as written in the third fstab column.
    pub fn fstab_type(self) -> &'static str {
        match self {
            Filesystem::Ext4 => "ext4",
            Filesystem::Fat32 | Filesystem::Fat16 => "vfat",
            Filesystem::Swap => "swap",
            Filesystem::None => "auto",
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Filesystem::Ext4 => "ext4",
            Filesystem::Fat32 => "fat32",
            Filesystem::Fat16 => "fat16",
            Filesystem::Swap => "swap",
            Filesystem::None => "none",
        };
        f.write_str(name)
    }
}

/// One top-level partition in the layout.
///
/// `size_mb: None` marks the entry as open-ended: it consumes all remaining
/// device space. At most one entry per table may be open-ended.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionEntry {
    pub label: String,
    #[serde(default)]
    pub fs: Filesystem,
    #[serde(default)]
    pub size_mb: Option<u64>,
    /// Partition-table flags applied via `parted set`, e.g. `bios_grub`,
    /// `boot`, `lvm`.
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    /// Marks the partition holding the OS tree.
    #[serde(default)]
    pub os: bool,
    /// Marks the partition holding the bootloader menu configuration.
    #[serde(default)]
    pub grub_cfg: bool,
    /// Marks the EFI System Partition.
    #[serde(default)]
    pub esp: bool,
    #[serde(default)]
    pub lvm: Option<LvmSpec>,
}

impl PartitionEntry {
    pub fn is_open_ended(&self) -> bool {
        self.size_mb.is_none()
    }
}

/// Volume group provisioned on top of a single partition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LvmSpec {
    pub vg_name: String,
    pub volumes: Vec<VolumeEntry>,
}

/// One logical volume inside a volume group. Same shape as a partition entry
/// minus table flags and nested LVM.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeEntry {
    pub label: String,
    #[serde(default)]
    pub fs: Filesystem,
    #[serde(default)]
    pub size_mb: Option<u64>,
    #[serde(default)]
    pub os: bool,
    #[serde(default)]
    pub grub_cfg: bool,
}

impl VolumeEntry {
    pub fn is_open_ended(&self) -> bool {
        self.size_mb.is_none()
    }
}

/// A labeled, formatted thing a boot entry or fstab line can refer to:
/// either a partition or a logical volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsRef<'a> {
    pub label: &'a str,
    pub fs: Filesystem,
}

/// Validated, immutable partition layout for one build.
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    entries: Vec<PartitionEntry>,
}

impl PartitionSpec {
    /// Build a spec directly from entries without validating. Callers are
    /// expected to run [`validate::validate`] before provisioning.
    pub fn from_entries(entries: Vec<PartitionEntry>) -> Self {
        Self { entries }
    }

    /// Load a layout file (JSON array of partition objects), merge it behind
    /// the bootloader's mandatory partitions, and validate the result.
    pub fn load(path: &Path, bootloader_partitions: Vec<PartitionEntry>) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            BuildError::config(format!("cannot read layout file {}: {}", path.display(), err))
        })?;

        let user_entries: Vec<PartitionEntry> = serde_json::from_str(&raw).map_err(|err| {
            BuildError::config(format!("malformed layout file {}: {}", path.display(), err))
        })?;

        let mut entries = bootloader_partitions;
        entries.extend(user_entries);

        let spec = Self::from_entries(entries);
        validate::validate(&spec)?;
        Ok(spec)
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    pub fn has_lvm(&self) -> bool {
        self.entries.iter().any(|e| e.lvm.is_some())
    }

    /// The single partition (or volume) designated to hold grub.cfg.
    /// Guaranteed unique by validation.
    pub fn grub_cfg_ref(&self) -> Result<FsRef<'_>> {
        for entry in &self.entries {
            if entry.grub_cfg {
                return Ok(FsRef { label: &entry.label, fs: entry.fs });
            }
            if let Some(lvm) = &entry.lvm {
                for vol in &lvm.volumes {
                    if vol.grub_cfg {
                        return Ok(FsRef { label: &vol.label, fs: vol.fs });
                    }
                }
            }
        }
        Err(BuildError::config("missing grub_cfg partition in layout"))
    }

    /// The first OS-designated partition, falling back to the first
    /// OS-designated logical volume.
    pub fn first_os_ref(&self) -> Result<FsRef<'_>> {
        if let Some(entry) = self.entries.iter().find(|e| e.os) {
            return Ok(FsRef { label: &entry.label, fs: entry.fs });
        }
        for entry in &self.entries {
            if let Some(lvm) = &entry.lvm {
                if let Some(vol) = lvm.volumes.iter().find(|v| v.os) {
                    return Ok(FsRef { label: &vol.label, fs: vol.fs });
                }
            }
        }
        Err(BuildError::config("no partition marked as OS in layout"))
    }

    /// Every OS-designated partition and volume: direct partitions first,
    /// then LVM volumes in layout order. One boot menu entry pair is written
    /// per element.
    pub fn all_os_refs(&self) -> Vec<FsRef<'_>> {
        let mut refs: Vec<FsRef<'_>> = self
            .entries
            .iter()
            .filter(|e| e.os)
            .map(|e| FsRef { label: &e.label, fs: e.fs })
            .collect();
        for entry in &self.entries {
            if let Some(lvm) = &entry.lvm {
                refs.extend(
                    lvm.volumes
                        .iter()
                        .filter(|v| v.os)
                        .map(|v| FsRef { label: &v.label, fs: v.fs }),
                );
            }
        }
        refs
    }

    /// Label of the EFI System Partition, when the layout has one.
    pub fn esp_label(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.esp)
            .map(|e| e.label.as_str())
    }

    /// Minimum disk size the layout needs, in MiB:
    /// every fixed entry at face value, plus the first-partition offset and
    /// the inclusive-end margin. An open-ended entry counts as a small fixed
    /// floor, or, when it carries LVM, as the sum of its fixed volumes plus
    /// metadata margin, so callers must pre-size physical devices generously.
    pub fn total_disk_size_mb(&self) -> u64 {
        let mut total = FIRST_PARTITION_OFFSET_MIB + END_MARGIN_MIB;
        for entry in &self.entries {
            total += match (entry.size_mb, &entry.lvm) {
                (Some(mb), _) => mb,
                (None, Some(lvm)) => {
                    let volumes: u64 = lvm.volumes.iter().filter_map(|v| v.size_mb).sum();
                    (volumes + LVM_METADATA_MARGIN_MIB).max(OPEN_ENDED_FLOOR_MIB)
                }
                (None, None) => OPEN_ENDED_FLOOR_MIB,
            };
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: &str, fs: Filesystem, size_mb: Option<u64>) -> PartitionEntry {
        PartitionEntry {
            label: label.into(),
            fs,
            size_mb,
            ..Default::default()
        }
    }

    #[test]
    fn parses_layout_json() {
        let json = r#"[
            {"label": "GRUB_CFG", "fs": "ext4", "size_mb": 32, "grub_cfg": true},
            {"label": "OS", "fs": "ext4", "size_mb": 768, "os": true,
             "flags": {"boot": true}}
        ]"#;
        let entries: Vec<PartitionEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].label, "GRUB_CFG");
        assert!(entries[0].grub_cfg);
        assert_eq!(entries[1].size_mb, Some(768));
        assert_eq!(entries[1].flags.get("boot"), Some(&true));
        assert_eq!(entries[1].fs, Filesystem::Ext4);
    }

    #[test]
    fn parses_nested_lvm() {
        let json = r#"[{
            "label": "PV0", "size_mb": 900,
            "flags": {"lvm": true},
            "lvm": {"vg_name": "vg0", "volumes": [
                {"label": "OS", "fs": "ext4", "size_mb": 768, "os": true},
                {"label": "DATA", "fs": "ext4"}
            ]}
        }]"#;
        let entries: Vec<PartitionEntry> = serde_json::from_str(json).unwrap();
        let lvm = entries[0].lvm.as_ref().unwrap();
        assert_eq!(lvm.vg_name, "vg0");
        assert_eq!(lvm.volumes.len(), 2);
        assert!(lvm.volumes[1].is_open_ended());
    }

    #[test]
    fn rejects_unknown_fields() {
        let json = r#"[{"label": "OS", "size_gb": 4}]"#;
        assert!(serde_json::from_str::<Vec<PartitionEntry>>(json).is_err());
    }

    #[test]
    fn omitted_size_means_open_ended() {
        let json = r#"[{"label": "OS", "fs": "ext4", "os": true}]"#;
        let entries: Vec<PartitionEntry> = serde_json::from_str(json).unwrap();
        assert!(entries[0].is_open_ended());
    }

    #[test]
    fn total_size_is_fixed_sizes_plus_two() {
        let spec = PartitionSpec::from_entries(vec![
            entry("GRUB_CFG", Filesystem::Ext4, Some(32)),
            entry("OS", Filesystem::Ext4, Some(768)),
        ]);
        assert_eq!(spec.total_disk_size_mb(), 32 + 768 + 2);
    }

    #[test]
    fn total_size_is_monotonic_in_entry_size() {
        let small = PartitionSpec::from_entries(vec![
            entry("A", Filesystem::Ext4, Some(32)),
            entry("B", Filesystem::Ext4, Some(768)),
        ]);
        let large = PartitionSpec::from_entries(vec![
            entry("A", Filesystem::Ext4, Some(33)),
            entry("B", Filesystem::Ext4, Some(768)),
        ]);
        assert!(large.total_disk_size_mb() > small.total_disk_size_mb());
    }

    #[test]
    fn open_ended_entry_counts_as_floor() {
        let spec = PartitionSpec::from_entries(vec![
            entry("A", Filesystem::Ext4, Some(100)),
            entry("B", Filesystem::Ext4, None),
        ]);
        assert_eq!(
            spec.total_disk_size_mb(),
            100 + OPEN_ENDED_FLOOR_MIB + FIRST_PARTITION_OFFSET_MIB + END_MARGIN_MIB
        );
    }

    #[test]
    fn open_ended_lvm_entry_counts_fixed_volumes() {
        let mut pv = entry("PV0", Filesystem::None, None);
        pv.lvm = Some(LvmSpec {
            vg_name: "vg0".into(),
            volumes: vec![
                VolumeEntry {
                    label: "OS".into(),
                    fs: Filesystem::Ext4,
                    size_mb: Some(768),
                    os: true,
                    ..Default::default()
                },
                VolumeEntry {
                    label: "DATA".into(),
                    fs: Filesystem::Ext4,
                    size_mb: None,
                    ..Default::default()
                },
            ],
        });
        let spec = PartitionSpec::from_entries(vec![pv]);
        assert_eq!(
            spec.total_disk_size_mb(),
            768 + LVM_METADATA_MARGIN_MIB + FIRST_PARTITION_OFFSET_MIB + END_MARGIN_MIB
        );
    }

    #[test]
    fn first_os_ref_falls_back_to_lvm_volume() {
        let mut pv = entry("PV0", Filesystem::None, Some(800));
        pv.lvm = Some(LvmSpec {
            vg_name: "vg0".into(),
            volumes: vec![VolumeEntry {
                label: "ROOT".into(),
                fs: Filesystem::Ext4,
                size_mb: Some(768),
                os: true,
                ..Default::default()
            }],
        });
        let spec = PartitionSpec::from_entries(vec![pv]);
        let os = spec.first_os_ref().unwrap();
        assert_eq!(os.label, "ROOT");
        assert_eq!(os.fs, Filesystem::Ext4);
    }

    #[test]
    fn all_os_refs_lists_partitions_before_volumes() {
        let mut pv = entry("PV0", Filesystem::None, Some(800));
        pv.lvm = Some(LvmSpec {
            vg_name: "vg0".into(),
            volumes: vec![VolumeEntry {
                label: "OS_B".into(),
                fs: Filesystem::Ext4,
                size_mb: Some(128),
                os: true,
                ..Default::default()
            }],
        });
        let mut direct = entry("OS_A", Filesystem::Ext4, Some(128));
        direct.os = true;
        let spec = PartitionSpec::from_entries(vec![pv, direct]);
        let labels: Vec<&str> = spec.all_os_refs().iter().map(|r| r.label).collect();
        assert_eq!(labels, vec!["OS_A", "OS_B"]);
    }
}
