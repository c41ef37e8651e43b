//! Static layout validation.
//!
//! Pure checks over a [`PartitionSpec`], run once before any command that
//! mutates device state. The checks run in a fixed order and fail fast on
//! the first violated invariant. When no partition declares LVM, only the
//! grub_cfg, OS-presence, open-ended, and label checks over top-level
//! entries apply.

use std::collections::HashSet;

use crate::error::{BuildError, Result};
use crate::layout::{PartitionSpec, LVM_METADATA_MARGIN_MIB};

pub fn validate(spec: &PartitionSpec) -> Result<()> {
    check_grub_cfg(spec)?;
    check_os_designation(spec)?;
    check_open_ended(spec)?;
    check_vg_capacity(spec)?;
    check_unique_labels(spec)
}

/// Exactly one entry (partition or logical volume) may hold grub.cfg.
fn check_grub_cfg(spec: &PartitionSpec) -> Result<()> {
    let mut count = 0usize;
    for entry in spec.entries() {
        count += usize::from(entry.grub_cfg);
        if let Some(lvm) = &entry.lvm {
            count += lvm.volumes.iter().filter(|v| v.grub_cfg).count();
        }
    }
    match count {
        0 => Err(BuildError::config("missing grub_cfg partition in layout")),
        1 => Ok(()),
        _ => Err(BuildError::config("multiple grub_cfg partitions in layout")),
    }
}

/// At least one OS-designated entry must exist, either a top-level partition
/// or a logical volume inside some volume group.
fn check_os_designation(spec: &PartitionSpec) -> Result<()> {
    if !spec.has_lvm() {
        if spec.entries().iter().any(|e| e.os) {
            return Ok(());
        }
        return Err(BuildError::config("missing OS partition in layout"));
    }

    for entry in spec.entries() {
        if let Some(lvm) = &entry.lvm {
            if lvm.vg_name.is_empty() {
                return Err(BuildError::config(format!(
                    "LVM partition {} is missing vg_name",
                    entry.label
                )));
            }
        }
    }

    let has_os = spec.entries().iter().any(|e| {
        e.os || e
            .lvm
            .as_ref()
            .is_some_and(|lvm| lvm.volumes.iter().any(|v| v.os))
    });
    if has_os {
        Ok(())
    } else {
        Err(BuildError::config("missing OS partition in layout"))
    }
}

/// At most one open-ended entry per partition table, and at most one
/// open-ended volume per volume group.
fn check_open_ended(spec: &PartitionSpec) -> Result<()> {
    let open = spec.entries().iter().filter(|e| e.is_open_ended()).count();
    if open > 1 {
        return Err(BuildError::config("only one open-ended partition allowed"));
    }

    for entry in spec.entries() {
        if let Some(lvm) = &entry.lvm {
            let open = lvm.volumes.iter().filter(|v| v.is_open_ended()).count();
            if open > 1 {
                return Err(BuildError::config(format!(
                    "only one open-ended volume allowed in VG {}",
                    lvm.vg_name
                )));
            }
        }
    }
    Ok(())
}

/// A fixed-size LVM partition must fit the sum of its fixed volumes plus
/// the metadata margin.
fn check_vg_capacity(spec: &PartitionSpec) -> Result<()> {
    for entry in spec.entries() {
        let (Some(size_mb), Some(lvm)) = (entry.size_mb, &entry.lvm) else {
            continue;
        };
        let volumes: u64 = lvm.volumes.iter().filter_map(|v| v.size_mb).sum();
        if volumes + LVM_METADATA_MARGIN_MIB > size_mb {
            return Err(BuildError::config(format!(
                "VG {} volumes ({} MiB + {} MiB metadata) exceed partition capacity ({} MiB)",
                lvm.vg_name, volumes, LVM_METADATA_MARGIN_MIB, size_mb
            )));
        }
    }
    Ok(())
}

/// Labels double as lookup keys under /dev/disk/by-label, so partition and
/// volume labels share one namespace and must be globally unique.
fn check_unique_labels(spec: &PartitionSpec) -> Result<()> {
    let mut seen = HashSet::new();
    let mut check = |label: &str| -> Result<()> {
        if !seen.insert(label.to_owned()) {
            return Err(BuildError::config(format!("duplicate label {}", label)));
        }
        Ok(())
    };

    for entry in spec.entries() {
        check(&entry.label)?;
        if let Some(lvm) = &entry.lvm {
            for vol in &lvm.volumes {
                check(&vol.label)?;
            }
        }
    }
    Ok(())
}
