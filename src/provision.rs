//! Partition, filesystem, and LVM provisioning.
//!
//! Writes a fresh GPT table, creates every partition in layout order with
//! running MiB offsets (the single open-ended entry, if any, is deferred to
//! the end of the pass and spans to 100% of the device), formats each one,
//! and provisions volume groups on LVM-bearing partitions. The teardown
//! counterpart, [`deprovision`], deactivates LVM state and drops the
//! kernel's partition child nodes so nothing leaks across builds.

use std::path::{Path, PathBuf};

use log::info;

use crate::device::{by_partlabel, wait_for_device, DEVICE_WAIT_TIMEOUT};
use crate::error::Result;
use crate::layout::{
    Filesystem, LvmSpec, PartitionEntry, PartitionSpec, VolumeEntry, FIRST_PARTITION_OFFSET_MIB,
    PARTITION_TABLE_TYPE,
};
use crate::process::Cmd;

/// A partition created on the device, addressable by its stable partlabel
/// symlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedPartition {
    pub label: String,
    pub node: PathBuf,
    /// 1-based partition number in creation order.
    pub number: u32,
}

/// Where a planned partition ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionEnd {
    /// Fixed end position in MiB.
    At(u64),
    /// Spans to 100% of the device.
    Remainder,
}

/// One partition with its creation order and on-disk span resolved.
struct PlannedPartition<'a> {
    entry: &'a PartitionEntry,
    number: u32,
    start_mib: u64,
    end: PartitionEnd,
}

/// Resolve creation order and MiB spans for every entry. Entries keep their
/// layout order except the open-ended one, which moves to the end of the
/// pass so it can consume whatever space remains.
fn plan(spec: &PartitionSpec) -> Vec<PlannedPartition<'_>> {
    let mut planned = Vec::with_capacity(spec.entries().len());
    let mut end = FIRST_PARTITION_OFFSET_MIB;
    let mut number = 0;
    let mut open_ended = None;

    for entry in spec.entries() {
        let Some(size_mb) = entry.size_mb else {
            open_ended = Some(entry);
            continue;
        };
        number += 1;
        let start_mib = end;
        end = start_mib + size_mb;
        planned.push(PlannedPartition {
            entry,
            number,
            start_mib,
            end: PartitionEnd::At(end),
        });
    }

    if let Some(entry) = open_ended {
        planned.push(PlannedPartition {
            entry,
            number: number + 1,
            start_mib: end,
            end: PartitionEnd::Remainder,
        });
    }

    planned
}

/// Write the partition table and create, flag, and format every partition
/// (plus nested LVM volumes) in the layout.
pub fn provision(device: &Path, spec: &PartitionSpec) -> Result<Vec<ProvisionedPartition>> {
    info!(
        "creating {} partition table on {}",
        PARTITION_TABLE_TYPE,
        device.display()
    );
    Cmd::new("parted")
        .arg("-s")
        .arg_path(device)
        .args(["mklabel", PARTITION_TABLE_TYPE])
        .run()?;

    let mut provisioned = Vec::new();
    for planned in plan(spec) {
        provisioned.push(create_partition(device, &planned)?);
    }
    Ok(provisioned)
}

fn create_partition(device: &Path, planned: &PlannedPartition<'_>) -> Result<ProvisionedPartition> {
    let entry = planned.entry;
    info!(
        "creating partition {} ({}, {})",
        entry.label,
        entry.fs,
        match planned.end {
            PartitionEnd::At(end) => format!("{}MiB", end - planned.start_mib),
            PartitionEnd::Remainder => "remainder of device".to_owned(),
        }
    );

    let mut cmd = Cmd::new("parted")
        .arg("-s")
        .arg_path(device)
        .arg("mkpart")
        .arg(&entry.label);
    if let Some(fs_type) = entry.fs.parted_type() {
        cmd = cmd.arg(fs_type);
    }
    cmd = cmd.arg(format!("{}MiB", planned.start_mib));
    cmd = match planned.end {
        PartitionEnd::At(end) => cmd.arg(format!("{}MiB", end)),
        PartitionEnd::Remainder => cmd.arg("100%"),
    };
    cmd.run()?;

    for (flag, enabled) in &entry.flags {
        info!("setting partition flag {} to {}", flag, enabled);
        Cmd::new("parted")
            .arg("-s")
            .arg_path(device)
            .arg("set")
            .arg(planned.number.to_string())
            .arg(flag)
            .arg(if *enabled { "on" } else { "off" })
            .run()?;
    }

    let node = by_partlabel(&entry.label);
    wait_for_device(&node, DEVICE_WAIT_TIMEOUT)?;

    make_filesystem(entry.fs, &entry.label, &node)?;

    if let Some(lvm) = &entry.lvm {
        info!("setting up LVM on {}", entry.label);
        provision_lvm(&node, lvm)?;
    }

    Ok(ProvisionedPartition {
        label: entry.label.clone(),
        node,
        number: planned.number,
    })
}

fn make_filesystem(fs: Filesystem, label: &str, node: &Path) -> Result<()> {
    match fs {
        Filesystem::None => {
            info!("no filesystem requested for {}, skipping mkfs", label);
            Ok(())
        }
        Filesystem::Fat32 => Cmd::new("mkfs.fat")
            .args(["-F", "32", "-n"])
            .arg(label)
            .arg_path(node)
            .run(),
        Filesystem::Fat16 => Cmd::new("mkfs.fat")
            .args(["-F", "16", "-n"])
            .arg(label)
            .arg_path(node)
            .run(),
        Filesystem::Swap => Cmd::new("mkswap").arg("-L").arg(label).arg_path(node).run(),
        other => Cmd::new(format!("mkfs.{}", other))
            .arg("-L")
            .arg(label)
            .arg_path(node)
            .run(),
    }
}

/// Single PV, single VG, multiple LVs. Fixed-size volumes are created in
/// declared order; the open-ended volume comes last and takes all remaining
/// free extents.
fn provision_lvm(node: &Path, lvm: &LvmSpec) -> Result<()> {
    Cmd::new("pvcreate").arg("-y").arg_path(node).run()?;
    Cmd::new("vgcreate")
        .arg("-y")
        .arg(&lvm.vg_name)
        .arg_path(node)
        .run()?;

    let mut open_ended = None;
    for volume in &lvm.volumes {
        if volume.is_open_ended() {
            open_ended = Some(volume);
            continue;
        }
        create_volume(&lvm.vg_name, volume)?;
    }
    if let Some(volume) = open_ended {
        create_volume(&lvm.vg_name, volume)?;
    }
    Ok(())
}

fn create_volume(vg_name: &str, volume: &VolumeEntry) -> Result<()> {
    info!("creating volume {} in VG {}", volume.label, vg_name);
    let cmd = Cmd::new("lvcreate")
        .arg("-y")
        .args(["--name", &volume.label]);
    match volume.size_mb {
        Some(size_mb) => cmd.arg("--size").arg(format!("{}MiB", size_mb)),
        None => cmd.args(["--extents", "100%FREE"]),
    }
    .arg(vg_name)
    .run()?;

    let node = Path::new("/dev").join(vg_name).join(&volume.label);
    wait_for_device(&node, DEVICE_WAIT_TIMEOUT)?;
    make_filesystem(volume.fs, &volume.label, &node)
}

/// Best-effort teardown of everything [`provision`] built: deactivate each
/// logical volume and volume group (reverse of creation order), export the
/// VGs so their PVs can be disconnected, then drop the device's partition
/// child nodes. Always runs, even after a failed build, so loop-device
/// children are not leaked into later runs.
pub fn deprovision(device: &Path, spec: &PartitionSpec) {
    let lvm_specs: Vec<&LvmSpec> = spec
        .entries()
        .iter()
        .filter_map(|e| e.lvm.as_ref())
        .collect();

    for lvm in lvm_specs.iter().rev() {
        for volume in lvm.volumes.iter().rev() {
            let node = Path::new("/dev").join(&lvm.vg_name).join(&volume.label);
            let _ = Cmd::new("lvchange").arg("-an").arg_path(&node).allow_fail().run();
        }
        let _ = Cmd::new("vgchange").arg("-an").arg(&lvm.vg_name).allow_fail().run();
        // Export so the PV can be disconnected cleanly.
        let _ = Cmd::new("vgexport").arg(&lvm.vg_name).allow_fail().run();
    }

    // Otherwise /dev/loopNp{1,2,3} survive the loop device itself.
    let _ = Cmd::new("partx")
        .args(["-d", "-v"])
        .arg_path(device)
        .allow_fail()
        .run();
}
