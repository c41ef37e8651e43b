//! UEFI (x86_64-efi) GRUB installation.
//!
//! Builds a self-contained EFI executable with the embedded load.cfg and
//! drops it at the removable-media fallback path (EFI/BOOT/bootx64.efi) on
//! the EFI System Partition. No MBR burning is involved; the firmware finds
//! the executable by convention.

use std::fs;

use log::info;

use super::{make_boot_image, Bootloader, GrubTools};
use crate::device::by_label;
use crate::error::{BuildError, Result};
use crate::layout::PartitionSpec;
use crate::mount::with_mount;

pub fn install(spec: &PartitionSpec, tools: &GrubTools) -> Result<()> {
    let esp_label = spec
        .esp_label()
        .ok_or_else(|| BuildError::config("missing ESP partition in layout"))?;

    with_mount(&by_label(esp_label), |mountdir| {
        let boot_dir = mountdir.join("EFI/BOOT");
        fs::create_dir_all(&boot_dir)?;

        info!("creating bootx64.efi (with embedded load.cfg)");
        make_boot_image(
            tools,
            Bootloader::Uefi,
            spec,
            "/EFI/BOOT",
            &boot_dir.join("bootx64.efi"),
        )
    })
}
