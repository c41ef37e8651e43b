//! BIOS (i386-pc) GRUB installation.
//!
//! Builds core.img with the embedded load.cfg, stages boot.img and the
//! module tree on the grub_cfg partition, then burns both images to the
//! device with grub-bios-setup. The core image lands in the partition
//! flagged `bios_grub`.

use std::fs;
use std::path::Path;

use log::info;

use super::{make_boot_image, Bootloader, GrubTools};
use crate::device::by_label;
use crate::error::Result;
use crate::layout::PartitionSpec;
use crate::mount::with_mount;
use crate::process::Cmd;

pub fn install(device: &Path, spec: &PartitionSpec, tools: &GrubTools) -> Result<()> {
    let target = Bootloader::Bios.grub_target();
    let grub = spec.grub_cfg_ref()?;

    with_mount(&by_label(grub.label), |mountdir| {
        let grub_dir = mountdir.join("boot/grub");
        let mods_dir = grub_dir.join(target);
        let imgs_dir = grub_dir.join("imgs");
        fs::create_dir_all(&mods_dir)?;
        fs::create_dir_all(&imgs_dir)?;

        let core_img = imgs_dir.join("core.img");
        let boot_img = imgs_dir.join("boot.img");

        info!("creating core.img (with embedded load.cfg)");
        make_boot_image(tools, Bootloader::Bios, spec, "/boot/grub", &core_img)?;

        let arch_dir = tools.grub_lib_dir(target);
        // boot.img is burned to the disk; the modules live where the core
        // image's prefix will look for them.
        fs::copy(arch_dir.join("boot.img"), &boot_img)?;
        copy_by_extension(&arch_dir, "mod", &mods_dir)?;
        copy_by_extension(&arch_dir, "lst", &mods_dir)?;

        info!("burning boot.img and core.img to {}", device.display());
        Cmd::new(arch_dir.join("grub-bios-setup"))
            .args(["--boot-image=boot.img", "--core-image=core.img"])
            .arg(format!("--directory={}", imgs_dir.display()))
            .args(["--device-map=/dev/null", "--skip-fs-probe"])
            .arg_path(device)
            .run()
    })
}

fn copy_by_extension(from: &Path, extension: &str, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == extension) {
            if let Some(name) = path.file_name() {
                fs::copy(&path, to.join(name))?;
            }
        }
    }
    Ok(())
}
