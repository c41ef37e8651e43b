use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::error;

use disk_builder::{preflight, Bootloader, BuildOrchestrator, BuildRequest, ToolSource};

/// Build a bootable disk image from a rootfs tarball and a partition layout.
#[derive(Debug, Parser)]
#[command(name = "disk-builder", version)]
struct Args {
    /// Rootfs tarball to install (optionally gz/bz2/xz/lzma/lz compressed)
    #[arg(long, value_name = "TARBALL")]
    image: PathBuf,

    /// Partition layout file (JSON array of partition objects)
    #[arg(long, value_name = "FILE")]
    layout: PathBuf,

    /// Output image file; format inferred from extension (vmdk by default)
    #[arg(long, value_name = "FILE", required_unless_present = "device")]
    outfile: Option<PathBuf>,

    /// Build directly on an existing block device instead of a loopback
    #[arg(long, value_name = "DEVICE")]
    device: Option<PathBuf>,

    /// Firmware the image should boot under
    #[arg(long, value_enum, default_value_t = LoaderArg::Bios)]
    bootloader: LoaderArg,

    /// Use the host's installed GRUB tools instead of downloading them
    #[arg(long)]
    system_grub_tools: bool,

    /// Directory for the loopback backing file; a tmpfs is mounted when omitted
    #[arg(long, value_name = "DIR")]
    scratch_dir: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LoaderArg {
    Bios,
    Uefi,
}

impl From<LoaderArg> for Bootloader {
    fn from(arg: LoaderArg) -> Self {
        match arg {
            LoaderArg::Bios => Bootloader::Bios,
            LoaderArg::Uefi => Bootloader::Uefi,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    preflight::ensure_root()?;

    let bootloader = Bootloader::from(args.bootloader);
    let grub_tools = if args.system_grub_tools {
        ToolSource::System
    } else {
        ToolSource::Download
    };
    let converting = args.outfile.is_some();

    let mut orchestrator = BuildOrchestrator::new(BuildRequest {
        image_tarball: args.image,
        layout_file: args.layout,
        outfile: args.outfile,
        device: args.device,
        bootloader,
        grub_tools,
        scratch_dir: args.scratch_dir,
    })?;

    preflight::check(orchestrator.spec(), bootloader, grub_tools, converting)?;

    if let Err(err) = orchestrator.run() {
        error!("build failed (final state {:?})", orchestrator.state());
        return Err(err.into());
    }
    Ok(())
}
