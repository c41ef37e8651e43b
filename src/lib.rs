//! Assembles bootable disk images from a rootfs tarball and a declarative
//! partition layout.
//!
//! The engine drives the standard Linux block stack through its userspace
//! tools (parted, losetup, mkfs, the LVM suite, grub-mkimage) rather than
//! reimplementing any on-disk format. A build takes three inputs:
//!
//! - **Rootfs tarball** - The operating system tree to unpack onto the OS
//!   partition
//! - **Partition layout** - A JSON array describing GPT partitions, flags,
//!   filesystems, and optional LVM volume groups
//! - **Bootloader choice** - BIOS (i386-pc) or UEFI (x86_64-efi) GRUB
//!
//! # Architecture
//!
//! ```text
//! BuildOrchestrator
//!     │
//!     ├── layout     parse + validate the layout, size the disk
//!     ├── device     loopback lifecycle, scratch space, device waits
//!     ├── provision  parted/mkfs/LVM partition creation and teardown
//!     ├── bootloader GRUB image building and installation (BIOS/UEFI)
//!     └── image      tarball extraction and fstab synthesis
//! ```
//!
//! Builds are transactional in effect: whatever forward progress was made,
//! teardown always deactivates LVM state, removes partition child nodes,
//! and detaches any loopback device the engine created.

pub mod bootloader;
pub mod build;
pub mod device;
pub mod error;
pub mod image;
pub mod layout;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod provision;

pub use bootloader::{Bootloader, ToolSource};
pub use build::{BuildOrchestrator, BuildRequest, BuildState};
pub use error::{BuildError, Result};
pub use layout::PartitionSpec;
