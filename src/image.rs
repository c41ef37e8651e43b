//! Root filesystem installation.
//!
//! Mounts the OS partition, unpacks the rootfs tarball into it with
//! permissions and numeric ownership taken verbatim from the archive, and
//! synthesizes /etc/fstab only when the image does not ship its own. A
//! global sync forces write-back before any later step reads the block
//! device.

use std::fs;
use std::path::Path;

use log::info;

use crate::device::by_label;
use crate::error::{BuildError, Result};
use crate::layout::PartitionSpec;
use crate::mount::with_mount;
use crate::process::Cmd;

const FSTAB_OPTS: &str = "defaults,errors=remount-ro";

/// Install the rootfs tarball onto the first OS-designated partition or
/// volume.
pub fn install_image(spec: &PartitionSpec, tarball: &Path) -> Result<()> {
    if !tarball.is_file() {
        return Err(BuildError::config(format!(
            "image tarball not found: {}",
            tarball.display()
        )));
    }

    let os = spec.first_os_ref()?;
    with_mount(&by_label(os.label), |mountdir| {
        info!("unpacking {} onto {}", tarball.display(), os.label);
        extract_tarball(tarball, mountdir)?;

        let fstab_path = mountdir.join("etc/fstab");
        if fstab_path.exists() {
            info!("image already contains an fstab file, not generating one");
        } else {
            info!("writing generated fstab");
            let grub = spec.grub_cfg_ref()?;
            fs::create_dir_all(mountdir.join("etc"))?;
            write_file_synced(
                &fstab_path,
                &fstab_contents(os.label, os.fs.fstab_type(), grub.label, grub.fs.fstab_type()),
            )?;
        }
        Ok(())
    })?;

    // Force write-back before anything else reads the device.
    Cmd::new("sync").run()
}

/// Unpack a tar archive, preserving permission bits and numeric ownership
/// exactly as recorded in the archive.
fn extract_tarball(tarball: &Path, dest: &Path) -> Result<()> {
    let mut cmd = Cmd::new("tar")
        .arg("--extract")
        .arg(format!("--file={}", tarball.display()))
        .args(["--preserve-permissions", "--numeric-owner"]);
    if let Some(flag) = compression_flag(tarball) {
        cmd = cmd.arg(flag);
    }
    cmd.arg("-C").arg_path(dest).arg(".").run()
}

/// Decompression flag for tar, chosen by file extension. Plain tar needs
/// none.
fn compression_flag(tarball: &Path) -> Option<&'static str> {
    let ext = tarball.extension()?.to_str()?;
    match ext {
        "gz" | "tgz" => Some("--gzip"),
        "bz2" | "tbz2" => Some("--bzip2"),
        "xz" | "txz" => Some("--xz"),
        "lzma" => Some("--lzma"),
        "lz" => Some("--lzip"),
        _ => None,
    }
}

/// fstab mapping the OS label to / and the grub_cfg label to /grub.
/// Tab-separated, six columns, header comment rows.
pub fn fstab_contents(os_label: &str, os_fstype: &str, grub_label: &str, grub_fstype: &str) -> String {
    let rows: Vec<[String; 6]> = vec![
        [
            "# <filesystem>".into(),
            "<mnt>".into(),
            "<type>".into(),
            "<opts>".into(),
            "<dump>".into(),
            "<pass>".into(),
        ],
        [
            format!("LABEL={}", os_label),
            "/".into(),
            os_fstype.into(),
            FSTAB_OPTS.into(),
            "0".into(),
            "1".into(),
        ],
        [
            format!("LABEL={}", grub_label),
            "/grub".into(),
            grub_fstype.into(),
            FSTAB_OPTS.into(),
            "0".into(),
            "1".into(),
        ],
    ];

    let mut out = String::from("# This file is autogenerated\n");
    for row in rows {
        out.push_str(&row.join("\t"));
        out.push('\n');
    }
    out
}

/// Write a file and flush it through to the OS before returning.
pub fn write_file_synced(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;
    let file = fs::File::open(path)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// Parse fstab text back into mountpoint -> (spec, fstype).
    fn parse_fstab(text: &str) -> HashMap<String, (String, String)> {
        text.lines()
            .filter(|line| !line.starts_with('#') && !line.is_empty())
            .map(|line| {
                let fields: Vec<&str> = line.split('\t').collect();
                assert_eq!(fields.len(), 6, "expected 6 columns in: {line}");
                (
                    fields[1].to_owned(),
                    (fields[0].to_owned(), fields[2].to_owned()),
                )
            })
            .collect()
    }

    #[test]
    fn fstab_round_trips_mounts_and_types() {
        let text = fstab_contents("OS", "ext4", "GRUB_CFG", "ext4");
        let parsed = parse_fstab(&text);
        assert_eq!(
            parsed.get("/"),
            Some(&("LABEL=OS".to_owned(), "ext4".to_owned()))
        );
        assert_eq!(
            parsed.get("/grub"),
            Some(&("LABEL=GRUB_CFG".to_owned(), "ext4".to_owned()))
        );
    }

    #[test]
    fn fstab_uses_conservative_mount_options() {
        let text = fstab_contents("OS", "ext4", "GRUB_CFG", "ext4");
        for line in text.lines().filter(|l| l.starts_with("LABEL=")) {
            assert!(line.contains("errors=remount-ro"));
        }
    }

    #[test]
    fn compression_flag_by_extension() {
        let cases = [
            ("rootfs.tar", None),
            ("rootfs.tar.gz", Some("--gzip")),
            ("rootfs.tgz", Some("--gzip")),
            ("rootfs.tar.bz2", Some("--bzip2")),
            ("rootfs.tar.xz", Some("--xz")),
            ("rootfs.tar.lzma", Some("--lzma")),
            ("rootfs.tar.lz", Some("--lzip")),
        ];
        for (name, expected) in cases {
            assert_eq!(
                compression_flag(&PathBuf::from(name)),
                expected,
                "for {name}"
            );
        }
    }

    #[test]
    fn write_file_synced_writes_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fstab");
        write_file_synced(&path, "LABEL=OS\t/\text4\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "LABEL=OS\t/\text4\n");
    }
}
