//! Creating ext4 filesystems inside image regions.

use std::io;
use std::path::Path;

use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::overlay::{EntryKind, OverlayEntry};
use crate::process::Cmd;
use crate::profile::FilesystemParams;

/// Where and how to create one filesystem.
#[derive(Debug, Clone, Copy)]
pub struct FilesystemRegion<'a> {
    pub partition: &'a str,
    /// Byte offset inside the image.
    pub offset: u64,
    pub size: u64,
    pub params: &'a FilesystemParams,
}

/// Creates a filesystem in an image region and fills it with entries.
pub trait FilesystemWriter: Send + Sync {
    fn populate(
        &self,
        image: &Path,
        region: &FilesystemRegion<'_>,
        entries: &[&OverlayEntry],
    ) -> Result<()>;

    /// Host programs this writer needs.
    fn required_programs(&self) -> Vec<String> {
        Vec::new()
    }
}

/// `mke2fs -d` fed a staging tar, writing directly at the region offset.
#[derive(Debug, Clone)]
pub struct Mke2fs {
    program: String,
}

impl Mke2fs {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Full argument list for one region.
    pub fn args(&self, image: &Path, region: &FilesystemRegion<'_>, root: &Path) -> Vec<String> {
        let params = region.params;
        let uuid = stable_uuid(region.partition);

        let mut args: Vec<String> = vec!["-F".into(), "-F".into(), "-t".into(), "ext4".into()];
        args.extend(["-d".into(), root.to_string_lossy().into_owned()]);
        if let Some(bs) = params.block_size {
            args.extend(["-b".into(), bs.to_string()]);
        }
        if let Some(is) = params.inode_size {
            args.extend(["-I".into(), is.to_string()]);
        }
        if let Some(lm) = params.last_mounted {
            args.extend(["-M".into(), lm.into()]);
        }
        if let Some(label) = params.label {
            args.extend(["-L".into(), label.into()]);
        }
        args.extend(["-U".into(), uuid.clone()]);
        if let Some(features) = params.features {
            args.extend(["-O".into(), features.into()]);
        }

        let mut extended = vec![format!("offset={}", region.offset), format!("hash_seed={}", uuid)];
        if let Some(e) = params.extended_options {
            extended.insert(0, e.to_string());
        }
        args.extend(["-E".into(), extended.join(",")]);

        if let Some(j) = params.journal_options {
            args.extend(["-J".into(), j.into()]);
        }

        let fs_size = match params.block_size {
            Some(bs) => (region.size / bs as u64).to_string(),
            None => format!("{}k", region.size / 1024),
        };
        args.extend([
            "--".into(),
            image.to_string_lossy().into_owned(),
            fs_size,
        ]);
        args
    }
}

impl Default for Mke2fs {
    fn default() -> Self {
        Self::new("mke2fs")
    }
}

impl FilesystemWriter for Mke2fs {
    fn populate(
        &self,
        image: &Path,
        region: &FilesystemRegion<'_>,
        entries: &[&OverlayEntry],
    ) -> Result<()> {
        let scratch_dir = image.parent().unwrap_or_else(|| Path::new("."));
        let staging = tempfile::Builder::new()
            .prefix(".pioneer-overlay-")
            .suffix(".tar")
            .tempfile_in(scratch_dir)
            .map_err(|e| Error::disk_write(region.partition, format!("staging archive: {}", e)))?;
        write_staging_tar(&staging, entries)
            .map_err(|e| Error::disk_write(region.partition, format!("staging archive: {}", e)))?;

        // Superblock timestamps follow the newest entry so rebuilds are identical.
        let timestamp = entries.iter().map(|e| e.mtime).max().unwrap_or(0).max(1);

        Cmd::new(&self.program)
            .args(self.args(image, region, staging.path()))
            .env("E2FSPROGS_FAKE_TIME", timestamp.to_string())
            .error_msg(format!("mke2fs failed to create '{}'", region.partition))
            .run()
            .map_err(|e| Error::tool(region.partition, e))?;
        Ok(())
    }

    fn required_programs(&self) -> Vec<String> {
        vec![self.program.clone()]
    }
}

/// Namespace for partition filesystem UUIDs.
const UUID_NAMESPACE: Uuid = Uuid::from_u128(0x5f0c_2b8e_4a1d_4c7b_9e36_0d2a_7c41_b958);

/// Filesystem UUID derived from the partition name (name-based, version 5).
pub fn stable_uuid(partition: &str) -> String {
    Uuid::new_v5(&UUID_NAMESPACE, partition.as_bytes())
        .hyphenated()
        .to_string()
}

fn entry_header(entry: &OverlayEntry, kind: tar::EntryType, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(entry.mode);
    header.set_uid(entry.uid);
    header.set_gid(entry.gid);
    header.set_mtime(entry.mtime);
    header
}

/// Write `entries`, in order, as a plain tar archive.
pub fn write_staging_tar(out: &NamedTempFile, entries: &[&OverlayEntry]) -> io::Result<()> {
    let mut builder = tar::Builder::new(out.as_file());
    builder.follow_symlinks(false);

    for entry in entries {
        match &entry.kind {
            EntryKind::File => {
                let mut header = entry_header(entry, tar::EntryType::Regular, entry.content.len() as u64);
                builder.append_data(&mut header, &entry.path, entry.content.as_slice())?;
            }
            EntryKind::Directory => {
                let mut header = entry_header(entry, tar::EntryType::Directory, 0);
                builder.append_data(&mut header, &entry.path, io::empty())?;
            }
            EntryKind::Symlink { target } => {
                let mut header = entry_header(entry, tar::EntryType::Symlink, 0);
                builder.append_link(&mut header, &entry.path, target)?;
            }
            EntryKind::Hardlink { target } => {
                let mut header = entry_header(entry, tar::EntryType::Link, 0);
                builder.append_link(&mut header, &entry.path, target)?;
            }
            EntryKind::CharDevice { major, minor } | EntryKind::BlockDevice { major, minor } => {
                let kind = if matches!(entry.kind, EntryKind::CharDevice { .. }) {
                    tar::EntryType::Char
                } else {
                    tar::EntryType::Block
                };
                let mut header = entry_header(entry, kind, 0);
                header.set_device_major(*major)?;
                header.set_device_minor(*minor)?;
                builder.append_data(&mut header, &entry.path, io::empty())?;
            }
            EntryKind::Fifo => {
                let mut header = entry_header(entry, tar::EntryType::Fifo, 0);
                builder.append_data(&mut header, &entry.path, io::empty())?;
            }
        }
    }

    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: FilesystemParams = FilesystemParams {
        block_size: Some(1024),
        inode_size: Some(128),
        last_mounted: None,
        label: Some("CACHE"),
        features: Some("^extent"),
        extended_options: Some("lazy_itable_init=0,nodiscard"),
        journal_options: None,
    };

    #[test]
    fn mke2fs_arguments() {
        let region = FilesystemRegion {
            partition: "cache",
            offset: 3_311_617 * 512,
            size: 262_143 * 512,
            params: &PARAMS,
        };
        let args = Mke2fs::default().args(Path::new("out.img"), &region, Path::new("root.tar"));
        let joined = args.join(" ");

        assert!(joined.starts_with("-F -F -t ext4 -d root.tar -b 1024 -I 128 -L CACHE -U "));
        assert!(joined.contains("-O ^extent"));
        assert!(joined.contains(&format!(
            "-E lazy_itable_init=0,nodiscard,offset={},hash_seed=",
            3_311_617u64 * 512
        )));
        assert!(!joined.contains("-J"));
        assert_eq!(&args[args.len() - 3..], ["--", "out.img", "131071"]);
    }

    #[test]
    fn uuid_is_stable_and_well_formed() {
        let a = stable_uuid("extdata");
        assert_eq!(a, stable_uuid("extdata"));
        assert_ne!(a, stable_uuid("cache"));
        assert_eq!(a, "6f439f63-5702-51fb-bf76-9f603daa3958");

        let parsed = Uuid::parse_str(&stable_uuid("cache")).unwrap();
        assert_eq!(parsed.get_version_num(), 5);
    }

    #[test]
    fn staging_tar_keeps_entry_order_and_metadata() {
        let entries = vec![
            OverlayEntry::directory("maps", 0o755),
            OverlayEntry::file("maps/a.bin", "data", 0o640).owned_by(1000, 1001),
            OverlayEntry {
                kind: EntryKind::Symlink {
                    target: "a.bin".into(),
                },
                ..OverlayEntry::file("maps/latest", Vec::new(), 0o777)
            },
        ];
        let refs: Vec<&OverlayEntry> = entries.iter().collect();
        let staging = NamedTempFile::new().unwrap();
        write_staging_tar(&staging, &refs).unwrap();

        let mut archive = tar::Archive::new(std::fs::File::open(staging.path()).unwrap());
        let read: Vec<(String, u32, u64)> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let h = e.header();
                (
                    e.path().unwrap().to_string_lossy().trim_end_matches('/').to_string(),
                    h.mode().unwrap(),
                    h.uid().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            read,
            [
                ("maps".to_string(), 0o755, 0),
                ("maps/a.bin".to_string(), 0o640, 1000),
                ("maps/latest".to_string(), 0o777, 0),
            ]
        );
    }

    #[test]
    fn missing_mke2fs_is_a_disk_write_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let image = dir.path().join("out.img");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();
        let region = FilesystemRegion {
            partition: "cache",
            offset: 0,
            size: 4096,
            params: &PARAMS,
        };
        let err = Mke2fs::new("nonexistent_mke2fs_12345")
            .populate(&image, &region, &[])
            .unwrap_err();
        assert!(matches!(err, Error::DiskWrite { ref partition, .. } if partition == "cache"));
    }
}
