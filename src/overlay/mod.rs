//! Overlay archives: the extra-data and cache trees injected into the image.
//!
//! Overlays are tar archives, optionally zstd-compressed. Entries keep
//! archive order; later entries for the same path win when merged.

mod merge;

pub use merge::{merge, resolve_conflicts, PopulatedFilesystem};

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::archive::{read_with_retry, ArchiveError};
use crate::error::Result;
use crate::profile::OverlayTarget;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Which of the two supplementary archives an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayOrigin {
    ExtraData,
    Cache,
}

impl OverlayOrigin {
    /// Partition tag this origin is merged into.
    pub fn target(self) -> OverlayTarget {
        match self {
            Self::ExtraData => OverlayTarget::ExtData,
            Self::Cache => OverlayTarget::Cache,
        }
    }
}

impl fmt::Display for OverlayOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExtraData => "extra-data",
            Self::Cache => "cache",
        })
    }
}

/// What an overlay entry creates. Links and device nodes are passed through as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink { target: String },
    Hardlink { target: String },
    CharDevice { major: u32, minor: u32 },
    BlockDevice { major: u32, minor: u32 },
    Fifo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    /// Relative path without leading `/` or `./`.
    pub path: String,
    pub kind: EntryKind,
    pub content: Vec<u8>,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
}

impl OverlayEntry {
    pub fn file(path: impl Into<String>, content: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            content: content.into(),
            mode,
            uid: 0,
            gid: 0,
            mtime: 0,
        }
    }

    pub fn directory(path: impl Into<String>, mode: u32) -> Self {
        Self {
            kind: EntryKind::Directory,
            ..Self::file(path, Vec::new(), mode)
        }
    }

    pub fn owned_by(mut self, uid: u64, gid: u64) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }
}

/// All entries of one overlay archive.
#[derive(Debug, Clone)]
pub struct OverlaySet {
    pub origin: OverlayOrigin,
    pub source: PathBuf,
    pub entries: Vec<OverlayEntry>,
}

impl OverlaySet {
    pub fn load(origin: OverlayOrigin, path: &Path) -> Result<Self> {
        let entries = read(path)?;
        info!(
            "Read {} {} overlay entries from {}",
            entries.len(),
            origin,
            path.display()
        );
        Ok(Self {
            origin,
            source: path.to_path_buf(),
            entries,
        })
    }

    pub fn content_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.content.len() as u64).sum()
    }
}

/// Read every entry of an overlay archive, in archive order.
pub fn read(path: &Path) -> Result<Vec<OverlayEntry>> {
    read_with_retry(path, || read_archive(path))
}

fn read_archive(path: &Path) -> std::result::Result<Vec<OverlayEntry>, ArchiveError> {
    let mut reader = BufReader::new(File::open(path)?);
    if reader.fill_buf()?.starts_with(&ZSTD_MAGIC) {
        debug!("{}: zstd-compressed tar", path.display());
        read_entries(zstd::stream::Decoder::with_buffer(reader)?)
    } else {
        read_entries(reader)
    }
}

fn read_entries<R: Read>(reader: R) -> std::result::Result<Vec<OverlayEntry>, ArchiveError> {
    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = String::from_utf8(entry.path_bytes().into_owned())
            .map_err(|_| ArchiveError::Format("entry path is not UTF-8".into()))?;
        let Some(path) = normalize_path(&raw_path).map_err(ArchiveError::Format)? else {
            continue;
        };

        let header = entry.header();
        let link_target = || -> std::result::Result<String, ArchiveError> {
            let target = entry
                .link_name_bytes()
                .ok_or_else(|| ArchiveError::Format(format!("{}: link without target", path)))?;
            String::from_utf8(target.into_owned())
                .map_err(|_| ArchiveError::Format(format!("{}: link target is not UTF-8", path)))
        };
        let device = || -> std::result::Result<(u32, u32), ArchiveError> {
            Ok((
                header.device_major()?.unwrap_or(0),
                header.device_minor()?.unwrap_or(0),
            ))
        };

        let kind = match header.entry_type() {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::File,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink => EntryKind::Symlink {
                target: link_target()?,
            },
            tar::EntryType::Link => {
                let target = normalize_path(&link_target()?)
                    .map_err(ArchiveError::Format)?
                    .ok_or_else(|| ArchiveError::Format(format!("{}: hard link to root", path)))?;
                EntryKind::Hardlink { target }
            }
            tar::EntryType::Char => {
                let (major, minor) = device()?;
                EntryKind::CharDevice { major, minor }
            }
            tar::EntryType::Block => {
                let (major, minor) = device()?;
                EntryKind::BlockDevice { major, minor }
            }
            tar::EntryType::Fifo => EntryKind::Fifo,
            other => {
                debug!("{}: skipping {:?} entry", path, other);
                continue;
            }
        };

        let old = header.as_old();
        let mode = numeric_field(&path, "mode", &old.mode, || header.mode())?;
        let uid = numeric_field(&path, "uid", &old.uid, || header.uid())?;
        let gid = numeric_field(&path, "gid", &old.gid, || header.gid())?;
        let mtime = numeric_field(&path, "mtime", &old.mtime, || header.mtime())?;

        let mut content = Vec::new();
        if kind == EntryKind::File {
            entry.read_to_end(&mut content)?;
        }

        out.push(OverlayEntry {
            path,
            kind,
            content,
            mode,
            uid,
            gid,
            mtime,
        });
    }

    Ok(out)
}

/// A numeric header field; blank (all NUL or space) reads as zero.
fn numeric_field<T: Default>(
    path: &str,
    name: &str,
    raw: &[u8],
    parse: impl FnOnce() -> std::io::Result<T>,
) -> std::result::Result<T, ArchiveError> {
    if raw.iter().all(|b| *b == 0 || *b == b' ') {
        return Ok(T::default());
    }
    parse().map_err(|e| ArchiveError::Format(format!("{}: bad {} field: {}", path, name, e)))
}

/// Strip leading `/` and `./`, collapse `.` segments, and reject `..`.
///
/// Returns `None` for the archive root itself.
fn normalize_path(raw: &str) -> std::result::Result<Option<String>, String> {
    let mut parts = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(format!("'{}' escapes the overlay root", raw)),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    fn header(kind: tar::EntryType, size: u64, mode: u32) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_size(size);
        header.set_mode(mode);
        header.set_uid(1000);
        header.set_gid(1000);
        header.set_mtime(0);
        header.set_cksum();
        header
    }

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut root = header(tar::EntryType::Directory, 0, 0o755);
        root.as_old_mut().name[..2].copy_from_slice(b"./");
        root.set_cksum();
        builder.append(&root, std::io::empty()).unwrap();
        let mut h = header(tar::EntryType::Directory, 0, 0o755);
        builder.append_data(&mut h, "./maps", std::io::empty()).unwrap();
        let mut h = header(tar::EntryType::Regular, 5, 0o644);
        builder.append_data(&mut h, "./maps/a.bin", &b"first"[..]).unwrap();

        let mut h = header(tar::EntryType::Symlink, 0, 0o777);
        h.set_link_name("a.bin").unwrap();
        h.set_cksum();
        builder.append_data(&mut h, "maps/latest", std::io::empty()).unwrap();

        let mut h = header(tar::EntryType::Char, 0, 0o600);
        h.set_device_major(1).unwrap();
        h.set_device_minor(3).unwrap();
        h.set_cksum();
        builder.append_data(&mut h, "dev/null", std::io::empty()).unwrap();

        let mut h = header(tar::EntryType::Regular, 6, 0o600);
        builder.append_data(&mut h, "maps/a.bin", &b"second"[..]).unwrap();

        builder.into_inner().unwrap()
    }

    #[test]
    fn reads_entries_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("extdata.tar");
        std::fs::write(&path, sample_tar()).unwrap();

        let entries = read(&path).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["maps", "maps/a.bin", "maps/latest", "dev/null", "maps/a.bin"]);

        assert_eq!(entries[1].content, b"first");
        assert_eq!(entries[1].mode, 0o644);
        assert_eq!((entries[1].uid, entries[1].gid), (1000, 1000));
        assert_eq!(
            entries[2].kind,
            EntryKind::Symlink {
                target: "a.bin".into()
            }
        );
        assert_eq!(entries[3].kind, EntryKind::CharDevice { major: 1, minor: 3 });
        assert_eq!(entries[4].content, b"second");
    }

    #[test]
    fn reads_zstd_compressed_archives() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.tar.zst");
        let compressed = zstd::stream::encode_all(&sample_tar()[..], 3).unwrap();
        std::fs::write(&path, compressed).unwrap();

        assert_eq!(read(&path).unwrap().len(), 5);
    }

    #[test]
    fn parent_segments_are_rejected() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut h = header(tar::EntryType::Regular, 1, 0o644);
        // set_path refuses "..", so write the name field directly.
        h.as_old_mut().name[..9].copy_from_slice(b"../escape");
        h.set_cksum();
        builder.append(&h, &b"x"[..]).unwrap();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.tar");
        std::fs::write(&path, builder.into_inner().unwrap()).unwrap();

        let err = read(&path).unwrap_err();
        assert!(matches!(err, Error::PackageFormat { .. }));
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn blank_owner_fields_read_as_zero() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut h = header(tar::EntryType::Regular, 2, 0o644);
        h.as_old_mut().uid = [0; 8];
        h.as_old_mut().gid = *b"       \0";
        h.set_cksum();
        builder.append_data(&mut h, "owned/by/nobody", &b"ok"[..]).unwrap();

        let entries = read_entries(&builder.into_inner().unwrap()[..]).unwrap();
        assert_eq!((entries[0].uid, entries[0].gid), (0, 0));
        assert_eq!(entries[0].mode, 0o644);
        assert_eq!(entries[0].content, b"ok");
    }

    #[test]
    fn garbage_numeric_field_is_rejected() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut h = header(tar::EntryType::Regular, 1, 0o644);
        h.as_old_mut().mtime = *b"not-a-number";
        h.set_cksum();
        builder.append_data(&mut h, "stamp", &b"x"[..]).unwrap();

        let err = read_entries(&builder.into_inner().unwrap()[..]).unwrap_err();
        assert!(matches!(err, ArchiveError::Format(msg) if msg.contains("mtime")));
    }

    #[test]
    fn unreadable_archive_is_malformed() {
        let err = read(Path::new("/nonexistent/extdata.tar")).unwrap_err();
        assert_eq!(err.kind(), "PackageFormat");
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path("/a/b").unwrap().as_deref(), Some("a/b"));
        assert_eq!(normalize_path("./a/./b/").unwrap().as_deref(), Some("a/b"));
        assert_eq!(normalize_path("./").unwrap(), None);
        assert!(normalize_path("a/../../b").is_err());
    }

    #[test]
    fn origins_map_to_targets() {
        assert_eq!(OverlayOrigin::ExtraData.target(), OverlayTarget::ExtData);
        assert_eq!(OverlayOrigin::Cache.target(), OverlayTarget::Cache);
    }
}
