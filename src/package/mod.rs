//! Firmware payload extraction.
//!
//! The payload is a zip of PRG images. Every PRG is a 0x200-byte header
//! followed by the partition content, which may be sparse-encoded.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive::{read_with_retry, ArchiveError};
use crate::error::Result;
use crate::profile::{GenerationProfile, ImageId, IMAGE_HEADER_SIZE};
use crate::sparse;

/// What to do with a `.PRG` entry the profile does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UnknownEntryPolicy {
    Ignore,
    #[default]
    Warn,
    Error,
}

/// How an image's content is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Raw,
    Sparse,
}

/// One vendor image, split into header and content.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub archive_path: String,
    pub header: Vec<u8>,
    pub content: Vec<u8>,
    pub encoding: Encoding,
}

impl FirmwareImage {
    /// Split a PRG file at the header boundary and detect the content encoding.
    pub fn from_prg(archive_path: impl Into<String>, mut bytes: Vec<u8>) -> std::result::Result<Self, String> {
        let archive_path = archive_path.into();
        let header_len = IMAGE_HEADER_SIZE as usize;
        if bytes.len() < header_len {
            return Err(format!(
                "{} is {} bytes, shorter than its {} byte header",
                archive_path,
                bytes.len(),
                header_len
            ));
        }
        let content = bytes.split_off(header_len);
        let encoding = if sparse::is_sparse(&content) {
            Encoding::Sparse
        } else {
            Encoding::Raw
        };
        Ok(Self {
            archive_path,
            header: bytes,
            content,
            encoding,
        })
    }
}

/// The images pulled out of a payload. Read-only after extraction.
#[derive(Debug, Clone)]
pub struct FirmwarePackage {
    pub source: PathBuf,
    pub images: BTreeMap<ImageId, FirmwareImage>,
}

impl FirmwarePackage {
    pub fn get(&self, image: ImageId) -> Option<&FirmwareImage> {
        self.images.get(&image)
    }

    /// Total content bytes across all images.
    pub fn content_bytes(&self) -> u64 {
        self.images.values().map(|i| i.content.len() as u64).sum()
    }
}

fn is_prg(name: &str) -> bool {
    name.rsplit('.')
        .next()
        .map(|ext| ext.eq_ignore_ascii_case("prg"))
        .unwrap_or(false)
        && name.contains('.')
}

/// Read the payload zip and collect the images `profile` consumes.
pub fn extract(
    payload: &Path,
    profile: &GenerationProfile,
    policy: UnknownEntryPolicy,
) -> Result<FirmwarePackage> {
    let images = read_with_retry(payload, || read_images(payload, profile, policy))?;

    info!(
        "Extracted {} images from {}",
        images.len(),
        payload.display()
    );
    Ok(FirmwarePackage {
        source: payload.to_path_buf(),
        images,
    })
}

fn read_images(
    payload: &Path,
    profile: &GenerationProfile,
    policy: UnknownEntryPolicy,
) -> std::result::Result<BTreeMap<ImageId, FirmwareImage>, ArchiveError> {
    let file = File::open(payload)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;
    let mut images = BTreeMap::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();

        let Some(id) = profile
            .images
            .iter()
            .find(|(_, path)| *path == name)
            .map(|(id, _)| *id)
        else {
            if is_prg(&name) {
                match policy {
                    UnknownEntryPolicy::Ignore => {}
                    UnknownEntryPolicy::Warn => {
                        warn!("{}: not used by {}, skipping", name, profile.label())
                    }
                    UnknownEntryPolicy::Error => {
                        return Err(ArchiveError::Format(format!(
                            "unexpected image '{}' for {}",
                            name,
                            profile.label()
                        )));
                    }
                }
            } else {
                debug!("{}: housekeeping entry, skipping", name);
            }
            continue;
        };

        if images.contains_key(&id) {
            return Err(ArchiveError::Format(format!("duplicate entry '{}'", name)));
        }

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        let image = FirmwareImage::from_prg(name, bytes).map_err(ArchiveError::Format)?;
        debug!(
            "{} ({}): {} content bytes, {:?}",
            id,
            image.archive_path,
            image.content.len(),
            image.encoding
        );
        images.insert(id, image);
    }

    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::profile::resolve;
    use crate::sparse::{encode, EncodeOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn prg(content: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x5Au8; IMAGE_HEADER_SIZE as usize];
        bytes.extend_from_slice(content);
        bytes
    }

    fn write_zip(dir: &TempDir, entries: &[(&str, Vec<u8>)]) -> PathBuf {
        let path = dir.path().join("payload.zip");
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        for (name, bytes) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn splits_header_and_detects_encoding() {
        let dir = TempDir::new().unwrap();
        let profile = resolve("AVH19", 1).unwrap();
        let sparse_content = encode(&vec![3u8; 8192], EncodeOptions::default()).unwrap();
        let payload = write_zip(
            &dir,
            &[
                ("AVH19/BOOT/PJ190BOT.PRG", prg(b"kernel")),
                ("AVH19/PLATFORM/PJ190PLT.PRG", prg(&sparse_content)),
                ("AVH19/README.TXT", b"notes".to_vec()),
            ],
        );

        let package = extract(&payload, &profile, UnknownEntryPolicy::Error).unwrap();
        assert_eq!(package.images.len(), 2);

        let boot = package.get(ImageId::Boot).unwrap();
        assert_eq!(boot.header.len(), 0x200);
        assert_eq!(boot.content, b"kernel");
        assert_eq!(boot.encoding, Encoding::Raw);

        let platform = package.get(ImageId::Platform).unwrap();
        assert_eq!(platform.encoding, Encoding::Sparse);
        assert_eq!(platform.content, sparse_content);
    }

    #[test]
    fn other_variant_images_follow_policy() {
        let dir = TempDir::new().unwrap();
        let profile = resolve("AVH19", 1).unwrap();
        let payload = write_zip(
            &dir,
            &[
                ("AVH19/SNAPSHOT/SNAPSHOT_1.PRG", prg(b"one")),
                ("AVH19/SNAPSHOT/SNAPSHOT_2.PRG", prg(b"two")),
            ],
        );

        let package = extract(&payload, &profile, UnknownEntryPolicy::Warn).unwrap();
        assert_eq!(package.get(ImageId::Snapshot).unwrap().content, b"one");

        let err = extract(&payload, &profile, UnknownEntryPolicy::Error).unwrap_err();
        assert!(matches!(err, Error::PackageFormat { .. }));
        assert!(err.to_string().contains("SNAPSHOT_2.PRG"));
    }

    #[test]
    fn short_image_is_malformed() {
        let dir = TempDir::new().unwrap();
        let profile = resolve("AVH19", 1).unwrap();
        let payload = write_zip(&dir, &[("AVH19/BOOT/PJ190BOT.PRG", vec![0u8; 100])]);

        let err = extract(&payload, &profile, UnknownEntryPolicy::Warn).unwrap_err();
        assert_eq!(err.kind(), "PackageFormat");
    }

    #[test]
    fn corrupt_container_is_malformed() {
        let dir = TempDir::new().unwrap();
        let profile = resolve("AVH19", 1).unwrap();
        let payload = dir.path().join("payload.zip");
        std::fs::write(&payload, b"this is not a zip archive").unwrap();

        let err = extract(&payload, &profile, UnknownEntryPolicy::Warn).unwrap_err();
        assert!(matches!(err, Error::PackageFormat { ref path, .. } if path == &payload));
    }

    #[test]
    fn missing_payload_is_malformed() {
        let profile = resolve("AVH19", 1).unwrap();
        let err = extract(Path::new("/nonexistent/payload.zip"), &profile, UnknownEntryPolicy::Warn)
            .unwrap_err();
        assert_eq!(err.kind(), "PackageFormat");
    }

    #[test]
    fn prg_detection_is_case_insensitive() {
        assert!(is_prg("A/B.PRG"));
        assert!(is_prg("a/b.prg"));
        assert!(!is_prg("PRG"));
        assert!(!is_prg("a/b.txt"));
    }
}
