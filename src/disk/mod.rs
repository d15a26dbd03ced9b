//! Disk image assembly.
//!
//! The assembler creates a zero-filled image at the profile's capacity,
//! writes the partition table once, then places every sourced extent at
//! its offset. Extents are disjoint, so placement runs on a bounded worker
//! pool with each worker writing only its own byte range.

pub mod filesystem;
pub mod image;
pub mod table;

pub use filesystem::{FilesystemRegion, FilesystemWriter, Mke2fs};
pub use image::{ImageHandle, Region};
pub use table::{PartitionTable, PartitionTableWriter, Sfdisk};

use std::path::Path;

use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::package::{Encoding, FirmwarePackage};
use crate::profile::{BlobSource, GenerationProfile, PartitionKind, PartitionSpec, Section};
use crate::sparse::{self, Sink, SparseCodec, SparseImage};

/// Record of one extent written into the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub name: String,
    pub start: u64,
    pub size: u64,
    /// Bytes covered by the source; the rest of the extent stays zero.
    pub written: u64,
    pub encoding: Option<Encoding>,
    /// SHA-256 of the source bytes, before any expansion.
    pub sha256: Option<String>,
}

enum Payload<'a> {
    Bytes(&'a [u8]),
    Generated(Vec<u8>),
    Sparse(&'a [u8]),
    Zero,
}

struct Job<'a> {
    spec: &'a PartitionSpec,
    payload: Payload<'a>,
}

impl Job<'_> {
    fn source(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(b) | Payload::Sparse(b) => Some(*b),
            Payload::Generated(b) => Some(b.as_slice()),
            Payload::Zero => None,
        }
    }

    fn encoding(&self) -> Option<Encoding> {
        match self.payload {
            Payload::Bytes(_) | Payload::Generated(_) => Some(Encoding::Raw),
            Payload::Sparse(_) => Some(Encoding::Sparse),
            Payload::Zero => None,
        }
    }

    /// Bytes physically written during placement.
    fn write_cost(&self) -> Result<u64> {
        Ok(match &self.payload {
            Payload::Bytes(b) => b.len() as u64,
            Payload::Generated(b) => b.len() as u64,
            Payload::Sparse(b) => SparseImage::parse(b)?.written_size(),
            Payload::Zero => 0,
        })
    }
}

/// Resolve every extent to its bytes, checking presence and size.
fn plan<'a>(profile: &'a GenerationProfile, package: &'a FirmwarePackage) -> Result<Vec<Job<'a>>> {
    let mut jobs = Vec::with_capacity(profile.partitions.len());

    for spec in &profile.partitions {
        let payload = match spec.source {
            None => {
                if spec.is_overlay_only() {
                    debug!("{}: left for the overlay merger", spec.name);
                }
                Payload::Zero
            }
            Some(BlobSource::PartInfo) => Payload::Generated(profile.part_info.to_block()),
            Some(BlobSource::Image { image, section }) => {
                let blob = package.get(image).ok_or_else(|| Error::PartitionMissing {
                    partition: spec.name.clone(),
                    expected: profile
                        .image_path(image)
                        .unwrap_or(image.name())
                        .to_string(),
                })?;
                match section {
                    Section::Header => Payload::Bytes(&blob.header),
                    Section::Content
                        if spec.kind == PartitionKind::Sparse && blob.encoding == Encoding::Sparse =>
                    {
                        Payload::Sparse(&blob.content)
                    }
                    Section::Content => Payload::Bytes(&blob.content),
                    Section::ContentRange { offset, len } => {
                        let start = offset as usize;
                        let end = match len {
                            Some(len) => start + len as usize,
                            None => blob.content.len(),
                        };
                        let bytes = blob.content.get(start..end).ok_or_else(|| {
                            Error::package_format(
                                &package.source,
                                format!(
                                    "{}: content is {} bytes, '{}' needs {:#x}..{:#x}",
                                    blob.archive_path,
                                    blob.content.len(),
                                    spec.name,
                                    start,
                                    end
                                ),
                            )
                        })?;
                        Payload::Bytes(bytes)
                    }
                }
            }
        };

        let len = match &payload {
            Payload::Bytes(b) => b.len() as u64,
            Payload::Generated(b) => b.len() as u64,
            Payload::Sparse(b) => sparse::declared_size(b)?,
            Payload::Zero => 0,
        };
        if len > spec.size {
            return Err(Error::disk_write(
                &spec.name,
                format!("{} bytes do not fit the {} byte extent", len, spec.size),
            ));
        }

        jobs.push(Job { spec, payload });
    }

    Ok(jobs)
}

/// Bytes placement will write for `package` under `profile`.
pub fn required_space(profile: &GenerationProfile, package: &FirmwarePackage) -> Result<u64> {
    plan(profile, package)?
        .iter()
        .map(Job::write_cost)
        .sum()
}

/// An image with every sourced extent in place, not yet published.
#[derive(Debug)]
pub struct AssembledImage {
    pub image: ImageHandle,
    pub placements: Vec<Placement>,
}

/// Builds the image from a profile and a package.
pub struct Assembler<'a> {
    pub table: &'a dyn PartitionTableWriter,
    pub codec: &'a dyn SparseCodec,
    /// Placement worker count.
    pub jobs: usize,
}

impl Assembler<'_> {
    /// Create the image in `dir`, write the table, and place all extents.
    pub fn assemble(
        &self,
        profile: &GenerationProfile,
        package: &FirmwarePackage,
        dir: &Path,
    ) -> Result<AssembledImage> {
        let jobs = plan(profile, package)?;

        let image = ImageHandle::create(dir, profile.capacity)?;
        debug!("Image {} ({} bytes)", image.path().display(), profile.capacity);

        let table = PartitionTable::from_profile(profile)?;
        self.table.write_table(image.path(), &table)?;
        info!("Wrote partition table ({} entries)", table.entries.len());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs.max(1))
            .build()
            .map_err(|e| Error::disk_write("image", format!("worker pool: {}", e)))?;
        let results: Vec<Result<Placement>> =
            pool.install(|| jobs.par_iter().map(|job| self.place(&image, job)).collect());
        let placements = results.into_iter().collect::<Result<Vec<_>>>()?;

        let written: u64 = placements.iter().map(|p| p.written).sum();
        info!(
            "Placed {} extents ({} bytes) with {} workers",
            placements.iter().filter(|p| p.written > 0).count(),
            written,
            self.jobs.max(1)
        );

        Ok(AssembledImage { image, placements })
    }

    fn place(&self, image: &ImageHandle, job: &Job<'_>) -> Result<Placement> {
        let spec = job.spec;
        let mut region = image.region(&spec.name, spec.start, spec.size);

        let written = match &job.payload {
            Payload::Bytes(b) => {
                region.write_at(0, b)?;
                b.len() as u64
            }
            Payload::Generated(b) => {
                region.write_at(0, b)?;
                b.len() as u64
            }
            Payload::Sparse(b) => self.codec.expand_into(b, &mut region)?,
            Payload::Zero => 0,
        };
        if written > 0 {
            debug!("{} @ {:#x}: {} bytes", spec.name, spec.start, written);
        }

        Ok(Placement {
            name: spec.name.clone(),
            start: spec.start,
            size: spec.size,
            written,
            encoding: job.encoding(),
            sha256: job.source().map(|b| format!("{:x}", Sha256::digest(b))),
        })
    }
}
