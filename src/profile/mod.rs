//! Generation profiles: the fixed partition geometry of each head-unit generation.
//!
//! A [`GenerationProfile`] is plain data. It is produced by
//! [`registry::resolve`] and never mutated afterwards; every other stage
//! only reads it.

mod part_info;
pub mod registry;

pub use part_info::{PartInfo, PART_INFO_MAGIC, PART_INFO_SIZE};
pub use registry::{all_profiles, generation_codes, resolve};

use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};

/// Sector size used by the partition table.
pub const SECTOR_SIZE: u64 = 512;

/// Size of the header that precedes the content of every vendor image.
pub const IMAGE_HEADER_SIZE: u64 = 0x200;

/// How a partition's bytes are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    /// Copied verbatim from the payload.
    Raw,
    /// Chunk-encoded in the payload; expanded on placement.
    Sparse,
    /// A filesystem, either from the payload or created by the overlay merger.
    Filesystem,
    /// Left zero-filled.
    Empty,
}

/// Tag naming which overlay archive a filesystem partition receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayTarget {
    ExtData,
    Cache,
}

impl fmt::Display for OverlayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExtData => "extdata",
            Self::Cache => "cache",
        })
    }
}

/// Position of a partition in the DOS partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableSlot {
    /// Raw region addressed by the bootloader directly, not in the table.
    Unlisted,
    /// Primary partition 1..=4.
    Primary(u8),
    /// Logical partition inside the extended container.
    Logical,
}

/// The vendor images a payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageId {
    Boot,
    Recovery,
    Platform,
    Snapshot,
    Hibendir,
    Userdata,
    Userapi,
}

impl ImageId {
    pub const ALL: [ImageId; 7] = [
        ImageId::Boot,
        ImageId::Recovery,
        ImageId::Platform,
        ImageId::Snapshot,
        ImageId::Hibendir,
        ImageId::Userdata,
        ImageId::Userapi,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Boot => "boot",
            Self::Recovery => "recovery",
            Self::Platform => "platform",
            Self::Snapshot => "snapshot",
            Self::Hibendir => "hibendir",
            Self::Userdata => "userdata",
            Self::Userapi => "userapi",
        }
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which part of a vendor image a partition takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    /// The fixed-size header.
    Header,
    /// Everything after the header, sparse-expanded if encoded.
    Content,
    /// A byte range of the (raw) content. `len: None` runs to the end.
    ContentRange { offset: u64, len: Option<u64> },
}

/// Where a partition's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobSource {
    Image { image: ImageId, section: Section },
    /// Generated from the profile's [`PartInfo`].
    PartInfo,
}

/// mke2fs parameters for a filesystem partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FilesystemParams {
    pub block_size: Option<u32>,
    pub inode_size: Option<u32>,
    pub last_mounted: Option<&'static str>,
    pub label: Option<&'static str>,
    pub features: Option<&'static str>,
    pub extended_options: Option<&'static str>,
    pub journal_options: Option<&'static str>,
}

/// One extent of the output image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionSpec {
    pub index: usize,
    pub name: String,
    pub start: u64,
    pub size: u64,
    pub kind: PartitionKind,
    pub source: Option<BlobSource>,
    pub table: TableSlot,
    pub overlay_target: Option<OverlayTarget>,
    pub filesystem: Option<FilesystemParams>,
}

impl PartitionSpec {
    /// A region outside the partition table. `index` is assigned on profile construction.
    pub fn new(
        name: impl Into<String>,
        start: u64,
        size: u64,
        kind: PartitionKind,
        source: Option<BlobSource>,
    ) -> Self {
        Self {
            index: 0,
            name: name.into(),
            start,
            size,
            kind,
            source,
            table: TableSlot::Unlisted,
            overlay_target: None,
            filesystem: None,
        }
    }

    pub fn primary(mut self, slot: u8) -> Self {
        self.table = TableSlot::Primary(slot);
        self
    }

    pub fn logical(mut self) -> Self {
        self.table = TableSlot::Logical;
        self
    }

    /// Mark as overlay-only: created from scratch by the overlay merger.
    pub fn overlay(mut self, target: OverlayTarget, params: FilesystemParams) -> Self {
        self.overlay_target = Some(target);
        self.filesystem = Some(params);
        self
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn start_sector(&self) -> u64 {
        self.start / SECTOR_SIZE
    }

    pub fn size_sectors(&self) -> u64 {
        self.size / SECTOR_SIZE
    }

    pub fn is_overlay_only(&self) -> bool {
        self.kind == PartitionKind::Filesystem && self.overlay_target.is_some()
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end()
    }
}

/// Resolved layout for one (generation, variant) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationProfile {
    pub generation: String,
    pub variant: u32,
    /// Total image size in bytes.
    pub capacity: u64,
    /// Primary slot holding the extended container, if any partition is logical.
    pub extended_slot: Option<u8>,
    pub part_info: PartInfo,
    /// Payload archive path of every image this profile consumes.
    pub images: Vec<(ImageId, String)>,
    /// Extents sorted by offset.
    pub partitions: Vec<PartitionSpec>,
}

impl GenerationProfile {
    /// Build a profile, sorting the extents by offset and numbering them.
    pub fn new(
        generation: impl Into<String>,
        variant: u32,
        capacity: u64,
        extended_slot: Option<u8>,
        part_info: PartInfo,
        images: Vec<(ImageId, String)>,
        mut partitions: Vec<PartitionSpec>,
    ) -> Self {
        partitions.sort_by_key(|p| p.start);
        for (index, spec) in partitions.iter_mut().enumerate() {
            spec.index = index;
        }
        Self {
            generation: generation.into(),
            variant,
            capacity,
            extended_slot,
            part_info,
            images,
            partitions,
        }
    }

    /// Display label such as `AVH19/1`.
    pub fn label(&self) -> String {
        format!("{}/{}", self.generation, self.variant)
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn overlay_partition(&self, target: OverlayTarget) -> Option<&PartitionSpec> {
        self.partitions
            .iter()
            .find(|p| p.overlay_target == Some(target))
    }

    pub fn image_path(&self, image: ImageId) -> Option<&str> {
        self.images
            .iter()
            .find(|(id, _)| *id == image)
            .map(|(_, path)| path.as_str())
    }

    /// Images referenced by at least one partition.
    pub fn required_images(&self) -> Vec<ImageId> {
        let mut out: Vec<ImageId> = self
            .partitions
            .iter()
            .filter_map(|p| match p.source {
                Some(BlobSource::Image { image, .. }) => Some(image),
                _ => None,
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Sum of all extent sizes.
    pub fn allocated(&self) -> u64 {
        self.partitions.iter().map(|p| p.size).sum()
    }

    /// Logical partitions, in offset order.
    pub fn logical_partitions(&self) -> impl Iterator<Item = &PartitionSpec> {
        self.partitions
            .iter()
            .filter(|p| p.table == TableSlot::Logical)
    }

    /// Sector range `(start, size)` of the extended container.
    ///
    /// It begins one sector before the first logical partition, which holds
    /// the first EBR, and ends with the last logical partition.
    pub fn extended_extent(&self) -> Option<(u64, u64)> {
        let start = self.logical_partitions().map(|p| p.start_sector()).min()?.checked_sub(1)?;
        let end = self
            .logical_partitions()
            .map(|p| p.start_sector() + p.size_sectors())
            .max()?;
        Some((start, end - start))
    }

    /// Check the geometry invariants: ordered, disjoint, inside capacity,
    /// sector-aligned table entries, and no extent over the MBR or an EBR.
    pub fn validate(&self) -> Result<()> {
        let fail = |name: &str, reason: String| Err(Error::disk_write(name, reason));

        let mut prev: Option<&PartitionSpec> = None;
        for (i, spec) in self.partitions.iter().enumerate() {
            if spec.index != i {
                return fail(&spec.name, format!("index {} at position {}", spec.index, i));
            }
            if spec.size == 0 {
                return fail(&spec.name, "zero-sized extent".into());
            }
            if spec.end() > self.capacity {
                return fail(
                    &spec.name,
                    format!(
                        "ends at {:#x}, beyond capacity {:#x}",
                        spec.end(),
                        self.capacity
                    ),
                );
            }
            if spec.overlaps(0, SECTOR_SIZE) {
                return fail(&spec.name, "covers the MBR sector".into());
            }
            if let Some(p) = prev {
                if p.end() > spec.start {
                    return fail(&spec.name, format!("overlaps '{}'", p.name));
                }
            }
            if spec.table != TableSlot::Unlisted
                && (spec.start % SECTOR_SIZE != 0 || spec.size % SECTOR_SIZE != 0)
            {
                return fail(&spec.name, "table entry is not sector-aligned".into());
            }
            if spec.kind == PartitionKind::Sparse && spec.source.is_none() {
                return fail(&spec.name, "sparse extent without a source".into());
            }
            prev = Some(spec);
        }

        let mut primaries = Vec::new();
        for spec in &self.partitions {
            if let TableSlot::Primary(n) = spec.table {
                if !(1..=4).contains(&n) || primaries.contains(&n) {
                    return fail(&spec.name, format!("invalid primary slot {}", n));
                }
                primaries.push(n);
            }
        }

        if let Some((ext_start, ext_size)) = self.extended_extent() {
            let Some(slot) = self.extended_slot else {
                return fail("extended", "logical partitions without an extended slot".into());
            };
            if !(1..=4).contains(&slot) || primaries.contains(&slot) {
                return fail("extended", format!("invalid extended slot {}", slot));
            }
            let ext = (ext_start * SECTOR_SIZE, (ext_start + ext_size) * SECTOR_SIZE);
            for spec in &self.partitions {
                if matches!(spec.table, TableSlot::Primary(_)) && spec.overlaps(ext.0, ext.1) {
                    return fail(&spec.name, "primary partition inside the extended container".into());
                }
            }
            for logical in self.logical_partitions() {
                let ebr = logical.start - SECTOR_SIZE;
                if let Some(hit) = self
                    .partitions
                    .iter()
                    .find(|p| p.overlaps(ebr, ebr + SECTOR_SIZE))
                {
                    return fail(
                        &hit.name,
                        format!("covers the EBR of '{}'", logical.name),
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, start: u64, size: u64) -> PartitionSpec {
        PartitionSpec::new(name, start, size, PartitionKind::Empty, None)
    }

    fn profile(parts: Vec<PartitionSpec>, extended_slot: Option<u8>) -> GenerationProfile {
        GenerationProfile::new(
            "TEST",
            1,
            0x10000,
            extended_slot,
            PartInfo::new(1, "A", "B", "C"),
            vec![],
            parts,
        )
    }

    #[test]
    fn new_sorts_and_numbers() {
        let p = profile(vec![spec("b", 0x2000, 0x200), spec("a", 0x1000, 0x200)], None);
        assert_eq!(p.partitions[0].name, "a");
        assert_eq!(p.partitions[1].index, 1);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn overlap_is_rejected() {
        let p = profile(vec![spec("a", 0x1000, 0x400), spec("b", 0x1200, 0x200)], None);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("overlaps 'a'"));
    }

    #[test]
    fn capacity_is_enforced() {
        let p = profile(vec![spec("a", 0xFE00, 0x400)], None);
        assert!(p.validate().is_err());
    }

    #[test]
    fn mbr_sector_is_reserved() {
        let p = profile(vec![spec("a", 0, 0x400)], None);
        assert!(p.validate().unwrap_err().to_string().contains("MBR"));
    }

    #[test]
    fn ebr_sector_is_reserved() {
        let p = profile(
            vec![
                spec("a", 0x1000, 0x400),
                spec("l", 0x1400, 0x400).logical(),
            ],
            Some(2),
        );
        assert!(p.validate().unwrap_err().to_string().contains("EBR"));

        let ok = profile(
            vec![
                spec("a", 0x1000, 0x400),
                spec("l", 0x1600, 0x400).logical(),
            ],
            Some(2),
        );
        assert!(ok.validate().is_ok());
        assert_eq!(ok.extended_extent(), Some((0x1600 / 512 - 1, 3)));
    }

    #[test]
    fn logical_at_first_sector_has_no_extended_extent() {
        let p = profile(vec![spec("l", 0, 0x400).logical()], Some(2));
        assert_eq!(p.extended_extent(), None);
        assert!(p.validate().unwrap_err().to_string().contains("MBR"));
    }

    #[test]
    fn logical_without_extended_slot() {
        let p = profile(vec![spec("l", 0x1600, 0x400).logical()], None);
        assert!(p.validate().is_err());
    }

    #[test]
    fn duplicate_primary_is_rejected() {
        let p = profile(
            vec![
                spec("a", 0x1000, 0x400).primary(1),
                spec("b", 0x2000, 0x400).primary(1),
            ],
            None,
        );
        assert!(p.validate().is_err());
    }
}
