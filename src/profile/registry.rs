//! The built-in generation table.
//!
//! Every generation shares one physical layout; they differ only in where
//! the payload keeps its images and in the partition-info identity.

use super::{
    BlobSource, FilesystemParams, GenerationProfile, ImageId, OverlayTarget, PartInfo,
    PartitionKind, PartitionSpec, Section, IMAGE_HEADER_SIZE, SECTOR_SIZE,
};
use crate::error::{Error, Result};

struct GenerationDef {
    code: &'static str,
    /// Image file prefix inside the payload, e.g. `PJ190`.
    prefix: &'static str,
    part_info: PartInfo,
    min_variant: u32,
    max_variant: u32,
}

// AVIC identities are unverified on hardware; they mirror the AVH units.
const GENERATIONS: &[GenerationDef] = &[
    GenerationDef {
        code: "AVH18",
        prefix: "PJ180",
        part_info: PartInfo::new(0x0102_0000, "CVJ2547-E", "CVJ2547-E", "PJDZ4-1-E"),
        min_variant: 1,
        max_variant: 4,
    },
    GenerationDef {
        code: "AVIC18",
        prefix: "PJ180",
        part_info: PartInfo::new(0x0102_0000, "CVJ2547-E", "CVJ2547-E", "PJDZ4-1-E"),
        min_variant: 1,
        max_variant: 4,
    },
    GenerationDef {
        code: "AVH19",
        prefix: "PJ190",
        part_info: PartInfo::new(0x0100_0000, "CVJ3973-A", "CVJ3973-A", "PJDZ5-1-A"),
        min_variant: 1,
        max_variant: 4,
    },
    GenerationDef {
        code: "AVIC19",
        prefix: "PJ190",
        part_info: PartInfo::new(0x0100_0000, "CVJ3973-A", "CVJ3973-A", "PJDZ5-1-A"),
        min_variant: 1,
        max_variant: 4,
    },
];

/// First header sector; headers follow one per sector.
const HEADER_BASE: u64 = 0xAF000;

const EXTDATA_START_SECTOR: u64 = 4_622_336;
const EXTDATA_SIZE_SECTORS: u64 = 10_420_224;
const CACHE_START_SECTOR: u64 = 3_311_617;
const CACHE_SIZE_SECTORS: u64 = 262_143;

/// Image capacity: everything up to the end of `extdata`.
pub const IMAGE_CAPACITY: u64 = (EXTDATA_START_SECTOR + EXTDATA_SIZE_SECTORS) * SECTOR_SIZE;

const EXTDATA_FS: FilesystemParams = FilesystemParams {
    block_size: Some(4096),
    inode_size: Some(256),
    last_mounted: Some("/extdata"),
    label: None,
    features: Some("^metadata_csum,uninit_bg,^64bit,^orphan_file"),
    extended_options: Some("lazy_itable_init=0,nodiscard"),
    journal_options: Some("size=128"),
};

const CACHE_FS: FilesystemParams = FilesystemParams {
    block_size: Some(1024),
    inode_size: Some(128),
    last_mounted: None,
    label: Some("CACHE"),
    features: Some("^extent,^large_file,^metadata_csum,uninit_bg,^64bit,^orphan_file"),
    extended_options: Some("lazy_itable_init=0,nodiscard"),
    journal_options: None,
};

/// Codes of all registered generations.
pub fn generation_codes() -> impl Iterator<Item = &'static str> {
    GENERATIONS.iter().map(|g| g.code)
}

/// Every registered (generation, variant) profile.
pub fn all_profiles() -> impl Iterator<Item = GenerationProfile> {
    GENERATIONS.iter().flat_map(|def| {
        (def.min_variant..=def.max_variant).map(move |variant| build_profile(def, variant))
    })
}

/// Look up the layout for a generation code and variant.
pub fn resolve(code: &str, variant: u32) -> Result<GenerationProfile> {
    let def = GENERATIONS
        .iter()
        .find(|g| g.code == code)
        .ok_or_else(|| Error::UnknownGeneration {
            code: code.to_string(),
            known: generation_codes().collect::<Vec<_>>().join(", "),
        })?;

    if !(def.min_variant..=def.max_variant).contains(&variant) {
        return Err(Error::VariantOutOfRange {
            generation: def.code.to_string(),
            variant,
            min: def.min_variant,
            max: def.max_variant,
        });
    }

    Ok(build_profile(def, variant))
}

fn build_profile(def: &GenerationDef, variant: u32) -> GenerationProfile {
    GenerationProfile::new(
        def.code,
        variant,
        IMAGE_CAPACITY,
        Some(3),
        def.part_info.clone(),
        image_paths(def, variant),
        layout(),
    )
}

fn image_paths(def: &GenerationDef, variant: u32) -> Vec<(ImageId, String)> {
    let (gen, pre) = (def.code, def.prefix);
    vec![
        (ImageId::Boot, format!("{gen}/BOOT/{pre}BOT.PRG")),
        (ImageId::Recovery, format!("{gen}/RECOVERY/{pre}REC.PRG")),
        (ImageId::Platform, format!("{gen}/PLATFORM/{pre}PLT.PRG")),
        (ImageId::Snapshot, format!("{gen}/SNAPSHOT/SNAPSHOT_{variant}.PRG")),
        (ImageId::Hibendir, format!("{gen}/HIBENDIR/HIBENDIR.PRG")),
        (ImageId::Userdata, format!("{gen}/USERDATA/{pre}DAT_{variant}.PRG")),
        (ImageId::Userapi, format!("{gen}/USERAPI/{pre}UPI.PRG")),
    ]
}

fn header(n: u64, name: &str, image: ImageId) -> PartitionSpec {
    PartitionSpec::new(
        name,
        HEADER_BASE + n * IMAGE_HEADER_SIZE,
        IMAGE_HEADER_SIZE,
        PartitionKind::Raw,
        Some(BlobSource::Image {
            image,
            section: Section::Header,
        }),
    )
}

fn content(name: &str, start: u64, size: u64, kind: PartitionKind, image: ImageId) -> PartitionSpec {
    PartitionSpec::new(
        name,
        start,
        size,
        kind,
        Some(BlobSource::Image {
            image,
            section: Section::Content,
        }),
    )
}

fn snapshot_range(name: &str, start: u64, size: u64, offset: u64, len: Option<u64>) -> PartitionSpec {
    PartitionSpec::new(
        name,
        start,
        size,
        PartitionKind::Raw,
        Some(BlobSource::Image {
            image: ImageId::Snapshot,
            section: Section::ContentRange { offset, len },
        }),
    )
}

/// Snapshot content: a 0x400-byte boot record, then the body.
const SNAPSHOT_BOOT_LEN: u64 = 0x400;

fn layout() -> Vec<PartitionSpec> {
    use ImageId::*;
    use PartitionKind::{Filesystem, Raw, Sparse};

    let part_info = PartitionSpec::new(
        "partinfo",
        HEADER_BASE + 5 * IMAGE_HEADER_SIZE,
        IMAGE_HEADER_SIZE,
        Raw,
        Some(BlobSource::PartInfo),
    );

    vec![
        header(0, "boot-header-a", Boot),
        header(1, "boot-header-b", Boot),
        header(2, "recovery-header-a", Recovery),
        header(3, "recovery-header-b", Recovery),
        header(4, "platform-header", Platform),
        part_info,
        header(6, "snapshot-header-a", Snapshot),
        header(7, "snapshot-header-b", Snapshot),
        header(8, "hibendir-header", Hibendir),
        header(9, "userdata-header", Userdata),
        header(10, "userapi-header", Userapi),
        content("hibendir", 0x0010_0000, 0x20000, Raw, Hibendir),
        content("userapi", 0x0012_0000, 0x20000, Raw, Userapi),
        snapshot_range("snapshot-boot-a", 0x0014_0000, 0x400, 0, Some(SNAPSHOT_BOOT_LEN)),
        snapshot_range("snapshot-boot-b", 0x0014_0400, 0x400, 0, Some(SNAPSHOT_BOOT_LEN)),
        snapshot_range("snapshot-a", 0x0014_0800, 0x0FFD_FC00, SNAPSHOT_BOOT_LEN, None),
        snapshot_range("snapshot-b", 0x1012_0400, 0x0FFD_FC00, SNAPSHOT_BOOT_LEN, None),
        content("boot-a", 0x2010_0000, 0x00A0_0000, Raw, Boot).primary(1),
        content("boot-b", 0x20B0_0000, 0x00A0_0000, Raw, Boot).primary(2),
        content("recovery-a", 0x2150_0200, 0x01DF_FE00, Raw, Recovery).logical(),
        content("recovery-b", 0x2330_0200, 0x01DF_FE00, Raw, Recovery).logical(),
        content("platform", 0x2510_0200, 0x3FFF_FE00, Sparse, Platform).logical(),
        PartitionSpec::new(
            "cache",
            CACHE_START_SECTOR * SECTOR_SIZE,
            CACHE_SIZE_SECTORS * SECTOR_SIZE,
            Filesystem,
            None,
        )
        .logical()
        .overlay(OverlayTarget::Cache, CACHE_FS),
        content("userdata", 0x6D10_0200, 0x1FFF_FE00, Sparse, Userdata).logical(),
        PartitionSpec::new(
            "extdata",
            EXTDATA_START_SECTOR * SECTOR_SIZE,
            EXTDATA_SIZE_SECTORS * SECTOR_SIZE,
            Filesystem,
            None,
        )
        .primary(4)
        .overlay(OverlayTarget::ExtData, EXTDATA_FS),
    ]
}
