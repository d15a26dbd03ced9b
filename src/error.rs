//! Error kinds for the image build pipeline.
//!
//! Every stage fails fast with one of these kinds. The orchestrator wraps
//! them in [`crate::build::BuildFailure`] together with the failing stage.

use std::path::PathBuf;
use thiserror::Error;

use crate::process::ToolError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while building an image.
#[derive(Error, Debug)]
pub enum Error {
    /// Generation code is not in the registry.
    #[error("unknown generation '{code}' (known: {known})")]
    UnknownGeneration { code: String, known: String },

    /// Generation exists but has no layout for this variant.
    #[error("variant {variant} is not registered for {generation} (valid: {min}..={max})")]
    VariantOutOfRange {
        generation: String,
        variant: u32,
        min: u32,
        max: u32,
    },

    /// Payload or overlay archive is corrupt, unreadable, or structurally wrong.
    #[error("malformed archive '{}': {reason}", path.display())]
    PackageFormat { path: PathBuf, reason: String },

    /// The payload lacks an image the profile requires.
    #[error("partition '{partition}' requires '{expected}', which is not in the payload")]
    PartitionMissing { partition: String, expected: String },

    /// Chunk stream is malformed, a checksum mismatched, or sizes disagree.
    #[error("sparse image: {0}")]
    SparseDecode(String),

    /// Overlay archive has no partition tagged to receive it.
    #[error("no partition in {profile} accepts the {origin} overlay")]
    OverlayTarget { profile: String, origin: String },

    /// A write into the image failed or would leave its extent.
    #[error("writing '{partition}': {reason}")]
    DiskWrite { partition: String, reason: String },

    /// Output directory cannot hold the image.
    #[error(
        "not enough space in '{}': need {required} bytes, {available} available",
        dir.display()
    )]
    InsufficientSpace {
        dir: PathBuf,
        required: u64,
        available: u64,
    },
}

impl Error {
    pub(crate) fn package_format(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::PackageFormat {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn disk_write(partition: impl Into<String>, reason: impl ToString) -> Self {
        Self::DiskWrite {
            partition: partition.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn tool(partition: impl Into<String>, err: ToolError) -> Self {
        Self::disk_write(partition, err)
    }

    /// Short, stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownGeneration { .. } => "UnknownGeneration",
            Self::VariantOutOfRange { .. } => "VariantOutOfRange",
            Self::PackageFormat { .. } => "PackageFormat",
            Self::PartitionMissing { .. } => "PartitionMissing",
            Self::SparseDecode(_) => "SparseDecode",
            Self::OverlayTarget { .. } => "OverlayTarget",
            Self::DiskWrite { .. } => "DiskWrite",
            Self::InsufficientSpace { .. } => "InsufficientSpace",
        }
    }

    /// Process exit status reported for this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnknownGeneration { .. } => 10,
            Self::VariantOutOfRange { .. } => 11,
            Self::PackageFormat { .. } => 12,
            Self::PartitionMissing { .. } => 13,
            Self::SparseDecode(_) => 14,
            Self::OverlayTarget { .. } => 15,
            Self::DiskWrite { .. } => 16,
            Self::InsufficientSpace { .. } => 17,
        }
    }
}
