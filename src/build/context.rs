//! The request and the per-build state threaded through the stages.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::disk::{ImageHandle, Placement};
use crate::overlay::{OverlaySet, PopulatedFilesystem};
use crate::package::FirmwarePackage;
use crate::profile::GenerationProfile;

/// What to build and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub generation: String,
    pub variant: u32,
    pub payload: PathBuf,
    pub extra_data: PathBuf,
    pub cache: PathBuf,
    pub output: PathBuf,
}

impl BuildRequest {
    /// Directory that receives the temporary image and the final one.
    pub fn output_dir(&self) -> &Path {
        match self.output.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    ResolveProfile,
    Preflight,
    ExtractPackage,
    ReadOverlays,
    Assemble,
    MergeOverlays,
    Publish,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::ResolveProfile => "resolve-profile",
            Self::Preflight => "preflight",
            Self::ExtractPackage => "extract-package",
            Self::ReadOverlays => "read-overlays",
            Self::Assemble => "assemble",
            Self::MergeOverlays => "merge-overlays",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything one build has loaded and produced so far.
///
/// Created once the inputs are fully loaded; owned by the orchestrator and
/// never shared with placement workers.
#[derive(Debug)]
pub struct BuildContext {
    pub request: BuildRequest,
    pub profile: GenerationProfile,
    pub package: FirmwarePackage,
    pub overlays: Vec<OverlaySet>,
    pub image: Option<ImageHandle>,
    pub placements: Vec<Placement>,
    pub populated: Vec<PopulatedFilesystem>,
}

impl BuildContext {
    pub fn new(
        request: BuildRequest,
        profile: GenerationProfile,
        package: FirmwarePackage,
        overlays: Vec<OverlaySet>,
    ) -> Self {
        Self {
            request,
            profile,
            package,
            overlays,
            image: None,
            placements: Vec::new(),
            populated: Vec::new(),
        }
    }

    /// Bytes of overlay file content across both archives.
    pub fn overlay_bytes(&self) -> u64 {
        self.overlays.iter().map(OverlaySet::content_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(output: &str) -> BuildRequest {
        BuildRequest {
            generation: "AVH19".into(),
            variant: 1,
            payload: "update.zip".into(),
            extra_data: "extdata.tar".into(),
            cache: "cache.tar".into(),
            output: output.into(),
        }
    }

    #[test]
    fn bare_output_name_uses_working_directory() {
        assert_eq!(request("sd.img").output_dir(), Path::new("."));
        assert_eq!(request("out/sd.img").output_dir(), Path::new("out"));
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::ResolveProfile < Stage::ExtractPackage);
        assert!(Stage::MergeOverlays < Stage::Publish);
        assert_eq!(Stage::ReadOverlays.to_string(), "read-overlays");
    }
}
