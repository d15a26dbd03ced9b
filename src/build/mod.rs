//! Build orchestration.
//!
//! ```text
//! resolve-profile → preflight → extract-package → read-overlays
//!     → assemble → merge-overlays → publish
//! ```
//!
//! Every stage fails fast. The image lives under a temporary name until
//! `publish` renames it, so a failed build never leaves a file at the
//! requested output path.

pub mod context;
mod manifest;
pub mod output;
mod timing;

pub use context::{BuildContext, BuildRequest, Stage};
pub use manifest::Manifest;

use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::config::{SparseBackend, ToolPaths};
use crate::disk::{self, Assembler, FilesystemWriter, Mke2fs, PartitionTableWriter, Placement, Sfdisk};
use crate::error::{Error, Result};
use crate::overlay::{self, OverlayOrigin, OverlaySet, PopulatedFilesystem};
use crate::package::{self, UnknownEntryPolicy};
use crate::preflight;
use crate::profile::{registry, GenerationProfile};
use crate::sparse::{NativeCodec, Simg2img, SparseCodec};
use output::OutputLock;
use timing::Timer;

/// Share of each created filesystem reserved for ext4 metadata when
/// estimating the space a build needs.
const FS_METADATA_SHARE: u64 = 16;

/// A failed build: the stage that failed and why.
#[derive(Debug, Error)]
#[error("{stage} failed: {error}")]
pub struct BuildFailure {
    pub stage: Stage,
    #[source]
    pub error: Error,
}

impl BuildFailure {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }

    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

/// The external collaborators a build drives.
pub struct Toolset {
    pub table: Box<dyn PartitionTableWriter>,
    pub filesystem: Box<dyn FilesystemWriter>,
    pub codec: Box<dyn SparseCodec>,
}

impl Toolset {
    /// sfdisk, mke2fs, and the chosen sparse backend.
    pub fn host(paths: &ToolPaths, backend: SparseBackend) -> Self {
        let codec: Box<dyn SparseCodec> = match backend {
            SparseBackend::Native => Box::new(NativeCodec),
            SparseBackend::Simg2img => Box::new(Simg2img::new(&paths.simg2img)),
        };
        Self {
            table: Box::new(Sfdisk::new(&paths.sfdisk)),
            filesystem: Box::new(Mke2fs::new(&paths.mke2fs)),
            codec,
        }
    }

    pub fn required_programs(&self) -> Vec<String> {
        let mut programs = self.table.required_programs();
        programs.extend(self.filesystem.required_programs());
        programs.extend(self.codec.required_programs());
        programs
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Placement worker count.
    pub jobs: usize,
    pub unknown_entries: UnknownEntryPolicy,
    /// Where to write the JSON manifest, if anywhere.
    pub manifest: Option<PathBuf>,
    /// Check that the collaborators' programs exist before starting.
    pub check_host: bool,
    /// Compare the estimated output size with the free space first.
    pub check_space: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            unknown_entries: UnknownEntryPolicy::default(),
            manifest: None,
            check_host: true,
            check_space: true,
        }
    }
}

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub output: PathBuf,
    pub manifest: Option<PathBuf>,
    pub placements: Vec<Placement>,
    pub populated: Vec<PopulatedFilesystem>,
}

fn run_stage<T>(stage: Stage, f: impl FnOnce() -> Result<T>) -> std::result::Result<T, BuildFailure> {
    let timer = Timer::start(stage.name());
    let value = f().map_err(|error| BuildFailure { stage, error })?;
    timer.finish();
    Ok(value)
}

pub struct Builder {
    tools: Toolset,
    options: BuildOptions,
}

impl Builder {
    pub fn new(tools: Toolset, options: BuildOptions) -> Self {
        Self { tools, options }
    }

    /// Run the whole pipeline for `request`.
    pub fn build(&self, request: BuildRequest) -> std::result::Result<BuildReport, BuildFailure> {
        let profile = run_stage(Stage::ResolveProfile, || {
            registry::resolve(&request.generation, request.variant)
        })?;
        self.build_with_profile(profile, request)
    }

    /// Run the pipeline against a caller-supplied `profile`.
    ///
    /// The profile is validated first, exactly as a registry profile is.
    pub fn build_with_profile(
        &self,
        profile: GenerationProfile,
        request: BuildRequest,
    ) -> std::result::Result<BuildReport, BuildFailure> {
        run_stage(Stage::ResolveProfile, || {
            profile.validate()?;
            info!(
                "Profile {}: {} extents, {} byte image",
                profile.label(),
                profile.partitions.len(),
                profile.capacity
            );
            Ok(())
        })?;

        let _lock = run_stage(Stage::Preflight, || {
            if self.options.check_host {
                preflight::check_required_tools(&self.tools.required_programs())?;
            }
            OutputLock::acquire(&request.output)
        })?;

        let package = run_stage(Stage::ExtractPackage, || {
            package::extract(&request.payload, &profile, self.options.unknown_entries)
        })?;

        let overlays = run_stage(Stage::ReadOverlays, || {
            Ok(vec![
                OverlaySet::load(OverlayOrigin::ExtraData, &request.extra_data)?,
                OverlaySet::load(OverlayOrigin::Cache, &request.cache)?,
            ])
        })?;

        let mut ctx = BuildContext::new(request, profile, package, overlays);

        run_stage(Stage::Assemble, || self.assemble(&mut ctx))?;
        run_stage(Stage::MergeOverlays, || self.merge(&mut ctx))?;
        run_stage(Stage::Publish, || self.publish(&mut ctx))
    }

    fn assemble(&self, ctx: &mut BuildContext) -> Result<()> {
        let dir = ctx.request.output_dir().to_path_buf();

        if self.options.check_space {
            let fs_metadata: u64 = ctx
                .profile
                .partitions
                .iter()
                .filter(|p| p.is_overlay_only())
                .map(|p| p.size / FS_METADATA_SHARE)
                .sum();
            let required =
                disk::required_space(&ctx.profile, &ctx.package)? + ctx.overlay_bytes() + fs_metadata;
            output::ensure_space(&dir, required)?;
        }

        let assembler = Assembler {
            table: self.tools.table.as_ref(),
            codec: self.tools.codec.as_ref(),
            jobs: self.options.jobs,
        };
        let built = assembler.assemble(&ctx.profile, &ctx.package, &dir)?;
        ctx.image = Some(built.image);
        ctx.placements = built.placements;
        Ok(())
    }

    fn merge(&self, ctx: &mut BuildContext) -> Result<()> {
        let image = ctx
            .image
            .as_ref()
            .ok_or_else(|| Error::disk_write("image", "no image was assembled"))?;
        ctx.populated = overlay::merge(
            image,
            &ctx.profile,
            &ctx.overlays,
            self.tools.filesystem.as_ref(),
        )?;
        Ok(())
    }

    /// Move the manifest into place, then the image.
    ///
    /// The image is renamed last, so it only appears at the output path once
    /// everything else has succeeded. A manifest left without its image is
    /// removed again.
    fn publish(&self, ctx: &mut BuildContext) -> Result<BuildReport> {
        let image = ctx
            .image
            .take()
            .ok_or_else(|| Error::disk_write("image", "no image was assembled"))?;

        let manifest = match &self.options.manifest {
            Some(path) => {
                output::stage_json(path, &Manifest::from_context(ctx))?
                    .persist(path)
                    .map_err(|e| Error::disk_write("manifest", format!("{}: {}", path.display(), e.error)))?;
                info!("Wrote manifest {}", path.display());
                Some(path.clone())
            }
            None => None,
        };

        let output = match image.persist(&ctx.request.output) {
            Ok(output) => output,
            Err(e) => {
                if let Some(path) = &manifest {
                    let _ = std::fs::remove_file(path);
                }
                return Err(e);
            }
        };
        info!("Published {}", output.display());

        Ok(BuildReport {
            output,
            manifest,
            placements: std::mem::take(&mut ctx.placements),
            populated: std::mem::take(&mut ctx.populated),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reports_stage_and_exit_code() {
        let failure = BuildFailure {
            stage: Stage::ExtractPackage,
            error: Error::package_format("update.zip", "truncated"),
        };
        assert_eq!(failure.kind(), "PackageFormat");
        assert_eq!(failure.exit_code(), 12);
        assert!(failure.to_string().starts_with("extract-package failed: "));
    }

    #[test]
    fn unknown_generation_fails_in_first_stage() {
        let builder = Builder::new(
            Toolset::host(&ToolPaths::default(), SparseBackend::Native),
            BuildOptions::default(),
        );
        let failure = builder
            .build(BuildRequest {
                generation: "AVH99".into(),
                variant: 1,
                payload: "/nonexistent/update.zip".into(),
                extra_data: "/nonexistent/extdata.tar".into(),
                cache: "/nonexistent/cache.tar".into(),
                output: "/nonexistent/sd.img".into(),
            })
            .unwrap_err();
        assert_eq!(failure.stage, Stage::ResolveProfile);
        assert!(matches!(failure.error, Error::UnknownGeneration { .. }));
    }

    #[test]
    fn host_toolset_names_its_programs() {
        let tools = Toolset::host(&ToolPaths::default(), SparseBackend::Simg2img);
        assert_eq!(tools.required_programs(), ["sfdisk", "mke2fs", "simg2img"]);
        let tools = Toolset::host(&ToolPaths::default(), SparseBackend::Native);
        assert_eq!(tools.required_programs(), ["sfdisk", "mke2fs"]);
    }
}
