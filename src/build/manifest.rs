//! JSON record of what went into a published image.

use serde::Serialize;
use std::path::PathBuf;

use crate::disk::Placement;
use crate::overlay::PopulatedFilesystem;

use super::BuildContext;

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub generation: String,
    pub variant: u32,
    pub image: PathBuf,
    pub capacity: u64,
    pub payload: PathBuf,
    pub partitions: Vec<Placement>,
    pub filesystems: Vec<PopulatedFilesystem>,
}

impl Manifest {
    pub fn from_context(ctx: &BuildContext) -> Self {
        Self {
            generation: ctx.profile.generation.clone(),
            variant: ctx.profile.variant,
            image: ctx.request.output.clone(),
            capacity: ctx.profile.capacity,
            payload: ctx.request.payload.clone(),
            partitions: ctx.placements.clone(),
            filesystems: ctx.populated.clone(),
        }
    }
}
