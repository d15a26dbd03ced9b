//! Injecting overlay sets into their filesystem partitions.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, info};

use super::{OverlayEntry, OverlayOrigin, OverlaySet};
use crate::disk::{FilesystemRegion, FilesystemWriter, ImageHandle};
use crate::error::{Error, Result};
use crate::profile::GenerationProfile;

/// A filesystem partition the merger created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PopulatedFilesystem {
    pub partition: String,
    pub origin: Option<OverlayOrigin>,
    pub entries: usize,
}

/// Collapse entries sharing a path into one.
///
/// The last occurrence supplies the content and metadata; the first
/// occurrence fixes the position, so a directory stays ahead of its children.
pub fn resolve_conflicts(entries: &[OverlayEntry]) -> Vec<&OverlayEntry> {
    let mut last: HashMap<&str, usize> = HashMap::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        last.insert(entry.path.as_str(), i);
    }
    let mut seen: HashSet<&str> = HashSet::with_capacity(last.len());
    entries
        .iter()
        .filter(|entry| seen.insert(entry.path.as_str()))
        .map(|entry| &entries[last[entry.path.as_str()]])
        .collect()
}

/// Populate every overlay-tagged partition of `profile` inside `image`.
///
/// All sets are matched to partitions before anything is written, so a set
/// without a target leaves the image untouched.
pub fn merge(
    image: &ImageHandle,
    profile: &GenerationProfile,
    overlays: &[OverlaySet],
    writer: &dyn FilesystemWriter,
) -> Result<Vec<PopulatedFilesystem>> {
    for set in overlays {
        if set.entries.is_empty() {
            continue;
        }
        if profile.overlay_partition(set.origin.target()).is_none() {
            return Err(Error::OverlayTarget {
                profile: profile.label(),
                origin: set.origin.to_string(),
            });
        }
    }

    let mut populated = Vec::new();
    for spec in profile.partitions.iter().filter(|p| p.is_overlay_only()) {
        let Some(target) = spec.overlay_target else {
            continue;
        };
        let set = overlays.iter().find(|s| s.origin.target() == target);
        let entries = set.map(|s| resolve_conflicts(&s.entries)).unwrap_or_default();
        if let Some(set) = set {
            let dropped = set.entries.len() - entries.len();
            if dropped > 0 {
                debug!("{}: {} overridden entries dropped", spec.name, dropped);
            }
        }

        let params = spec.filesystem.unwrap_or_default();
        let region = FilesystemRegion {
            partition: &spec.name,
            offset: spec.start,
            size: spec.size,
            params: &params,
        };
        info!(
            "Populating {} with {} entries",
            spec.name,
            entries.len()
        );
        writer.populate(image.path(), &region, &entries)?;

        populated.push(PopulatedFilesystem {
            partition: spec.name.clone(),
            origin: set.map(|s| s.origin),
            entries: entries.len(),
        });
    }

    Ok(populated)
}
