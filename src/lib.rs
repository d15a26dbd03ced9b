//! Builds bootable SD-card images for Pioneer head units from vendor
//! firmware updates.
//!
//! A build takes a firmware payload (a zip of `.PRG` images), two overlay
//! archives (`extra-data` and `cache`) and a generation code, and produces
//! one raw disk image with a DOS partition table, every firmware image at
//! its fixed offset, and the two ext4 data partitions populated.
//!
//! # Architecture
//!
//! ```text
//! build (orchestrator)
//!     │
//!     ├── profile   generation registry: extents, table slots, image paths
//!     ├── package   payload zip → FirmwareImage per ImageId
//!     ├── overlay   tar / tar.zst → OverlaySet, conflict resolution, merge
//!     ├── sparse    Android sparse decode/encode, SparseCodec backends
//!     └── disk      ImageHandle, parallel placement, PartitionTableWriter,
//!                   FilesystemWriter
//!
//! process / preflight   external tool invocation and host checks
//! config                optional TOML tool paths and defaults
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use pioneer_imager::build::{BuildOptions, BuildRequest, Builder, Toolset};
//! use pioneer_imager::config::{SparseBackend, ToolPaths};
//!
//! let builder = Builder::new(
//!     Toolset::host(&ToolPaths::default(), SparseBackend::Native),
//!     BuildOptions::default(),
//! );
//! let report = builder.build(BuildRequest {
//!     generation: "AVH19".into(),
//!     variant: 1,
//!     payload: "update.zip".into(),
//!     extra_data: "extdata.tar".into(),
//!     cache: "cache.tar".into(),
//!     output: "sd.img".into(),
//! })?;
//! println!("{}", report.output.display());
//! ```

mod archive;
pub mod build;
pub mod config;
pub mod disk;
pub mod error;
pub mod overlay;
pub mod package;
pub mod preflight;
pub mod process;
pub mod profile;
pub mod sparse;

pub use error::{Error, Result};
