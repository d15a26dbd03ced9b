//! Optional `pioneer-imager.toml` settings.
//!
//! ```toml
//! jobs = 4
//! unknown_entries = "warn"      # ignore | warn | error
//! sparse_backend = "native"     # native | simg2img
//!
//! [tools]
//! sfdisk = "/usr/sbin/sfdisk"
//! mke2fs = "mke2fs"
//! simg2img = "simg2img"
//! ```
//!
//! Command-line flags override every value here.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::package::UnknownEntryPolicy;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "pioneer-imager.toml";

/// Upper bound for the default placement worker count.
const DEFAULT_MAX_JOBS: usize = 4;

/// Which implementation expands sparse contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SparseBackend {
    #[default]
    Native,
    Simg2img,
}

/// External program names or paths.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ToolPaths {
    pub sfdisk: String,
    pub mke2fs: String,
    pub simg2img: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            sfdisk: "sfdisk".into(),
            mke2fs: "mke2fs".into(),
            simg2img: "simg2img".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub jobs: Option<usize>,
    pub unknown_entries: UnknownEntryPolicy,
    pub sparse_backend: SparseBackend,
    pub tools: ToolPaths,
}

impl Config {
    /// Load `path`, or the default file if `path` is `None` and it exists.
    ///
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };
        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config '{}'", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.jobs == Some(0) {
            bail!("jobs must be at least 1");
        }
        Ok(config)
    }

    /// Configured worker count, or the host's parallelism capped at four.
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(DEFAULT_MAX_JOBS)
        })
    }
}
