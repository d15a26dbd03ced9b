//! pioneer-imager - build an SD-card image for a Pioneer head unit.
//!
//! Progress goes to stderr; stdout carries only the `OK` sentinel.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use pioneer_imager::build::{BuildOptions, BuildRequest, Builder, Toolset};
use pioneer_imager::config::{Config, SparseBackend};
use pioneer_imager::package::UnknownEntryPolicy;

/// Exit status for failures before the build starts (bad config, bad flags).
const SETUP_FAILURE: u8 = 2;

#[derive(Parser)]
#[command(name = "pioneer-imager")]
#[command(about = "Build a bootable SD-card image from a Pioneer firmware update")]
#[command(
    after_help = "EXAMPLE:\n  pioneer-imager sd.img AVH19 update.zip extdata.tar cache.tar.zst\n\nAll inputs and the output are plain files; the image appears under IMAGE only\nonce it is complete."
)]
struct Cli {
    /// Output image name
    image: PathBuf,

    /// Generation code, e.g. AVH19
    platform: String,

    /// Firmware update payload (zip of .PRG images)
    payload: PathBuf,

    /// Overlay archive for the extra-data partition (tar or tar.zst)
    extdata: PathBuf,

    /// Overlay archive for the cache partition (tar or tar.zst)
    cache: PathBuf,

    /// Hardware variant within the generation
    #[arg(long, default_value_t = 1)]
    variant: u32,

    /// Placement worker count
    #[arg(short, long)]
    jobs: Option<usize>,

    /// What to do with .PRG entries the generation does not use
    #[arg(long, value_enum)]
    unknown_entries: Option<UnknownEntryPolicy>,

    /// Sparse image expander
    #[arg(long, value_enum)]
    sparse_backend: Option<SparseBackend>,

    /// Write a JSON manifest of the build here
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Config file (default: ./pioneer-imager.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log external tool output and per-partition detail
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn setup(cli: &Cli) -> Result<(Builder, BuildRequest)> {
    let config = Config::load(cli.config.as_deref())?;
    if cli.jobs == Some(0) {
        anyhow::bail!("--jobs must be at least 1");
    }

    let backend = cli.sparse_backend.unwrap_or(config.sparse_backend);
    let options = BuildOptions {
        jobs: cli.jobs.unwrap_or_else(|| config.jobs()),
        unknown_entries: cli.unknown_entries.unwrap_or(config.unknown_entries),
        manifest: cli.manifest.clone(),
        ..BuildOptions::default()
    };
    let builder = Builder::new(Toolset::host(&config.tools, backend), options);

    let request = BuildRequest {
        generation: cli.platform.clone(),
        variant: cli.variant,
        payload: cli.payload.clone(),
        extra_data: cli.extdata.clone(),
        cache: cli.cache.clone(),
        output: cli.image.clone(),
    };
    Ok((builder, request))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let (builder, request) = match setup(&cli) {
        Ok(v) => v,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(SETUP_FAILURE);
        }
    };

    match builder.build(request) {
        Ok(_) => {
            println!("OK");
            ExitCode::SUCCESS
        }
        Err(failure) => {
            error!("[{}] {}", failure.kind(), failure);
            ExitCode::from(u8::try_from(failure.exit_code()).unwrap_or(1))
        }
    }
}
