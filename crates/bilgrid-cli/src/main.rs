//! bilgrid - Edge-aware smoothing CLI
//!
//! Runs the bilateral grid filter over image files on the CPU or a CUDA device.

use anyhow::{Context, Result};
use bilgrid_compute::Backend;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "bilgrid")]
#[command(author, version, about = "Bilateral grid edge-aware smoothing")]
#[command(long_about = "
Edge-aware smoothing and local contrast with a bilateral grid.

Examples:
  bilgrid info                                  # Backends and device limits
  bilgrid info --width 1920 --height 1080       # Grid geometry for an image size
  bilgrid filter in.png -o out.png              # Luminance, detail 0
  bilgrid filter in.png -o out.png -d 0.8       # Boost local contrast
  bilgrid filter in.tif -o out.tif --smooth -s 16 -r 20
  bilgrid -b cpu filter in.png -o out.png --per-channel
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Number of threads (0 = auto)
    #[arg(short = 'j', long, global = true, default_value = "0")]
    threads: usize,

    /// Compute backend: auto, cpu, cuda
    #[arg(short, long, global = true, default_value = "auto")]
    backend: Backend,
}

#[derive(Subcommand)]
enum Commands {
    /// Filter an image
    #[command(visible_alias = "f")]
    Filter(FilterArgs),

    /// Show backends, device limits and grid geometry
    #[command(visible_alias = "i")]
    Info(InfoArgs),
}

#[derive(Args)]
struct FilterArgs {
    /// Input image
    input: PathBuf,

    /// Output image
    #[arg(short, long)]
    output: PathBuf,

    /// Spatial sigma in pixels
    #[arg(short = 's', long, default_value = "8.0")]
    sigma_s: f32,

    /// Range sigma (the full intensity range is 100)
    #[arg(short = 'r', long, default_value = "10.0")]
    sigma_r: f32,

    /// Detail amount: negative smooths, positive boosts local contrast
    #[arg(short = 'd', long, default_value = "0.0", allow_hyphen_values = true)]
    detail: f32,

    /// Write the smoothed image (detail is ignored)
    #[arg(long)]
    smooth: bool,

    /// Filter R, G and B independently instead of luminance
    #[arg(long)]
    per_channel: bool,
}

#[derive(Args)]
struct InfoArgs {
    /// Image width for the geometry report
    #[arg(long, requires = "height")]
    width: Option<usize>,

    /// Image height for the geometry report
    #[arg(long, requires = "width")]
    height: Option<usize>,

    /// Spatial sigma for the geometry report
    #[arg(short = 's', long, default_value = "8.0")]
    sigma_s: f32,

    /// Range sigma for the geometry report
    #[arg(short = 'r', long, default_value = "10.0")]
    sigma_r: f32,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Configure thread pool
    if cli.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads)
            .build_global()
            .context("Failed to configure thread pool")?;
    }

    match cli.command {
        Commands::Filter(args) => commands::filter::run(args, cli.backend, cli.verbose),
        Commands::Info(args) => commands::info::run(args, cli.backend),
    }
}
