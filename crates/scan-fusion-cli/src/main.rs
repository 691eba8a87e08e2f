//! scanfuse: command-line driver for scan-fusion.
//!
//! Runs fusion passes over point files and prints quality, alignment and
//! mesh reports, suitable for scripting and offline evaluation of captures.
//!
//! # Logging
//!
//! Set the `RUST_LOG` environment variable to control log output:
//! - `RUST_LOG=scan_fusion=info` - Stage-level logging
//! - `RUST_LOG=scan_fusion=debug` - Per-stage details
//! - `RUST_LOG=scan_fusion::timing=debug` - Stage timings
//!
//! # Example
//!
//! ```bash
//! scanfuse run depth.xyz image.xyz --output mesh.json
//! RUST_LOG=debug scanfuse align image.xyz depth.xyz --format json
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod output;
mod pointfile;

use commands::{align, config, quality, run};

/// scanfuse - fuse depth and image point clouds into a surface mesh.
#[derive(Parser)]
#[command(name = "scanfuse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format for results
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Suppress all non-error output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Increase output verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one full pass: quality, alignment, fusion, reconstruction, refinement
    Run {
        /// Depth-sensor point file
        depth: PathBuf,

        /// Image-derived point file
        image: PathBuf,

        /// Configuration file (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Start from a built-in preset instead of the defaults
        #[arg(long, conflicts_with = "config")]
        preset: Option<Preset>,

        /// Tracked features (same format; a missing normal faces the camera)
        #[arg(long)]
        features: Option<PathBuf>,

        /// Write the mesh as JSON
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Run the per-point kernels on the GPU when one is available
        #[cfg_attr(feature = "gpu", arg(long))]
        #[cfg_attr(not(feature = "gpu"), arg(skip))]
        gpu: bool,
    },

    /// Print the quality report of one point cloud
    Quality {
        /// Point file
        input: PathBuf,

        /// Configuration file (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Register one cloud onto another
    Align {
        /// Cloud to move
        source: PathBuf,

        /// Reference cloud
        target: PathBuf,

        /// Configuration file (TOML)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Print a configuration, or validate one
    Config {
        /// Validate this file instead of printing
        #[arg(long)]
        validate: Option<PathBuf>,

        /// Print a preset instead of the defaults
        #[arg(long)]
        preset: Option<Preset>,

        /// Write the configuration here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Show the GPU adapter used by the gpu backend
    #[cfg(feature = "gpu")]
    GpuInfo,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Preset {
    /// Short time budget, coarse grid
    Realtime,
    /// Fine grid, long ICP, large meshes
    HighDetail,
}

impl Preset {
    pub fn config(self) -> scan_fusion::FusionConfig {
        match self {
            Preset::Realtime => scan_fusion::FusionConfig::preset_realtime(),
            Preset::HighDetail => scan_fusion::FusionConfig::preset_high_detail(),
        }
    }
}

/// Initialize the tracing subscriber based on verbosity level.
fn init_tracing(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    // RUST_LOG wins over -v flags
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "scan_fusion=info,scan_fusion_gpu=info",
            2 => "scan_fusion=debug,scan_fusion_gpu=debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    #[cfg(debug_assertions)]
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let result = match &cli.command {
        Commands::Run {
            depth,
            image,
            config,
            preset,
            features,
            output,
            gpu,
        } => run::run(
            run::RunArgs {
                depth,
                image,
                config: config.as_deref(),
                preset: *preset,
                features: features.as_deref(),
                output: output.as_deref(),
                gpu: *gpu,
            },
            &cli,
        ),
        Commands::Quality { input, config } => quality::run(input, config.as_deref(), &cli),
        Commands::Align {
            source,
            target,
            config,
        } => align::run(source, target, config.as_deref(), &cli),
        Commands::Config {
            validate,
            preset,
            output,
        } => config::run(validate.as_deref(), *preset, output.as_deref(), &cli),
        #[cfg(feature = "gpu")]
        Commands::GpuInfo => commands::gpu_info::run(&cli),
    };

    if let Err(e) = &result {
        if !cli.quiet {
            if let Some(fusion_err) = e.downcast_ref::<scan_fusion::FusionError>() {
                eprintln!("{}: {}", "Error".red().bold(), fusion_err);
                eprintln!("  {}: {}", "Code".cyan(), fusion_err.code());
                eprintln!(
                    "  {}: {}",
                    "Suggestion".green(),
                    fusion_err.recovery_suggestion()
                );
                if let Some(stage) = fusion_err.stage() {
                    eprintln!("  {}: {}", "Stage".yellow(), stage);
                }
            } else {
                eprintln!("{}: {}", "Error".red().bold(), e);
                for cause in e.chain().skip(1) {
                    eprintln!("  {}: {}", "Caused by".yellow(), cause);
                }
            }
        }
        std::process::exit(1);
    }

    Ok(())
}
