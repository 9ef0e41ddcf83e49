// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use ucamera::{CaptureTemplate, ConversionPath};

mod cli;

#[derive(Parser)]
#[command(name = "ucamera")]
#[command(about = "Run capture pipelines against the simulated camera")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    /// Pipeline configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available cameras
    List,

    /// Stream frames from a continuous session
    Stream {
        /// Camera id to use (from 'ucamera list')
        #[arg(short, long, default_value = "0")]
        camera: String,

        #[arg(long, default_value = "640")]
        width: u32,

        #[arg(long, default_value = "480")]
        height: u32,

        /// Number of processed frames to wait for
        #[arg(short, long, default_value = "10")]
        frames: u32,

        /// Conversion path: compute or external
        #[arg(short, long)]
        path: Option<ConversionPath>,
    },

    /// Take one-shot captures from an on-demand session
    Capture {
        /// Camera id to use (from 'ucamera list')
        #[arg(short, long, default_value = "0")]
        camera: String,

        /// Capture template: preview, still, record or snapshot
        #[arg(short, long, default_value = "still")]
        template: CaptureTemplate,

        /// Number of captures
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        #[arg(long, default_value = "640")]
        width: u32,

        #[arg(long, default_value = "480")]
        height: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=ucamera=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::List => cli::list_cameras(),
        Commands::Stream {
            camera,
            width,
            height,
            frames,
            path,
        } => cli::stream(config, &camera, width, height, frames, path),
        Commands::Capture {
            camera,
            template,
            count,
            width,
            height,
        } => cli::capture(config, &camera, template, count, width, height),
    }
}
