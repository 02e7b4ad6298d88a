//! Renderer subprocess
//!
//! Usage: surface-renderer <region-name> <asset-path> <data-path>
//!
//! Opens the region created by the host, runs the bundled solid-fill engine
//! against it and exits when the host sends Shutdown.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use surface_relay::renderer::{self, exit_code, RendererArgs};
use surface_relay::{EngineAssets, RendererConfig, SolidFillEngine};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "surface-renderer")]
#[command(
    about = "Renders into a surface_relay region created by a host process",
    long_about = None
)]
struct Cli {
    /// Shared memory region name (created by the host)
    region_name: String,

    /// Engine asset bundle directory
    asset_path: PathBuf,

    /// Engine runtime data (locale tables etc.)
    data_path: PathBuf,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(exit_code::USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing::info!(region = %cli.region_name, "renderer subprocess starting");

    let args = RendererArgs {
        region_name: cli.region_name,
        assets: EngineAssets {
            assets_path: cli.asset_path,
            data_path: cli.data_path,
        },
    };

    match renderer::run(&args, SolidFillEngine::default(), RendererConfig::default()) {
        Ok(_) => ExitCode::from(exit_code::OK),
        Err(e) => {
            tracing::error!(error = %e, "renderer failed");
            ExitCode::from(renderer::exit_code_for(&e))
        }
    }
}
