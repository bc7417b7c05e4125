use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tractmap::config::CONFIG_ENV;
use tractmap::pipeline::{self, GeometryStage};
use tractmap::PipelineConfig;

/// Census tract population choropleth from TIGER shapefiles and an ACS export.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON file overriding the default input and output paths.
    #[arg(long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Directory for every output not given an explicit path.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Ingest the shapefiles again even if a simplified GeoJSON exists.
    #[arg(long)]
    rebuild_geometry: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = output_dir;
    }
    config.rebuild_geometry |= cli.rebuild_geometry;

    let report = pipeline::run(&config).context("pipeline failed")?;

    match &report.geometry {
        GeometryStage::Reused(path) => println!("GeoJSON reused from: {}", path.display()),
        GeometryStage::Built { tracts, simplified } => {
            println!("GeoJSON saved to: {}", tracts.output.display());
            println!("Simplified GeoJSON saved to: {}", simplified.display());
        }
    }
    println!("{}", report.csv);
    match &report.stats {
        Some(stats) => println!("{stats}"),
        None => println!("No rows to summarise"),
    }
    println!(
        "Found {} matching GEOIDs; choropleth map saved to: {}",
        report.map.matched,
        report.map.output.display()
    );

    Ok(())
}
