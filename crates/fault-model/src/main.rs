use anyhow::Context;
use clap::Parser;
use geodetect::{FaultBehavior, PipelineConfig, RasterGrid, dominant_color};
use std::path::PathBuf;

/// Answers with a failure mode chosen by the dominant color of an image.
#[derive(Debug, Parser)]
#[command(name = "fault-model", version)]
struct Args {
    /// Image to classify (PNG, JPEG or TIFF).
    image: PathBuf,

    /// Report the timeout response without waiting for it.
    #[arg(long)]
    no_delay: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = PipelineConfig::from_env();

    common::setup_logging(config.log_level.clone(), config.environment.clone());

    tracing::debug!(image = %args.image.display(), "Invoking failure model");

    let (status, body) = match respond(&args) {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Error processing request");
            (500, format!("Unable to process request: {e:#}"))
        }
    };

    println!("{status}");
    println!("{body}");

    Ok(())
}

fn respond(args: &Args) -> anyhow::Result<(u16, String)> {
    let decoded = image::open(&args.image)
        .with_context(|| format!("Failed to open image {}", args.image.display()))?;

    let grid = RasterGrid::from_dynamic_image(&decoded)?;

    let color = dominant_color(&grid);
    let behavior = FaultBehavior::from_color(color);
    tracing::info!(?color, behavior = behavior.as_str(), "Dominant color detected");

    let response = behavior.response()?;
    if let Some(delay) = response.delay.filter(|_| !args.no_delay) {
        tracing::debug!(?delay, "Simulating slow response");
        std::thread::sleep(delay);
    }

    Ok((response.status, response.body))
}
