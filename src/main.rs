use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use mapseg_rs::{Cli, PointPrompt, SegmentOptions, SegmentationEvent, Segmenter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.model_config().context("Invalid model configuration")?;
    let segmenter = Segmenter::new(config).context("Failed to set up the segmenter")?;

    let progress_bar = ProgressBar::new(100);
    progress_bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );
    let bar = progress_bar.clone();
    segmenter.subscribe(move |event| {
        if let SegmentationEvent::Progress { percent, message } = event {
            bar.set_position(percent.round() as u64);
            bar.set_message(message.clone());
        }
        Ok(())
    });

    let result = segmenter
        .segment(
            cli.image.as_str(),
            PointPrompt::new(cli.x, cli.y),
            SegmentOptions::default(),
        )
        .await;
    progress_bar.finish_and_clear();

    let mut result = result.with_context(|| format!("Failed to segment {}", cli.image))?;
    if !cli.include_mask {
        result.mask.clear();
    }

    let json = serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
    match &cli.output {
        Some(path) => fs::write(path, json)
            .with_context(|| format!("Failed to write result: {}", path.display()))?,
        None => println!("{json}"),
    }

    Ok(())
}
