//! Command-line interface for the LiDAR pipeline.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::core::loaders::{find_las_files, load_las};
use crate::processors::{
    subtile_centers, Classifier, FlushReport, LabelEcho, LasTileStore, ReconstructionEngine,
    SubtileSampler, TileStream,
};
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "lidar-pipeline")]
#[command(about = "LiDAR subtile sampling and prediction reconstruction", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the subtile centres of a tile and their point counts
    Centers {
        /// Input LAS tile
        tile: PathBuf,
        /// Subtile width in meters (defaults to config)
        #[arg(long)]
        width: Option<f64>,
        /// Fraction of overlap between neighbouring subtiles (defaults to config)
        #[arg(long)]
        overlap: Option<f64>,
    },

    /// Stream every tile through the pipeline and reconstruct per-point classes
    Reconstruct {
        /// Directory containing LAS tiles
        input_dir: PathBuf,
        /// Output directory for reconstructed tiles
        output_dir: PathBuf,
        /// Phase tag prefixed to output file names (defaults to config)
        #[arg(long)]
        phase: Option<String>,
        /// Items per batch (defaults to config)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Limit number of tiles to process
        #[arg(long)]
        limit: Option<usize>,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}, using defaults", path.display(), e);
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Centers { tile, width, overlap } => {
            cmd_centers(&tile, width, overlap, &config);
        }
        Commands::Reconstruct {
            input_dir,
            output_dir,
            phase,
            batch_size,
            limit,
        } => {
            let mut config = config;
            config.reconstruction.output_dir = output_dir;
            if let Some(phase) = phase {
                config.reconstruction.phase = phase;
            }
            if let Some(batch_size) = batch_size {
                config.reconstruction.batch_size = batch_size;
            }
            cmd_reconstruct(&input_dir, limit, &config);
        }
    }
}

fn cmd_centers(tile: &Path, width: Option<f64>, overlap: Option<f64>, config: &PipelineConfig) {
    let width = width.unwrap_or(config.subtile.width_meters);
    let overlap = overlap.unwrap_or(config.subtile.overlap);

    let spinner = create_spinner("Loading tile...");
    let record = match load_las(tile) {
        Ok(r) => r,
        Err(e) => {
            spinner.finish_and_clear();
            error!("Failed to load tile: {}", e);
            std::process::exit(1);
        }
    };
    spinner.finish_and_clear();

    let Some(bounds) = record.points.horizontal_bounds() else {
        warn!("{} has no points", tile.display());
        return;
    };

    let (sampler, centers) = match SubtileSampler::new(width)
        .and_then(|s| subtile_centers(&bounds, width, overlap).map(|c| (s, c)))
    {
        Ok(pair) => pair,
        Err(e) => {
            error!("Invalid subtile geometry: {}", e);
            std::process::exit(1);
        }
    };

    println!("{:>12} {:>12} {:>10}", "center_x", "center_y", "points");
    let mut kept = 0;
    for center in &centers {
        let count = sampler.window_indices(&record, *center).len();
        if count >= config.subtile.min_points {
            kept += 1;
        }
        println!("{:>12.2} {:>12.2} {:>10}", center[0], center[1], count);
    }

    print_summary(
        "Subtile Centres",
        &[
            ("Tile", tile.display().to_string()),
            ("Points", record.len().to_string()),
            ("Width", format!("{} m", width)),
            ("Overlap", overlap.to_string()),
            ("Centres", centers.len().to_string()),
            ("Above min points", kept.to_string()),
        ],
    );
}

/// Totals of one reconstruction run.
struct ReconstructSummary {
    tiles: Vec<FlushReport>,
    batches: usize,
    kept: usize,
    dropped: usize,
    failed: usize,
    matching: usize,
    compared: usize,
}

fn reconstruct_tiles(
    input_dir: &Path,
    limit: Option<usize>,
    config: &PipelineConfig,
    progress: &ProgressBar,
) -> anyhow::Result<ReconstructSummary> {
    let mut tiles = find_las_files(input_dir)
        .with_context(|| format!("failed to list {}", input_dir.display()))?;
    if let Some(limit) = limit {
        tiles.truncate(limit);
    }
    if tiles.is_empty() {
        bail!("no LAS files found in {}", input_dir.display());
    }

    let mut stream = TileStream::from_config(tiles, config)?;
    let mut classifier = LabelEcho;
    let mut engine = ReconstructionEngine::new(LasTileStore::from_config(&config.reconstruction));
    let mut reports = Vec::new();

    for batch in stream.by_ref() {
        let batch = batch.context("failed to build batch")?;
        let predictions = classifier
            .classify(&batch)
            .context("classifier failed")?;
        reports.extend(engine.consume(&batch, &predictions)?);
        progress.set_message(format!(
            "Batch {} ({} tiles written)",
            engine.batches_consumed(),
            reports.len()
        ));
    }
    reports.extend(engine.finish()?);

    let (mut matching, mut compared) = (0, 0);
    for report in &reports {
        let (m, c) = agreement(report, &config.classes.codes)
            .with_context(|| format!("failed to compare {}", report.output.display()))?;
        matching += m;
        compared += c;
    }

    let stats = stream.stats();
    Ok(ReconstructSummary {
        tiles: reports,
        batches: engine.batches_consumed(),
        kept: stats.kept,
        dropped: stats.dropped,
        failed: stats.failed,
        matching,
        compared,
    })
}

/// Counts output points whose class equals the source class.
///
/// With a class mapping the output holds dense indices, which are mapped
/// back to raw codes before comparing.
fn agreement(report: &FlushReport, codes: &[u8]) -> anyhow::Result<(usize, usize)> {
    let source = load_las(&report.tile)?;
    let output = load_las(&report.output)?;
    let (Some(expected), Some(predicted)) = (source.points.labels(), output.points.labels()) else {
        return Ok((0, 0));
    };

    let matching = expected
        .iter()
        .zip(predicted)
        .filter(|&(&e, &p)| {
            let p = if codes.is_empty() {
                Some(p)
            } else {
                codes.get(usize::from(p)).copied()
            };
            p == Some(e)
        })
        .count();
    Ok((matching, expected.len()))
}

fn cmd_reconstruct(input_dir: &Path, limit: Option<usize>, config: &PipelineConfig) {
    let start = Instant::now();

    println!("Reconstructing tiles...");
    println!("Input directory: {}", input_dir.display());
    println!("Output directory: {}", config.reconstruction.output_dir.display());
    println!("Phase: {}", config.reconstruction.phase);

    let spinner = create_spinner("Streaming batches...");
    match reconstruct_tiles(input_dir, limit, config, &spinner) {
        Ok(summary) => {
            spinner.finish_and_clear();

            let points: usize = summary.tiles.iter().map(|t| t.points).sum();
            let agreement = if summary.compared > 0 {
                format!("{:.2}%", 100.0 * summary.matching as f64 / summary.compared as f64)
            } else {
                "n/a".to_string()
            };

            print_summary(
                "Reconstruction Complete",
                &[
                    ("Input directory", input_dir.display().to_string()),
                    ("Output directory", config.reconstruction.output_dir.display().to_string()),
                    ("Tiles written", summary.tiles.len().to_string()),
                    ("Points written", points.to_string()),
                    ("Batches", summary.batches.to_string()),
                    ("Subtiles kept", summary.kept.to_string()),
                    ("Subtiles dropped", summary.dropped.to_string()),
                    ("Subtiles failed", summary.failed.to_string()),
                    ("Agreement", agreement),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => {
            spinner.finish_and_clear();
            error!("Reconstruction failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
