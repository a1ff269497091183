use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use std::path::PathBuf;
use std::time::Instant;
use walkdir::WalkDir;

use patchvault::engine::CaptureKind;
use patchvault::{Config, Engine};

#[derive(Parser)]
#[command(name = "patchvault", about = "Incremental file backup: baselines, block diffs, patch chains")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture files (directories are walked recursively)
    Put {
        /// Files or directories to capture
        paths: Vec<PathBuf>,
    },
    /// List the stored versions of a file, newest first
    List {
        /// Tracked file path
        path: PathBuf,
    },
    /// Restore a version of a file into the download base
    Get {
        /// Tracked file path
        path: PathBuf,
        /// Version to restore, 1 = newest
        #[arg(long, default_value_t = 1)]
        version: usize,
    },
}

/// Expand put arguments into the list of individual files to capture.
fn collect_files(paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        let path = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve path: {}", path.display()))?;
        if path.is_dir() {
            for entry in WalkDir::new(&path).min_depth(1) {
                let entry = entry
                    .with_context(|| format!("Failed to walk directory: {}", path.display()))?;
                if entry.file_type().is_file() {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else {
            files.push(path);
        }
    }
    Ok(files)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let engine = Engine::from_config(&config)?;

    match cli.command {
        Commands::Put { paths } => {
            if paths.is_empty() {
                bail!("put needs at least one file or directory");
            }
            let files = collect_files(&paths)?;
            println!("Capturing {} file(s)...", files.len());

            let start = Instant::now();
            // Distinct files only; captures of one file are never concurrent.
            let reports = files
                .par_iter()
                .map(|file| engine.capture(file))
                .collect::<Result<Vec<_>, _>>()?;
            let elapsed = start.elapsed();

            let baselines = reports
                .iter()
                .filter(|r| r.kind == CaptureKind::Baseline)
                .count();
            let patches = reports
                .iter()
                .filter(|r| r.kind == CaptureKind::Patch)
                .count();
            let unchanged = reports
                .iter()
                .filter(|r| r.kind == CaptureKind::Unchanged)
                .count();
            let uploaded: u64 = reports
                .iter()
                .filter(|r| r.kind != CaptureKind::Unchanged)
                .map(|r| r.patch_size)
                .sum();

            println!("\nCapture finished!");
            println!("  Baselines: {}", baselines);
            println!("  Patches: {}", patches);
            println!("  Unchanged: {}", unchanged);
            println!("  Bytes uploaded: {}", uploaded);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::List { path } => {
            let versions = engine.versions(&path)?;
            if versions.is_empty() {
                println!("No versions stored for {}", path.display());
                return Ok(());
            }
            for (i, version) in versions.iter().enumerate() {
                println!("Version {}:", i + 1);
                println!("  Kind: {:?}", version.kind);
                println!("  Object: {}", version.object_id);
                println!("  File size: {}", version.file_size);
                println!("  Payload size: {}", version.patch_size);
                println!("  Stored at: {}", version.backup_time);
                println!("  Modified at: {}", version.mtime);
            }
        }
        Commands::Get { path, version } => {
            if version == 0 {
                bail!("versions are numbered from 1 (newest)");
            }
            println!("Restoring version {} of {}...", version, path.display());

            let start = Instant::now();
            let dest = engine.restore(&path, version - 1)?;
            let elapsed = start.elapsed();

            println!("\nRestore finished!");
            println!("  Output: {}", dest.display());
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
    }

    Ok(())
}
