//! memvol — in-memory volume engine, command-line front end.
//!
//! Thin binary entry point. All engine logic lives in the `memvol-core`
//! crate; this front end parses options, builds a volume, optionally seeds
//! it from a host directory, runs the structural self-check, and reports
//! usage. Mounting the volume is the job of a host-driver shim and is not
//! part of this binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use memvol_core::loader::{progress::SeedProgress, start_seed};
use memvol_core::options::{parse_size, VolumeOptions};
use memvol_core::Volume;

#[derive(Parser, Debug)]
#[command(name = "memvol", version, about)]
struct Args {
    /// Volume capacity: decimal with an optional K/M/G/T suffix.
    #[arg(long, default_value = "2G")]
    size: String,

    /// Compare names case-sensitively (default is case-insensitive,
    /// case-preserving).
    #[arg(long)]
    case_sensitive: bool,

    /// Volume label.
    #[arg(long, default_value = "MEMVOL")]
    label: String,

    /// Filesystem name reported to the host.
    #[arg(long, default_value = "memvol")]
    file_system_name: String,

    /// Security descriptor for the root directory (SDDL text, stored as
    /// an opaque blob; the host driver shim interprets it).
    #[arg(long)]
    security: Option<String>,

    /// Verbose engine logging.
    #[arg(long)]
    debug: bool,

    /// Seed the volume from a host directory before reporting.
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Emit the usage report as JSON instead of human-readable text.
    #[arg(long)]
    json: bool,

    /// Mount point, handed to the host driver shim. Without a shim the
    /// volume is created, exercised, and dropped.
    mount_point: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let options = VolumeOptions {
        total_size: parse_size(&args.size).context("--size")?,
        case_sensitive: args.case_sensitive,
        label: args.label.clone(),
        file_system_name: args.file_system_name.clone(),
        root_security: args.security.as_ref().map(|s| s.as_bytes().to_vec()),
    };
    options.validate()?;

    let volume = Arc::new(
        Volume::new(&options)
            .map_err(|err| anyhow::anyhow!("cannot create volume: {err}"))?,
    );
    tracing::info!(
        total_size = options.total_size,
        label = %args.label,
        "volume created"
    );

    if let Some(source) = &args.seed {
        seed(&volume, source.clone())?;
    }

    if args.mount_point.is_some() {
        tracing::warn!("mounting requires a host driver shim; reporting usage only");
    }

    volume.check_consistency();

    let stats = volume.stats();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("label:        {}", stats.label);
        println!("file system:  {}", stats.file_system_name);
        println!("capacity:     {} bytes", stats.total_size);
        println!("used:         {} bytes", stats.used_size);
        println!("free:         {} bytes", stats.free_size);
        println!(
            "nodes:        {} ({} directories, {} files)",
            stats.node_count, stats.directory_count, stats.file_count
        );
    }
    Ok(())
}

/// Drive a seed to completion, logging progress.
fn seed(volume: &Arc<Volume>, source: PathBuf) -> anyhow::Result<()> {
    let handle = start_seed(volume.clone(), source);
    loop {
        match handle.progress_rx.recv() {
            Ok(SeedProgress::Update {
                dirs_created,
                files_created,
                bytes_written,
                ..
            }) => {
                tracing::info!(dirs_created, files_created, bytes_written, "seeding");
            }
            Ok(SeedProgress::Skipped { path, reason }) => {
                tracing::warn!(%path, %reason, "entry skipped");
            }
            Ok(SeedProgress::Complete {
                duration,
                dirs_created,
                files_created,
                bytes_written,
                skipped,
            }) => {
                tracing::info!(
                    ?duration,
                    dirs_created,
                    files_created,
                    bytes_written,
                    skipped,
                    "seed complete"
                );
                return Ok(());
            }
            Ok(SeedProgress::Cancelled) => anyhow::bail!("seed cancelled"),
            Err(_) => anyhow::bail!("seed thread exited without completing"),
        }
    }
}
