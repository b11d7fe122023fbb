//! piecework - slice file corpora into fixed-capacity archives
//!
//! Subcommands:
//! - `piecework chunk <inputs..>` - Partition inputs into slices and build archives
//! - `piecework commp <file>` - Compute the piece commitment of an existing archive

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use piececas::{commit_file, FlatArchiveBuilder};
use piececonf::{parse_size, SliceConfig};
use piecework::{
    run_loop, run_once, BuildCallback, ExtraFileFeeder, Feeder, Ffmpeg, LoopParams, MetadataStore, NoFeeder,
    RunContext, RunParams, VideoFeeder,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "piecework")]
#[command(about = "Partition file corpora into fixed-capacity, content-addressed slices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition inputs into slices and build one archive per slice
    Chunk(ChunkArgs),

    /// Compute the piece commitment of an archive file
    Commp {
        /// Archive to commit to
        file: PathBuf,

        /// Rename the file to its piece cid
        #[arg(long)]
        rename: bool,

        /// Zero-pad the file to its piece size
        #[arg(long)]
        add_padding: bool,
    },
}

#[derive(clap::Args)]
struct ChunkArgs {
    /// Files or directories to slice
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Prefix of every slice name
    #[arg(long)]
    graph_name: String,

    /// Directory receiving archives and manifest.csv (must exist)
    #[arg(long)]
    car_dir: PathBuf,

    /// Entry names keep their path relative to this directory (default: first input)
    #[arg(long)]
    parent_path: Option<PathBuf>,

    /// Slices built concurrently
    #[arg(long, default_value = "2")]
    parallel: usize,

    /// Directory walkers during enumeration
    #[arg(long, default_value = "4")]
    walk_workers: usize,

    /// Compute piece commitments and write full manifest rows
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    calc_commp: bool,

    /// Without commitments, still write archives and light manifest rows
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    save_manifest: bool,

    /// Drop the .car suffix from written archives
    #[arg(long)]
    rename: bool,

    /// Zero-pad archives to their piece size
    #[arg(long)]
    add_padding: bool,

    /// Replace entry names with random identifiers
    #[arg(long)]
    random_rename_source_file: bool,

    /// Shuffle the input before partitioning
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    random_select_file: bool,

    /// Leave entry names out of the manifest detail
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    skip_filename: bool,

    /// Capacity config file (created in loop mode if missing)
    #[arg(short, long, env = "PIECEWORK_CONFIG")]
    config: Option<PathBuf>,

    /// Target slice capacity in bytes, overrides the config file
    #[arg(long)]
    slice_size: Option<i64>,

    /// Keep re-running until interrupted
    #[arg(long = "loop")]
    run_loop: bool,

    /// Capacity added after each loop run, 0 keeps it fixed
    #[arg(long, default_value = "1")]
    capacity_step: i64,

    /// Seed video cut into one segment per slice
    #[arg(long)]
    video_path: Option<PathBuf>,

    /// Directory for video segments (default: first input)
    #[arg(long)]
    video_output_path: Option<PathBuf>,

    /// Segment index to start from, to resume an earlier session
    #[arg(long, default_value = "0")]
    base_limit: u64,

    /// Prefix of segment file names (default: random)
    #[arg(long)]
    base_rename: Option<String>,

    /// Distance between segment starts in milliseconds
    #[arg(long, default_value = "1000")]
    video_step_ms: u64,

    /// Bytes reserved per slice for the video segment, e.g. 64MiB.
    ///
    /// The default of 0 reserves nothing: each segment rides on top of a full
    /// slice, so archives exceed the slice size by one segment.
    #[arg(long, default_value = "0")]
    video_reserve: String,

    /// SQLite database recording produced pieces
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Chunk(args) => chunk(args).await?,
        Commands::Commp {
            file,
            rename,
            add_padding,
        } => {
            let commitment = commit_file(&file, rename, add_padding)?;
            println!("PieceCID: {}, PieceSize: {}", commitment.root, commitment.piece_size);
        }
    }

    Ok(())
}

fn load_config(args: &ChunkArgs) -> Result<SliceConfig> {
    let mut config = match &args.config {
        Some(path) if path.exists() => SliceConfig::load_with_env(path)?,
        other => {
            if let Some(path) = other {
                info!(path = %path.display(), "config file not found, using defaults");
            }
            let mut config = SliceConfig::default();
            let applied = piececonf::apply_env_overrides(&mut config);
            if !applied.is_empty() {
                info!(?applied, "environment overrides applied");
            }
            config
        }
    };
    if let Some(slice_size) = args.slice_size {
        config.slice_size = slice_size;
    }
    config.validate()?;
    info!(
        slice_size = config.slice_size,
        reserved = config.reserved_bytes()?,
        "capacity configuration"
    );
    Ok(config)
}

async fn build_feeder(args: &ChunkArgs, config: &SliceConfig) -> Result<Arc<dyn Feeder>> {
    if let Some(video) = &args.video_path {
        if config.extra_file_path.is_some() {
            warn!("both a seed video and an extra file path are set, using the video");
        }
        let output_dir = args
            .video_output_path
            .clone()
            .unwrap_or_else(|| args.inputs[0].clone());
        let base_rename = args
            .base_rename
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let reserved = parse_size(&args.video_reserve)?;
        if reserved == 0 {
            warn!("no --video-reserve set, video segments are added on top of the slice size");
        }

        let feeder = VideoFeeder::new(video, output_dir, base_rename, Box::new(Ffmpeg::default()))
            .context("failed to set up video feeder")?
            .with_start_index(args.base_limit)
            .with_step(Duration::from_millis(args.video_step_ms))
            .with_reserved_bytes(reserved);
        return Ok(Arc::new(feeder));
    }

    if let Some(dir) = &config.extra_file_path {
        let reserved = config.reserved_bytes()?;
        let feeder = ExtraFileFeeder::from_dir(
            dir,
            reserved,
            args.random_rename_source_file,
            args.walk_workers,
        )
        .await
        .context("failed to set up extra file feeder")?;
        return Ok(Arc::new(feeder));
    }

    Ok(Arc::new(NoFeeder))
}

fn build_callback(args: &ChunkArgs) -> BuildCallback {
    if args.calc_commp {
        BuildCallback::commitment_recording(&args.car_dir, args.rename, args.add_padding)
    } else if args.save_manifest {
        BuildCallback::manifest_only(&args.car_dir)
    } else {
        BuildCallback::discard()
    }
}

fn require_dir(path: &Path, what: &str) -> Result<()> {
    let metadata = std::fs::metadata(path).with_context(|| format!("{what} {} is not accessible", path.display()))?;
    if !metadata.is_dir() {
        bail!("{what} {} is not a directory", path.display());
    }
    Ok(())
}

async fn chunk(args: ChunkArgs) -> Result<()> {
    let mut config = load_config(&args)?;
    require_dir(&args.car_dir, "car dir")?;
    if args.graph_name.is_empty() {
        bail!("graph name is required");
    }

    let store = match &args.db {
        Some(path) => Some(Arc::new(
            MetadataStore::open(path).with_context(|| format!("failed to open database {}", path.display()))?,
        )),
        None => None,
    };
    let ctx = RunContext {
        builder: Arc::new(FlatArchiveBuilder),
        callback: Arc::new(build_callback(&args)),
        feeder: build_feeder(&args, &config).await?,
        store,
    };

    let params = RunParams {
        inputs: args.inputs.clone(),
        parent_path: args.parent_path.clone().or_else(|| args.inputs.first().cloned()),
        graph_name: args.graph_name.clone(),
        target_capacity: config.slice_size,
        parallel: args.parallel,
        walk_workers: args.walk_workers,
        random_select_file: args.random_select_file,
        random_rename_source_file: args.random_rename_source_file,
        skip_filename: args.skip_filename,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT, shutting down...");
                cancel.cancel();
            }
        });
    }

    if args.run_loop {
        let loop_params = LoopParams {
            config_path: args.config.clone(),
            capacity_step: args.capacity_step,
            ..LoopParams::default()
        };
        let runs = run_loop(params, &ctx, &mut config, &loop_params, &cancel).await?;
        info!(runs, "loop finished");
    } else {
        let report = run_once(&params, &ctx, &cancel).await?;
        info!(
            files = report.files,
            skipped = report.skipped,
            slices = report.slices,
            "completed"
        );
    }

    Ok(())
}
