//! Run orchestration: enumerate, partition, build, record.
//!
//! The partitioner runs on a blocking thread and hands plans through a
//! bounded channel to a pool of build jobs. Plans are numbered before they
//! leave the partitioner, so completion order does not matter. The first
//! failing job cancels the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use piececas::{ArchiveBuilder, ArchiveSource};
use piececonf::SliceConfig;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callback::{BuildCallback, SliceRecord};
use crate::descriptor::{slice_name, FileDescriptor, SlicePlan};
use crate::enumerate::{enumerate, shuffle};
use crate::feeder::Feeder;
use crate::partition::{PartitionError, Partitioner, SliceSink};
use crate::store::{MetadataStore, NewPieceManifest, Status, StoreError};

/// Delay between runs in loop mode.
pub const LOOP_DELAY: Duration = Duration::from_secs(60);

/// Inputs of a single run.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub inputs: Vec<PathBuf>,
    /// Entry names keep their directory relative to this path.
    pub parent_path: Option<PathBuf>,
    pub graph_name: String,
    pub target_capacity: i64,
    /// Slices built concurrently.
    pub parallel: usize,
    /// Directory walkers during enumeration.
    pub walk_workers: usize,
    pub random_select_file: bool,
    pub random_rename_source_file: bool,
    /// Leave entry names out of the manifest detail.
    pub skip_filename: bool,
}

impl RunParams {
    pub fn new(inputs: Vec<PathBuf>, graph_name: impl Into<String>, target_capacity: i64) -> Self {
        Self {
            inputs,
            parent_path: None,
            graph_name: graph_name.into(),
            target_capacity,
            parallel: 2,
            walk_workers: 4,
            random_select_file: true,
            random_rename_source_file: false,
            skip_filename: true,
        }
    }
}

/// Collaborators shared by every slice of a run.
#[derive(Clone)]
pub struct RunContext {
    pub builder: Arc<dyn ArchiveBuilder>,
    pub callback: Arc<BuildCallback>,
    pub feeder: Arc<dyn Feeder>,
    pub store: Option<Arc<MetadataStore>>,
}

/// Outcome of one run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub files: usize,
    pub skipped: u64,
    pub slices: u64,
    pub input_bytes: u64,
    pub supplementary_bytes: u64,
    /// Finished slices in slice order.
    pub records: Vec<SliceRecord>,
}

struct ChannelSink {
    tx: mpsc::Sender<SlicePlan>,
}

impl SliceSink for ChannelSink {
    fn accept(&mut self, plan: SlicePlan) -> Result<(), PartitionError> {
        let index = plan.slice_index;
        self.tx.blocking_send(plan).map_err(|_| PartitionError::SinkClosed(index))
    }
}

/// Everything a build job needs for one slice.
struct SliceJob {
    plan: SlicePlan,
    graph_name: String,
    parent_path: Option<PathBuf>,
    skip_filename: bool,
    builder: Arc<dyn ArchiveBuilder>,
    callback: Arc<BuildCallback>,
    store: Option<Arc<MetadataStore>>,
}

impl SliceJob {
    fn run(self) -> Result<SliceRecord> {
        let index = self.plan.slice_index;
        let name = slice_name(&self.graph_name, index, self.plan.slice_total);
        let sources: Vec<ArchiveSource> = self
            .plan
            .all()
            .map(|d| ArchiveSource {
                path: d.path().to_path_buf(),
                entry_name: entry_name(self.parent_path.as_deref(), d),
                byte_start: d.byte_start(),
                len: d.size_in_slice(),
            })
            .collect();

        debug!(slice = index, name = %name, entries = sources.len(), "building slice");
        let built = self
            .builder
            .build(&name, &sources)
            .and_then(|archive| archive.detail(self.skip_filename).map(|detail| (archive, detail)));
        let (archive, detail) = match built {
            Ok(built) => built,
            Err(e) => return Err(self.callback.on_error(&name, e).into()),
        };

        let record = self.callback.on_success(index, &archive, &detail)?;
        if let Some(store) = &self.store {
            record_piece(store, &record)?;
        }

        info!(
            slice = index,
            name = %name,
            payload_cid = %record.payload_cid,
            payload_size = record.payload_size,
            "slice finished"
        );
        Ok(record)
    }
}

fn record_piece(store: &MetadataStore, record: &SliceRecord) -> Result<()> {
    let (Some(piece_cid), Some(piece_size)) = (&record.piece_cid, record.piece_size) else {
        return Ok(());
    };
    let manifest = NewPieceManifest {
        payload_cid: record.payload_cid.to_string(),
        filename: record.slice_name.clone(),
        piece_cid: piece_cid.to_string(),
        payload_size: i64::try_from(record.payload_size).context("payload size overflows the store")?,
        piece_size: i64::try_from(piece_size).context("piece size overflows the store")?,
        detail: record.detail.clone(),
        status: Status::Completed,
    };
    match store.create(&manifest) {
        Ok(_) => Ok(()),
        Err(StoreError::Duplicate(cid)) => {
            warn!(payload_cid = %cid, "piece already recorded");
            Ok(())
        }
        Err(e) => Err(e).context("failed to record piece"),
    }
}

/// Name of a descriptor inside the archive: its display name, under its
/// directory relative to `parent` when it lives below it.
fn entry_name(parent: Option<&Path>, descriptor: &FileDescriptor) -> String {
    let dir = parent
        .and_then(|p| descriptor.path().strip_prefix(p).ok())
        .and_then(Path::parent)
        .filter(|d| !d.as_os_str().is_empty());
    match dir {
        Some(dir) => dir.join(descriptor.display_name()).to_string_lossy().into_owned(),
        None => descriptor.display_name().to_string(),
    }
}

/// One complete run over `params.inputs`.
pub async fn run_once(params: &RunParams, ctx: &RunContext, cancel: &CancellationToken) -> Result<RunReport> {
    // Capacity problems are fatal before any I/O
    Partitioner::new(params.target_capacity, ctx.feeder.as_ref())?;

    let enumeration = enumerate(&params.inputs, params.walk_workers)
        .await
        .context("enumeration failed")?;
    let total_bytes = enumeration.total_bytes();
    let mut report = RunReport {
        files: enumeration.files.len(),
        skipped: enumeration.skipped,
        ..RunReport::default()
    };
    info!(
        files = report.files,
        skipped = report.skipped,
        total_bytes,
        "enumeration finished"
    );

    if total_bytes == 0 {
        info!("nothing to slice, input is empty");
        return Ok(report);
    }

    let mut files = enumeration.files;
    if params.random_select_file {
        shuffle(&mut files);
    }

    let run_token = cancel.child_token();
    let parallel = params.parallel.max(1);
    let (tx, mut rx) = mpsc::channel::<SlicePlan>(parallel);

    let partitioner = {
        let feeder = ctx.feeder.clone();
        let token = run_token.clone();
        let target = params.target_capacity;
        let anonymize = params.random_rename_source_file;
        tokio::task::spawn_blocking(move || {
            let mut partitioner = Partitioner::new(target, feeder.as_ref())?.anonymize(anonymize);
            let mut sink = ChannelSink { tx };
            partitioner.partition(&files, &mut sink, &token)
        })
    };

    let permits = Arc::new(Semaphore::new(parallel));
    let mut jobs = JoinSet::new();
    let mut failure: Option<anyhow::Error> = None;

    while let Some(plan) = rx.recv().await {
        while let Some(done) = jobs.try_join_next() {
            settle(done, &mut report, &mut failure, &run_token);
        }
        if failure.is_some() || run_token.is_cancelled() {
            break;
        }

        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => permit.context("build pool closed")?,
            _ = run_token.cancelled() => break,
        };
        let job = SliceJob {
            plan,
            graph_name: params.graph_name.clone(),
            parent_path: params.parent_path.clone(),
            skip_filename: params.skip_filename,
            builder: ctx.builder.clone(),
            callback: ctx.callback.clone(),
            store: ctx.store.clone(),
        };
        jobs.spawn_blocking(move || {
            let _permit = permit;
            job.run()
        });
    }
    // Unblocks the partitioner if we stopped early
    drop(rx);

    while let Some(done) = jobs.join_next().await {
        settle(done, &mut report, &mut failure, &run_token);
    }

    let partitioned = partitioner.await.context("partitioner panicked")?;
    if let Some(err) = failure {
        return Err(err);
    }
    let summary = partitioned?;

    if summary.input_bytes != total_bytes {
        bail!(PartitionError::Invariant(format!(
            "partitioned {} bytes out of {}",
            summary.input_bytes, total_bytes
        )));
    }

    report.slices = summary.slices;
    report.input_bytes = summary.input_bytes;
    report.supplementary_bytes = summary.supplementary_bytes;
    report.records.sort_by_key(|r| r.slice_index);
    info!(
        slices = report.slices,
        input_bytes = report.input_bytes,
        supplementary_bytes = report.supplementary_bytes,
        skipped = report.skipped,
        "run finished"
    );
    Ok(report)
}

fn settle(
    done: Result<Result<SliceRecord>, tokio::task::JoinError>,
    report: &mut RunReport,
    failure: &mut Option<anyhow::Error>,
    run_token: &CancellationToken,
) {
    let outcome = done.context("build job panicked").and_then(|r| r);
    match outcome {
        Ok(record) => report.records.push(record),
        Err(e) => {
            run_token.cancel();
            if failure.is_none() {
                *failure = Some(e);
            } else {
                debug!(error = %e, "additional failure after cancellation");
            }
        }
    }
}

/// Loop-mode settings.
#[derive(Debug, Clone)]
pub struct LoopParams {
    /// Where the adjusted capacity is persisted after each run.
    pub config_path: Option<PathBuf>,
    /// Capacity added after each successful run, 0 keeps it fixed.
    pub capacity_step: i64,
    pub delay: Duration,
}

impl Default for LoopParams {
    fn default() -> Self {
        Self {
            config_path: None,
            capacity_step: 1,
            delay: LOOP_DELAY,
        }
    }
}

/// Repeat runs until cancelled. Returns the number of successful runs.
///
/// A failed run is logged and retried after the delay. The capacity used by
/// each run comes from `config`, which is adjusted and persisted after every
/// successful run.
pub async fn run_loop(
    mut params: RunParams,
    ctx: &RunContext,
    config: &mut SliceConfig,
    loop_params: &LoopParams,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut runs = 0u64;
    loop {
        if cancel.is_cancelled() {
            info!(runs, "loop cancelled");
            break;
        }

        params.target_capacity = config.slice_size;
        match run_once(&params, ctx, cancel).await {
            Ok(report) => {
                runs += 1;
                info!(run = runs, slices = report.slices, capacity = params.target_capacity, "loop run done");
                if loop_params.capacity_step > 0 {
                    let next = config.bump_capacity(loop_params.capacity_step);
                    if let Some(path) = &loop_params.config_path {
                        config.save(path)?;
                    }
                    info!(capacity = next, "capacity adjusted for next run");
                }
            }
            Err(e) if cancel.is_cancelled() => {
                info!(error = %format!("{e:#}"), "run stopped by cancellation");
                break;
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "run failed, retrying after delay");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(runs, "loop cancelled");
                break;
            }
            _ = tokio::time::sleep(loop_params.delay) => {}
        }
    }
    Ok(runs)
}
