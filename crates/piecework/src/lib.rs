//! Piecework - partition file corpora into fixed-capacity slices.
//!
//! A run walks one or more input roots, cuts the files into an ordered
//! sequence of slices no larger than the target capacity (splitting files
//! across slice boundaries by byte range), mixes optional supplementary
//! content into each slice, and hands every slice to a builder and callback
//! that turn it into a content-addressed archive.
//!
//! # Pipeline
//!
//! ```text
//! enumerate ──> partition ──> build archive ──> callback ──> store
//!   (pool)      (single)        (pool)          (manifest)
//!                  ^
//!                feeder
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use piececas::FlatArchiveBuilder;
//! use piecework::{run_once, BuildCallback, NoFeeder, RunContext, RunParams};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let params = RunParams::new(vec!["/data/set".into()], "dataset", 18 << 30);
//! let ctx = RunContext {
//!     builder: Arc::new(FlatArchiveBuilder),
//!     callback: Arc::new(BuildCallback::commitment_recording("/data/cars", false, false)),
//!     feeder: Arc::new(NoFeeder),
//!     store: None,
//! };
//! let report = run_once(&params, &ctx, &CancellationToken::new()).await?;
//! println!("{} slices", report.slices);
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod descriptor;
pub mod driver;
pub mod enumerate;
pub mod feeder;
pub mod partition;
pub mod store;

pub use callback::{BuildCallback, CallbackError, SliceRecord};
pub use descriptor::{slice_name, Anonymizer, FileDescriptor, SlicePlan};
pub use driver::{run_loop, run_once, LoopParams, RunContext, RunParams, RunReport, LOOP_DELAY};
pub use enumerate::{enumerate, shuffle, shuffle_with_seed, EnumerateError, Enumeration};
pub use feeder::{ExtraFileFeeder, Feeder, FeederBudget, FeederError, Ffmpeg, NoFeeder, SegmentTool, VideoFeeder};
pub use partition::{slice_total, PartitionError, PartitionSummary, Partitioner, SliceSink};
pub use store::{MetadataStore, NewPieceManifest, PieceManifest, Status, StatusStats, StoreError};
