//! Supplementary content injected into every slice.
//!
//! A feeder reserves part of each slice's capacity and, whenever the
//! partitioner emits a slice, hands back a batch of descriptors to ride in that
//! reservation. Feeder failures are never fatal to a run: the affected call
//! returns an empty batch and the slice goes out without supplementary content.

mod extra;
mod video;

pub use extra::ExtraFileFeeder;
pub use video::{format_timestamp, Ffmpeg, SegmentTool, VideoFeeder};

use std::io;
use std::path::PathBuf;

use piececonf::PIECE_CEILING;
use thiserror::Error;

use crate::descriptor::FileDescriptor;
use crate::enumerate::EnumerateError;

/// Byte budget of a feeder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeederBudget {
    /// Subtracted from the target capacity before partitioning input files.
    pub reserved_bytes: u64,
    /// Ceiling that feeder items plus partitioner items may never exceed.
    pub hard_cap_bytes: u64,
}

impl FeederBudget {
    pub fn new(reserved_bytes: u64) -> Self {
        Self {
            reserved_bytes,
            hard_cap_bytes: PIECE_CEILING,
        }
    }
}

/// Source of supplementary descriptors.
pub trait Feeder: Send + Sync {
    fn budget(&self) -> FeederBudget;

    /// Descriptors for the slice about to be emitted. May be empty.
    ///
    /// `target` is the full capacity of that slice, reservation included.
    fn next_batch(&self, target: u64) -> Vec<FileDescriptor>;
}

/// Feeder that reserves nothing and never contributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFeeder;

impl Feeder for NoFeeder {
    fn budget(&self) -> FeederBudget {
        FeederBudget::new(0)
    }

    fn next_batch(&self, _target: u64) -> Vec<FileDescriptor> {
        Vec::new()
    }
}

/// Errors raised while setting up a feeder or producing a batch.
#[derive(Debug, Error)]
pub enum FeederError {
    #[error("feeder source {path} is not accessible: {source}")]
    SourceMissing { path: PathBuf, source: io::Error },

    #[error("the path {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("failed to prepare {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} exited with {status}, stderr: {stderr}")]
    Tool {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("no usable duration for {path}: {output:?}")]
    NoDuration { path: PathBuf, output: String },

    #[error("output file was not created: {0}")]
    MissingOutput(PathBuf),

    #[error(transparent)]
    Enumerate(#[from] EnumerateError),
}
