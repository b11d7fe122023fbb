//! The slice partitioner.
//!
//! Files are taken in the order given and accumulated until the usable
//! capacity (target minus the feeder's reservation) is reached. A file that
//! does not fit is cut: the first range fills the current slice, further
//! ranges fill whole slices, and whatever is left carries into the next one.
//! Every emit asks the feeder for a batch to ride in the reserved bytes.
//!
//! Zero-length files are moved to the front, keeping their relative order, so
//! they ride in the first slice and never open a slice of their own.
//!
//! The partitioner is synchronous and does no I/O of its own beyond what the
//! feeder does, so the arithmetic can be tested without touching a disk.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::descriptor::{Anonymizer, FileDescriptor, SlicePlan};
use crate::feeder::Feeder;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("slice size has been set as {0}, it must be greater than 0")]
    InvalidCapacity(i64),

    #[error("feeder reserves {reserved} of {target} bytes, leaving no room for input")]
    NoRoomForInput { target: u64, reserved: u64 },

    #[error("partition invariant violated: {0}")]
    Invariant(String),

    #[error("cancelled before emitting slice {0}")]
    Cancelled(u64),

    #[error("slice {0} could not be handed off, the consumer is gone")]
    SinkClosed(u64),
}

/// Receives finished plans in partition order.
pub trait SliceSink {
    fn accept(&mut self, plan: SlicePlan) -> Result<(), PartitionError>;
}

impl SliceSink for Vec<SlicePlan> {
    fn accept(&mut self, plan: SlicePlan) -> Result<(), PartitionError> {
        self.push(plan);
        Ok(())
    }
}

/// Totals of one partition run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    pub slices: u64,
    pub slice_total: u64,
    pub input_bytes: u64,
    pub supplementary_bytes: u64,
}

/// Number of slices a run over `sizes` emits at usable capacity `cap`:
/// `ceil(total / cap)`. Zero input yields zero.
pub fn slice_total(sizes: impl IntoIterator<Item = u64>, cap: u64) -> u64 {
    if cap == 0 {
        return 0;
    }
    sizes.into_iter().sum::<u64>().div_ceil(cap)
}

/// The slice under construction.
#[derive(Debug, Default)]
struct SliceAccumulator {
    size: u64,
    descriptors: Vec<FileDescriptor>,
}

impl SliceAccumulator {
    fn push(&mut self, descriptor: FileDescriptor) {
        self.size += descriptor.size_in_slice();
        self.descriptors.push(descriptor);
    }

    fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    fn take(&mut self) -> Vec<FileDescriptor> {
        self.size = 0;
        std::mem::take(&mut self.descriptors)
    }
}

/// Splits an ordered file list into slice plans.
pub struct Partitioner<'a> {
    target: u64,
    capacity: u64,
    feeder: &'a dyn Feeder,
    anonymizer: Option<Anonymizer>,
    slice_index: u64,
}

impl<'a> Partitioner<'a> {
    /// `target` is the full slice capacity; the feeder's reservation is taken
    /// out of it here.
    pub fn new(target: i64, feeder: &'a dyn Feeder) -> Result<Self, PartitionError> {
        if target <= 0 {
            return Err(PartitionError::InvalidCapacity(target));
        }
        let target = target as u64;
        let reserved = feeder.budget().reserved_bytes;
        if reserved >= target {
            return Err(PartitionError::NoRoomForInput { target, reserved });
        }
        Ok(Self {
            target,
            capacity: target - reserved,
            feeder,
            anonymizer: None,
            slice_index: 0,
        })
    }

    /// Rename every input descriptor before it is handed on.
    pub fn anonymize(mut self, enabled: bool) -> Self {
        self.anonymizer = enabled.then_some(Anonymizer);
        self
    }

    /// Usable capacity per slice for input files.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn partition(
        &mut self,
        files: &[FileDescriptor],
        sink: &mut dyn SliceSink,
        cancel: &CancellationToken,
    ) -> Result<PartitionSummary, PartitionError> {
        let cap = self.capacity;
        let mut summary = PartitionSummary {
            slice_total: slice_total(files.iter().map(FileDescriptor::size_in_slice), cap),
            ..PartitionSummary::default()
        };
        let mut acc = SliceAccumulator::default();

        let empty = files.iter().filter(|f| f.size_in_slice() == 0);
        let sized = files.iter().filter(|f| f.size_in_slice() > 0);
        for file in empty.chain(sized) {
            let size = file.size_in_slice();

            if acc.size + size <= cap {
                acc.push(self.rename(file.clone()));
                if acc.size == cap {
                    self.emit(&mut acc, sink, cancel, &mut summary)?;
                }
                continue;
            }

            let mut offset = 0u64;
            let mut seq = 0u32;
            while offset < size {
                let room = cap - acc.size;
                let len = room.min(size - offset);
                let name = format!("{}.{:08}", file.display_name(), seq);
                acc.push(self.rename(file.cut(name, offset, len)));
                offset += len;
                seq += 1;

                if acc.size == cap {
                    self.emit(&mut acc, sink, cancel, &mut summary)?;
                }
            }
        }

        if acc.size > 0 {
            self.emit(&mut acc, sink, cancel, &mut summary)?;
        } else if !acc.is_empty() {
            debug!(files = acc.descriptors.len(), "input holds only empty files, nothing to emit");
        }

        if summary.slices != summary.slice_total {
            return Err(PartitionError::Invariant(format!(
                "emitted {} slices, expected {}",
                summary.slices, summary.slice_total
            )));
        }
        Ok(summary)
    }

    fn rename(&self, descriptor: FileDescriptor) -> FileDescriptor {
        match &self.anonymizer {
            Some(anonymizer) => anonymizer.rename(descriptor),
            None => descriptor,
        }
    }

    fn emit(
        &mut self,
        acc: &mut SliceAccumulator,
        sink: &mut dyn SliceSink,
        cancel: &CancellationToken,
        summary: &mut PartitionSummary,
    ) -> Result<(), PartitionError> {
        if cancel.is_cancelled() {
            return Err(PartitionError::Cancelled(self.slice_index));
        }
        if acc.size > self.capacity {
            return Err(PartitionError::Invariant(format!(
                "slice {} holds {} bytes, capacity is {}",
                self.slice_index, acc.size, self.capacity
            )));
        }

        let input_bytes = acc.size;
        let budget = self.feeder.budget();
        let mut room = budget.hard_cap_bytes.saturating_sub(input_bytes);
        let mut supplementary = self.feeder.next_batch(self.target);
        supplementary.retain(|d| {
            let size = d.size_in_slice();
            if size <= room {
                room -= size;
                true
            } else {
                warn!(
                    slice = self.slice_index,
                    path = %d.path().display(),
                    size,
                    "dropping supplementary file over the piece ceiling"
                );
                false
            }
        });

        let plan = SlicePlan {
            slice_index: self.slice_index,
            slice_total: summary.slice_total,
            supplementary,
            descriptors: acc.take(),
        };
        let supplementary_bytes = plan.supplementary_bytes();
        debug!(
            slice = plan.slice_index,
            total = plan.slice_total,
            files = plan.descriptors.len(),
            input_bytes,
            supplementary_bytes,
            "slice planned"
        );

        sink.accept(plan)?;
        self.slice_index += 1;
        summary.slices += 1;
        summary.input_bytes += input_bytes;
        summary.supplementary_bytes += supplementary_bytes;
        Ok(())
    }
}
