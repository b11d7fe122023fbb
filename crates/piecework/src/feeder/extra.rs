use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use piececonf::PIECE_CEILING;
use tracing::{debug, info};

use super::{Feeder, FeederBudget, FeederError};
use crate::descriptor::{Anonymizer, FileDescriptor};
use crate::enumerate::{enumerate, shuffle};

/// Mixes files from a side directory into every slice.
///
/// The candidate list is enumerated and shuffled once. Each batch continues
/// round-robin from where the previous one stopped, so successive slices get
/// different files.
#[derive(Debug)]
pub struct ExtraFileFeeder {
    candidates: Vec<FileDescriptor>,
    cursor: Mutex<usize>,
    reserved_bytes: u64,
    ceiling: u64,
}

impl ExtraFileFeeder {
    /// Enumerate `dir` and build a feeder over its files.
    ///
    /// With `anonymize` every candidate is renamed once here.
    pub async fn from_dir(
        dir: &Path,
        reserved_bytes: u64,
        anonymize: bool,
        workers: usize,
    ) -> Result<Self, FeederError> {
        let metadata = std::fs::metadata(dir).map_err(|e| FeederError::SourceMissing {
            path: dir.to_path_buf(),
            source: e,
        })?;
        if !metadata.is_dir() {
            return Err(FeederError::NotADirectory(dir.to_path_buf()));
        }

        let found = enumerate(&[PathBuf::from(dir)], workers).await?;
        let mut candidates = found.files;
        if anonymize {
            candidates = candidates.into_iter().map(|d| Anonymizer.rename(d)).collect();
        }
        shuffle(&mut candidates);

        info!(
            dir = %dir.display(),
            candidates = candidates.len(),
            skipped = found.skipped,
            reserved_bytes,
            "extra file feeder ready"
        );
        Ok(Self::from_candidates(candidates, reserved_bytes))
    }

    /// Feeder over an explicit candidate list, used as given.
    pub fn from_candidates(candidates: Vec<FileDescriptor>, reserved_bytes: u64) -> Self {
        Self {
            candidates,
            cursor: Mutex::new(0),
            reserved_bytes,
            ceiling: PIECE_CEILING,
        }
    }

    /// Override the absolute ceiling.
    pub fn with_ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }
}

impl Feeder for ExtraFileFeeder {
    fn budget(&self) -> FeederBudget {
        FeederBudget {
            reserved_bytes: self.reserved_bytes,
            hard_cap_bytes: self.ceiling,
        }
    }

    /// A candidate is admitted only while the batch plus `target` stays
    /// within the ceiling, so the check follows the capacity of each run.
    fn next_batch(&self, target: u64) -> Vec<FileDescriptor> {
        let count = self.candidates.len();
        if count == 0 {
            return Vec::new();
        }

        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let start = *cursor;
        let mut total = 0u64;
        let mut batch = Vec::new();

        while total < self.reserved_bytes {
            let candidate = &self.candidates[*cursor];
            let size = candidate.size_in_slice();
            if total + size + target <= self.ceiling {
                total += size;
                batch.push(candidate.clone());
            }
            *cursor = (*cursor + 1) % count;
            if *cursor == start {
                break;
            }
        }

        debug!(files = batch.len(), bytes = total, cursor = *cursor, "extra file batch");
        batch
    }
}
