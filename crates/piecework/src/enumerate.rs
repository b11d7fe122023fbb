//! File enumeration over one or more roots.
//!
//! Each root is fanned out into work units (its immediate files, plus one unit
//! per subdirectory) which are walked on a bounded pool of blocking tasks. All
//! workers publish into a single channel drained by one collector, so the
//! emitted order is unspecified. The result is sorted and deduplicated by path
//! before it is returned.
//!
//! Unreadable entries are skipped and counted, never fatal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::descriptor::FileDescriptor;

const CHANNEL_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum EnumerateError {
    #[error("enumeration worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("enumeration worker pool closed")]
    PoolClosed,
}

/// Everything the walk found.
#[derive(Debug, Default)]
pub struct Enumeration {
    /// Whole-file descriptors sorted by path.
    pub files: Vec<FileDescriptor>,
    /// Entries that could not be read.
    pub skipped: u64,
}

impl Enumeration {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(FileDescriptor::size_in_slice).sum()
    }
}

enum Found {
    File(FileDescriptor),
    Skipped { path: Option<PathBuf>, reason: String },
}

/// Walk `roots` with at most `workers` blocking walkers in flight.
pub async fn enumerate(roots: &[PathBuf], workers: usize) -> Result<Enumeration, EnumerateError> {
    let (tx, mut rx) = mpsc::channel::<Found>(CHANNEL_DEPTH);

    let collector = tokio::spawn(async move {
        let mut out = Enumeration::default();
        while let Some(found) = rx.recv().await {
            match found {
                Found::File(descriptor) => out.files.push(descriptor),
                Found::Skipped { path, reason } => {
                    warn!(path = ?path, %reason, "skipping unreadable entry");
                    out.skipped += 1;
                }
            }
        }
        out
    });

    let units = {
        let roots = roots.to_vec();
        let tx = tx.clone();
        tokio::task::spawn_blocking(move || fan_out(&roots, &tx)).await?
    };
    debug!(units = units.len(), workers, "walking subdirectories");

    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut walkers = JoinSet::new();
    for unit in units {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EnumerateError::PoolClosed)?;
        let tx = tx.clone();
        walkers.spawn_blocking(move || {
            let _permit = permit;
            walk(&unit, &tx);
        });
    }
    drop(tx);

    while let Some(joined) = walkers.join_next().await {
        joined?;
    }

    let mut enumeration = collector.await?;
    enumeration.files.sort_by(|a, b| a.path().cmp(b.path()));
    enumeration.files.dedup_by(|a, b| a.path() == b.path());
    Ok(enumeration)
}

/// Emit the files sitting directly in each root and return its
/// subdirectories as separate work units. A root that is itself a file is
/// emitted as is.
fn fan_out(roots: &[PathBuf], tx: &mpsc::Sender<Found>) -> Vec<PathBuf> {
    let mut units = Vec::new();
    for root in roots {
        let metadata = match std::fs::metadata(root) {
            Ok(metadata) => metadata,
            Err(e) => {
                send(tx, Found::Skipped {
                    path: Some(root.clone()),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if !metadata.is_dir() {
            if metadata.is_file() {
                send(tx, Found::File(FileDescriptor::whole(root.clone(), metadata.len())));
            }
            continue;
        }

        for entry in WalkDir::new(root).min_depth(1).max_depth(1).follow_links(true) {
            match entry {
                Ok(entry) if entry.file_type().is_dir() => units.push(entry.into_path()),
                Ok(entry) => emit_entry(entry, tx),
                Err(e) => send(tx, skipped(e)),
            }
        }
    }
    units
}

fn walk(root: &Path, tx: &mpsc::Sender<Found>) {
    for entry in WalkDir::new(root).follow_links(true) {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => {}
            Ok(entry) => emit_entry(entry, tx),
            Err(e) => send(tx, skipped(e)),
        }
    }
}

fn emit_entry(entry: walkdir::DirEntry, tx: &mpsc::Sender<Found>) {
    if !entry.file_type().is_file() {
        return;
    }
    match entry.metadata() {
        Ok(metadata) => send(tx, Found::File(FileDescriptor::whole(entry.into_path(), metadata.len()))),
        Err(e) => send(tx, skipped(e)),
    }
}

fn skipped(e: walkdir::Error) -> Found {
    Found::Skipped {
        path: e.path().map(Path::to_path_buf),
        reason: e.to_string(),
    }
}

fn send(tx: &mpsc::Sender<Found>, found: Found) {
    // The collector outlives every walker, a failed send means it panicked
    if tx.blocking_send(found).is_err() {
        warn!("enumeration collector is gone");
    }
}

/// Uniform shuffle for randomized slice composition.
pub fn shuffle(files: &mut [FileDescriptor]) {
    files.shuffle(&mut rand::thread_rng());
}

/// Reproducible shuffle.
pub fn shuffle_with_seed(files: &mut [FileDescriptor], seed: u64) {
    files.shuffle(&mut StdRng::seed_from_u64(seed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, len: usize) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, vec![b'x'; len]).unwrap();
        path
    }

    #[tokio::test]
    async fn test_enumerates_every_file_once() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "top.bin", 3);
        write(temp_dir.path(), "a/one.bin", 5);
        write(temp_dir.path(), "a/deep/two.bin", 7);
        write(temp_dir.path(), "b/three.bin", 11);
        write(temp_dir.path(), "b/empty", 0);

        let found = enumerate(&[temp_dir.path().to_path_buf()], 3).await.unwrap();

        assert_eq!(found.files.len(), 5);
        assert_eq!(found.skipped, 0);
        assert_eq!(found.total_bytes(), 26);
        assert!(found.files.iter().all(FileDescriptor::is_whole));
    }

    #[tokio::test]
    async fn test_overlapping_roots_do_not_duplicate() {
        let temp_dir = TempDir::new().unwrap();
        let file = write(temp_dir.path(), "sub/file.bin", 4);

        let roots = vec![temp_dir.path().to_path_buf(), temp_dir.path().join("sub"), file];
        let found = enumerate(&roots, 2).await.unwrap();

        assert_eq!(found.files.len(), 1);
        assert_eq!(found.total_bytes(), 4);
    }

    #[tokio::test]
    async fn test_missing_root_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "ok.bin", 2);

        let roots = vec![temp_dir.path().join("missing"), temp_dir.path().to_path_buf()];
        let found = enumerate(&roots, 1).await.unwrap();

        assert_eq!(found.files.len(), 1);
        assert_eq!(found.skipped, 1);
    }

    #[tokio::test]
    async fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let found = enumerate(&[temp_dir.path().to_path_buf()], 4).await.unwrap();
        assert!(found.files.is_empty());
        assert_eq!(found.skipped, 0);
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() {
        let files: Vec<FileDescriptor> = (0..32)
            .map(|i| FileDescriptor::whole(format!("/in/{i:02}"), i))
            .collect();

        let mut a = files.clone();
        let mut b = files.clone();
        shuffle_with_seed(&mut a, 7);
        shuffle_with_seed(&mut b, 7);
        assert_eq!(a, b);
        assert_ne!(a, files);

        let mut sorted = a;
        sorted.sort_by(|x, y| x.path().cmp(y.path()));
        assert_eq!(sorted, files);
    }
}
