//! What happens to a slice once its archive is built.
//!
//! Exactly one of [`BuildCallback::on_success`] or [`BuildCallback::on_error`]
//! runs per slice. Both report failures back to the caller instead of ending
//! the process; the driver treats any of them as fatal to the run.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use piececas::archive::archive_path;
use piececas::{ArchiveError, CommitmentId, ContentId, ManifestRow, ManifestWriter, PieceCommitment, SliceArchive};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("failed to build slice {slice}: {source}")]
    Build { slice: String, source: ArchiveError },

    #[error("failed to persist {path}: {source}")]
    Persist { path: PathBuf, source: io::Error },

    #[error("failed to append to manifest {path}: {source}")]
    Manifest { path: PathBuf, source: io::Error },
}

/// Metadata of one finished slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceRecord {
    pub slice_index: u64,
    pub slice_name: String,
    pub payload_cid: ContentId,
    pub piece_cid: Option<CommitmentId>,
    pub payload_size: u64,
    pub piece_size: Option<u64>,
    pub detail: String,
    pub archive_path: Option<PathBuf>,
}

/// The closed set of slice handlers.
#[derive(Debug)]
pub enum BuildCallback {
    /// Compute the piece commitment, write the archive named after it, and
    /// append a full manifest row.
    CommitmentRecording {
        car_dir: PathBuf,
        /// Drop the `.car` suffix from the written archive.
        rename: bool,
        /// Zero-pad the written archive to its piece size.
        add_padding: bool,
        manifest: ManifestWriter,
    },
    /// Write the archive named after its content id and append a light row.
    ManifestOnly { car_dir: PathBuf, manifest: ManifestWriter },
    /// Dry run: nothing is persisted.
    Discard,
}

impl BuildCallback {
    pub fn commitment_recording(car_dir: impl Into<PathBuf>, rename: bool, add_padding: bool) -> Self {
        let car_dir = car_dir.into();
        Self::CommitmentRecording {
            manifest: ManifestWriter::in_dir(&car_dir),
            car_dir,
            rename,
            add_padding,
        }
    }

    pub fn manifest_only(car_dir: impl Into<PathBuf>) -> Self {
        let car_dir = car_dir.into();
        Self::ManifestOnly {
            manifest: ManifestWriter::in_dir(&car_dir),
            car_dir,
        }
    }

    pub fn discard() -> Self {
        Self::Discard
    }

    pub fn on_success(
        &self,
        slice_index: u64,
        archive: &SliceArchive,
        detail: &str,
    ) -> Result<SliceRecord, CallbackError> {
        let mut record = SliceRecord {
            slice_index,
            slice_name: archive.name.clone(),
            payload_cid: archive.content_id.clone(),
            piece_cid: None,
            payload_size: archive.payload_size(),
            piece_size: None,
            detail: detail.to_string(),
            archive_path: None,
        };

        match self {
            BuildCallback::CommitmentRecording {
                car_dir,
                rename,
                add_padding,
                manifest,
            } => {
                let commitment = PieceCommitment::compute(&archive.bytes);
                info!(
                    slice = slice_index,
                    piece_cid = %commitment.root,
                    payload_size = commitment.payload_size,
                    piece_size = commitment.piece_size,
                    "piece commitment computed"
                );

                let stem = commitment.root.to_string();
                let pad_to = add_padding.then_some(commitment.piece_size);
                let path = persist(car_dir, &stem, *rename, &archive.bytes, pad_to)?;

                append(
                    manifest,
                    &ManifestRow::Commitment {
                        payload_cid: archive.content_id.to_string(),
                        filename: archive.name.clone(),
                        piece_cid: stem,
                        payload_size: commitment.payload_size,
                        piece_size: commitment.piece_size,
                        detail: detail.to_string(),
                    },
                )?;

                record.piece_cid = Some(commitment.root);
                record.piece_size = Some(commitment.piece_size);
                record.archive_path = Some(path);
            }
            BuildCallback::ManifestOnly { car_dir, manifest } => {
                let path = persist(car_dir, archive.content_id.as_str(), false, &archive.bytes, None)?;
                append(
                    manifest,
                    &ManifestRow::Light {
                        payload_cid: archive.content_id.to_string(),
                        filename: archive.name.clone(),
                        detail: detail.to_string(),
                    },
                )?;
                record.archive_path = Some(path);
            }
            BuildCallback::Discard => {
                debug!(slice = slice_index, payload_cid = %archive.content_id, "dry run, slice discarded");
            }
        }

        Ok(record)
    }

    /// Turn a build failure into the error that ends the run.
    pub fn on_error(&self, slice_name: &str, err: ArchiveError) -> CallbackError {
        error!(slice = slice_name, error = %err, "slice build failed");
        CallbackError::Build {
            slice: slice_name.to_string(),
            source: err,
        }
    }
}

/// Write the archive under its final name.
///
/// Bytes go to a uniquely named staging file in `dir`, are synced, then
/// renamed into place, so the final name only ever holds a complete archive.
/// An existing archive of the expected length is kept. One of any other
/// length is left over from an interrupted write and is replaced.
fn persist(
    dir: &Path,
    stem: &str,
    rename: bool,
    bytes: &[u8],
    pad_to: Option<u64>,
) -> Result<PathBuf, CallbackError> {
    let target = archive_path(dir, stem, !rename);
    let payload = bytes.len() as u64;
    let expected = pad_to.map_or(payload, |piece_size| piece_size.max(payload));

    match fs::metadata(&target) {
        Ok(metadata) if metadata.len() == expected => {
            debug!(path = %target.display(), "archive already present");
            return Ok(target);
        }
        Ok(metadata) => {
            warn!(
                path = %target.display(),
                found = metadata.len(),
                expected,
                "replacing incomplete archive"
            );
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(persist_error(&target)(e)),
    }

    let staging = dir.join(format!(".{stem}.{}.partial", Uuid::new_v4().simple()));
    let staged = write_staged(&staging, bytes, expected)
        .and_then(|()| fs::rename(&staging, &target).map_err(persist_error(&target)));
    if let Err(e) = staged {
        if let Err(cleanup) = fs::remove_file(&staging) {
            debug!(path = %staging.display(), error = %cleanup, "staging file not removed");
        }
        return Err(e);
    }
    Ok(target)
}

fn write_staged(path: &Path, bytes: &[u8], len: u64) -> Result<(), CallbackError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(persist_error(path))?;
    file.write_all(bytes).map_err(persist_error(path))?;
    if len > bytes.len() as u64 {
        file.set_len(len).map_err(persist_error(path))?;
    }
    file.sync_all().map_err(persist_error(path))
}

fn persist_error(path: &Path) -> impl FnOnce(io::Error) -> CallbackError {
    let path = path.to_path_buf();
    move |source| CallbackError::Persist { path, source }
}

fn append(manifest: &ManifestWriter, row: &ManifestRow) -> Result<(), CallbackError> {
    manifest.append(row).map_err(|source| CallbackError::Manifest {
        path: manifest.path().to_path_buf(),
        source,
    })
}
