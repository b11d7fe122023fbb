//! Content addressing for piecework slices.
//!
//! Everything the slicing engine needs from the archive side lives here:
//! - **archive**: materializes a list of byte ranges into one slice archive
//! - **hash**: content identifiers (BLAKE3) and commitment identifiers
//! - **commitment**: piece commitment over archive bytes
//! - **manifest**: the append-only `manifest.csv` next to the archives
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use piececas::{ArchiveBuilder, ArchiveSource, FlatArchiveBuilder, PieceCommitment};
//!
//! let sources = vec![ArchiveSource::whole("/data/a.bin", "a.bin", 1024)];
//! let archive = FlatArchiveBuilder::default()
//!     .build("graph-total-1-part-0", &sources)
//!     .unwrap();
//! println!("payload cid: {}", archive.content_id);
//!
//! let commitment = PieceCommitment::compute(&archive.bytes);
//! println!("piece cid: {}, piece size: {}", commitment.root, commitment.piece_size);
//! ```
//!
//! # Archive files
//!
//! Archives are write-once: a file named by its identifier is never appended
//! to, and an existing file with the same name already holds the same bytes.

pub mod archive;
pub mod commitment;
pub mod hash;
pub mod manifest;

// Re-exports for convenience
pub use archive::{ArchiveBuilder, ArchiveEntry, ArchiveError, ArchiveSource, FlatArchiveBuilder, SliceArchive};
pub use commitment::{commit_file, PieceCommitment};
pub use hash::{CommitmentId, ContentId, HashError};
pub use manifest::{ManifestRow, ManifestWriter};
