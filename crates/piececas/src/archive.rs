//! Slice archives: byte ranges of source files packed into one addressable blob.
//!
//! Layout of a flat archive:
//! ```text
//! "PWSLICE1"                      magic
//! u32 LE                          entry count
//! repeated per entry:
//!   u32 LE + utf-8 bytes          entry name
//!   u64 LE                        byte_start in the source file
//!   u64 LE                        length
//!   <length bytes>                the source bytes [byte_start, byte_start + length)
//! ```
//!
//! The content id is the BLAKE3 digest of the whole archive.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::ContentId;

pub const ARCHIVE_MAGIC: &[u8; 8] = b"PWSLICE1";

/// Errors raised while materializing an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("{path} is {actual} bytes, range needs {needed}")]
    SourceShrank { path: PathBuf, needed: u64, actual: u64 },

    #[error("slice has {0} entries, the archive format allows at most u32::MAX")]
    TooManyEntries(usize),

    #[error("failed to encode detail: {0}")]
    Detail(#[from] serde_json::Error),
}

/// One byte range of a source file to place in an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    /// Where to read the bytes from.
    pub path: PathBuf,
    /// Name the range carries inside the archive.
    pub entry_name: String,
    pub byte_start: u64,
    pub len: u64,
}

impl ArchiveSource {
    /// A whole file of known length.
    pub fn whole(path: impl Into<PathBuf>, entry_name: impl Into<String>, len: u64) -> Self {
        Self {
            path: path.into(),
            entry_name: entry_name.into(),
            byte_start: 0,
            len,
        }
    }
}

/// Layout record for one entry, used for the manifest detail column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub start: u64,
    pub size: u64,
}

/// A finished, readable slice.
#[derive(Debug, Clone)]
pub struct SliceArchive {
    /// Slice name, e.g. `dataset-total-3-part-0`.
    pub name: String,
    pub content_id: ContentId,
    pub bytes: Vec<u8>,
    pub entries: Vec<ArchiveEntry>,
}

impl SliceArchive {
    pub fn payload_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// JSON description of the entries.
    ///
    /// With `skip_filename` the entry names are left out so the manifest does
    /// not leak source names.
    pub fn detail(&self, skip_filename: bool) -> Result<String, ArchiveError> {
        if skip_filename {
            let anonymous: Vec<ArchiveEntry> = self
                .entries
                .iter()
                .map(|e| ArchiveEntry { name: None, ..e.clone() })
                .collect();
            Ok(serde_json::to_string(&anonymous)?)
        } else {
            Ok(serde_json::to_string(&self.entries)?)
        }
    }
}

/// Turns a list of byte ranges into archive content.
///
/// This allows for alternative formats (e.g., a real merkle-DAG writer) without
/// touching the slicing engine.
pub trait ArchiveBuilder: Send + Sync {
    fn build(&self, name: &str, sources: &[ArchiveSource]) -> Result<SliceArchive, ArchiveError>;
}

/// Default builder producing the flat layout described above.
#[derive(Debug, Clone, Default)]
pub struct FlatArchiveBuilder;

impl FlatArchiveBuilder {
    fn append_range(out: &mut Vec<u8>, source: &ArchiveSource) -> Result<(), ArchiveError> {
        let read_err = |e| ArchiveError::Read {
            path: source.path.clone(),
            source: e,
        };

        let mut file = File::open(&source.path).map_err(read_err)?;
        let actual = file.metadata().map_err(read_err)?.len();
        let needed = source.byte_start + source.len;
        if actual < needed {
            return Err(ArchiveError::SourceShrank {
                path: source.path.clone(),
                needed,
                actual,
            });
        }

        file.seek(SeekFrom::Start(source.byte_start)).map_err(read_err)?;
        let copied = file.take(source.len).read_to_end(out).map_err(read_err)?;
        if copied as u64 != source.len {
            return Err(ArchiveError::SourceShrank {
                path: source.path.clone(),
                needed,
                actual: source.byte_start + copied as u64,
            });
        }
        Ok(())
    }
}

impl ArchiveBuilder for FlatArchiveBuilder {
    fn build(&self, name: &str, sources: &[ArchiveSource]) -> Result<SliceArchive, ArchiveError> {
        let count = u32::try_from(sources.len()).map_err(|_| ArchiveError::TooManyEntries(sources.len()))?;
        let payload: u64 = sources.iter().map(|s| s.len).sum();

        let mut bytes = Vec::with_capacity(payload as usize + 64 * sources.len() + 12);
        bytes.extend_from_slice(ARCHIVE_MAGIC);
        bytes.extend_from_slice(&count.to_le_bytes());

        let mut entries = Vec::with_capacity(sources.len());
        for source in sources {
            let name_bytes = source.entry_name.as_bytes();
            bytes.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
            bytes.extend_from_slice(name_bytes);
            bytes.extend_from_slice(&source.byte_start.to_le_bytes());
            bytes.extend_from_slice(&source.len.to_le_bytes());
            Self::append_range(&mut bytes, source)?;

            entries.push(ArchiveEntry {
                name: Some(source.entry_name.clone()),
                start: source.byte_start,
                size: source.len,
            });
        }

        Ok(SliceArchive {
            name: name.to_string(),
            content_id: ContentId::from_data(&bytes),
            bytes,
            entries,
        })
    }
}

/// Path of an archive named `stem` inside `dir`, with or without the suffix.
pub fn archive_path(dir: &Path, stem: &str, with_suffix: bool) -> PathBuf {
    if with_suffix {
        dir.join(format!("{stem}.car"))
    } else {
        dir.join(stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_build_copies_exact_ranges() {
        let temp_dir = TempDir::new().unwrap();
        let a = fixture(temp_dir.path(), "a", b"0123456789");
        let b = fixture(temp_dir.path(), "b", b"abcdef");

        let sources = vec![
            ArchiveSource::whole(&a, "a", 10),
            ArchiveSource {
                path: b.clone(),
                entry_name: "b.00000000".to_string(),
                byte_start: 2,
                len: 3,
            },
        ];
        let archive = FlatArchiveBuilder.build("slice", &sources).unwrap();

        assert!(archive.bytes.starts_with(ARCHIVE_MAGIC));
        assert!(archive.bytes.ends_with(b"cde"));
        assert!(archive.bytes.windows(10).any(|w| w == b"0123456789"));
        assert_eq!(archive.entries.len(), 2);
        assert_eq!(archive.entries[1].start, 2);
        assert_eq!(archive.entries[1].size, 3);
    }

    #[test]
    fn test_content_id_is_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        let a = fixture(temp_dir.path(), "a", b"same bytes");
        let sources = vec![ArchiveSource::whole(&a, "a", 10)];

        let first = FlatArchiveBuilder.build("one", &sources).unwrap();
        let second = FlatArchiveBuilder.build("two", &sources).unwrap();
        assert_eq!(first.content_id, second.content_id);
        assert_eq!(first.content_id, ContentId::from_data(&first.bytes));
    }

    #[test]
    fn test_shrunk_source_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let a = fixture(temp_dir.path(), "a", b"tiny");
        let sources = vec![ArchiveSource::whole(&a, "a", 100)];

        let err = FlatArchiveBuilder.build("slice", &sources).unwrap_err();
        assert!(matches!(err, ArchiveError::SourceShrank { needed: 100, actual: 4, .. }));
    }

    #[test]
    fn test_missing_source_names_path() {
        let sources = vec![ArchiveSource::whole("/nonexistent/piece/source", "x", 1)];
        let err = FlatArchiveBuilder.build("slice", &sources).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/piece/source"));
    }

    #[test]
    fn test_detail_skip_filename() {
        let temp_dir = TempDir::new().unwrap();
        let a = fixture(temp_dir.path(), "secret-name.txt", b"data");
        let sources = vec![ArchiveSource::whole(&a, "secret-name.txt", 4)];
        let archive = FlatArchiveBuilder.build("slice", &sources).unwrap();

        assert!(archive.detail(false).unwrap().contains("secret-name.txt"));
        let hidden = archive.detail(true).unwrap();
        assert!(!hidden.contains("secret-name.txt"));
        assert!(hidden.contains("\"size\":4"));
    }

    #[test]
    fn test_archive_path_suffix() {
        let dir = Path::new("/cars");
        assert_eq!(archive_path(dir, "abc", true), PathBuf::from("/cars/abc.car"));
        assert_eq!(archive_path(dir, "abc", false), PathBuf::from("/cars/abc"));
    }
}
