//! File descriptors and slice plans.
//!
//! A [`FileDescriptor`] is one contiguous byte range of a source file. The
//! enumerator creates whole-file descriptors, the partitioner cuts them into
//! ranges, and each range is consumed by exactly one slice.

use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

/// One contiguous byte range of a source file contributing to a slice.
///
/// Ranges are described by their start and length; [`FileDescriptor::byte_end`]
/// gives the inclusive end offset for non-empty ranges. A zero-length file is a
/// whole-file descriptor with no end offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    path: PathBuf,
    display_name: String,
    byte_start: u64,
    len: u64,
    file_size: u64,
}

impl FileDescriptor {
    /// Whole-file descriptor named after the file itself.
    pub fn whole(path: impl Into<PathBuf>, file_size: u64) -> Self {
        let path = path.into();
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            path,
            display_name,
            byte_start: 0,
            len: file_size,
            file_size,
        }
    }

    /// Sub-range `[byte_start, byte_start + len)` of `self`'s source file.
    pub(crate) fn cut(&self, display_name: String, byte_start: u64, len: u64) -> Self {
        debug_assert!(byte_start + len <= self.file_size);
        Self {
            path: self.path.clone(),
            display_name,
            byte_start,
            len,
            file_size: self.file_size,
        }
    }

    /// Same range under a different name. The source path is untouched.
    pub fn with_display_name(self, display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..self
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn byte_start(&self) -> u64 {
        self.byte_start
    }

    /// Inclusive end offset, `None` for an empty range.
    pub fn byte_end(&self) -> Option<u64> {
        (self.len > 0).then(|| self.byte_start + self.len - 1)
    }

    pub fn size_in_slice(&self) -> u64 {
        self.len
    }

    /// Size of the whole source file.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn is_whole(&self) -> bool {
        self.byte_start == 0 && self.len == self.file_size
    }
}

/// The descriptors assigned to one output slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePlan {
    /// Position in partition order, starting at 0.
    pub slice_index: u64,
    /// Number of slices the run produces.
    pub slice_total: u64,
    /// Feeder content riding in the reserved budget.
    pub supplementary: Vec<FileDescriptor>,
    /// Whole files and ranges taken from the enumerated input.
    pub descriptors: Vec<FileDescriptor>,
}

impl SlicePlan {
    /// Bytes taken from the enumerated input.
    pub fn input_bytes(&self) -> u64 {
        self.descriptors.iter().map(FileDescriptor::size_in_slice).sum()
    }

    pub fn supplementary_bytes(&self) -> u64 {
        self.supplementary.iter().map(FileDescriptor::size_in_slice).sum()
    }

    /// Every descriptor in archive order, feeder content first.
    pub fn all(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.supplementary.iter().chain(self.descriptors.iter())
    }
}

/// Slice name: `{graph_name}-total-{total}-part-{index}`.
pub fn slice_name(graph_name: &str, index: u64, total: u64) -> String {
    format!("{graph_name}-total-{total}-part-{index}")
}

/// Replaces display names with random identifiers.
///
/// Every call draws a fresh identifier, so two ranges of one file end up with
/// unrelated names. The source file's extension is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymizer;

impl Anonymizer {
    pub fn rename(&self, descriptor: FileDescriptor) -> FileDescriptor {
        let id = Uuid::new_v4().simple().to_string();
        let name = match descriptor.path().extension() {
            Some(ext) => format!("{id}.{}", ext.to_string_lossy()),
            None => id,
        };
        descriptor.with_display_name(name)
    }
}
