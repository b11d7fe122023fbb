use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Feeder, FeederBudget, FeederError};
use crate::descriptor::FileDescriptor;

const DEFAULT_STEP: Duration = Duration::from_millis(1000);

/// External tool that cuts segments out of a video.
pub trait SegmentTool: Send + Sync {
    /// Total duration of `source`.
    fn duration(&self, source: &Path) -> Result<Duration, FeederError>;

    /// Write `length` of `source` starting at `start` into `output`.
    fn extract(&self, source: &Path, start: Duration, length: Duration, output: &Path) -> Result<(), FeederError>;
}

/// `ffprobe` / `ffmpeg` from `$PATH`.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl Ffmpeg {
    fn run(mut command: Command) -> Result<Output, FeederError> {
        let program = command.get_program().to_string_lossy().into_owned();
        let output = command.output().map_err(|e| FeederError::Spawn {
            program: program.clone(),
            source: e,
        })?;
        if !output.status.success() {
            return Err(FeederError::Tool {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl SegmentTool for Ffmpeg {
    fn duration(&self, source: &Path) -> Result<Duration, FeederError> {
        let mut command = Command::new(&self.ffprobe);
        command
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(source);
        let output = Self::run(command)?;

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        match text.parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
            _ => Err(FeederError::NoDuration {
                path: source.to_path_buf(),
                output: text,
            }),
        }
    }

    fn extract(&self, source: &Path, start: Duration, length: Duration, output: &Path) -> Result<(), FeederError> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-ss")
            .arg(format_timestamp(start))
            .arg("-i")
            .arg(source)
            .arg("-t")
            .arg(format_timestamp(length))
            .args(["-c", "copy"])
            .arg(output)
            .arg("-y");
        Self::run(command)?;
        Ok(())
    }
}

/// `h:mm:ss.mmm`, the form both ffmpeg flags accept.
pub fn format_timestamp(offset: Duration) -> String {
    let total_ms = offset.as_millis();
    let ms = total_ms % 1000;
    let secs = total_ms / 1000;
    format!("{}:{:02}:{:02}.{:03}", secs / 3600, secs % 3600 / 60, secs % 60, ms)
}

/// Cuts one fresh segment out of a single source video per slice.
///
/// Segment `n` starts at `n * step`. The counter only ever moves forward, so
/// with `segment_length <= step` no two calls cover the same source time.
/// Starting the counter at a previous run's end resumes a session.
pub struct VideoFeeder {
    source: PathBuf,
    output_dir: PathBuf,
    base_rename: String,
    counter: AtomicU64,
    step: Duration,
    segment_length: Duration,
    duration: Duration,
    reserved_bytes: u64,
    tool: Box<dyn SegmentTool>,
}

impl std::fmt::Debug for VideoFeeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFeeder")
            .field("source", &self.source)
            .field("output_dir", &self.output_dir)
            .field("counter", &self.counter)
            .field("step", &self.step)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

impl VideoFeeder {
    /// Probe `source` and prepare `output_dir`.
    pub fn new(
        source: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        base_rename: impl Into<String>,
        tool: Box<dyn SegmentTool>,
    ) -> Result<Self, FeederError> {
        let source = source.into();
        let output_dir = output_dir.into();

        fs::metadata(&source).map_err(|e| FeederError::SourceMissing {
            path: source.clone(),
            source: e,
        })?;
        fs::create_dir_all(&output_dir).map_err(|e| FeederError::Io {
            path: output_dir.clone(),
            source: e,
        })?;
        let duration = tool.duration(&source)?;

        info!(
            source = %source.display(),
            output_dir = %output_dir.display(),
            duration_ms = duration.as_millis() as u64,
            "using seed video"
        );

        Ok(Self {
            source,
            output_dir,
            base_rename: base_rename.into(),
            counter: AtomicU64::new(0),
            step: DEFAULT_STEP,
            segment_length: DEFAULT_STEP,
            duration,
            reserved_bytes: 0,
            tool,
        })
    }

    /// Resume from segment `index`.
    pub fn with_start_index(self, index: u64) -> Self {
        self.counter.store(index, Ordering::SeqCst);
        self
    }

    /// Distance between segment starts. Also resets the segment length.
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self.segment_length = step;
        self
    }

    pub fn with_segment_length(mut self, length: Duration) -> Self {
        self.segment_length = length;
        self
    }

    pub fn with_reserved_bytes(mut self, reserved_bytes: u64) -> Self {
        self.reserved_bytes = reserved_bytes;
        self
    }

    /// Index the next call will use.
    pub fn next_index(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    fn segment(&self, index: u64) -> Result<FileDescriptor, FeederError> {
        let start_ms = (self.step.as_millis() as u64).saturating_mul(index);
        let start = Duration::from_millis(start_ms);
        if start >= self.duration {
            return Err(FeederError::NoDuration {
                path: self.source.clone(),
                output: format!("offset {} is past the end", format_timestamp(start)),
            });
        }

        let output = self.output_dir.join(format!("{}{}.mp4", self.base_rename, index));
        self.tool.extract(&self.source, start, self.segment_length, &output)?;

        let metadata = fs::metadata(&output).map_err(|_| FeederError::MissingOutput(output.clone()))?;
        debug!(index, start = %format_timestamp(start), bytes = metadata.len(), "video segment ready");
        Ok(FileDescriptor::whole(output, metadata.len()))
    }
}

impl Feeder for VideoFeeder {
    fn budget(&self) -> FeederBudget {
        FeederBudget::new(self.reserved_bytes)
    }

    fn next_batch(&self, _target: u64) -> Vec<FileDescriptor> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        match self.segment(index) {
            Ok(descriptor) => vec![descriptor],
            Err(e) => {
                warn!(index, error = %e, "video segment failed, slice goes out without it");
                Vec::new()
            }
        }
    }
}
