use crate::analyzer::SourceDescriptor;
use crate::encoder::ProcessingParams;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Opaque job identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty for logs and events
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Status of a job in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker slot
    Pending,
    /// A stage is being transcoded
    Running,
    Completed,
    Failed,
    /// Stopped on request; not an error
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// A render job in the queue
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub lut: Option<PathBuf>,
    pub cover: Option<PathBuf>,
    pub params: ProcessingParams,
    pub descriptor: Option<SourceDescriptor>,
    /// Master file, pro mode only
    pub intermediate: Option<PathBuf>,
    pub status: JobStatus,
    /// 0-100
    pub progress: u8,
    /// Empty unless the job failed or was canceled
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl Job {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        params: ProcessingParams,
    ) -> Self {
        Self {
            id: JobId::new(),
            source: source.into(),
            destination: destination.into(),
            lut: None,
            cover: None,
            params,
            descriptor: None,
            intermediate: None,
            status: JobStatus::Pending,
            progress: 0,
            error: String::new(),
            started_at: None,
            finished_at: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_lut(mut self, lut: impl Into<PathBuf>) -> Self {
        self.lut = Some(lut.into());
        self
    }

    pub fn with_cover(mut self, cover: impl Into<PathBuf>) -> Self {
        self.cover = Some(cover.into());
        self
    }

    pub fn with_intermediate(mut self, intermediate: impl Into<PathBuf>) -> Self {
        self.intermediate = Some(intermediate.into());
        self
    }

    pub fn with_descriptor(mut self, descriptor: SourceDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// Get the filename
    pub fn filename(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Put a terminal job back to `pending` for a fresh run
    pub(crate) fn reset(&mut self) {
        self.status = JobStatus::Pending;
        self.progress = 0;
        self.error.clear();
        self.started_at = None;
        self.finished_at = None;
    }
}

/// `<dir>/<stem>_out<ext>`, numbered if taken on disk or in `reserved`
pub fn output_path_for(
    source: &Path,
    output_dir: &Path,
    reserved: &mut HashSet<PathBuf>,
) -> PathBuf {
    let ext = source
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| ".mp4".to_string());
    unique_path(output_dir, &format!("{}_out", stem(source)), &ext, reserved)
}

/// `<dir>/<stem>_cover.jpg`, numbered if taken on disk or in `reserved`
pub fn cover_path_for(source: &Path, output_dir: &Path, reserved: &mut HashSet<PathBuf>) -> PathBuf {
    unique_path(output_dir, &format!("{}_cover", stem(source)), ".jpg", reserved)
}

/// `<dir>/<stem>_master.mov`, numbered if taken on disk or in `reserved`
pub fn intermediate_path_for(
    source: &Path,
    intermediate_dir: &Path,
    reserved: &mut HashSet<PathBuf>,
) -> PathBuf {
    unique_path(
        intermediate_dir,
        &format!("{}_master", stem(source)),
        ".mov",
        reserved,
    )
}

/// Default output directory: `output/` next to the source
pub fn default_output_dir(source: &Path) -> PathBuf {
    source.parent().unwrap_or(Path::new(".")).join("output")
}

fn stem(path: &Path) -> String {
    path.file_stem().unwrap_or_default().to_string_lossy().to_string()
}

/// Files of one batch do not exist yet, so names handed out earlier are
/// tracked in `reserved` alongside what is already on disk.
fn unique_path(dir: &Path, base: &str, ext: &str, reserved: &mut HashSet<PathBuf>) -> PathBuf {
    let mut candidate = dir.join(format!("{}{}", base, ext));
    let mut counter = 1;
    while candidate.exists() || reserved.contains(&candidate) {
        candidate = dir.join(format!("{}_{}{}", base, counter, ext));
        counter += 1;
    }
    reserved.insert(candidate.clone());
    candidate
}

/// Check if a path is a video file
pub fn is_video_file(path: &Path) -> bool {
    const VIDEO_EXTENSIONS: [&str; 11] = [
        "mp4", "mkv", "avi", "mov", "webm", "m4v", "ts", "mts", "mxf", "wmv", "flv",
    ];

    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}
