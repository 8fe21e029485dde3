use crate::queue::{JobId, JobStatus};
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = AppError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AppError {
    /// The prober could not be run or returned something we could not read
    #[error("probe failed: {0}")]
    Probe(String),

    /// Parameters that must never reach the transcoder
    #[error("invalid parameter combination: {0}")]
    InvalidParameterCombination(String),

    /// A transcoder stage exited with a non-zero status
    #[error("transcoder failed ({status}): {diagnostics}")]
    Transcode { status: String, diagnostics: String },

    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {id} is {status} and cannot be scheduled")]
    InvalidJobState { id: JobId, status: JobStatus },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::Filesystem {
            path: path.into(),
            source,
        }
    }
}
