use crate::queue::job::{JobId, JobStatus};
use serde::Serialize;

/// Everything the queue publishes to the outside world
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Added {
        id: JobId,
    },
    Progress {
        id: JobId,
        progress: u8,
    },
    StatusChanged {
        id: JobId,
        status: JobStatus,
        /// Set for failed and canceled jobs
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Log {
        id: JobId,
        line: String,
    },
    /// Nothing running and nothing waiting
    QueueDrained,
}

impl JobEvent {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Added { id }
            | Self::Progress { id, .. }
            | Self::StatusChanged { id, .. }
            | Self::Log { id, .. } => Some(*id),
            Self::QueueDrained => None,
        }
    }
}
