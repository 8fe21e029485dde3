pub mod events;
pub mod job;
pub mod manager;
pub mod run;
pub mod state;
pub mod worker;

pub use events::JobEvent;
pub use job::{
    Job, JobId, JobStatus, cover_path_for, default_output_dir, intermediate_path_for,
    is_video_file, output_path_for,
};
pub use manager::QueueManager;
pub use run::PipelineRun;
pub use state::{MAX_CONCURRENCY, QueueCounts, QueueState};
pub use worker::{JobReporter, Toolchain, run_job};
