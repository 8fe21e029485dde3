use crate::analyzer::{self, SourceDescriptor};
use crate::encoder::{self, CommandStage, StageOutcome, StageProgress, build_command};
use crate::error::AppError;
use crate::queue::events::JobEvent;
use crate::queue::job::{Job, JobId, JobStatus};
use crate::queue::run::PipelineRun;
use crate::queue::state::QueueState;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// External binaries a worker drives
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

pub(crate) fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write access to one job's run-state fields, and nothing else.
///
/// Every change is published as a [`JobEvent`] right after the record is updated.
pub struct JobReporter {
    id: JobId,
    state: Arc<Mutex<QueueState>>,
    events: broadcast::Sender<JobEvent>,
}

impl JobReporter {
    pub(crate) fn new(
        id: JobId,
        state: Arc<Mutex<QueueState>>,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self { id, state, events }
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Raise progress; lower values are ignored
    pub fn progress(&self, value: u8) {
        let value = value.min(100);
        let changed = {
            let mut state = lock(&self.state);
            match state.get_mut(self.id) {
                Some(job) if value > job.progress => {
                    job.progress = value;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.publish(JobEvent::Progress {
                id: self.id,
                progress: value,
            });
        }
    }

    pub fn log(&self, line: &str) {
        self.publish(JobEvent::Log {
            id: self.id,
            line: line.to_string(),
        });
    }

    /// Move to a terminal state
    pub fn finish(&self, status: JobStatus, error: Option<String>) {
        {
            let mut state = lock(&self.state);
            if let Some(job) = state.get_mut(self.id) {
                job.status = status;
                job.error = error.clone().unwrap_or_default();
                job.finished_at = Some(Utc::now());
                if status == JobStatus::Completed {
                    job.progress = 100;
                }
            }
        }
        if status == JobStatus::Completed {
            self.publish(JobEvent::Progress {
                id: self.id,
                progress: 100,
            });
        }
        self.publish(JobEvent::StatusChanged {
            id: self.id,
            status,
            error,
        });
    }

    fn fail(&self, message: String) -> JobStatus {
        error!("Job {} failed: {}", self.id, message);
        self.log(&format!("Failed: {}", message));
        self.finish(JobStatus::Failed, Some(message));
        JobStatus::Failed
    }

    fn cancel(&self) -> JobStatus {
        info!("Job {} canceled", self.id);
        self.log("Canceled");
        self.finish(JobStatus::Canceled, Some("canceled".to_string()));
        JobStatus::Canceled
    }
}

/// Execute every stage of `job`, reporting through `reporter`.
///
/// `job` is a copy of the queued record; only run-state changes flow back.
pub async fn run_job(
    job: Job,
    tools: &Toolchain,
    cancel: &CancellationToken,
    reporter: &JobReporter,
) -> JobStatus {
    info!("Starting job {}: {}", job.id, job.source.display());

    let stages = match encoder::build_pipeline(&job) {
        Ok(stages) => stages,
        Err(e) => return reporter.fail(e.to_string()),
    };

    let source_descriptor = match job.descriptor.clone() {
        Some(d) => Some(d),
        None => probe_non_fatal(tools, &job.source, cancel, reporter).await,
    };
    if cancel.is_cancelled() {
        return reporter.cancel();
    }

    for stage in &stages {
        if let Some(parent) = stage.output.parent().filter(|p| !p.as_os_str().is_empty())
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return reporter.fail(AppError::filesystem(parent, e).to_string());
        }
    }

    let mut run = PipelineRun::new(&stages);
    let count = stages.len();

    while let Some(index) = run.current_stage() {
        let stage = &stages[index];

        let descriptor = if stage.probe_source {
            probe_non_fatal(tools, &stage.source, cancel, reporter).await
        } else {
            source_descriptor.clone()
        };
        // Nothing of this stage exists yet; earlier outputs are kept for a retry
        if cancel.is_cancelled() {
            return reporter.cancel();
        }

        let args = plan_stage(stage, descriptor.as_ref(), reporter);
        let progress = StageProgress::new(
            index,
            count,
            descriptor.as_ref().and_then(|d| d.duration_secs),
        );
        let stage_end = progress.finish();

        // With -y ffmpeg truncates an existing output, so only -n leaves it intact
        run.begin_stage(!stage.params.overwrite && stage.output.exists());
        reporter.log(&format!("Stage {}/{} ({})", index + 1, count, stage.name));

        let outcome = encoder::run_stage(
            &tools.ffmpeg,
            &args,
            progress,
            cancel,
            |p| reporter.progress(p),
            |line| reporter.log(line),
        )
        .await;

        match outcome {
            Ok(StageOutcome::Success) => {
                reporter.progress(stage_end);
                for path in run.complete_stage() {
                    remove_quietly(&path, reporter).await;
                }
            }
            Ok(StageOutcome::Canceled) => {
                if let Some(partial) = run.cancel() {
                    remove_quietly(&partial, reporter).await;
                }
                return reporter.cancel();
            }
            Ok(StageOutcome::Failed {
                status,
                diagnostics,
            }) => {
                if let Some(partial) = run.fail() {
                    remove_quietly(&partial, reporter).await;
                }
                let err = AppError::Transcode {
                    status,
                    diagnostics,
                };
                return reporter.fail(err.to_string());
            }
            Err(e) => {
                if let Some(partial) = run.fail() {
                    remove_quietly(&partial, reporter).await;
                }
                return reporter.fail(e.to_string());
            }
        }
    }

    if let Some(cover) = &job.cover {
        let from = if job.destination.exists() {
            &job.destination
        } else {
            &job.source
        };
        reporter.log("Generating cover image");
        match encoder::extract_cover(&tools.ffmpeg, from, cover).await {
            Ok(()) => reporter.log(&format!("Cover saved: {}", cover.display())),
            Err(e) => {
                warn!("Cover for job {} failed: {}", job.id, e);
                reporter.log(&format!("Cover generation failed: {}", e));
            }
        }
    }

    info!("Job {} completed: {}", job.id, job.destination.display());
    reporter.log("Completed");
    reporter.finish(JobStatus::Completed, None);
    JobStatus::Completed
}

/// Build the stage's arguments and surface its notes
fn plan_stage(
    stage: &CommandStage,
    descriptor: Option<&SourceDescriptor>,
    reporter: &JobReporter,
) -> Vec<String> {
    let mut notes = stage.notes.clone();
    let args = build_command(
        &stage.source,
        &stage.output,
        &stage.params,
        stage.lut_path.as_deref(),
        descriptor,
        &mut notes,
    );
    for note in &notes {
        info!("[{}] {}", stage.name, note);
        reporter.log(&format!("[{}] {}", stage.name, note));
    }
    args
}

/// `None` on failure, or when `cancel` fires before the prober answers
async fn probe_non_fatal(
    tools: &Toolchain,
    path: &Path,
    cancel: &CancellationToken,
    reporter: &JobReporter,
) -> Option<SourceDescriptor> {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!("Probe of {} abandoned, job canceled", path.display());
            return None;
        }
        result = analyzer::probe(&tools.ffprobe, path) => result,
    };
    match result {
        Ok(descriptor) => Some(descriptor),
        Err(e) => {
            warn!("{}; continuing with default inference", e);
            reporter.log(&format!("Probe failed, using defaults: {}", e));
            None
        }
    }
}

async fn remove_quietly(path: &Path, reporter: &JobReporter) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => reporter.log(&format!("Removed {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
