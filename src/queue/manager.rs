use crate::error::{AppError, Result};
use crate::queue::events::JobEvent;
use crate::queue::job::{Job, JobId, JobStatus};
use crate::queue::state::{QueueCounts, QueueState};
use crate::queue::worker::{JobReporter, Toolchain, lock, run_job};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 4096;

/// Owns every job record and a bounded pool of workers.
///
/// Cheap to clone; all clones share the same queue. Methods never block on a
/// running transcode and may be called from any thread.
#[derive(Clone)]
pub struct QueueManager {
    state: Arc<Mutex<QueueState>>,
    events: broadcast::Sender<JobEvent>,
    tools: Arc<Toolchain>,
    runtime: Handle,
}

impl QueueManager {
    /// Must be called from within a tokio runtime; workers are spawned onto it.
    pub fn new(tools: Toolchain, max_concurrency: usize) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| AppError::Config(format!("queue needs a tokio runtime: {}", e)))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            state: Arc::new(Mutex::new(QueueState::new(max_concurrency))),
            events,
            tools: Arc::new(tools),
            runtime,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    fn status_changed(&self, id: JobId, status: JobStatus, error: Option<String>) {
        self.publish(JobEvent::StatusChanged { id, status, error });
    }

    /// Enqueue without scheduling
    pub fn add(&self, job: Job) -> JobId {
        let id = lock(&self.state).push(job);
        debug!("Added job {}", id);
        self.publish(JobEvent::Added { id });
        id
    }

    /// Enqueue a pending job and schedule it
    pub fn submit(&self, job: Job) -> Result<JobId> {
        if job.status != JobStatus::Pending {
            return Err(AppError::InvalidJobState {
                id: job.id,
                status: job.status,
            });
        }
        let id = job.id;
        let mut state = lock(&self.state);
        if let Some(existing) = state.get(id) {
            return Err(AppError::InvalidJobState {
                id,
                status: existing.status,
            });
        }
        state.push(job);
        debug!("Added job {}", id);
        self.publish(JobEvent::Added { id });
        if !state.schedule(id) {
            return Err(AppError::InvalidJobState {
                id,
                status: JobStatus::Pending,
            });
        }
        self.pump(&mut state);
        Ok(id)
    }

    /// Schedule every pending job; returns how many were newly scheduled
    pub fn start_all(&self) -> usize {
        let mut state = lock(&self.state);
        let pending: Vec<JobId> = state
            .jobs()
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(|j| j.id)
            .collect();
        let scheduled = pending.into_iter().filter(|id| state.schedule(*id)).count();
        self.pump(&mut state);
        scheduled
    }

    /// Request cancellation. Finished jobs are left alone.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let mut state = lock(&self.state);
        let status = state.get(id).ok_or(AppError::JobNotFound(id))?.status;

        match status {
            JobStatus::Running => {
                if let Some(token) = state.cancel_token(id) {
                    info!("Canceling job {}", id);
                    token.cancel();
                }
            }
            JobStatus::Pending => {
                state.unschedule(id);
                if let Some(job) = state.get_mut(id) {
                    job.status = JobStatus::Canceled;
                    job.error = "canceled before start".to_string();
                    job.finished_at = Some(Utc::now());
                }
                info!("Canceled pending job {}", id);
                self.status_changed(
                    id,
                    JobStatus::Canceled,
                    Some("canceled before start".to_string()),
                );
                if state.is_idle() {
                    self.publish(JobEvent::QueueDrained);
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled => {}
        }
        Ok(())
    }

    /// Cancel everything that has not finished yet
    pub fn cancel_all(&self) {
        let live: Vec<JobId> = lock(&self.state)
            .jobs()
            .iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.id)
            .collect();
        for id in live {
            let _ = self.cancel(id);
        }
    }

    /// Drop a job that is not running
    pub fn remove(&self, id: JobId) -> Result<Job> {
        let mut state = lock(&self.state);
        let status = state.get(id).ok_or(AppError::JobNotFound(id))?.status;
        if status == JobStatus::Running {
            return Err(AppError::InvalidJobState { id, status });
        }
        state.remove(id).ok_or(AppError::JobNotFound(id))
    }

    /// Re-enqueue a finished job for a fresh run.
    ///
    /// A job whose worker has reported the end but not yet handed back its slot
    /// is queued again when the slot is released.
    pub fn retry(&self, id: JobId) -> Result<()> {
        let mut state = lock(&self.state);
        let job = state.get_mut(id).ok_or(AppError::JobNotFound(id))?;
        if !job.status.is_terminal() {
            return Err(AppError::InvalidJobState {
                id,
                status: job.status,
            });
        }
        job.reset();
        self.status_changed(id, JobStatus::Pending, None);

        if state.is_running(id) {
            debug!("Job {} is retried before its slot was released", id);
            return Ok(());
        }
        if !state.schedule(id) {
            return Err(AppError::InvalidJobState {
                id,
                status: JobStatus::Pending,
            });
        }
        self.pump(&mut state);
        Ok(())
    }

    pub fn clear_finished(&self) -> usize {
        lock(&self.state).clear_finished()
    }

    /// Applies to jobs not yet started
    pub fn set_concurrency(&self, n: usize) {
        let mut state = lock(&self.state);
        state.set_max_concurrency(n);
        info!("Concurrency set to {}", state.max_concurrency());
        self.pump(&mut state);
    }

    pub fn concurrency(&self) -> usize {
        lock(&self.state).max_concurrency()
    }

    /// Copy of every job record
    pub fn snapshot(&self) -> Vec<Job> {
        lock(&self.state).jobs().to_vec()
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        lock(&self.state).get(id).cloned()
    }

    pub fn counts(&self) -> QueueCounts {
        lock(&self.state).counts()
    }

    pub fn overall_progress(&self) -> f32 {
        lock(&self.state).overall_progress()
    }

    pub fn is_idle(&self) -> bool {
        lock(&self.state).is_idle()
    }

    /// Resolve once nothing is running or waiting
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        loop {
            if self.is_idle() {
                return;
            }
            match rx.recv().await {
                Ok(JobEvent::QueueDrained) => {}
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Start workers while slots are free
    fn pump(&self, state: &mut QueueState) {
        while let Some((job, token)) = state.dispatch_next() {
            let id = job.id;
            debug!(
                "Dispatching job {} ({}/{} slots)",
                id,
                state.running_count(),
                state.max_concurrency()
            );
            self.status_changed(id, JobStatus::Running, None);
            let manager = self.clone();
            self.runtime.spawn(async move { manager.execute(job, token).await });
        }
    }

    async fn execute(self, job: Job, token: CancellationToken) {
        let id = job.id;
        let reporter = JobReporter::new(id, self.state.clone(), self.events.clone());
        let status = run_job(job, &self.tools, &token, &reporter).await;
        debug!("Job {} finished as {}", id, status);

        let mut state = lock(&self.state);
        state.release(id);
        self.pump(&mut state);
        // Published under the lock so anyone who sees an idle queue also sees the event
        if state.is_idle() {
            self.publish(JobEvent::QueueDrained);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::ProcessingParams;

    fn manager() -> QueueManager {
        let tools = Toolchain {
            ffmpeg: "/nonexistent/ffmpeg".into(),
            ffprobe: "/nonexistent/ffprobe".into(),
        };
        QueueManager::new(tools, 1).unwrap()
    }

    /// Put `id` in a worker slot without spawning a worker
    fn occupy_slot(manager: &QueueManager, id: JobId) {
        let mut state = lock(&manager.state);
        state.schedule(id);
        state.dispatch_next().unwrap();
    }

    #[tokio::test]
    async fn retry_before_slot_release_is_not_lost() {
        let manager = manager();
        let mut events = manager.subscribe();
        let id = manager.add(Job::new("a.mov", "a_out.mov", ProcessingParams::default()));
        occupy_slot(&manager, id);

        // the worker has reported its end but still holds the slot
        lock(&manager.state).get_mut(id).unwrap().status = JobStatus::Failed;
        manager.retry(id).unwrap();
        assert_eq!(manager.get(id).unwrap().status, JobStatus::Pending);

        {
            let mut state = lock(&manager.state);
            state.release(id);
            assert!(state.is_waiting(id));
            assert!(!state.is_idle());
        }
        assert!(!manager.is_idle());

        let mut saw_pending = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, JobEvent::StatusChanged { status: JobStatus::Pending, .. }) {
                saw_pending = true;
            }
            assert_ne!(event, JobEvent::QueueDrained);
        }
        assert!(saw_pending);
    }

    #[tokio::test]
    async fn retry_rejects_live_jobs() {
        let manager = manager();
        let id = manager.add(Job::new("a.mov", "a_out.mov", ProcessingParams::default()));
        assert!(matches!(
            manager.retry(id),
            Err(AppError::InvalidJobState { .. })
        ));
        occupy_slot(&manager, id);
        assert!(matches!(
            manager.retry(id),
            Err(AppError::InvalidJobState { .. })
        ));
    }

    #[tokio::test]
    async fn submitting_the_same_job_twice_is_rejected() {
        let manager = manager();
        let job = Job::new("a.mov", "a_out.mov", ProcessingParams::default());
        let again = job.clone();
        manager.add(job);
        assert!(matches!(
            manager.submit(again),
            Err(AppError::InvalidJobState { .. })
        ));
        assert_eq!(manager.snapshot().len(), 1);
    }
}
