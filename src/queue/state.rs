use super::job::{Job, JobId, JobStatus};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tokio_util::sync::CancellationToken;

/// Largest worker pool the queue accepts
pub const MAX_CONCURRENCY: usize = 16;

/// Canonical job records plus scheduling bookkeeping
pub struct QueueState {
    jobs: Vec<Job>,
    waiting: VecDeque<JobId>,
    running: HashMap<JobId, CancellationToken>,
    max_concurrency: usize,
}

/// Terminal tallies for a summary line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl QueueState {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            jobs: Vec::new(),
            waiting: VecDeque::new(),
            running: HashMap::new(),
            max_concurrency: clamp_concurrency(max_concurrency),
        }
    }

    pub fn push(&mut self, job: Job) -> JobId {
        let id = job.id;
        self.jobs.push(job);
        id
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn set_max_concurrency(&mut self, n: usize) {
        self.max_concurrency = clamp_concurrency(n);
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn is_waiting(&self, id: JobId) -> bool {
        self.waiting.contains(&id)
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.running.contains_key(&id)
    }

    /// Nothing running and nothing waiting for a slot
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    /// Queue a pending job for a worker slot; false if it was already scheduled
    pub fn schedule(&mut self, id: JobId) -> bool {
        if self.is_waiting(id) || self.is_running(id) {
            return false;
        }
        self.waiting.push_back(id);
        true
    }

    pub fn unschedule(&mut self, id: JobId) -> bool {
        let before = self.waiting.len();
        self.waiting.retain(|w| *w != id);
        before != self.waiting.len()
    }

    /// Take the next waiting job if a slot is free, marking it running.
    ///
    /// Returns a copy of the record for the worker and the job's cancellation token.
    pub fn dispatch_next(&mut self) -> Option<(Job, CancellationToken)> {
        while self.running.len() < self.max_concurrency {
            let id = self.waiting.pop_front()?;
            let Some(job) = self.get_mut(id) else {
                continue;
            };
            if job.status != JobStatus::Pending {
                continue;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            let snapshot = job.clone();

            let token = CancellationToken::new();
            self.running.insert(id, token.clone());
            return Some((snapshot, token));
        }
        None
    }

    pub fn cancel_token(&self, id: JobId) -> Option<&CancellationToken> {
        self.running.get(&id)
    }

    /// Release the worker slot held by `id`.
    ///
    /// A job retried while its worker was still winding down is back to `Pending`
    /// by now and goes to the end of the waiting line.
    pub fn release(&mut self, id: JobId) {
        if self.running.remove(&id).is_none() {
            return;
        }
        if self.get(id).is_some_and(|j| j.status == JobStatus::Pending) {
            self.waiting.push_back(id);
        }
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        self.unschedule(id);
        let index = self.jobs.iter().position(|j| j.id == id)?;
        Some(self.jobs.remove(index))
    }

    /// Drop terminal jobs; returns how many were removed
    pub fn clear_finished(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|j| !j.status.is_terminal());
        before - self.jobs.len()
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for job in &self.jobs {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Canceled => counts.canceled += 1,
            }
        }
        counts
    }

    /// Mean progress over every job, terminal ones counting as done
    pub fn overall_progress(&self) -> f32 {
        if self.jobs.is_empty() {
            return 0.0;
        }
        let total: f32 = self
            .jobs
            .iter()
            .map(|j| {
                if j.status.is_terminal() {
                    100.0
                } else {
                    f32::from(j.progress)
                }
            })
            .sum();
        (total / self.jobs.len() as f32).min(100.0)
    }
}

fn clamp_concurrency(n: usize) -> usize {
    n.clamp(1, MAX_CONCURRENCY)
}
