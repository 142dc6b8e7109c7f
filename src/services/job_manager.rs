//! JobManager: owns the set of outstanding job attempts.
//!
//! Serializes submissions to the DRM driver and exposes the completion
//! stream the controller drains. Completions are delivered in DRM
//! completion order; polling cadence is bounded by `poll_interval`.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{JobAttempt, QueueStatus, Task};
use crate::domain::ports::{DrmDriver, DrmPoll, JobRepository, JobSpec};

/// Owns live job attempts and the poller that resolves them.
#[derive(Clone)]
pub struct JobManager {
    drm: Arc<dyn DrmDriver>,
    jobs: Arc<dyn JobRepository>,
    /// Queued attempt ids, in submission order.
    outstanding: Arc<Mutex<Vec<i64>>>,
    /// Attempts finalized without ever reaching the DRM queue (submit
    /// failures), delivered through the same completion stream.
    completed_buffer: Arc<Mutex<VecDeque<JobAttempt>>>,
    poll_interval: Duration,
}

impl JobManager {
    pub fn new(drm: Arc<dyn DrmDriver>, jobs: Arc<dyn JobRepository>, poll_interval: Duration) -> Self {
        Self {
            drm,
            jobs,
            outstanding: Arc::new(Mutex::new(Vec::new())),
            completed_buffer: Arc::new(Mutex::new(VecDeque::new())),
            poll_interval,
        }
    }

    /// Persist a new attempt in state `not_submitted`, with capture
    /// paths allocated under `capture_dir` (which outlives the job
    /// output directory across retries and GC).
    pub async fn add_job_attempt(
        &self,
        task: &Task,
        command: &str,
        job_name: &str,
        capture_dir: &Path,
    ) -> DomainResult<JobAttempt> {
        let attempt_no = self.jobs.count_by_task(task.id).await? + 1;
        let mut attempt = JobAttempt::new(task.id, command.to_string(), job_name.to_string());
        attempt.stdout_path = Some(capture_dir.join(format!("attempt{attempt_no}.stdout")));
        attempt.stderr_path = Some(capture_dir.join(format!("attempt{attempt_no}.stderr")));
        self.jobs.insert(&mut attempt).await?;
        Ok(attempt)
    }

    /// Hand the attempt to the DRM. A driver that refuses the submission
    /// finalizes the attempt as failed and routes it through the normal
    /// completion stream, where the retry policy picks it up.
    pub async fn submit_job(&self, attempt: &mut JobAttempt, task: &Task, queue: Option<&str>, working_dir: &Path) -> DomainResult<()> {
        let spec = JobSpec {
            command: attempt.command.clone(),
            job_name: attempt.job_name.clone(),
            queue: queue.map(String::from),
            resources: task.resources,
            stdout_path: attempt.stdout_path.clone().unwrap_or_else(|| working_dir.join("stdout")),
            stderr_path: attempt.stderr_path.clone().unwrap_or_else(|| working_dir.join("stderr")),
            working_dir: working_dir.to_path_buf(),
        };

        match self.drm.submit(&spec).await {
            Ok(job_id) => {
                attempt.drm_job_id = Some(job_id);
                attempt.queue_status = QueueStatus::Queued;
                attempt.started_on = Some(Utc::now());
                self.jobs.update(attempt).await?;
                self.outstanding.lock().await.push(attempt.id);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(task_id = task.id, error = %err, "DRM rejected submission, failing the attempt");
                attempt.queue_status = QueueStatus::Completed;
                attempt.successful = false;
                attempt.finished_on = Some(Utc::now());
                self.jobs.update(attempt).await?;
                self.completed_buffer.lock().await.push_back(attempt.clone());
                Ok(())
            }
        }
    }

    /// Block until the next attempt completes, or return `None` once no
    /// attempts are outstanding. Each attempt is yielded exactly once,
    /// with its outcome, usage profile and timestamps persisted.
    pub async fn next_completed_job(&self) -> DomainResult<Option<JobAttempt>> {
        loop {
            if let Some(buffered) = self.completed_buffer.lock().await.pop_front() {
                return Ok(Some(buffered));
            }

            let ids = self.outstanding.lock().await.clone();
            if ids.is_empty() {
                return Ok(None);
            }

            for id in ids {
                let Some(mut attempt) = self.jobs.get(id).await? else {
                    self.outstanding.lock().await.retain(|&x| x != id);
                    continue;
                };
                let Some(job_id) = attempt.drm_job_id.clone() else {
                    self.outstanding.lock().await.retain(|&x| x != id);
                    continue;
                };

                match self.drm.poll(&job_id).await {
                    Ok(DrmPoll::Running) => {}
                    Ok(DrmPoll::Done(outcome)) => {
                        attempt.queue_status = QueueStatus::Completed;
                        attempt.successful = outcome.successful();
                        attempt.resource_usage = outcome.usage;
                        attempt.finished_on = Some(Utc::now());
                        self.jobs.update(&attempt).await?;
                        self.outstanding.lock().await.retain(|&x| x != id);
                        return Ok(Some(attempt));
                    }
                    Err(err) => {
                        // A job the DRM no longer knows about cannot
                        // complete; fail the attempt and let the retry
                        // policy decide.
                        tracing::warn!(attempt_id = id, error = %err, "DRM poll failed, failing the attempt");
                        attempt.queue_status = QueueStatus::Completed;
                        attempt.successful = false;
                        attempt.finished_on = Some(Utc::now());
                        self.jobs.update(&attempt).await?;
                        self.outstanding.lock().await.retain(|&x| x != id);
                        return Ok(Some(attempt));
                    }
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// The blocking completion stream: yields each queued attempt
    /// exactly once upon DRM-reported termination, then ends.
    pub fn yield_all_queued_jobs(&self) -> impl Stream<Item = DomainResult<JobAttempt>> {
        futures::stream::unfold(self.clone(), |manager| async move {
            match manager.next_completed_job().await {
                Ok(Some(attempt)) => Some((Ok(attempt), manager)),
                Ok(None) => None,
                Err(err) => Some((Err(err), manager)),
            }
        })
    }

    /// Best-effort forced kill via the DRM.
    pub async fn terminate_job_attempt(&self, attempt: &JobAttempt) {
        if let Some(job_id) = &attempt.drm_job_id {
            if let Err(err) = self.drm.kill(job_id).await {
                tracing::warn!(attempt_id = attempt.id, error = %err, "failed to kill job attempt");
            }
        }
    }

    pub async fn outstanding_count(&self) -> usize {
        self.outstanding.lock().await.len()
    }
}
