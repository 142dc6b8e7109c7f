//! Mock DRM driver for testing.
//!
//! Jobs complete instantly with scripted outcomes keyed by a substring
//! of the submitted command; unscripted jobs succeed. Submissions are
//! recorded in order so tests can assert on dispatch behavior.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ResourceUsage;
use crate::domain::ports::{DrmDriver, DrmPoll, JobOutcome, JobSpec};

/// Behavior of one scripted submission.
#[derive(Debug, Clone, Copy)]
pub enum MockOutcome {
    /// Complete immediately with this exit code.
    Exit(i32),
    /// Stay in `Running` until killed.
    Hang,
}

#[derive(Debug, Clone)]
struct MockJob {
    outcome: Option<JobOutcome>,
}

/// Scripted in-memory DRM.
#[derive(Clone, Default)]
pub struct MockDrm {
    next_id: Arc<AtomicU64>,
    scripts: Arc<Mutex<HashMap<String, VecDeque<MockOutcome>>>>,
    jobs: Arc<Mutex<HashMap<String, MockJob>>>,
    submissions: Arc<Mutex<Vec<JobSpec>>>,
}

impl MockDrm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for submissions whose command contains `marker`.
    /// Consumed front-to-back; once drained, further matches succeed.
    pub async fn script(&self, marker: &str, outcomes: Vec<MockOutcome>) {
        self.scripts
            .lock()
            .await
            .entry(marker.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Every submission seen so far, in order.
    pub async fn submissions(&self) -> Vec<JobSpec> {
        self.submissions.lock().await.clone()
    }

    pub async fn submission_count(&self) -> usize {
        self.submissions.lock().await.len()
    }

    async fn next_outcome_for(&self, command: &str) -> MockOutcome {
        let mut scripts = self.scripts.lock().await;
        for (marker, queue) in scripts.iter_mut() {
            if command.contains(marker.as_str()) {
                if let Some(outcome) = queue.pop_front() {
                    return outcome;
                }
            }
        }
        MockOutcome::Exit(0)
    }
}

fn outcome_from_exit(exit_code: i32) -> JobOutcome {
    JobOutcome {
        exit_code: Some(exit_code),
        term_signal: None,
        usage: ResourceUsage {
            exit_status: Some(i64::from(exit_code)),
            wall_seconds: Some(0.1),
            ..ResourceUsage::default()
        },
    }
}

#[async_trait]
impl DrmDriver for MockDrm {
    async fn submit(&self, spec: &JobSpec) -> DomainResult<String> {
        self.submissions.lock().await.push(spec.clone());

        // Mimic the capture files a real DRM would leave behind.
        let scripted = self.next_outcome_for(&spec.command).await;
        let (stdout, stderr) = match scripted {
            MockOutcome::Exit(0) => ("ok\n", ""),
            _ => ("", "simulated job failure\n"),
        };
        let _ = std::fs::write(&spec.stdout_path, stdout);
        let _ = std::fs::write(&spec.stderr_path, stderr);

        let job_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let outcome = match scripted {
            MockOutcome::Exit(code) => Some(outcome_from_exit(code)),
            MockOutcome::Hang => None,
        };
        self.jobs.lock().await.insert(job_id.clone(), MockJob { outcome });
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> DomainResult<DrmPoll> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| DomainError::Drm(format!("unknown job id {job_id}")))?;
        Ok(match job.outcome {
            Some(outcome) => DrmPoll::Done(outcome),
            None => DrmPoll::Running,
        })
    }

    async fn kill(&self, job_id: &str) -> DomainResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| DomainError::Drm(format!("unknown job id {job_id}")))?;
        if job.outcome.is_none() {
            job.outcome = Some(JobOutcome {
                exit_code: None,
                term_signal: Some(9),
                usage: ResourceUsage {
                    term_signal: Some(9),
                    ..ResourceUsage::default()
                },
            });
        }
        Ok(())
    }
}
