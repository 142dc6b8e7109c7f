//! DRM driver port.
//!
//! The distributed resource manager is the external scheduler that
//! actually runs processes. The engine only requires three capabilities:
//! submit a command with requested resources, poll a job for a terminal
//! outcome, and force-kill a job. Jobs are independent; exit status 0
//! means success, anything else (including death by signal) is failure.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{ResourceHints, ResourceUsage};

/// Everything the DRM needs to run one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Fully rendered shell command.
    pub command: String,
    /// Display name for the job in the DRM.
    pub job_name: String,
    /// Queue to submit to, if the DRM has queues.
    pub queue: Option<String>,
    pub resources: ResourceHints,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub working_dir: PathBuf,
}

/// Terminal outcome of a job as reported by the DRM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobOutcome {
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub usage: ResourceUsage,
}

impl JobOutcome {
    pub fn successful(&self) -> bool {
        self.exit_code == Some(0) && self.term_signal.is_none()
    }
}

/// Result of polling a submitted job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrmPoll {
    Running,
    Done(JobOutcome),
}

/// Driver interface over a concrete resource manager.
#[async_trait]
pub trait DrmDriver: Send + Sync {
    /// Hand a job to the DRM; returns an opaque job id.
    async fn submit(&self, spec: &JobSpec) -> DomainResult<String>;

    /// Check a job for a terminal outcome. Callers bound their polling
    /// cadence; implementations must not block until completion.
    async fn poll(&self, job_id: &str) -> DomainResult<DrmPoll>;

    /// Best-effort forced termination.
    async fn kill(&self, job_id: &str) -> DomainResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_zero_without_signal_is_success() {
        let ok = JobOutcome { exit_code: Some(0), term_signal: None, usage: ResourceUsage::default() };
        let bad = JobOutcome { exit_code: Some(1), term_signal: None, usage: ResourceUsage::default() };
        let killed = JobOutcome { exit_code: None, term_signal: Some(9), usage: ResourceUsage::default() };
        assert!(ok.successful());
        assert!(!bad.successful());
        assert!(!killed.successful());
    }
}
