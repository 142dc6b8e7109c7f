//! Local-subprocess DRM driver.
//!
//! Runs each job as `sh -c <command>` in its own process group on this
//! host, capturing stdout/stderr to the paths in the job spec. Useful
//! for laptops and single-node runs; cluster backends implement the same
//! trait against their batch scheduler.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::Mutex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ResourceUsage;
use crate::domain::ports::{DrmDriver, DrmPoll, JobOutcome, JobSpec};

#[derive(Debug)]
struct LocalJob {
    pid: Option<i32>,
    outcome: Option<JobOutcome>,
}

/// DRM driver that runs jobs as local subprocesses.
#[derive(Clone, Default)]
pub struct LocalDrm {
    next_id: Arc<AtomicU64>,
    jobs: Arc<Mutex<HashMap<String, Arc<Mutex<LocalJob>>>>>,
}

impl LocalDrm {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DrmDriver for LocalDrm {
    async fn submit(&self, spec: &JobSpec) -> DomainResult<String> {
        let stdout = std::fs::File::create(&spec.stdout_path)?;
        let stderr = std::fs::File::create(&spec.stderr_path)?;

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            // Own process group so kill() can take the whole job tree down.
            .process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| DomainError::Drm(format!("failed to spawn job: {e}")))?;

        let job_id = format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let job = Arc::new(Mutex::new(LocalJob {
            pid: child.id().and_then(|p| i32::try_from(p).ok()),
            outcome: None,
        }));
        self.jobs.lock().await.insert(job_id.clone(), job.clone());

        tokio::spawn(async move {
            let started = Instant::now();
            let status = child.wait().await;
            let wall = started.elapsed().as_secs_f64();
            let outcome = match status {
                Ok(status) => {
                    let exit_code = status.code();
                    let term_signal = status.signal();
                    JobOutcome {
                        exit_code,
                        term_signal,
                        usage: ResourceUsage {
                            exit_status: exit_code.map(i64::from),
                            term_signal,
                            wall_seconds: Some(wall),
                            ..ResourceUsage::default()
                        },
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "waiting on local job failed");
                    JobOutcome {
                        exit_code: None,
                        term_signal: None,
                        usage: ResourceUsage {
                            wall_seconds: Some(wall),
                            ..ResourceUsage::default()
                        },
                    }
                }
            };
            job.lock().await.outcome = Some(outcome);
        });

        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> DomainResult<DrmPoll> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| DomainError::Drm(format!("unknown job id {job_id}")))?
            .clone();
        drop(jobs);

        let job = job.lock().await;
        Ok(match job.outcome {
            Some(outcome) => DrmPoll::Done(outcome),
            None => DrmPoll::Running,
        })
    }

    async fn kill(&self, job_id: &str) -> DomainResult<()> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| DomainError::Drm(format!("unknown job id {job_id}")))?
            .clone();
        drop(jobs);

        let pid = job.lock().await.pid;
        if let Some(pid) = pid {
            match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(err) => return Err(DomainError::Drm(format!("killpg({pid}) failed: {err}"))),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ResourceHints;
    use std::time::Duration;

    fn spec(dir: &std::path::Path, command: &str) -> JobSpec {
        JobSpec {
            command: command.to_string(),
            job_name: "test".to_string(),
            queue: None,
            resources: ResourceHints::default(),
            stdout_path: dir.join("stdout.txt"),
            stderr_path: dir.join("stderr.txt"),
            working_dir: dir.to_path_buf(),
        }
    }

    async fn wait_done(drm: &LocalDrm, job_id: &str) -> JobOutcome {
        for _ in 0..200 {
            if let DrmPoll::Done(outcome) = drm.poll(job_id).await.unwrap() {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[tokio::test]
    async fn captures_exit_status_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let drm = LocalDrm::new();

        let ok = drm.submit(&spec(dir.path(), "echo hello")).await.unwrap();
        let outcome = wait_done(&drm, &ok).await;
        assert!(outcome.successful());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("stdout.txt")).unwrap(),
            "hello\n"
        );

        let bad = drm.submit(&spec(dir.path(), "exit 3")).await.unwrap();
        let outcome = wait_done(&drm, &bad).await;
        assert!(!outcome.successful());
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn kill_terminates_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let drm = LocalDrm::new();

        let job_id = drm.submit(&spec(dir.path(), "sleep 30")).await.unwrap();
        drm.kill(&job_id).await.unwrap();
        let outcome = wait_done(&drm, &job_id).await;
        assert!(!outcome.successful());
        assert_eq!(outcome.term_signal, Some(9));
    }

    #[tokio::test]
    async fn unknown_job_id_is_an_error() {
        let drm = LocalDrm::new();
        assert!(drm.poll("local-999").await.is_err());
    }
}
