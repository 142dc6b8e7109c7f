//! JobAttempt domain model.
//!
//! One submission of a task's rendered command to the DRM. A task
//! accumulates attempts up to the workflow's `max_reattempts`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an attempt sits in the DRM queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Persisted but not yet handed to the DRM.
    #[default]
    NotSubmitted,
    /// Submitted; the DRM owns it.
    Queued,
    /// The DRM reported a terminal outcome (or the attempt was killed).
    Completed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotSubmitted => "not_submitted",
            Self::Queued => "queued",
            Self::Completed => "completed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "not_submitted" => Some(Self::NotSubmitted),
            "queued" => Some(Self::Queued),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Resource-usage profile reported by the DRM for a finished job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub exit_status: Option<i64>,
    pub term_signal: Option<i32>,
    pub wall_seconds: Option<f64>,
    pub user_seconds: Option<f64>,
    pub system_seconds: Option<f64>,
    pub max_rss_kb: Option<i64>,
}

impl ResourceUsage {
    /// Field names accepted by stage-level aggregation queries.
    pub const PROFILE_FIELDS: &'static [&'static str] = &[
        "exit_status",
        "wall_seconds",
        "user_seconds",
        "system_seconds",
        "max_rss_kb",
    ];
}

/// One submission of a task's command to the DRM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttempt {
    pub id: i64,
    pub task_id: i64,
    /// Opaque handle returned by the DRM driver.
    pub drm_job_id: Option<String>,
    pub queue_status: QueueStatus,
    pub successful: bool,
    pub job_name: String,
    /// Snapshot of the rendered command this attempt ran.
    pub command: String,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub resource_usage: ResourceUsage,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

impl JobAttempt {
    pub fn new(task_id: i64, command: String, job_name: String) -> Self {
        Self {
            id: 0,
            task_id,
            drm_job_id: None,
            queue_status: QueueStatus::NotSubmitted,
            successful: false,
            job_name,
            command,
            stdout_path: None,
            stderr_path: None,
            resource_usage: ResourceUsage::default(),
            created_on: Utc::now(),
            started_on: None,
            finished_on: None,
        }
    }

    /// Best-effort read of the captured stderr, for retry logging.
    pub fn stderr_text(&self) -> String {
        self.stderr_path
            .as_deref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .unwrap_or_default()
    }
}
