//! Task domain model.
//!
//! A task is a single declarative unit of work: a command template, a
//! tag map identifying it within its stage, resource hints for the DRM,
//! and flags controlling dispatch and garbage collection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

use super::status::Status;

/// Tag map for a task. Keys are unique per task; the `(stage, tags)`
/// pair is unique within a stage. `BTreeMap` keeps the JSON rendering
/// canonical so that equality survives persistence.
pub type Tags = BTreeMap<String, String>;

/// Resource hints handed to the DRM on submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Memory to reserve, in MB.
    pub mem_mb: Option<i64>,
    /// Number of CPUs to reserve.
    pub cpus: Option<i64>,
    /// Expected runtime in minutes; jobs exceeding it may be killed.
    pub time_minutes: Option<i64>,
}

/// A persisted task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub stage_id: i64,
    /// Pre-formatted command template; may embed `#F[<id>:<name>:<path>]`
    /// task-file references that are substituted at render time.
    pub pcmd: String,
    /// The rendered command actually handed to the DRM.
    pub exec_command: Option<String>,
    pub resources: ResourceHints,
    pub status: Status,
    /// Declarative node that is never dispatched (e.g. an input file).
    pub noop: bool,
    /// Succeed and let the workflow progress even if every attempt fails.
    pub succeed_on_failure: bool,
    /// Output bytes have been reclaimed by the intermediate GC.
    pub cleared_output_files: bool,
    /// Opt this task out of intermediate GC.
    pub dont_delete_output_files: bool,
    pub tags: Tags,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

/// Descriptor handed over by the DAG-construction layer for a task that
/// has not been persisted yet.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub stage_id: i64,
    pub pcmd: String,
    pub tags: Tags,
    pub resources: ResourceHints,
    pub noop: bool,
    pub succeed_on_failure: bool,
    pub dont_delete_output_files: bool,
}

impl TaskSpec {
    pub fn new(stage_id: i64, pcmd: impl Into<String>) -> Self {
        Self {
            stage_id,
            pcmd: pcmd.into(),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn noop(mut self) -> Self {
        self.noop = true;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.pcmd.trim().is_empty() && !self.noop {
            return Err(DomainError::Task(
                "pcmd cannot be blank unless the task is a NOOP".to_string(),
            ));
        }
        Ok(())
    }

    /// Finalize into an unpersisted task row (`id == 0`).
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: 0,
            stage_id: self.stage_id,
            pcmd: self.pcmd,
            exec_command: None,
            resources: self.resources,
            status: Status::NoAttempt,
            noop: self.noop,
            succeed_on_failure: self.succeed_on_failure,
            cleared_output_files: false,
            dont_delete_output_files: self.dont_delete_output_files,
            tags: self.tags,
            created_on: now,
            started_on: None,
            finished_on: None,
        }
    }
}

impl Task {
    /// Derived flag mirroring `status == Successful`.
    pub fn successful(&self) -> bool {
        self.status == Status::Successful
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Task output directory: `<stage_output_dir>/<task_id>`. Part of the
    /// on-disk contract — external tools locate outputs by convention.
    pub fn output_dir(&self, stage_output_dir: &Path) -> PathBuf {
        stage_output_dir.join(self.id.to_string())
    }

    /// Where the job's stdout/stderr/artifacts land:
    /// `<task_output_dir>/out`.
    pub fn job_output_dir(&self, stage_output_dir: &Path) -> PathBuf {
        self.output_dir(stage_output_dir).join("out")
    }

    /// Canonical JSON rendering of the tag map, used for the
    /// `(stage, tags)` uniqueness constraint.
    pub fn tags_json(&self) -> DomainResult<String> {
        Ok(serde_json::to_string(&self.tags)?)
    }
}

/// A directed parent -> child dependency between two tasks. Edges are
/// the only representation of data dependency; both endpoints must
/// belong to the same workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskEdge {
    pub parent: i64,
    pub child: i64,
}

impl TaskEdge {
    pub fn new(parent: i64, child: i64) -> Self {
        Self { parent, child }
    }
}

/// Render a tag map for log lines: `{key=value,...}` in key order.
pub fn format_tags(tags: &Tags) -> String {
    let body = tags
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{body}}}")
}
