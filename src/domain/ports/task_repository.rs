//! Task repository port.
//!
//! Tasks are an aggregate with their tag rows, edges, and output files;
//! the bulk operations here are the only way they are created and they
//! each run inside a single transaction, so a crash never leaves a task
//! without its tags or a file without its task.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{Tags, Task, TaskEdge, TaskFile};

use super::statistic::Statistic;

/// Repository interface for the Task aggregate (tasks, tags, edges,
/// output files).
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Bulk-insert tasks in one transaction, assigning contiguous ids
    /// above the current maximum and materializing tag rows. A duplicate
    /// `(stage, tags)` pair — within the batch or against existing rows —
    /// fails the whole batch with an error reporting every collision.
    async fn bulk_insert(&self, tasks: &mut [Task]) -> DomainResult<()>;

    async fn get(&self, id: i64) -> DomainResult<Option<Task>>;

    async fn update(&self, task: &Task) -> DomainResult<()>;

    async fn list_by_stage(&self, stage_id: i64) -> DomainResult<Vec<Task>>;

    async fn list_by_workflow(&self, workflow_id: i64) -> DomainResult<Vec<Task>>;

    /// Tasks whose tag map contains every given (key, value) pair
    /// (AND semantics), optionally restricted to one stage.
    async fn find_by_tags(
        &self,
        workflow_id: i64,
        stage_id: Option<i64>,
        tags: &Tags,
    ) -> DomainResult<Vec<Task>>;

    /// Ids of tasks in this workflow that are not successful.
    async fn unsuccessful_ids(&self, workflow_id: i64) -> DomainResult<Vec<i64>>;

    /// Delete tasks; attempts, tags, edges touching them (as parent or
    /// child), and output files all cascade.
    async fn bulk_delete(&self, task_ids: &[i64]) -> DomainResult<()>;

    /// Terminate support: fail the given tasks. Returns rows changed.
    async fn bulk_mark_failed(&self, task_ids: &[i64], now: DateTime<Utc>) -> DomainResult<u64>;

    async fn set_cleared_output_files(&self, task_id: i64) -> DomainResult<()>;

    // --- edges ---

    /// Bulk-insert edges in one transaction. Both endpoints must be
    /// tasks of the given workflow.
    async fn insert_edges(&self, workflow_id: i64, edges: &[TaskEdge]) -> DomainResult<()>;

    async fn list_edges(&self, workflow_id: i64) -> DomainResult<Vec<TaskEdge>>;

    // --- output files ---

    /// Bulk-insert files in one transaction, assigning contiguous ids
    /// above the current maximum.
    async fn insert_files(&self, files: &mut [TaskFile]) -> DomainResult<()>;

    async fn list_files_by_workflow(&self, workflow_id: i64) -> DomainResult<Vec<TaskFile>>;

    async fn update_file_path(&self, file_id: i64, path: &Path) -> DomainResult<()>;

    /// Highest task file id ever assigned (0 when none), used to seed
    /// the per-workflow synthetic id counter.
    async fn max_file_id(&self) -> DomainResult<i64>;

    /// Persist rewritten command templates, `(task_id, pcmd)` pairs, in
    /// one transaction (synthetic file refs -> persisted ids).
    async fn rewrite_pcmds(&self, updates: &[(i64, String)]) -> DomainResult<()>;

    async fn set_exec_command(&self, task_id: i64, exec_command: &str) -> DomainResult<()>;

    // --- reporting ---

    /// Aggregate a resource-hint column over a stage's tasks.
    /// `field` is one of `mem_req`, `cpu_req`, `time_req`.
    async fn stage_task_stat(
        &self,
        stage_id: i64,
        field: &str,
        statistic: Statistic,
    ) -> DomainResult<Option<f64>>;
}
