//! SQLite implementation of the TaskRepository.
//!
//! Tasks, their tag rows, their edges, and their output files are an
//! aggregate: every bulk operation here runs in a single transaction so
//! a crash never leaves a task without its tags or an edge without its
//! endpoints.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{ResourceHints, Status, Tags, Task, TaskEdge, TaskFile};
use crate::domain::ports::{Statistic, TaskRepository};

const TASK_STAT_FIELDS: &[&str] = &["mem_req", "cpu_req", "time_req"];

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn bulk_insert(&self, tasks: &mut [Task]) -> DomainResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        // Stage names for collision reporting.
        let stage_ids: Vec<i64> = {
            let mut ids: Vec<i64> = tasks.iter().map(|t| t.stage_id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        let name_sql = format!(
            "SELECT id, name FROM stages WHERE id IN ({})",
            super::placeholders(stage_ids.len())
        );
        let mut name_query = sqlx::query_as::<_, (i64, String)>(&name_sql);
        for id in &stage_ids {
            name_query = name_query.bind(id);
        }
        let stage_names: HashMap<i64, String> =
            name_query.fetch_all(&mut *tx).await?.into_iter().collect();

        // The (stage, tags) pair must be unique. Check the batch against
        // itself and against existing rows so the error can report every
        // colliding tag set, not just the first constraint hit.
        let existing_sql = format!(
            "SELECT stage_id, tags FROM tasks WHERE stage_id IN ({})",
            super::placeholders(stage_ids.len())
        );
        let mut existing_query = sqlx::query_as::<_, (i64, String)>(&existing_sql);
        for id in &stage_ids {
            existing_query = existing_query.bind(id);
        }
        let mut seen: HashSet<(i64, String)> =
            existing_query.fetch_all(&mut *tx).await?.into_iter().collect();

        let mut collisions = Vec::new();
        for task in tasks.iter() {
            let key = (task.stage_id, task.tags_json()?);
            if !seen.insert(key) {
                let stage = stage_names
                    .get(&task.stage_id)
                    .cloned()
                    .unwrap_or_else(|| task.stage_id.to_string());
                collisions.push((stage, task.tags.clone()));
            }
        }
        if !collisions.is_empty() {
            return Err(DomainError::DuplicateTags { collisions });
        }

        // Contiguous ids above the current max keep insertion order
        // recoverable after a bulk create.
        let (max_id,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM tasks")
            .fetch_one(&mut *tx)
            .await?;
        for (i, task) in tasks.iter_mut().enumerate() {
            task.id = max_id + 1 + i as i64;
        }

        for task in tasks.iter() {
            sqlx::query(
                r#"INSERT INTO tasks (id, stage_id, pcmd, exec_command, mem_req, cpu_req,
                   time_req, status, noop, succeed_on_failure, cleared_output_files,
                   dont_delete_output_files, tags, created_on, started_on, finished_on)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(task.id)
            .bind(task.stage_id)
            .bind(&task.pcmd)
            .bind(&task.exec_command)
            .bind(task.resources.mem_mb)
            .bind(task.resources.cpus)
            .bind(task.resources.time_minutes)
            .bind(task.status.as_str())
            .bind(task.noop)
            .bind(task.succeed_on_failure)
            .bind(task.cleared_output_files)
            .bind(task.dont_delete_output_files)
            .bind(task.tags_json()?)
            .bind(task.created_on.to_rfc3339())
            .bind(task.started_on.map(|t| t.to_rfc3339()))
            .bind(task.finished_on.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await?;

            for (key, value) in &task.tags {
                sqlx::query("INSERT INTO task_tags (task_id, key, value) VALUES (?, ?, ?)")
                    .bind(task.id)
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, task: &Task) -> DomainResult<()> {
        let result = sqlx::query(
            r#"UPDATE tasks SET pcmd = ?, exec_command = ?, mem_req = ?, cpu_req = ?,
               time_req = ?, status = ?, noop = ?, succeed_on_failure = ?,
               cleared_output_files = ?, dont_delete_output_files = ?, tags = ?,
               started_on = ?, finished_on = ? WHERE id = ?"#,
        )
        .bind(&task.pcmd)
        .bind(&task.exec_command)
        .bind(task.resources.mem_mb)
        .bind(task.resources.cpus)
        .bind(task.resources.time_minutes)
        .bind(task.status.as_str())
        .bind(task.noop)
        .bind(task.succeed_on_failure)
        .bind(task.cleared_output_files)
        .bind(task.dont_delete_output_files)
        .bind(task.tags_json()?)
        .bind(task.started_on.map(|t| t.to_rfc3339()))
        .bind(task.finished_on.map(|t| t.to_rfc3339()))
        .bind(task.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(task.id));
        }
        Ok(())
    }

    async fn list_by_stage(&self, stage_id: i64) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE stage_id = ? ORDER BY id")
                .bind(stage_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_by_workflow(&self, workflow_id: i64) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT t.* FROM tasks t
               INNER JOIN stages s ON t.stage_id = s.id
               WHERE s.workflow_id = ? ORDER BY t.id"#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_by_tags(
        &self,
        workflow_id: i64,
        stage_id: Option<i64>,
        tags: &Tags,
    ) -> DomainResult<Vec<Task>> {
        let mut sql = String::from(
            r#"SELECT t.* FROM tasks t
               INNER JOIN stages s ON t.stage_id = s.id
               WHERE s.workflow_id = ?"#,
        );
        if stage_id.is_some() {
            sql.push_str(" AND t.stage_id = ?");
        }
        for _ in tags {
            sql.push_str(" AND t.id IN (SELECT task_id FROM task_tags WHERE key = ? AND value = ?)");
        }
        sql.push_str(" ORDER BY t.id");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql).bind(workflow_id);
        if let Some(stage_id) = stage_id {
            query = query.bind(stage_id);
        }
        for (key, value) in tags {
            query = query.bind(key).bind(value);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn unsuccessful_ids(&self, workflow_id: i64) -> DomainResult<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"SELECT t.id FROM tasks t
               INNER JOIN stages s ON t.stage_id = s.id
               WHERE s.workflow_id = ? AND t.status != 'successful' ORDER BY t.id"#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn bulk_delete(&self, task_ids: &[i64]) -> DomainResult<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "DELETE FROM tasks WHERE id IN ({})",
            super::placeholders(task_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in task_ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn bulk_mark_failed(&self, task_ids: &[i64], now: DateTime<Utc>) -> DomainResult<u64> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE tasks SET status = 'failed', finished_on = ? WHERE id IN ({}) AND status != 'failed'",
            super::placeholders(task_ids.len())
        );
        let mut query = sqlx::query(&sql).bind(now.to_rfc3339());
        for id in task_ids {
            query = query.bind(id);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn set_cleared_output_files(&self, task_id: i64) -> DomainResult<()> {
        sqlx::query("UPDATE tasks SET cleared_output_files = 1 WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_edges(&self, workflow_id: i64, edges: &[TaskEdge]) -> DomainResult<()> {
        if edges.is_empty() {
            return Ok(());
        }

        // Both endpoints must be tasks of this workflow.
        let endpoints: Vec<i64> = {
            let mut ids: Vec<i64> = edges.iter().flat_map(|e| [e.parent, e.child]).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        let check_sql = format!(
            r#"SELECT COUNT(DISTINCT t.id) FROM tasks t
               INNER JOIN stages s ON t.stage_id = s.id
               WHERE s.workflow_id = ? AND t.id IN ({})"#,
            super::placeholders(endpoints.len())
        );
        let mut check = sqlx::query_as::<_, (i64,)>(&check_sql).bind(workflow_id);
        for id in &endpoints {
            check = check.bind(id);
        }
        let (found,) = check.fetch_one(&self.pool).await?;
        if found as usize != endpoints.len() {
            return Err(DomainError::ValidationFailed(
                "task edges may only reference tasks in the same workflow".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        for edge in edges {
            sqlx::query("INSERT OR IGNORE INTO task_edges (parent, child) VALUES (?, ?)")
                .bind(edge.parent)
                .bind(edge.child)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_edges(&self, workflow_id: i64) -> DomainResult<Vec<TaskEdge>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"SELECT e.parent, e.child FROM task_edges e
               INNER JOIN tasks t ON e.parent = t.id
               INNER JOIN stages s ON t.stage_id = s.id
               WHERE s.workflow_id = ?"#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(parent, child)| TaskEdge { parent, child })
            .collect())
    }

    async fn insert_files(&self, files: &mut [TaskFile]) -> DomainResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let (max_id,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM task_files")
            .fetch_one(&mut *tx)
            .await?;
        for (i, file) in files.iter_mut().enumerate() {
            file.id = max_id + 1 + i as i64;
        }
        for file in files.iter() {
            sqlx::query("INSERT INTO task_files (id, task_id, path, name, fmt) VALUES (?, ?, ?, ?, ?)")
                .bind(file.id)
                .bind(file.task_id)
                .bind(file.path.as_deref().map(|p| p.to_string_lossy().into_owned()))
                .bind(&file.name)
                .bind(&file.fmt)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_files_by_workflow(&self, workflow_id: i64) -> DomainResult<Vec<TaskFile>> {
        let rows: Vec<TaskFileRow> = sqlx::query_as(
            r#"SELECT f.* FROM task_files f
               INNER JOIN tasks t ON f.task_id = t.id
               INNER JOIN stages s ON t.stage_id = s.id
               WHERE s.workflow_id = ? ORDER BY f.id"#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_file_path(&self, file_id: i64, path: &Path) -> DomainResult<()> {
        sqlx::query("UPDATE task_files SET path = ? WHERE id = ?")
            .bind(path.to_string_lossy().into_owned())
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn max_file_id(&self) -> DomainResult<i64> {
        let (max_id,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM task_files")
            .fetch_one(&self.pool)
            .await?;
        Ok(max_id)
    }

    async fn rewrite_pcmds(&self, updates: &[(i64, String)]) -> DomainResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (task_id, pcmd) in updates {
            sqlx::query("UPDATE tasks SET pcmd = ? WHERE id = ?")
                .bind(pcmd)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_exec_command(&self, task_id: i64, exec_command: &str) -> DomainResult<()> {
        sqlx::query("UPDATE tasks SET exec_command = ? WHERE id = ?")
            .bind(exec_command)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stage_task_stat(
        &self,
        stage_id: i64,
        field: &str,
        statistic: Statistic,
    ) -> DomainResult<Option<f64>> {
        if !TASK_STAT_FIELDS.contains(&field) {
            return Err(DomainError::UnknownStatField(field.to_string()));
        }
        let sql = format!(
            "SELECT CAST({}({field}) AS REAL) FROM tasks WHERE stage_id = ?",
            statistic.sql_fn()
        );
        let (value,): (Option<f64>,) = sqlx::query_as(&sql)
            .bind(stage_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    stage_id: i64,
    pcmd: String,
    exec_command: Option<String>,
    mem_req: Option<i64>,
    cpu_req: Option<i64>,
    time_req: Option<i64>,
    status: String,
    noop: bool,
    succeed_on_failure: bool,
    cleared_output_files: bool,
    dont_delete_output_files: bool,
    tags: String,
    created_on: String,
    started_on: Option<String>,
    finished_on: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = Status::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;
        let tags: Tags = serde_json::from_str(&row.tags)?;
        Ok(Task {
            id: row.id,
            stage_id: row.stage_id,
            pcmd: row.pcmd,
            exec_command: row.exec_command,
            resources: ResourceHints {
                mem_mb: row.mem_req,
                cpus: row.cpu_req,
                time_minutes: row.time_req,
            },
            status,
            noop: row.noop,
            succeed_on_failure: row.succeed_on_failure,
            cleared_output_files: row.cleared_output_files,
            dont_delete_output_files: row.dont_delete_output_files,
            tags,
            created_on: super::parse_datetime(&row.created_on)?,
            started_on: super::parse_optional_datetime(row.started_on)?,
            finished_on: super::parse_optional_datetime(row.finished_on)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskFileRow {
    id: i64,
    task_id: i64,
    path: Option<String>,
    name: String,
    fmt: String,
}

impl From<TaskFileRow> for TaskFile {
    fn from(row: TaskFileRow) -> Self {
        TaskFile {
            id: row.id,
            task_id: row.task_id,
            path: row.path.map(std::path::PathBuf::from),
            name: row.name,
            fmt: row.fmt,
        }
    }
}
