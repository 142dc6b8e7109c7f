//! SQLite implementation of the JobRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::path::PathBuf;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{JobAttempt, QueueStatus, ResourceUsage, Tags};
use crate::domain::ports::{JobRepository, Statistic};

#[derive(Clone)]
pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn insert(&self, attempt: &mut JobAttempt) -> DomainResult<()> {
        let result = sqlx::query(
            r#"INSERT INTO job_attempts (task_id, drm_job_id, queue_status, successful,
               job_name, command, stdout_path, stderr_path, resource_usage,
               created_on, started_on, finished_on)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(attempt.task_id)
        .bind(&attempt.drm_job_id)
        .bind(attempt.queue_status.as_str())
        .bind(attempt.successful)
        .bind(&attempt.job_name)
        .bind(&attempt.command)
        .bind(attempt.stdout_path.as_deref().map(|p| p.to_string_lossy().into_owned()))
        .bind(attempt.stderr_path.as_deref().map(|p| p.to_string_lossy().into_owned()))
        .bind(serde_json::to_string(&attempt.resource_usage)?)
        .bind(attempt.created_on.to_rfc3339())
        .bind(attempt.started_on.map(|t| t.to_rfc3339()))
        .bind(attempt.finished_on.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        attempt.id = result.last_insert_rowid();
        Ok(())
    }

    async fn update(&self, attempt: &JobAttempt) -> DomainResult<()> {
        let result = sqlx::query(
            r#"UPDATE job_attempts SET drm_job_id = ?, queue_status = ?, successful = ?,
               job_name = ?, command = ?, stdout_path = ?, stderr_path = ?,
               resource_usage = ?, started_on = ?, finished_on = ? WHERE id = ?"#,
        )
        .bind(&attempt.drm_job_id)
        .bind(attempt.queue_status.as_str())
        .bind(attempt.successful)
        .bind(&attempt.job_name)
        .bind(&attempt.command)
        .bind(attempt.stdout_path.as_deref().map(|p| p.to_string_lossy().into_owned()))
        .bind(attempt.stderr_path.as_deref().map(|p| p.to_string_lossy().into_owned()))
        .bind(serde_json::to_string(&attempt.resource_usage)?)
        .bind(attempt.started_on.map(|t| t.to_rfc3339()))
        .bind(attempt.finished_on.map(|t| t.to_rfc3339()))
        .bind(attempt.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::DatabaseError(format!(
                "job attempt {} not found",
                attempt.id
            )));
        }
        Ok(())
    }

    async fn get(&self, id: i64) -> DomainResult<Option<JobAttempt>> {
        let row: Option<JobAttemptRow> = sqlx::query_as("SELECT * FROM job_attempts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_by_task(&self, task_id: i64) -> DomainResult<Vec<JobAttempt>> {
        let rows: Vec<JobAttemptRow> =
            sqlx::query_as("SELECT * FROM job_attempts WHERE task_id = ? ORDER BY id")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn count_by_task(&self, task_id: i64) -> DomainResult<u32> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM job_attempts WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u32)
    }

    async fn has_successful(&self, task_id: i64) -> DomainResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM job_attempts WHERE task_id = ? AND successful = 1",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn list_by_workflow(
        &self,
        workflow_id: i64,
        queue_status: Option<QueueStatus>,
    ) -> DomainResult<Vec<JobAttempt>> {
        let mut sql = String::from(
            r#"SELECT ja.* FROM job_attempts ja
               INNER JOIN tasks t ON ja.task_id = t.id
               INNER JOIN stages s ON t.stage_id = s.id
               WHERE s.workflow_id = ?"#,
        );
        if queue_status.is_some() {
            sql.push_str(" AND ja.queue_status = ?");
        }
        sql.push_str(" ORDER BY ja.id");

        let mut query = sqlx::query_as::<_, JobAttemptRow>(&sql).bind(workflow_id);
        if let Some(status) = queue_status {
            query = query.bind(status.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn bulk_mark_terminated(
        &self,
        attempt_ids: &[i64],
        now: DateTime<Utc>,
    ) -> DomainResult<u64> {
        if attempt_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            r#"UPDATE job_attempts SET queue_status = 'completed', successful = 0, finished_on = ?
               WHERE id IN ({}) AND queue_status != 'completed'"#,
            super::placeholders(attempt_ids.len())
        );
        let mut query = sqlx::query(&sql).bind(now.to_rfc3339());
        for id in attempt_ids {
            query = query.bind(id);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn stage_job_stat(
        &self,
        stage_id: i64,
        field: &str,
        statistic: Statistic,
    ) -> DomainResult<Option<f64>> {
        if !ResourceUsage::PROFILE_FIELDS.contains(&field) {
            return Err(DomainError::UnknownStatField(field.to_string()));
        }
        let sql = format!(
            r#"SELECT CAST({}(json_extract(ja.resource_usage, '$.{field}')) AS REAL)
               FROM job_attempts ja
               INNER JOIN tasks t ON ja.task_id = t.id
               WHERE t.stage_id = ? AND ja.successful = 1"#,
            statistic.sql_fn()
        );
        let (value,): (Option<f64>,) = sqlx::query_as(&sql)
            .bind(stage_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(value)
    }

    async fn successful_usage_by_workflow(
        &self,
        workflow_id: i64,
    ) -> DomainResult<Vec<(String, Tags, ResourceUsage)>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"SELECT s.name, t.tags, ja.resource_usage
               FROM job_attempts ja
               INNER JOIN tasks t ON ja.task_id = t.id
               INNER JOIN stages s ON t.stage_id = s.id
               WHERE s.workflow_id = ? AND ja.successful = 1
               ORDER BY s.order_in_workflow IS NULL, s.order_in_workflow, t.id"#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(stage, tags, usage)| {
                Ok((
                    stage,
                    serde_json::from_str(&tags)?,
                    serde_json::from_str(&usage)?,
                ))
            })
            .collect()
    }
}

#[derive(sqlx::FromRow)]
struct JobAttemptRow {
    id: i64,
    task_id: i64,
    drm_job_id: Option<String>,
    queue_status: String,
    successful: bool,
    job_name: String,
    command: String,
    stdout_path: Option<String>,
    stderr_path: Option<String>,
    resource_usage: String,
    created_on: String,
    started_on: Option<String>,
    finished_on: Option<String>,
}

impl TryFrom<JobAttemptRow> for JobAttempt {
    type Error = DomainError;

    fn try_from(row: JobAttemptRow) -> Result<Self, Self::Error> {
        let queue_status = QueueStatus::from_str(&row.queue_status).ok_or_else(|| {
            DomainError::SerializationError(format!("Invalid queue_status: {}", row.queue_status))
        })?;
        Ok(JobAttempt {
            id: row.id,
            task_id: row.task_id,
            drm_job_id: row.drm_job_id,
            queue_status,
            successful: row.successful,
            job_name: row.job_name,
            command: row.command,
            stdout_path: row.stdout_path.map(PathBuf::from),
            stderr_path: row.stderr_path.map(PathBuf::from),
            resource_usage: serde_json::from_str(&row.resource_usage)?,
            created_on: super::parse_datetime(&row.created_on)?,
            started_on: super::parse_optional_datetime(row.started_on)?,
            finished_on: super::parse_optional_datetime(row.finished_on)?,
        })
    }
}
