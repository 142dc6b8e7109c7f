//! SQLite implementation of the StageRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Stage, Status};
use crate::domain::ports::StageRepository;

#[derive(Clone)]
pub struct SqliteStageRepository {
    pool: SqlitePool,
}

impl SqliteStageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StageRepository for SqliteStageRepository {
    async fn insert(&self, stage: &Stage) -> DomainResult<i64> {
        let result = sqlx::query(
            r#"INSERT INTO stages (workflow_id, name, order_in_workflow, status,
               created_on, started_on, finished_on)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(stage.workflow_id)
        .bind(&stage.name)
        .bind(stage.order_in_workflow)
        .bind(stage.status.as_str())
        .bind(stage.created_on.to_rfc3339())
        .bind(stage.started_on.map(|t| t.to_rfc3339()))
        .bind(stage.finished_on.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> DomainResult<Option<Stage>> {
        let row: Option<StageRow> = sqlx::query_as("SELECT * FROM stages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_by_name(&self, workflow_id: i64, name: &str) -> DomainResult<Option<Stage>> {
        let row: Option<StageRow> =
            sqlx::query_as("SELECT * FROM stages WHERE workflow_id = ? AND name = ?")
                .bind(workflow_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_by_workflow(&self, workflow_id: i64) -> DomainResult<Vec<Stage>> {
        let rows: Vec<StageRow> = sqlx::query_as(
            r#"SELECT * FROM stages WHERE workflow_id = ?
               ORDER BY order_in_workflow IS NULL, order_in_workflow, id"#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn max_order(&self, workflow_id: i64) -> DomainResult<Option<i64>> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(order_in_workflow) FROM stages WHERE workflow_id = ?")
                .bind(workflow_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    async fn update(&self, stage: &Stage) -> DomainResult<()> {
        let result = sqlx::query(
            r#"UPDATE stages SET name = ?, order_in_workflow = ?, status = ?,
               started_on = ?, finished_on = ? WHERE id = ?"#,
        )
        .bind(&stage.name)
        .bind(stage.order_in_workflow)
        .bind(stage.status.as_str())
        .bind(stage.started_on.map(|t| t.to_rfc3339()))
        .bind(stage.finished_on.map(|t| t.to_rfc3339()))
        .bind(stage.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::StageNotFound(stage.name.clone()));
        }
        Ok(())
    }

    async fn clear_order(&self, workflow_id: i64) -> DomainResult<()> {
        sqlx::query("UPDATE stages SET order_in_workflow = NULL WHERE workflow_id = ?")
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> DomainResult<()> {
        sqlx::query("DELETE FROM stages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_unfinished_failed(
        &self,
        workflow_id: i64,
        now: DateTime<Utc>,
    ) -> DomainResult<u64> {
        let result = sqlx::query(
            r#"UPDATE stages SET status = 'failed', finished_on = ?
               WHERE workflow_id = ? AND status NOT IN ('successful', 'failed')"#,
        )
        .bind(now.to_rfc3339())
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    id: i64,
    workflow_id: i64,
    name: String,
    order_in_workflow: Option<i64>,
    status: String,
    created_on: String,
    started_on: Option<String>,
    finished_on: Option<String>,
}

impl TryFrom<StageRow> for Stage {
    type Error = DomainError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        let status = Status::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;
        Ok(Stage {
            id: row.id,
            workflow_id: row.workflow_id,
            name: row.name,
            order_in_workflow: row.order_in_workflow,
            status,
            created_on: super::parse_datetime(&row.created_on)?,
            started_on: super::parse_optional_datetime(row.started_on)?,
            finished_on: super::parse_optional_datetime(row.finished_on)?,
        })
    }
}
