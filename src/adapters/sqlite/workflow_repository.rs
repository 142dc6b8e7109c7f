//! SQLite implementation of the WorkflowRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::path::PathBuf;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::Workflow;
use crate::domain::ports::WorkflowRepository;

#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: SqlitePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for SqliteWorkflowRepository {
    async fn insert(&self, workflow: &Workflow) -> DomainResult<i64> {
        if workflow.id != 0 {
            let occupied: Option<(i64,)> = sqlx::query_as("SELECT id FROM workflows WHERE id = ?")
                .bind(workflow.id)
                .fetch_optional(&self.pool)
                .await?;
            if occupied.is_some() {
                return Err(DomainError::WorkflowIdInUse(workflow.id));
            }
        }

        let result = sqlx::query(
            r#"INSERT INTO workflows (id, name, output_dir, max_reattempts, default_queue,
               dry_run, delete_intermediates, created_on, finished_on)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(if workflow.id == 0 { None } else { Some(workflow.id) })
        .bind(&workflow.name)
        .bind(workflow.output_dir.to_string_lossy().into_owned())
        .bind(i64::from(workflow.max_reattempts))
        .bind(&workflow.default_queue)
        .bind(workflow.dry_run)
        .bind(workflow.delete_intermediates)
        .bind(workflow.created_on.to_rfc3339())
        .bind(workflow.finished_on.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> DomainResult<Option<Workflow>> {
        let row: Option<WorkflowRow> = sqlx::query_as("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_by_name(&self, name: &str) -> DomainResult<Option<Workflow>> {
        let row: Option<WorkflowRow> = sqlx::query_as("SELECT * FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self) -> DomainResult<Vec<Workflow>> {
        let rows: Vec<WorkflowRow> = sqlx::query_as("SELECT * FROM workflows ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update(&self, workflow: &Workflow) -> DomainResult<()> {
        let result = sqlx::query(
            r#"UPDATE workflows SET name = ?, output_dir = ?, max_reattempts = ?,
               default_queue = ?, dry_run = ?, delete_intermediates = ?, finished_on = ?
               WHERE id = ?"#,
        )
        .bind(&workflow.name)
        .bind(workflow.output_dir.to_string_lossy().into_owned())
        .bind(i64::from(workflow.max_reattempts))
        .bind(&workflow.default_queue)
        .bind(workflow.dry_run)
        .bind(workflow.delete_intermediates)
        .bind(workflow.finished_on.map(|t| t.to_rfc3339()))
        .bind(workflow.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DomainError::WorkflowNotFound(workflow.name.clone()));
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> DomainResult<()> {
        sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: i64,
    name: String,
    output_dir: String,
    max_reattempts: i64,
    default_queue: Option<String>,
    dry_run: bool,
    delete_intermediates: bool,
    created_on: String,
    finished_on: Option<String>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = DomainError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        Ok(Workflow {
            id: row.id,
            name: row.name,
            output_dir: PathBuf::from(row.output_dir),
            max_reattempts: u32::try_from(row.max_reattempts)
                .map_err(|e| DomainError::SerializationError(e.to_string()))?,
            default_queue: row.default_queue,
            dry_run: row.dry_run,
            delete_intermediates: row.delete_intermediates,
            created_on: super::parse_datetime(&row.created_on)?,
            finished_on: super::parse_optional_datetime(row.finished_on)?,
        })
    }
}
