//! Workflow repository port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::Workflow;

/// Repository interface for Workflow persistence.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Insert a workflow and return its id. When `workflow.id != 0` the
    /// given id is used verbatim — restart preserves the old id for
    /// stable URLs — and an occupied id is an error.
    async fn insert(&self, workflow: &Workflow) -> DomainResult<i64>;

    async fn get(&self, id: i64) -> DomainResult<Option<Workflow>>;

    async fn get_by_name(&self, name: &str) -> DomainResult<Option<Workflow>>;

    async fn list(&self) -> DomainResult<Vec<Workflow>>;

    async fn update(&self, workflow: &Workflow) -> DomainResult<()>;

    /// Delete the row; stages, tasks, attempts, tags, edges and files go
    /// with it via cascade. Files on disk are the caller's problem.
    async fn delete(&self, id: i64) -> DomainResult<()>;
}
