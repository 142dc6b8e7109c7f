//! Stage repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::Stage;

/// Repository interface for Stage persistence.
#[async_trait]
pub trait StageRepository: Send + Sync {
    async fn insert(&self, stage: &Stage) -> DomainResult<i64>;

    async fn get(&self, id: i64) -> DomainResult<Option<Stage>>;

    async fn get_by_name(&self, workflow_id: i64, name: &str) -> DomainResult<Option<Stage>>;

    /// Ordered by `order_in_workflow`, unordered stages last.
    async fn list_by_workflow(&self, workflow_id: i64) -> DomainResult<Vec<Stage>>;

    async fn max_order(&self, workflow_id: i64) -> DomainResult<Option<i64>>;

    async fn update(&self, stage: &Stage) -> DomainResult<()>;

    /// Resume support: blank out every stage's insertion index so the
    /// DSL re-numbers them on replay.
    async fn clear_order(&self, workflow_id: i64) -> DomainResult<()>;

    async fn delete(&self, id: i64) -> DomainResult<()>;

    /// Terminate support: fail every stage that has not already reached
    /// a terminal state. Returns the number of rows actually changed.
    async fn mark_unfinished_failed(
        &self,
        workflow_id: i64,
        now: DateTime<Utc>,
    ) -> DomainResult<u64>;
}
