//! JobAttempt repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::{JobAttempt, QueueStatus, ResourceUsage, Tags};

use super::statistic::Statistic;

/// Repository interface for JobAttempt persistence.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert, assigning the id into `attempt.id`.
    async fn insert(&self, attempt: &mut JobAttempt) -> DomainResult<()>;

    async fn update(&self, attempt: &JobAttempt) -> DomainResult<()>;

    async fn get(&self, id: i64) -> DomainResult<Option<JobAttempt>>;

    /// Ordered by id (attempt order).
    async fn list_by_task(&self, task_id: i64) -> DomainResult<Vec<JobAttempt>>;

    async fn count_by_task(&self, task_id: i64) -> DomainResult<u32>;

    async fn has_successful(&self, task_id: i64) -> DomainResult<bool>;

    async fn list_by_workflow(
        &self,
        workflow_id: i64,
        queue_status: Option<QueueStatus>,
    ) -> DomainResult<Vec<JobAttempt>>;

    /// Terminate support: mark attempts completed-and-unsuccessful.
    /// Returns the number of rows actually changed.
    async fn bulk_mark_terminated(
        &self,
        attempt_ids: &[i64],
        now: DateTime<Utc>,
    ) -> DomainResult<u64>;

    /// Aggregate a resource-usage field over a stage's successful
    /// attempts. `field` is one of [`ResourceUsage::PROFILE_FIELDS`].
    async fn stage_job_stat(
        &self,
        stage_id: i64,
        field: &str,
        statistic: Statistic,
    ) -> DomainResult<Option<f64>>;

    /// `(stage_name, task_tags, usage)` rows for every successful
    /// attempt in the workflow, for resource-usage export.
    async fn successful_usage_by_workflow(
        &self,
        workflow_id: i64,
    ) -> DomainResult<Vec<(String, Tags, ResourceUsage)>>;
}
