//! Domain errors for the cascade workflow engine.
//!
//! Three families of failure exist at runtime: validation errors (the
//! caller broke a contract it controls — never retried), workflow/task
//! errors (internal inconsistency — fatal, trigger terminate), and
//! transient job failures, which are not errors at this level at all:
//! they are recovered by the retry policy and only promoted to
//! [`DomainError::TaskFailed`] once reattempts are exhausted.

use std::collections::BTreeMap;

use thiserror::Error;

/// Domain-level errors for the cascade engine.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow with name {0} already exists. Choose a different one or resume it")]
    WorkflowExists(String),

    #[error("Workflow with id {0} already exists")]
    WorkflowIdInUse(i64),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    #[error("Duplicate tags within a stage: {}", format_tag_collisions(.collisions))]
    DuplicateTags {
        /// Every colliding (stage name, tag map) pair found in the batch.
        collisions: Vec<(String, BTreeMap<String, String>)>,
    },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Statistic {0} not supported")]
    UnknownStatistic(String),

    #[error("Field {0} not supported for aggregation")]
    UnknownStatField(String),

    #[error("Tag filter op 'or' is not supported")]
    UnsupportedTagFilter,

    #[error("Expected exactly one task matching tags, found {0}")]
    TaskCountMismatch(usize),

    #[error("Unresolved task file reference: {0}")]
    UnresolvedFileRef(String),

    #[error("Malformed task file reference in command: {0}")]
    MalformedFileRef(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Task {0} failed after exhausting reattempts")]
    TaskFailed(i64),

    #[error("Dependency cycle detected: {0} tasks remain with unsatisfied parents")]
    DependencyCycle(usize),

    #[error("DRM error: {0}")]
    Drm(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether this error is a caller-contract violation (surfaced to the
    /// caller, never fatal to an in-flight run).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::WorkflowNotFound(_)
                | Self::WorkflowExists(_)
                | Self::WorkflowIdInUse(_)
                | Self::DuplicateTags { .. }
                | Self::ValidationFailed(_)
                | Self::UnknownStatistic(_)
                | Self::UnknownStatField(_)
                | Self::UnsupportedTagFilter
                | Self::TaskCountMismatch(_)
        )
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Io(err.to_string())
    }
}

fn format_tag_collisions(collisions: &[(String, BTreeMap<String, String>)]) -> String {
    collisions
        .iter()
        .map(|(stage, tags)| {
            let rendered = tags
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            format!("{stage} {{{rendered}}}")
        })
        .collect::<Vec<_>>()
        .join("; ")
}
