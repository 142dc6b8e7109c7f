//! Domain ports (interfaces) for the cascade engine.

pub mod drm;
pub mod job_repository;
pub mod stage_repository;
pub mod statistic;
pub mod task_repository;
pub mod workflow_repository;

pub use drm::{DrmDriver, DrmPoll, JobOutcome, JobSpec};
pub use job_repository::JobRepository;
pub use stage_repository::StageRepository;
pub use statistic::Statistic;
pub use task_repository::TaskRepository;
pub use workflow_repository::WorkflowRepository;
