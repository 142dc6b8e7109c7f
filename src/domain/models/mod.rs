//! Domain models
//!
//! Pure domain entities with business logic and validation rules.
//! These models are framework-agnostic and contain no infrastructure
//! concerns.

pub mod config;
pub mod dag;
pub mod job_attempt;
pub mod stage;
pub mod status;
pub mod task;
pub mod task_file;
pub mod workflow;

pub use config::{Config, DatabaseConfig, EngineConfig, LoggingConfig};
pub use dag::{DagNode, WorkflowDag};
pub use job_attempt::{JobAttempt, QueueStatus, ResourceUsage};
pub use stage::Stage;
pub use status::Status;
pub use task::{format_tags, ResourceHints, Tags, Task, TaskEdge, TaskSpec};
pub use task_file::{infer_fmt, TaskFile, TaskFileSpec};
pub use workflow::{normalize_name, validate_name, Workflow};
