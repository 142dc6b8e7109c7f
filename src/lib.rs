//! cascade - DAG workflow engine for batch pipelines
//!
//! A user declaratively assembles a DAG of shell-command tasks grouped
//! into stages. The engine persists the graph in SQLite, dispatches
//! each ready task as a job to a distributed resource manager, tracks
//! job outcomes, retries transient failures, reclaims intermediate disk
//! space, and supports clean resume / reload / restart across process
//! restarts.

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export the types a pipeline definition needs.
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    ResourceHints, Stage, Status, Tags, Task, TaskEdge, TaskFileSpec, TaskSpec, Workflow,
};
pub use services::{
    JobManager, Repositories, RunOutcome, StartMode, StartOptions, TagFilterOp, WorkflowController,
};
