//! Application services for the cascade engine.

pub mod command;
pub mod controller;
pub mod gc;
pub mod job_manager;

pub use command::{CommandTemplate, FileRef, FileRefId};
pub use controller::{
    Repositories, RunOutcome, StartMode, StartOptions, TagFilterOp, WorkflowController,
};
pub use job_manager::JobManager;
