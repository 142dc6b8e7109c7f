//! CLI interface module
//!
//! Command definitions and handlers for the `cascade` binary. The CLI
//! is an administrative surface over persisted workflows: listing them,
//! listing their job attempts, and terminating a run by id. Pipeline
//! definition and `run()` live in library callers.

pub mod commands;
pub mod display;

use clap::{Parser, Subcommand};

use commands::workflow::WorkflowArgs;

#[derive(Parser, Debug)]
#[command(name = "cascade", version, about = "DAG workflow engine for batch pipelines")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Workflow administration
    Workflow(WorkflowArgs),

    /// List job attempts of a workflow
    Jobs {
        /// Workflow id
        workflow_id: i64,
        /// Queued jobs only
        #[arg(short, long)]
        queued: bool,
        /// Print DRM job ids only
        #[arg(long)]
        job_id_only: bool,
    },
}
