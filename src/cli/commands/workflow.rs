//! Workflow CLI commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use comfy_table::Cell;

use crate::cli::display::table::list_table;
use crate::domain::ports::WorkflowRepository as _;
use crate::services::{JobManager, Repositories, WorkflowController};

#[derive(Args, Debug)]
pub struct WorkflowArgs {
    #[command(subcommand)]
    pub command: WorkflowCommands,
}

#[derive(Subcommand, Debug)]
pub enum WorkflowCommands {
    /// List all workflows
    List,
    /// Terminate a running workflow by id
    Terminate {
        /// Workflow id
        id: i64,
    },
}

pub async fn handle_list(repos: &Repositories) -> Result<()> {
    let workflows = repos.workflows.list().await?;
    if workflows.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    let mut table = list_table(&["id", "name", "output dir", "created", "finished"]);
    for wf in &workflows {
        table.add_row(vec![
            Cell::new(wf.id),
            Cell::new(&wf.name),
            Cell::new(wf.output_dir.display()),
            Cell::new(wf.created_on.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(
                wf.finished_on
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }
    println!("{table}");
    Ok(())
}

/// Terminate by id: kill queued attempts, fail their tasks and every
/// unfinished stage, stamp the workflow finished.
pub async fn handle_terminate(
    repos: Repositories,
    job_manager: JobManager,
    id: i64,
) -> Result<()> {
    let mut controller = WorkflowController::attach(repos, job_manager, id).await?;
    println!("Telling workflow {} to terminate", controller.workflow().name);
    controller.terminate().await?;
    Ok(())
}
