//! cascade CLI entry point

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use cascade::adapters::drm::LocalDrm;
use cascade::adapters::sqlite::{
    initialize_database, SqliteJobRepository, SqliteStageRepository, SqliteTaskRepository,
    SqliteWorkflowRepository,
};
use cascade::cli::commands::workflow::WorkflowCommands;
use cascade::cli::commands::{jobs, workflow};
use cascade::cli::{Cli, Commands};
use cascade::infrastructure::config::ConfigLoader;
use cascade::infrastructure::logging;
use cascade::services::{JobManager, Repositories};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = ConfigLoader::load().context("Failed to load configuration")?;
    let _log_guard = logging::init(&config.logging).context("Failed to initialize logging")?;

    let database_url = format!("sqlite:{}", config.database.path);
    let pool = initialize_database(&database_url)
        .await
        .context("Failed to open database")?;

    let repos = Repositories {
        workflows: Arc::new(SqliteWorkflowRepository::new(pool.clone())),
        stages: Arc::new(SqliteStageRepository::new(pool.clone())),
        tasks: Arc::new(SqliteTaskRepository::new(pool.clone())),
        jobs: Arc::new(SqliteJobRepository::new(pool.clone())),
    };
    let job_manager = JobManager::new(
        Arc::new(LocalDrm::new()),
        repos.jobs.clone(),
        Duration::from_millis(config.engine.poll_interval_ms),
    );

    match cli.command {
        Commands::Workflow(args) => match args.command {
            WorkflowCommands::List => {
                workflow::handle_list(&repos).await?;
                Ok(ExitCode::SUCCESS)
            }
            WorkflowCommands::Terminate { id } => {
                workflow::handle_terminate(repos, job_manager, id).await?;
                // Terminate always leaves the process with a non-zero
                // status: the run did not finish cleanly.
                Ok(ExitCode::FAILURE)
            }
        },
        Commands::Jobs { workflow_id, queued, job_id_only } => {
            jobs::handle_jobs(&repos, workflow_id, queued, job_id_only).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
