//! Job attempt CLI commands.

use anyhow::Result;
use comfy_table::Cell;

use crate::cli::display::table::list_table;
use crate::domain::models::QueueStatus;
use crate::domain::ports::JobRepository as _;
use crate::services::Repositories;

pub async fn handle_jobs(
    repos: &Repositories,
    workflow_id: i64,
    queued_only: bool,
    job_id_only: bool,
) -> Result<()> {
    let filter = queued_only.then_some(QueueStatus::Queued);
    let attempts = repos.jobs.list_by_workflow(workflow_id, filter).await?;

    if job_id_only {
        for attempt in &attempts {
            if let Some(job_id) = &attempt.drm_job_id {
                println!("{job_id}");
            }
        }
        return Ok(());
    }

    if attempts.is_empty() {
        println!("No job attempts found.");
        return Ok(());
    }

    let mut table = list_table(&["id", "task", "drm job id", "queue status", "successful"]);
    for attempt in &attempts {
        table.add_row(vec![
            Cell::new(attempt.id),
            Cell::new(attempt.task_id),
            Cell::new(attempt.drm_job_id.as_deref().unwrap_or("-")),
            Cell::new(attempt.queue_status.as_str()),
            Cell::new(attempt.successful),
        ]);
    }
    println!("{table}");
    Ok(())
}
