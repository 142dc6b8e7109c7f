//! Intermediate garbage collector.
//!
//! Reclaims disk by emptying the job output directory of tasks that are
//! internal to the DAG (at least one parent, at least one child, and at
//! least one successful child). Rows are retained — only bytes on disk
//! are reclaimed. The pass is advisory: a failed deletion is logged and
//! never fails the workflow.

use std::path::Path;

use crate::domain::models::WorkflowDag;
use crate::domain::ports::TaskRepository;
use crate::infrastructure::fs;

/// Clear every eligible intermediate task's job output directory and
/// persist `cleared_output_files`. Returns how many tasks were cleared.
pub async fn clear_intermediate_tasks(
    dag: &mut WorkflowDag,
    tasks: &dyn TaskRepository,
    workflow_output_dir: &Path,
) -> u64 {
    let mut cleared = 0;
    for task_id in dag.clearable_intermediates() {
        let Some(node) = dag.node(task_id) else { continue };
        let job_output_dir = workflow_output_dir
            .join(&node.stage_name)
            .join(task_id.to_string())
            .join("out");

        tracing::info!(task_id, path = %job_output_dir.display(), "clearing intermediate task outputs");
        if let Err(err) = fs::remove_dir_contents(&job_output_dir) {
            tracing::warn!(task_id, error = %err, "failed to clear intermediate outputs");
            continue;
        }
        if let Err(err) = tasks.set_cleared_output_files(task_id).await {
            tracing::warn!(task_id, error = %err, "failed to persist cleared_output_files");
            continue;
        }
        dag.mark_cleared(task_id);
        cleared += 1;
    }
    cleared
}
