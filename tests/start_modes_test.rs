//! Create / resume / reload / restart semantics.

mod common;

use cascade::adapters::drm::MockOutcome;
use cascade::domain::models::Status;
use cascade::domain::ports::{JobRepository as _, StageRepository as _, TaskRepository as _};
use cascade::{DomainError, RunOutcome, StartMode, TaskEdge, TaskSpec, WorkflowController};

use common::{harness, Harness};

async fn start(h: &Harness, name: &str, mode: StartMode) -> cascade::DomainResult<WorkflowController> {
    WorkflowController::start(h.repos.clone(), h.job_manager.clone(), name, mode, h.options()).await
}

#[tokio::test]
async fn create_rejects_duplicate_names() {
    let h = harness().await;
    start(&h, "dup", StartMode::Create).await.unwrap();
    let err = start(&h, "dup", StartMode::Create).await.unwrap_err();
    assert!(matches!(err, DomainError::WorkflowExists(_)));
}

#[tokio::test]
async fn resume_requires_an_existing_workflow() {
    let h = harness().await;
    let err = start(&h, "missing", StartMode::Resume).await.unwrap_err();
    assert!(matches!(err, DomainError::WorkflowNotFound(_)));
}

#[tokio::test]
async fn resume_clears_finished_on_and_stage_order() {
    let h = harness().await;
    let mut controller = start(&h, "wf", StartMode::Create).await.unwrap();
    let stage = controller.add_stage("s1").await.unwrap();
    assert_eq!(stage.order_in_workflow, Some(1));
    controller.finished().await.unwrap();
    assert!(controller.workflow().finished_on.is_some());
    drop(controller);

    let controller = start(&h, "wf", StartMode::Resume).await.unwrap();
    assert!(controller.workflow().finished_on.is_none());
    let stage = h.repos.stages.get(stage.id).await.unwrap().unwrap();
    assert!(stage.order_in_workflow.is_none());

    // The DSL replay re-numbers the stage and gets the same row back.
    let renumbered = controller.add_stage("s1").await.unwrap();
    assert_eq!(renumbered.id, stage.id);
    assert_eq!(renumbered.order_in_workflow, Some(1));
}

#[tokio::test]
async fn add_stage_is_idempotent() {
    let h = harness().await;
    let controller = start(&h, "wf", StartMode::Create).await.unwrap();
    let first = controller.add_stage("align reads").await.unwrap();
    let second = controller.add_stage("align reads").await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.name, "align_reads");
    assert_eq!(second.order_in_workflow, Some(1));

    let next = controller.add_stage("call variants").await.unwrap();
    assert_eq!(next.order_in_workflow, Some(2));
}

#[tokio::test]
async fn finished_twice_keeps_the_first_stamp() {
    let h = harness().await;
    let mut controller = start(&h, "wf", StartMode::Create).await.unwrap();
    controller.finished().await.unwrap();
    let first = controller.workflow().finished_on.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    controller.finished().await.unwrap();
    assert_eq!(controller.workflow().finished_on.unwrap(), first);
}

#[tokio::test]
async fn terminate_on_terminated_workflow_changes_no_rows() {
    let h = harness().await;
    let mut controller = start(&h, "wf", StartMode::Create).await.unwrap();
    let stage = controller.add_stage("s").await.unwrap();
    controller
        .bulk_save_tasks(vec![TaskSpec::new(stage.id, "echo hi")])
        .await
        .unwrap();

    controller.terminate().await.unwrap();
    let stage_after = h.repos.stages.get(stage.id).await.unwrap().unwrap();
    assert_eq!(stage_after.status, Status::Failed);
    let stamp = stage_after.finished_on;
    let wf_stamp = controller.workflow().finished_on;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    controller.terminate().await.unwrap();
    let stage_replayed = h.repos.stages.get(stage.id).await.unwrap().unwrap();
    assert_eq!(stage_replayed.finished_on, stamp);
    assert_eq!(controller.workflow().finished_on, wf_stamp);
}

#[tokio::test]
async fn restart_preserves_the_workflow_id_and_wipes_everything_else() {
    let h = harness().await;
    let controller = start(&h, "wf", StartMode::Create).await.unwrap();
    let old_id = controller.workflow().id;
    let stage = controller.add_stage("s").await.unwrap();
    let tasks = controller
        .bulk_save_tasks(vec![TaskSpec::new(stage.id, "echo hi")])
        .await
        .unwrap();
    let task_dir = h
        .root
        .path()
        .join("wf/s")
        .join(tasks[0].id.to_string());
    assert!(task_dir.exists());
    drop(controller);

    let controller = start(&h, "wf", StartMode::Restart).await.unwrap();
    assert_eq!(controller.workflow().id, old_id);
    assert!(h.repos.tasks.list_by_workflow(old_id).await.unwrap().is_empty());
    assert!(h.repos.stages.list_by_workflow(old_id).await.unwrap().is_empty());
    assert!(!task_dir.exists());
    // A fresh output root was allocated.
    assert!(h.root.path().join("wf").exists());
}

#[tokio::test]
async fn reload_prunes_failures_and_reruns_only_their_subgraph() {
    let h = harness().await;

    // First run: B succeeds, C fails (no terminate so the run drains).
    let mut controller = start(&h, "wf", StartMode::Create).await.unwrap();
    let stage = controller.add_stage("s").await.unwrap();
    let tasks = controller
        .bulk_save_tasks(vec![
            TaskSpec::new(stage.id, "echo run-b").with_tag("letter", "b"),
            TaskSpec::new(stage.id, "echo run-c").with_tag("letter", "c"),
        ])
        .await
        .unwrap();
    let (b_id, c_id) = (tasks[0].id, tasks[1].id);
    controller
        .bulk_save_task_edges(vec![TaskEdge::new(b_id, c_id)])
        .await
        .unwrap();
    h.drm
        .script(
            "run-c",
            vec![MockOutcome::Exit(1), MockOutcome::Exit(1), MockOutcome::Exit(1)],
        )
        .await;

    let outcome = controller.run(false, true).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished);
    assert_eq!(h.repos.tasks.get(c_id).await.unwrap().unwrap().status, Status::Failed);
    let c_dir = h.root.path().join("wf/s").join(c_id.to_string());
    assert!(c_dir.exists());
    drop(controller);

    // Reload: C's row and directory go away, the stage resumes.
    let mut controller = start(&h, "wf", StartMode::Reload).await.unwrap();
    assert!(h.repos.tasks.get(c_id).await.unwrap().is_none());
    assert!(h.repos.jobs.list_by_task(c_id).await.unwrap().is_empty());
    assert!(!c_dir.exists());
    let b_task = h.repos.tasks.get(b_id).await.unwrap().unwrap();
    assert_eq!(b_task.status, Status::Successful);
    let stage_after = h.repos.stages.get(stage.id).await.unwrap().unwrap();
    assert_eq!(stage_after.status, Status::InProgress);

    // The DSL replays C; rerun dispatches only C's subgraph.
    let stage = controller.add_stage("s").await.unwrap();
    let replayed = controller
        .bulk_save_tasks(vec![TaskSpec::new(stage.id, "echo run-c").with_tag("letter", "c")])
        .await
        .unwrap();
    controller
        .bulk_save_task_edges(vec![TaskEdge::new(b_id, replayed[0].id)])
        .await
        .unwrap();

    let before = h.drm.submission_count().await;
    controller.run(true, true).await.unwrap();
    assert_eq!(h.drm.submission_count().await - before, 1);

    // Every retained task is successful now.
    for task in h.repos.tasks.list_by_workflow(controller.workflow().id).await.unwrap() {
        assert_eq!(task.status, Status::Successful);
    }
    assert!(controller.workflow_successful().await.unwrap());
}

#[tokio::test]
async fn reload_drops_stages_with_no_successful_tasks() {
    let h = harness().await;
    let mut controller = start(&h, "wf", StartMode::Create).await.unwrap();
    let good = controller.add_stage("good").await.unwrap();
    let bad = controller.add_stage("bad").await.unwrap();
    controller
        .bulk_save_tasks(vec![TaskSpec::new(good.id, "echo run-g")])
        .await
        .unwrap();
    controller
        .bulk_save_tasks(vec![TaskSpec::new(bad.id, "echo run-x")])
        .await
        .unwrap();
    h.drm
        .script(
            "run-x",
            vec![MockOutcome::Exit(1), MockOutcome::Exit(1), MockOutcome::Exit(1)],
        )
        .await;
    controller.run(false, true).await.unwrap();
    drop(controller);

    let controller = start(&h, "wf", StartMode::Reload).await.unwrap();
    let names: Vec<String> = h
        .repos
        .stages
        .list_by_workflow(controller.workflow().id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert!(names.contains(&"good".to_string()));
    assert!(!names.contains(&"bad".to_string()));
}
