//! End-to-end engine scenarios against the mock DRM.

mod common;

use cascade::adapters::drm::MockOutcome;
use cascade::domain::models::{QueueStatus, Status};
use cascade::domain::ports::{JobRepository as _, StageRepository as _, TaskRepository as _};
use cascade::{RunOutcome, StartMode, Task, TaskEdge, TaskSpec, WorkflowController};

use common::{harness, Harness};

async fn start_create(h: &Harness, name: &str) -> WorkflowController {
    WorkflowController::start(
        h.repos.clone(),
        h.job_manager.clone(),
        name,
        StartMode::Create,
        h.options(),
    )
    .await
    .expect("create workflow")
}

/// One stage per letter, one task per stage, chained left to right.
async fn save_chain(controller: &WorkflowController, letters: &[&str]) -> Vec<Task> {
    let mut tasks = Vec::new();
    for letter in letters {
        let stage = controller.add_stage(letter).await.unwrap();
        let mut batch = controller
            .bulk_save_tasks(vec![
                TaskSpec::new(stage.id, format!("echo run-{letter}")).with_tag("letter", *letter)
            ])
            .await
            .unwrap();
        tasks.push(batch.pop().unwrap());
    }
    let edges: Vec<TaskEdge> = tasks
        .windows(2)
        .map(|pair| TaskEdge::new(pair[0].id, pair[1].id))
        .collect();
    controller.bulk_save_task_edges(edges).await.unwrap();
    tasks
}

#[tokio::test]
async fn linear_chain_runs_in_order_and_finishes() {
    let h = harness().await;
    let mut controller = start_create(&h, "linear").await;
    let tasks = save_chain(&controller, &["a", "b", "c"]).await;

    let outcome = controller.run(true, true).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished);

    // Exactly three submissions, in dependency order.
    let submissions = h.drm.submissions().await;
    assert_eq!(submissions.len(), 3);
    assert!(submissions[0].command.contains("run-a"));
    assert!(submissions[1].command.contains("run-b"));
    assert!(submissions[2].command.contains("run-c"));

    // Every stage successful, workflow finished and successful.
    for stage in h.repos.stages.list_by_workflow(controller.workflow().id).await.unwrap() {
        assert_eq!(stage.status, Status::Successful);
        assert!(stage.successful());
    }
    assert!(controller.workflow_successful().await.unwrap());
    assert!(controller.workflow().finished_on.is_some());

    // Each task has exactly one successful attempt.
    for task in &tasks {
        let attempts = h.repos.jobs.list_by_task(task.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].successful);
        assert_eq!(attempts[0].queue_status, QueueStatus::Completed);
    }

    // Edge ordering invariant: a parent finishes before its child starts.
    let persisted = h.repos.tasks.list_by_workflow(controller.workflow().id).await.unwrap();
    let by_id: std::collections::HashMap<i64, &Task> = persisted.iter().map(|t| (t.id, t)).collect();
    for edge in h.repos.tasks.list_edges(controller.workflow().id).await.unwrap() {
        let parent = by_id[&edge.parent];
        let child = by_id[&edge.child];
        assert!(parent.finished_on.unwrap() <= child.started_on.unwrap());
    }
}

#[tokio::test]
async fn diamond_exposes_both_branches_before_the_join() {
    let h = harness().await;
    let mut controller = start_create(&h, "diamond").await;

    let stage = controller.add_stage("all").await.unwrap();
    let specs = ["a", "b", "c", "d"]
        .iter()
        .map(|l| TaskSpec::new(stage.id, format!("echo run-{l}")).with_tag("letter", *l))
        .collect();
    let tasks = controller.bulk_save_tasks(specs).await.unwrap();
    let (a, b, c, d) = (tasks[0].id, tasks[1].id, tasks[2].id, tasks[3].id);
    controller
        .bulk_save_task_edges(vec![
            TaskEdge::new(a, b),
            TaskEdge::new(a, c),
            TaskEdge::new(b, d),
            TaskEdge::new(c, d),
        ])
        .await
        .unwrap();

    controller.run(true, true).await.unwrap();

    let submissions = h.drm.submissions().await;
    assert_eq!(submissions.len(), 4);
    assert!(submissions[0].command.contains("run-a"));
    // B and C enter the frontier together, in either order, before D.
    let middle: Vec<&str> = submissions[1..3]
        .iter()
        .map(|s| s.command.as_str())
        .collect();
    assert!(middle.iter().any(|c| c.contains("run-b")));
    assert!(middle.iter().any(|c| c.contains("run-c")));
    assert!(submissions[3].command.contains("run-d"));

    // D started only after both branches finished.
    let persisted = h.repos.tasks.list_by_workflow(controller.workflow().id).await.unwrap();
    let find = |id: i64| persisted.iter().find(|t| t.id == id).unwrap();
    assert!(find(b).finished_on.unwrap() <= find(d).started_on.unwrap());
    assert!(find(c).finished_on.unwrap() <= find(d).started_on.unwrap());
}

#[tokio::test]
async fn failing_task_is_retried_until_it_recovers() {
    let h = harness().await;
    let mut controller = start_create(&h, "retry").await;
    let tasks = save_chain(&controller, &["a"]).await;
    h.drm
        .script("run-a", vec![MockOutcome::Exit(1), MockOutcome::Exit(1), MockOutcome::Exit(0)])
        .await;

    // Leftover bytes from a failed attempt must not leak into the next.
    let job_dir = h
        .root
        .path()
        .join("retry/a")
        .join(tasks[0].id.to_string())
        .join("out");
    std::fs::write(job_dir.join("partial.bin"), "junk").unwrap();

    let outcome = controller.run(true, true).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished);

    let attempts = h.repos.jobs.list_by_task(tasks[0].id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(!attempts[0].successful);
    assert!(!attempts[1].successful);
    assert!(attempts[2].successful);

    let task = h.repos.tasks.get(tasks[0].id).await.unwrap().unwrap();
    assert_eq!(task.status, Status::Successful);
    assert!(!job_dir.join("partial.bin").exists());
    assert!(controller.workflow_successful().await.unwrap());
}

#[tokio::test]
async fn exhausted_retries_terminate_the_workflow() {
    let h = harness().await;
    let mut controller = start_create(&h, "exhausted").await;

    // Two independent roots: one keeps failing, one hangs in the queue.
    let stage = controller.add_stage("roots").await.unwrap();
    let tasks = controller
        .bulk_save_tasks(vec![
            TaskSpec::new(stage.id, "echo run-bad").with_tag("letter", "bad"),
            TaskSpec::new(stage.id, "echo run-slow").with_tag("letter", "slow"),
        ])
        .await
        .unwrap();
    h.drm
        .script(
            "run-bad",
            vec![MockOutcome::Exit(1), MockOutcome::Exit(1), MockOutcome::Exit(1)],
        )
        .await;
    h.drm.script("run-slow", vec![MockOutcome::Hang]).await;

    let outcome = controller.run(true, true).await.unwrap();
    assert_eq!(outcome, RunOutcome::Terminated);

    // The failing task burned its full retry budget, never more.
    let bad_attempts = h.repos.jobs.list_by_task(tasks[0].id).await.unwrap();
    assert_eq!(bad_attempts.len() as u32, controller.workflow().max_reattempts);
    assert!(bad_attempts.iter().all(|a| !a.successful));

    // The hung job was killed and bulk-marked completed/unsuccessful.
    let slow_attempts = h.repos.jobs.list_by_task(tasks[1].id).await.unwrap();
    assert_eq!(slow_attempts.len(), 1);
    assert_eq!(slow_attempts[0].queue_status, QueueStatus::Completed);
    assert!(!slow_attempts[0].successful);
    assert!(slow_attempts[0].finished_on.is_some());

    // Tasks, stage and workflow are all closed out as failed.
    for task in &tasks {
        let task = h.repos.tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, Status::Failed);
    }
    let stages = h.repos.stages.list_by_workflow(controller.workflow().id).await.unwrap();
    assert!(stages.iter().all(|s| s.status == Status::Failed));
    assert!(controller.workflow().finished_on.is_some());
}

#[tokio::test]
async fn single_failure_fails_immediately_with_one_reattempt() {
    let h = harness().await;
    let mut options = h.options();
    options.max_reattempts = 1;
    let mut controller = WorkflowController::start(
        h.repos.clone(),
        h.job_manager.clone(),
        "one_shot",
        StartMode::Create,
        options,
    )
    .await
    .unwrap();
    let tasks = save_chain(&controller, &["a"]).await;
    h.drm.script("run-a", vec![MockOutcome::Exit(1)]).await;

    let outcome = controller.run(true, true).await.unwrap();
    assert_eq!(outcome, RunOutcome::Terminated);
    assert_eq!(h.repos.jobs.count_by_task(tasks[0].id).await.unwrap(), 1);
    let task = h.repos.tasks.get(tasks[0].id).await.unwrap().unwrap();
    assert_eq!(task.status, Status::Failed);
}

#[tokio::test]
async fn noop_only_workflow_completes_without_touching_the_drm() {
    let h = harness().await;
    let mut controller = start_create(&h, "noop_only").await;

    let stage = controller.add_stage("inputs").await.unwrap();
    let tasks = controller
        .bulk_save_tasks(vec![TaskSpec::new(stage.id, "").noop().with_tag("kind", "input")])
        .await
        .unwrap();

    let outcome = controller.run(true, true).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished);
    assert_eq!(h.drm.submission_count().await, 0);
    assert!(h.repos.jobs.list_by_task(tasks[0].id).await.unwrap().is_empty());

    let task = h.repos.tasks.get(tasks[0].id).await.unwrap().unwrap();
    assert_eq!(task.status, Status::Successful);
    assert!(controller.workflow_successful().await.unwrap());
}

#[tokio::test]
async fn succeed_on_failure_lets_the_workflow_progress() {
    let h = harness().await;
    let mut controller = start_create(&h, "tolerant").await;

    let stage = controller.add_stage("s").await.unwrap();
    let mut spec = TaskSpec::new(stage.id, "echo run-flaky").with_tag("letter", "a");
    spec.succeed_on_failure = true;
    let first = controller.bulk_save_tasks(vec![spec]).await.unwrap();
    let second = controller
        .bulk_save_tasks(vec![TaskSpec::new(stage.id, "echo run-after").with_tag("letter", "b")])
        .await
        .unwrap();
    controller
        .bulk_save_task_edges(vec![TaskEdge::new(first[0].id, second[0].id)])
        .await
        .unwrap();
    h.drm.script("run-flaky", vec![MockOutcome::Exit(1)]).await;

    let outcome = controller.run(true, true).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished);

    // One failed attempt, yet the task counts as successful and the
    // child still ran.
    assert_eq!(h.repos.jobs.count_by_task(first[0].id).await.unwrap(), 1);
    let task = h.repos.tasks.get(first[0].id).await.unwrap().unwrap();
    assert_eq!(task.status, Status::Successful);
    assert_eq!(h.drm.submission_count().await, 2);
    assert!(controller.workflow_successful().await.unwrap());
}

#[tokio::test]
async fn dry_run_never_submits() {
    let h = harness().await;
    let mut options = h.options();
    options.dry_run = true;
    let mut controller = WorkflowController::start(
        h.repos.clone(),
        h.job_manager.clone(),
        "dry",
        StartMode::Create,
        options,
    )
    .await
    .unwrap();
    let tasks = save_chain(&controller, &["a"]).await;

    controller.run(true, true).await.unwrap();
    assert_eq!(h.drm.submission_count().await, 0);

    // The attempt exists but never reached the queue.
    let attempts = h.repos.jobs.list_by_task(tasks[0].id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].queue_status, QueueStatus::NotSubmitted);
}

#[tokio::test]
async fn cycle_is_reported_as_a_fatal_error() {
    let h = harness().await;
    let mut controller = start_create(&h, "cyclic").await;

    let stage = controller.add_stage("s").await.unwrap();
    let tasks = controller
        .bulk_save_tasks(vec![
            TaskSpec::new(stage.id, "echo run-a").with_tag("letter", "a"),
            TaskSpec::new(stage.id, "echo run-b").with_tag("letter", "b"),
        ])
        .await
        .unwrap();
    controller
        .bulk_save_task_edges(vec![
            TaskEdge::new(tasks[0].id, tasks[1].id),
            TaskEdge::new(tasks[1].id, tasks[0].id),
        ])
        .await
        .unwrap();

    let err = controller.run(true, true).await.unwrap_err();
    assert!(matches!(err, cascade::DomainError::DependencyCycle(2)));
    assert_eq!(h.drm.submission_count().await, 0);
}
