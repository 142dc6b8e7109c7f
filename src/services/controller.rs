//! Workflow controller: the top-level state machine.
//!
//! One controller instance drives one workflow: it owns the start modes
//! (create / resume / reload / restart), the bulk persistence entry
//! points the DAG layer calls, the main `run` loop that converts DAG
//! structure into DRM submissions, the retry policy, and the terminate
//! protocol. There is exactly one logical executor of `run()`;
//! everything below it is out-of-process jobs plus the JobManager's
//! poller.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    format_tags, JobAttempt, QueueStatus, ResourceUsage, Stage, Status, Tags, Task, TaskEdge,
    TaskFile, TaskFileSpec, TaskSpec, Workflow, WorkflowDag,
};
use crate::domain::models::workflow::{normalize_name, validate_name};
use crate::domain::ports::{
    JobRepository, StageRepository, Statistic, TaskRepository, WorkflowRepository,
};
use crate::infrastructure::fs;
use crate::services::command::{synthesize_output_paths, CommandTemplate};
use crate::services::gc;
use crate::services::job_manager::JobManager;

/// How `start` binds to a workflow name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Fail if the name exists; allocate the output directory.
    Create,
    /// Require the name exists; continue without pruning anything.
    Resume,
    /// Resume, then delete unsuccessful tasks (rows and files).
    Reload,
    /// Delete the workflow entirely, keep its id, create anew.
    Restart,
}

/// Options applied at `start`.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub root_output_dir: PathBuf,
    pub max_reattempts: u32,
    pub default_queue: Option<String>,
    pub dry_run: bool,
    pub delete_intermediates: bool,
    /// Reload only: drop entire unsuccessful stages instead of just
    /// their unsuccessful tasks.
    pub delete_unsuccessful_stages: bool,
    /// Restart only: ask on stdin before wiping an existing workflow.
    pub prompt_confirm: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            root_output_dir: PathBuf::from(".cascade/out"),
            max_reattempts: 3,
            default_queue: None,
            dry_run: false,
            delete_intermediates: false,
            delete_unsuccessful_stages: false,
            prompt_confirm: true,
        }
    }
}

/// Tag filter combinator for task queries. Only `And` is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFilterOp {
    And,
    Or,
}

/// How a `run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The DAG drained (possibly with failed tasks when
    /// `terminate_on_fail` was off).
    Finished,
    /// The terminate protocol ran; the process should exit non-zero.
    Terminated,
}

/// The repository bundle the controller works against.
#[derive(Clone)]
pub struct Repositories {
    pub workflows: Arc<dyn WorkflowRepository>,
    pub stages: Arc<dyn StageRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub jobs: Arc<dyn JobRepository>,
}

enum FinishKind {
    /// NOOP tasks are instantaneously successful.
    Noop,
    /// Judge by the attempt record (succeed_on_failure, successful
    /// attempt present).
    Attempt,
}

/// Everything `run` hydrates once up front. Repository queries replace
/// lazy back-references; nothing here is re-fetched inside the loop
/// except per-stage task lists at stage completion.
struct RunContext {
    dag: WorkflowDag,
    tasks: HashMap<i64, Task>,
    stages: HashMap<i64, Stage>,
    stage_dirs: HashMap<i64, PathBuf>,
    files: HashMap<i64, TaskFile>,
    files_by_task: HashMap<i64, Vec<i64>>,
    templates: HashMap<i64, CommandTemplate>,
}

pub struct WorkflowController {
    repos: Repositories,
    job_manager: JobManager,
    workflow: Workflow,
    /// Synthetic TaskFile id source for this workflow, seeded from
    /// `max(task_file.id) + 1` so ids never collide across workflows
    /// sharing a process.
    next_tmp_file_id: AtomicU64,
}

impl std::fmt::Debug for WorkflowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowController").finish_non_exhaustive()
    }
}

impl WorkflowController {
    /// Bind to a workflow according to `mode`. Returns a controller
    /// holding the workflow handle.
    pub async fn start(
        repos: Repositories,
        job_manager: JobManager,
        name: &str,
        mode: StartMode,
        options: StartOptions,
    ) -> DomainResult<Self> {
        let name = normalize_name(name);
        validate_name(&name)?;

        let workflow = match mode {
            StartMode::Create => Self::create_workflow(&repos, &name, &options, None).await?,
            StartMode::Resume => Self::resume_workflow(&repos, &name, &options).await?,
            StartMode::Reload => Self::resume_workflow(&repos, &name, &options).await?,
            StartMode::Restart => Self::restart_workflow(&repos, &name, &options).await?,
        };

        let seed = repos.tasks.max_file_id().await? + 1;
        let controller = Self {
            repos,
            job_manager,
            workflow,
            next_tmp_file_id: AtomicU64::new(seed.max(1) as u64),
        };

        if mode == StartMode::Reload {
            controller.reload(options.delete_unsuccessful_stages).await?;
        }
        Ok(controller)
    }

    /// Bind to an existing workflow by id without mutating it. Used by
    /// the CLI for terminate and inspection.
    pub async fn attach(
        repos: Repositories,
        job_manager: JobManager,
        workflow_id: i64,
    ) -> DomainResult<Self> {
        let workflow = repos
            .workflows
            .get(workflow_id)
            .await?
            .ok_or_else(|| DomainError::WorkflowNotFound(workflow_id.to_string()))?;
        let seed = repos.tasks.max_file_id().await? + 1;
        Ok(Self {
            repos,
            job_manager,
            workflow,
            next_tmp_file_id: AtomicU64::new(seed.max(1) as u64),
        })
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    async fn create_workflow(
        repos: &Repositories,
        name: &str,
        options: &StartOptions,
        explicit_id: Option<i64>,
    ) -> DomainResult<Workflow> {
        if repos.workflows.get_by_name(name).await?.is_some() {
            return Err(DomainError::WorkflowExists(name.to_string()));
        }

        let mut workflow = Workflow::new(name, &options.root_output_dir)?;
        workflow.max_reattempts = options.max_reattempts;
        workflow.default_queue = options.default_queue.clone();
        workflow.dry_run = options.dry_run;
        workflow.delete_intermediates = options.delete_intermediates;
        if let Some(id) = explicit_id {
            workflow.id = id;
        }

        fs::ensure_dir(&workflow.output_dir)?;
        workflow.id = repos.workflows.insert(&workflow).await?;
        tracing::info!(workflow = %workflow.name, id = workflow.id, "created workflow");
        Ok(workflow)
    }

    async fn resume_workflow(
        repos: &Repositories,
        name: &str,
        options: &StartOptions,
    ) -> DomainResult<Workflow> {
        let mut workflow = repos
            .workflows
            .get_by_name(name)
            .await?
            .ok_or_else(|| DomainError::WorkflowNotFound(name.to_string()))?;

        workflow.finished_on = None;
        workflow.max_reattempts = options.max_reattempts;
        workflow.default_queue = options.default_queue.clone();
        workflow.dry_run = options.dry_run;
        workflow.delete_intermediates = options.delete_intermediates;
        repos.workflows.update(&workflow).await?;

        // The DSL re-numbers stages as it replays them.
        repos.stages.clear_order(workflow.id).await?;
        tracing::info!(workflow = %workflow.name, "resuming workflow");
        Ok(workflow)
    }

    async fn restart_workflow(
        repos: &Repositories,
        name: &str,
        options: &StartOptions,
    ) -> DomainResult<Workflow> {
        let mut preserved_id = None;
        if let Some(old) = repos.workflows.get_by_name(name).await? {
            if options.prompt_confirm
                && !confirm(&format!(
                    "Are you sure you want to restart workflow '{name}'? All files will be deleted."
                ))
            {
                return Err(DomainError::ValidationFailed("restart declined".to_string()));
            }
            tracing::info!(workflow = %old.name, id = old.id, "deleting workflow for restart");
            preserved_id = Some(old.id);
            fs::remove_tree(&old.output_dir)?;
            repos.workflows.delete(old.id).await?;
        }
        Self::create_workflow(repos, name, options, preserved_id).await
    }

    /// Reload pruning: drop unsuccessful tasks (and optionally whole
    /// unsuccessful stages), delete their rows and directories, and put
    /// partially-complete stages back in progress.
    async fn reload(&self, delete_unsuccessful_stages: bool) -> DomainResult<()> {
        let stages = self.repos.stages.list_by_workflow(self.workflow.id).await?;
        for stage in &stages {
            if stage.successful() {
                continue;
            }
            let stage_tasks = self.repos.tasks.list_by_stage(stage.id).await?;
            let no_successful_tasks = stage_tasks.iter().all(|t| !t.successful());
            if delete_unsuccessful_stages || no_successful_tasks {
                tracing::info!(stage = %stage.name, "deleting unsuccessful stage");
                self.delete_stage(stage, &stage_tasks).await?;
            }
        }

        let unsuccessful = self.repos.tasks.unsuccessful_ids(self.workflow.id).await?;
        if !unsuccessful.is_empty() {
            tracing::info!(count = unsuccessful.len(), "deleting unsuccessful tasks");
            self.bulk_delete_tasks(&unsuccessful).await?;
        }

        // Stages that kept successful tasks resume in progress.
        for stage in self.repos.stages.list_by_workflow(self.workflow.id).await? {
            if stage.successful() {
                continue;
            }
            let has_successful = self
                .repos
                .tasks
                .list_by_stage(stage.id)
                .await?
                .iter()
                .any(Task::successful);
            if has_successful {
                let mut stage = stage;
                stage.status = Status::InProgress;
                stage.finished_on = None;
                self.repos.stages.update(&stage).await?;
            }
        }
        Ok(())
    }

    async fn delete_stage(&self, stage: &Stage, stage_tasks: &[Task]) -> DomainResult<()> {
        let ids: Vec<i64> = stage_tasks.iter().map(|t| t.id).collect();
        self.bulk_delete_tasks(&ids).await?;
        fs::remove_tree(&self.workflow.stage_output_dir(&stage.name))?;
        self.repos.stages.delete(stage.id).await
    }

    /// Delete task rows (attempts, tags, edges and files cascade) and
    /// their output directories on disk.
    async fn bulk_delete_tasks(&self, task_ids: &[i64]) -> DomainResult<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let stage_names: HashMap<i64, String> = self
            .repos
            .stages
            .list_by_workflow(self.workflow.id)
            .await?
            .into_iter()
            .map(|s| (s.id, s.name))
            .collect();

        let mut dirs = Vec::new();
        for &id in task_ids {
            if let Some(task) = self.repos.tasks.get(id).await? {
                if let Some(stage_name) = stage_names.get(&task.stage_id) {
                    dirs.push(task.output_dir(&self.workflow.stage_output_dir(stage_name)));
                }
            }
        }

        self.repos.tasks.bulk_delete(task_ids).await?;
        for dir in dirs {
            fs::remove_tree(&dir)?;
        }
        Ok(())
    }

    /// Idempotent: returns the existing stage when the name is already
    /// registered, assigning an insertion index only to stages that do
    /// not have one (new, or cleared by resume).
    pub async fn add_stage(&self, name: &str) -> DomainResult<Stage> {
        let name = normalize_name(name);
        validate_name(&name)?;

        if let Some(mut existing) = self
            .repos
            .stages
            .get_by_name(self.workflow.id, &name)
            .await?
        {
            if existing.order_in_workflow.is_none() {
                let order = self.repos.stages.max_order(self.workflow.id).await?.unwrap_or(0) + 1;
                existing.order_in_workflow = Some(order);
                self.repos.stages.update(&existing).await?;
            }
            tracing::info!(stage = %existing.name, "loading stage");
            return Ok(existing);
        }

        let order = self.repos.stages.max_order(self.workflow.id).await?.unwrap_or(0) + 1;
        let mut stage = Stage::new(self.workflow.id, &name, order);
        fs::ensure_dir(&self.workflow.stage_output_dir(&stage.name))?;
        stage.id = self.repos.stages.insert(&stage).await?;
        tracing::info!(stage = %stage.name, "created stage");
        Ok(stage)
    }

    /// Next synthetic id for a pre-persist TaskFile reference.
    pub fn next_tmp_file_id(&self) -> u64 {
        self.next_tmp_file_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Bulk-persist tasks: contiguous ids, tag rows, and per-task output
    /// directories. Duplicate `(stage, tags)` pairs fail the whole batch
    /// with every collision reported.
    pub async fn bulk_save_tasks(&self, specs: Vec<TaskSpec>) -> DomainResult<Vec<Task>> {
        for spec in &specs {
            spec.validate()?;
        }
        tracing::info!(count = specs.len(), "bulk adding tasks");

        let now = Utc::now();
        let mut tasks: Vec<Task> = specs.into_iter().map(|s| s.into_task(now)).collect();
        self.repos.tasks.bulk_insert(&mut tasks).await?;

        let stage_names: HashMap<i64, String> = self
            .repos
            .stages
            .list_by_workflow(self.workflow.id)
            .await?
            .into_iter()
            .map(|s| (s.id, s.name))
            .collect();
        for task in &tasks {
            let stage_name = stage_names
                .get(&task.stage_id)
                .ok_or_else(|| DomainError::StageNotFound(task.stage_id.to_string()))?;
            let stage_dir = self.workflow.stage_output_dir(stage_name);
            fs::ensure_dir(&task.job_output_dir(&stage_dir))?;
        }
        Ok(tasks)
    }

    /// Bulk-persist task files, then rewrite any `t_<n>` references in
    /// this workflow's command templates to the freshly assigned ids.
    pub async fn bulk_save_task_files(
        &self,
        specs: Vec<TaskFileSpec>,
    ) -> DomainResult<Vec<TaskFile>> {
        tracing::info!(count = specs.len(), "bulk adding task files");
        let tmp_ids: Vec<u64> = specs.iter().map(|s| s.tmp_id).collect();
        let mut files = specs
            .into_iter()
            .map(TaskFileSpec::into_task_file)
            .collect::<DomainResult<Vec<_>>>()?;
        self.repos.tasks.insert_files(&mut files).await?;

        let mapping: HashMap<u64, TaskFile> = tmp_ids
            .into_iter()
            .zip(files.iter().cloned())
            .collect();

        let mut updates = Vec::new();
        for task in self.repos.tasks.list_by_workflow(self.workflow.id).await? {
            if !task.pcmd.contains("#F[t_") {
                continue;
            }
            let template = CommandTemplate::parse(&task.pcmd)?;
            let (pcmd, changed) = template.rewrite_synthetic(&mapping);
            if changed {
                updates.push((task.id, pcmd));
            }
        }
        self.repos.tasks.rewrite_pcmds(&updates).await?;
        Ok(files)
    }

    /// Bulk-persist parent -> child edges.
    pub async fn bulk_save_task_edges(&self, edges: Vec<TaskEdge>) -> DomainResult<()> {
        tracing::info!(count = edges.len(), "bulk adding task edges");
        self.repos.tasks.insert_edges(self.workflow.id, &edges).await
    }

    /// Tasks matching every (key, value) pair in `tags`, optionally
    /// within one stage. `Or` filtering is not supported.
    pub async fn get_tasks_by(
        &self,
        stage: Option<&Stage>,
        tags: &Tags,
        op: TagFilterOp,
    ) -> DomainResult<Vec<Task>> {
        if op == TagFilterOp::Or {
            return Err(DomainError::UnsupportedTagFilter);
        }
        self.repos
            .tasks
            .find_by_tags(self.workflow.id, stage.map(|s| s.id), tags)
            .await
    }

    /// Exactly-one variant of [`get_tasks_by`](Self::get_tasks_by).
    pub async fn get_task_by(
        &self,
        stage: Option<&Stage>,
        tags: &Tags,
        op: TagFilterOp,
    ) -> DomainResult<Task> {
        let mut found = self.get_tasks_by(stage, tags, op).await?;
        if found.len() != 1 {
            return Err(DomainError::TaskCountMismatch(found.len()));
        }
        Ok(found.pop().expect("len checked"))
    }

    /// Main loop: dispatch the frontier, drain completions applying the
    /// retry policy, rerun the frontier after every completion, and
    /// terminate on SIGINT or exhausted retries (when
    /// `terminate_on_fail`).
    pub async fn run(&mut self, terminate_on_fail: bool, finish: bool) -> DomainResult<RunOutcome> {
        tracing::info!(workflow = %self.workflow.name, "generating DAG");
        let mut ctx = self.hydrate().await?;
        tracing::info!(tasks = ctx.dag.len(), remaining = ctx.dag.remaining(), "running DAG");

        self.run_ready_tasks(&mut ctx).await?;

        let manager = self.job_manager.clone();
        loop {
            let completed = tokio::select! {
                // The SIGINT registration lives only while run() awaits
                // here; it is dropped with the future on every exit path.
                // Installation is best-effort: if the handler cannot be
                // registered, the branch just never fires.
                () = sigint() => {
                    tracing::warn!("interrupt received, terminating workflow");
                    self.terminate().await?;
                    return Ok(RunOutcome::Terminated);
                }
                completed = manager.next_completed_job() => completed?,
            };
            let Some(attempt) = completed else { break };

            let task = ctx
                .tasks
                .get(&attempt.task_id)
                .cloned()
                .ok_or(DomainError::TaskNotFound(attempt.task_id))?;

            if attempt.successful || task.succeed_on_failure {
                self.task_has_finished(&mut ctx, task.id, &FinishKind::Attempt).await?;
                let status = ctx.tasks[&task.id].status;
                ctx.dag.complete_task(task.id, status);
                self.run_ready_tasks(&mut ctx).await?;
            } else if self.repos.jobs.count_by_task(task.id).await? < self.workflow.max_reattempts {
                self.reattempt_task(&mut ctx, task.id, &attempt).await?;
            } else {
                tracing::warn!(
                    task_id = task.id,
                    max_reattempts = self.workflow.max_reattempts,
                    "task failed and reached max_reattempts"
                );
                self.task_has_finished(&mut ctx, task.id, &FinishKind::Attempt).await?;
                // The node stays in the working queue so its descendants
                // never become ready.
                ctx.dag.stamp_status(task.id, Status::Failed);
                if terminate_on_fail {
                    tracing::warn!("terminate_on_fail is set, terminating");
                    self.terminate().await?;
                    return Ok(RunOutcome::Terminated);
                }
            }
        }

        // Completions drained, work remains, and nothing was ever
        // dispatched for it: only a cycle in the handed-over graph
        // produces this (failed tasks stay accounted as in-flight).
        if ctx.dag.is_stalled() {
            return Err(DomainError::DependencyCycle(ctx.dag.remaining()));
        }

        if finish {
            self.finished().await?;
        }
        Ok(RunOutcome::Finished)
    }

    /// Stamp `finished_on`. Idempotent: a second call keeps the stamp.
    pub async fn finished(&mut self) -> DomainResult<()> {
        if self.workflow.finished_on.is_none() {
            self.workflow.finished_on = Some(Utc::now());
            self.repos.workflows.update(&self.workflow).await?;
            tracing::info!(workflow = %self.workflow.name, "finished");
        }
        Ok(())
    }

    /// Terminate protocol: kill every queued attempt, fail the attempts,
    /// their tasks and every non-terminal stage, stamp `finished_on`.
    /// Replaying on an already-terminated workflow changes no rows.
    pub async fn terminate(&mut self) -> DomainResult<()> {
        let queued = self
            .repos
            .jobs
            .list_by_workflow(self.workflow.id, Some(QueueStatus::Queued))
            .await?;
        if queued.is_empty() && self.workflow.finished_on.is_some() {
            tracing::info!("terminate: workflow already terminated");
            return Ok(());
        }

        tracing::warn!(workflow = %self.workflow.name, "terminating workflow");
        tracing::info!(count = queued.len(), "sending terminate signal to all running jobs");
        for attempt in &queued {
            self.job_manager.terminate_job_attempt(attempt).await;
        }

        let now = Utc::now();
        let attempt_ids: Vec<i64> = queued.iter().map(|a| a.id).collect();
        let changed = self.repos.jobs.bulk_mark_terminated(&attempt_ids, now).await?;
        tracing::info!(count = changed, "marked terminated job attempts as failed");

        let mut task_ids: Vec<i64> = queued.iter().map(|a| a.task_id).collect();
        task_ids.sort_unstable();
        task_ids.dedup();
        let changed = self.repos.tasks.bulk_mark_failed(&task_ids, now).await?;
        tracing::info!(count = changed, "marked terminated tasks as failed");

        let changed = self
            .repos
            .stages
            .mark_unfinished_failed(self.workflow.id, now)
            .await?;
        tracing::info!(count = changed, "marked unfinished stages as failed");

        self.finished().await
    }

    /// True once every stage of the workflow is successful.
    pub async fn workflow_successful(&self) -> DomainResult<bool> {
        let stages = self.repos.stages.list_by_workflow(self.workflow.id).await?;
        Ok(!stages.is_empty() && stages.iter().all(Stage::successful))
    }

    /// Aggregate a resource-usage field over a stage's successful
    /// attempts.
    pub async fn stage_job_stat(
        &self,
        stage: &Stage,
        field: &str,
        statistic: &str,
    ) -> DomainResult<Option<f64>> {
        let statistic = Statistic::parse(statistic)?;
        self.repos.jobs.stage_job_stat(stage.id, field, statistic).await
    }

    /// Aggregate a resource-hint field over a stage's tasks.
    pub async fn stage_task_stat(
        &self,
        stage: &Stage,
        field: &str,
        statistic: &str,
    ) -> DomainResult<Option<f64>> {
        let statistic = Statistic::parse(statistic)?;
        self.repos.tasks.stage_task_stat(stage.id, field, statistic).await
    }

    /// Write one CSV row per successful attempt: stage, every tag key
    /// used in the workflow, then the resource-usage profile fields.
    pub async fn save_resource_usage_csv(&self, path: &Path) -> DomainResult<()> {
        let rows = self
            .repos
            .jobs
            .successful_usage_by_workflow(self.workflow.id)
            .await?;

        let mut tag_keys: BTreeSet<String> = BTreeSet::new();
        for (_, tags, _) in &rows {
            tag_keys.extend(tags.keys().cloned());
        }

        let mut out = String::new();
        let mut header: Vec<String> = vec!["stage".to_string()];
        header.extend(tag_keys.iter().cloned());
        header.extend(ResourceUsage::PROFILE_FIELDS.iter().map(|f| (*f).to_string()));
        out.push_str(&header.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(","));
        out.push('\n');

        for (stage, tags, usage) in &rows {
            let mut fields: Vec<String> = vec![stage.clone()];
            for key in &tag_keys {
                fields.push(tags.get(key).cloned().unwrap_or_default());
            }
            fields.push(render_opt(usage.exit_status.map(|v| v.to_string())));
            fields.push(render_opt(usage.wall_seconds.map(|v| v.to_string())));
            fields.push(render_opt(usage.user_seconds.map(|v| v.to_string())));
            fields.push(render_opt(usage.system_seconds.map(|v| v.to_string())));
            fields.push(render_opt(usage.max_rss_kb.map(|v| v.to_string())));
            out.push_str(&fields.iter().map(|f| csv_field(f)).collect::<Vec<_>>().join(","));
            out.push('\n');
        }

        std::fs::write(path, out)?;
        Ok(())
    }

    // --- run internals ---

    async fn hydrate(&self) -> DomainResult<RunContext> {
        let stage_list = self.repos.stages.list_by_workflow(self.workflow.id).await?;
        let task_list = self.repos.tasks.list_by_workflow(self.workflow.id).await?;
        let edges = self.repos.tasks.list_edges(self.workflow.id).await?;
        let file_list = self.repos.tasks.list_files_by_workflow(self.workflow.id).await?;

        let stage_names: HashMap<i64, String> =
            stage_list.iter().map(|s| (s.id, s.name.clone())).collect();
        let dag = WorkflowDag::hydrate(
            task_list.iter().map(|t| {
                (
                    t,
                    stage_names
                        .get(&t.stage_id)
                        .map(String::as_str)
                        .unwrap_or_default(),
                )
            }),
            edges.iter().map(|e| (e.parent, e.child)),
        );

        let stage_dirs = stage_list
            .iter()
            .map(|s| (s.id, self.workflow.stage_output_dir(&s.name)))
            .collect();
        let mut files_by_task: HashMap<i64, Vec<i64>> = HashMap::new();
        for file in &file_list {
            files_by_task.entry(file.task_id).or_default().push(file.id);
        }

        Ok(RunContext {
            dag,
            tasks: task_list.into_iter().map(|t| (t.id, t)).collect(),
            stages: stage_list.into_iter().map(|s| (s.id, s)).collect(),
            stage_dirs,
            files: file_list.into_iter().map(|f| (f.id, f)).collect(),
            files_by_task,
            templates: HashMap::new(),
        })
    }

    /// Dispatch every frontier member. NOOP tasks complete synchronously
    /// and may expose new frontier, so loop until the frontier is empty.
    /// Each pass ends with a GC sweep when `delete_intermediates`.
    async fn run_ready_tasks(&self, ctx: &mut RunContext) -> DomainResult<()> {
        loop {
            let ready = ctx.dag.ready_tasks();
            for &task_id in &ready {
                ctx.dag.mark_queued(task_id);
                let noop = ctx.tasks[&task_id].noop;
                if noop {
                    self.task_has_finished(ctx, task_id, &FinishKind::Noop).await?;
                    ctx.dag.complete_task(task_id, Status::Successful);
                } else {
                    self.dispatch_task(ctx, task_id).await?;
                }
            }
            // The GC sweep runs after every dispatch pass, including the
            // empty one that follows the last completion.
            if self.workflow.delete_intermediates {
                gc::clear_intermediate_tasks(
                    &mut ctx.dag,
                    self.repos.tasks.as_ref(),
                    &self.workflow.output_dir,
                )
                .await;
            }
            if ready.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Render one task's command and hand it to the JobManager.
    async fn dispatch_task(&self, ctx: &mut RunContext, task_id: i64) -> DomainResult<()> {
        let stage_id = ctx.tasks[&task_id].stage_id;
        let stage_dir = ctx.stage_dirs[&stage_id].clone();

        // First dispatch moves the stage out of no_attempt.
        let stage = ctx
            .stages
            .get_mut(&stage_id)
            .ok_or_else(|| DomainError::StageNotFound(stage_id.to_string()))?;
        if matches!(stage.status, Status::NoAttempt | Status::Failed) {
            if stage.status == Status::NoAttempt {
                stage.started_on = Some(Utc::now());
            }
            stage.status = Status::InProgress;
            self.repos.stages.update(stage).await?;
        }
        let stage_name = stage.name.clone();

        let task = ctx
            .tasks
            .get_mut(&task_id)
            .ok_or(DomainError::TaskNotFound(task_id))?;
        task.status = Status::InProgress;
        if task.started_on.is_none() {
            task.started_on = Some(Utc::now());
        }
        tracing::info!(task_id, stage = %stage_name, tags = %format_tags(&task.tags), "running task");

        let output_dir = task.output_dir(&stage_dir);
        let job_output_dir = task.job_output_dir(&stage_dir);
        fs::ensure_dir(&job_output_dir)?;

        // Give this task's output files concrete locations.
        let file_ids = ctx.files_by_task.get(&task_id).cloned().unwrap_or_default();
        let mut task_files: Vec<TaskFile> =
            file_ids.iter().map(|id| ctx.files[id].clone()).collect();
        let path_updates = synthesize_output_paths(&mut task_files, &job_output_dir)?;
        for file in task_files {
            ctx.files.insert(file.id, file);
        }
        for (file_id, path) in &path_updates {
            self.repos.tasks.update_file_path(*file_id, path).await?;
        }

        // The template parse is cached across retries.
        if !ctx.templates.contains_key(&task_id) {
            ctx.templates.insert(task_id, CommandTemplate::parse(&task.pcmd)?);
        }
        let exec_command = ctx.templates[&task_id].render(&ctx.files)?;

        let task = ctx.tasks.get_mut(&task_id).ok_or(DomainError::TaskNotFound(task_id))?;
        task.exec_command = Some(exec_command.clone());
        self.repos.tasks.update(task).await?;
        let task = ctx.tasks[&task_id].clone();

        let job_name = format!("{}_{}", stage_name, task_id);
        let mut attempt = self
            .job_manager
            .add_job_attempt(&task, &exec_command, &job_name, &output_dir)
            .await?;
        if self.workflow.dry_run {
            tracing::info!(task_id, "dry run: skipping submission of job attempt");
        } else {
            self.job_manager
                .submit_job(&mut attempt, &task, self.workflow.default_queue.as_deref(), &job_output_dir)
                .await?;
            tracing::info!(task_id, drm_job_id = ?attempt.drm_job_id, "submitted job attempt");
        }
        Ok(())
    }

    /// Retry policy body for one failed attempt: the task has not
    /// exhausted its reattempts, so wipe the job outputs and resubmit.
    async fn reattempt_task(
        &self,
        ctx: &mut RunContext,
        task_id: i64,
        failed_attempt: &JobAttempt,
    ) -> DomainResult<()> {
        let attempts = self.repos.jobs.count_by_task(task_id).await?;
        tracing::warn!(
            task_id,
            attempt = attempts,
            stderr = %failed_attempt.stderr_text(),
            "job attempt failed, deleting failed output files and retrying"
        );

        let stage_id = ctx.tasks[&task_id].stage_id;
        let job_output_dir = ctx.tasks[&task_id].job_output_dir(&ctx.stage_dirs[&stage_id]);
        fs::remove_dir_contents(&job_output_dir)?;

        self.dispatch_task(ctx, task_id).await
    }

    /// Finalize a task: stamp the terminal status, and close out the
    /// stage once all of its tasks are done.
    async fn task_has_finished(
        &self,
        ctx: &mut RunContext,
        task_id: i64,
        kind: &FinishKind,
    ) -> DomainResult<()> {
        let successful = match kind {
            FinishKind::Noop => true,
            FinishKind::Attempt => {
                let task = &ctx.tasks[&task_id];
                task.succeed_on_failure || self.repos.jobs.has_successful(task_id).await?
            }
        };

        let task = ctx
            .tasks
            .get_mut(&task_id)
            .ok_or(DomainError::TaskNotFound(task_id))?;
        task.status = if successful { Status::Successful } else { Status::Failed };
        task.finished_on = Some(Utc::now());
        if successful {
            tracing::info!(task_id, tags = %format_tags(&task.tags), "task successful");
        }
        let stage_id = task.stage_id;
        self.repos.tasks.update(task).await?;

        let stage_tasks = self.repos.tasks.list_by_stage(stage_id).await?;
        if stage_tasks.iter().all(Task::is_terminal) {
            let stage = ctx
                .stages
                .get_mut(&stage_id)
                .ok_or_else(|| DomainError::StageNotFound(stage_id.to_string()))?;
            stage_has_finished(stage, &stage_tasks)?;
            self.repos.stages.update(stage).await?;
        }
        Ok(())
    }
}

/// Close out a stage: successful iff every task succeeded, failed iff
/// every task is terminal and at least one failed. Calling this with a
/// non-terminal task in the stage is an engine bug.
fn stage_has_finished(stage: &mut Stage, stage_tasks: &[Task]) -> DomainResult<()> {
    let total = stage_tasks.len();
    let successful = stage_tasks.iter().filter(|t| t.successful()).count();
    let failed = stage_tasks.iter().filter(|t| t.status == Status::Failed).count();

    if successful == total {
        stage.status = Status::Successful;
    } else if successful + failed == total {
        stage.status = Status::Failed;
    } else {
        return Err(DomainError::Workflow(format!(
            "stage {} closed out before all tasks were terminal",
            stage.name
        )));
    }
    stage.finished_on = Some(Utc::now());
    tracing::info!(stage = %stage.name, status = %stage.status, "stage finished");
    Ok(())
}

fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render_opt(v: Option<String>) -> String {
    v.unwrap_or_default()
}

async fn sigint() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => (),
        // Registration failed (restricted environment, not the main
        // thread): never resolve rather than spuriously terminating.
        Err(_) => std::future::pending().await,
    }
}

fn confirm(prompt: &str) -> bool {
    use std::io::Write;
    eprint!("{prompt} [Y/n] ");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim(), "" | "y" | "Y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn stage_close_out_rules() {
        let mk = |status| {
            let mut t = TaskSpec::new(1, "x").into_task(Utc::now());
            t.status = status;
            t
        };
        let mut stage = Stage::new(1, "s", 1);

        stage_has_finished(&mut stage, &[mk(Status::Successful), mk(Status::Successful)]).unwrap();
        assert_eq!(stage.status, Status::Successful);

        let mut stage = Stage::new(1, "s", 1);
        stage_has_finished(&mut stage, &[mk(Status::Successful), mk(Status::Failed)]).unwrap();
        assert_eq!(stage.status, Status::Failed);

        let mut stage = Stage::new(1, "s", 1);
        let err = stage_has_finished(&mut stage, &[mk(Status::Successful), mk(Status::InProgress)]);
        assert!(matches!(err, Err(DomainError::Workflow(_))));
    }
}
