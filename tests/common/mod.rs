//! Common test utilities for integration tests
//!
//! Provides shared fixtures and helpers used across multiple
//! integration test files: an in-memory migrated database, a scripted
//! mock DRM, and a ready-to-start controller harness.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tempfile::TempDir;

use cascade::adapters::drm::MockDrm;
use cascade::adapters::sqlite::{
    create_migrated_test_pool, SqliteJobRepository, SqliteStageRepository, SqliteTaskRepository,
    SqliteWorkflowRepository,
};
use cascade::services::{JobManager, Repositories, StartOptions};

pub struct Harness {
    #[allow(dead_code)]
    pub pool: SqlitePool,
    pub repos: Repositories,
    pub drm: MockDrm,
    pub job_manager: JobManager,
    pub root: TempDir,
}

/// In-memory database, mock DRM, fast poller, temp output root.
pub async fn harness() -> Harness {
    let pool = create_migrated_test_pool().await.expect("migrated test pool");
    let repos = Repositories {
        workflows: Arc::new(SqliteWorkflowRepository::new(pool.clone())),
        stages: Arc::new(SqliteStageRepository::new(pool.clone())),
        tasks: Arc::new(SqliteTaskRepository::new(pool.clone())),
        jobs: Arc::new(SqliteJobRepository::new(pool.clone())),
    };
    let drm = MockDrm::new();
    let job_manager = JobManager::new(
        Arc::new(drm.clone()),
        repos.jobs.clone(),
        Duration::from_millis(10),
    );
    let root = tempfile::tempdir().expect("temp output root");
    Harness { pool, repos, drm, job_manager, root }
}

impl Harness {
    /// Start options rooted at this harness's temp dir; never prompts.
    pub fn options(&self) -> StartOptions {
        StartOptions {
            root_output_dir: self.root.path().to_path_buf(),
            prompt_confirm: false,
            ..StartOptions::default()
        }
    }

    #[allow(dead_code)]
    pub fn setup_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }
}
