//! Workflow domain model.
//!
//! A Workflow is the master record: it owns a set of stages, a root
//! output directory on shared storage, and the retry/GC policy applied
//! to every task it runs.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

/// The master record for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier, stable across restart.
    pub id: i64,
    /// Unique name; whitespace is normalized to underscores.
    pub name: String,
    /// Root of this workflow's on-disk output tree.
    pub output_dir: PathBuf,
    /// Maximum number of job attempts per task.
    pub max_reattempts: u32,
    /// Default DRM queue for submissions.
    pub default_queue: Option<String>,
    /// When set, jobs are never handed to the DRM.
    pub dry_run: bool,
    /// When set, intermediate task outputs are reclaimed as the DAG drains.
    pub delete_intermediates: bool,
    pub created_on: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Build a new, unpersisted workflow record (`id == 0`).
    pub fn new(name: &str, root_output_dir: &Path) -> DomainResult<Self> {
        let name = normalize_name(name);
        validate_name(&name)?;
        Ok(Self {
            id: 0,
            output_dir: root_output_dir.join(&name),
            name,
            max_reattempts: 3,
            default_queue: None,
            dry_run: false,
            delete_intermediates: false,
            created_on: Utc::now(),
            finished_on: None,
        })
    }

    /// Stage output directory: `<workflow.output_dir>/<stage_name>`.
    pub fn stage_output_dir(&self, stage_name: &str) -> PathBuf {
        self.output_dir.join(stage_name)
    }
}

/// Replace whitespace runs with underscores.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Names become path components, so restrict them to a safe alphabet
/// and reject the reserved components `.` and `..` outright — a name
/// that traverses out of the output root would turn restart/reload
/// deletion into data loss outside the workflow's tree.
pub fn validate_name(name: &str) -> DomainResult<()> {
    if name.is_empty() {
        return Err(DomainError::ValidationFailed(
            "name cannot be empty".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(DomainError::ValidationFailed(format!(
            "name {name} may only contain alphanumerics, '_', '-' and '.'"
        )));
    }
    let is_single_safe_component = Path::new(name).components().eq([Component::Normal(
        std::ffi::OsStr::new(name),
    )]);
    if !is_single_safe_component {
        return Err(DomainError::ValidationFailed(format!(
            "name {name} is not a valid path component"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_whitespace_to_underscores() {
        assert_eq!(normalize_name("Whole Genome  Analysis"), "Whole_Genome_Analysis");
    }

    #[test]
    fn rejects_path_hostile_names() {
        assert!(validate_name("wga_run-1.2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name("a/b").is_err());
        // `.` and `..` pass the character whitelist but are reserved
        // path components, not names.
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        // Dotted names that are real components stay allowed.
        assert!(validate_name("v1..final").is_ok());
        assert!(validate_name(".hidden").is_ok());
    }

    #[test]
    fn output_dir_is_rooted_at_name() {
        let wf = Workflow::new("my run", Path::new("/data/out")).unwrap();
        assert_eq!(wf.name, "my_run");
        assert_eq!(wf.output_dir, PathBuf::from("/data/out/my_run"));
        assert_eq!(
            wf.stage_output_dir("align"),
            PathBuf::from("/data/out/my_run/align")
        );
    }
}
