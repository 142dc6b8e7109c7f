//! TaskFile domain model.
//!
//! A TaskFile is a named output artifact of exactly one task, referenced
//! by other tasks' command templates to form data dependencies.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

/// A named output artifact of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFile {
    pub id: i64,
    /// The producing task.
    pub task_id: i64,
    /// Concrete location on shared storage. `None` until the engine
    /// synthesizes a path under the task's job output directory.
    pub path: Option<PathBuf>,
    /// Keyword used to reference this file (defaults to `fmt`).
    pub name: String,
    /// File format, e.g. `bam`, `fastq.gz`, `dir`.
    pub fmt: String,
}

/// Descriptor for a TaskFile that has not been persisted yet. Carries a
/// synthetic id (`t_<n>`) so the DAG layer can embed references in
/// command templates before real ids exist.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFileSpec {
    pub tmp_id: u64,
    pub task_id: i64,
    pub path: Option<PathBuf>,
    pub name: Option<String>,
    pub fmt: Option<String>,
}

impl TaskFileSpec {
    /// Resolve name/fmt defaults and produce an unpersisted row.
    pub fn into_task_file(self) -> DomainResult<TaskFile> {
        let fmt = match self.fmt {
            Some(fmt) => fmt,
            None => match &self.path {
                Some(path) => infer_fmt(path)?,
                None => {
                    return Err(DomainError::ValidationFailed(
                        "task file needs a fmt or a path to infer it from".to_string(),
                    ))
                }
            },
        };
        let name = self.name.unwrap_or_else(|| fmt.clone());
        Ok(TaskFile {
            id: 0,
            task_id: self.task_id,
            path: self.path,
            name,
            fmt,
        })
    }

    /// The `#F[t_<n>:<name>:<path>]` form the DAG layer embeds in
    /// command templates before persistence.
    pub fn reference(&self) -> String {
        let name = self.name.as_deref().unwrap_or("");
        let path = self.path.as_deref().map(Path::to_string_lossy).unwrap_or_default();
        format!("#F[t_{}:{}:{}]", self.tmp_id, name, path)
    }
}

impl TaskFile {
    /// The `#F[<id>:<name>:<path>]` reference form for this file.
    pub fn reference(&self) -> String {
        let path = self.path.as_deref().map(Path::to_string_lossy).unwrap_or_default();
        format!("#F[{}:{}:{}]", self.id, self.name, path)
    }
}

/// Infer a format from a path: `file.blah.fastq.gz` -> `fastq.gz`,
/// `file.blah.fastq` -> `fastq`.
pub fn infer_fmt(path: &Path) -> DomainResult<String> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let parts: Vec<&str> = file_name.split('.').collect();
    match parts.as_slice() {
        [] | [_] => Err(DomainError::ValidationFailed(format!(
            "cannot infer format, path has no extension ( {} )",
            path.display()
        ))),
        [.., prev, "gz"] if parts.len() >= 3 => Ok(format!("{prev}.gz")),
        [.., last] => Ok((*last).to_string()),
    }
}
