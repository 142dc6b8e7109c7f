//! Command template rendering.
//!
//! Task commands are written against named files, not concrete paths:
//! the template embeds `#F[<id>:<name>:<path>]` references that are
//! substituted with each file's current path just before submission.
//! Pre-persist references carry a synthetic `t_<n>` id and are rewritten
//! to their persisted ids when the files are bulk-saved. The grammar is
//! parsed once per task and the parse is cached by the controller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::TaskFile;
use crate::infrastructure::fs;

/// A task-file reference id as it appears in a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileRefId {
    /// A persisted TaskFile row id.
    Persisted(i64),
    /// A pre-persist synthetic id (`t_<n>`).
    Synthetic(u64),
}

/// One parsed `#F[...]` occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRef {
    pub id: FileRefId,
    pub name: String,
    pub path: String,
}

impl FileRef {
    fn serialize(&self) -> String {
        match self.id {
            FileRefId::Persisted(id) => format!("#F[{}:{}:{}]", id, self.name, self.path),
            FileRefId::Synthetic(n) => format!("#F[t_{}:{}:{}]", n, self.name, self.path),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Ref(FileRef),
}

/// A command template, parsed once from `pcmd`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    segments: Vec<Segment>,
}

impl CommandTemplate {
    /// Parse every `#F[<id>:<name>:<path>]` occurrence. Anything that
    /// opens a reference and fails to close or split into three fields
    /// is a hard error — templates are machine-emitted, malformation
    /// means a broken tool wrapper.
    pub fn parse(pcmd: &str) -> DomainResult<Self> {
        let mut segments = Vec::new();
        let mut rest = pcmd;

        while let Some(start) = rest.find("#F[") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after_open = &rest[start + 3..];
            let end = after_open.find(']').ok_or_else(|| {
                DomainError::MalformedFileRef(truncate(&rest[start..], 60))
            })?;
            let inner = &after_open[..end];

            let mut fields = inner.splitn(3, ':');
            let (id_field, name, path) = match (fields.next(), fields.next(), fields.next()) {
                (Some(id), Some(name), Some(path)) => (id, name, path),
                _ => return Err(DomainError::MalformedFileRef(format!("#F[{inner}]"))),
            };

            let id = if let Some(tmp) = id_field.strip_prefix("t_") {
                FileRefId::Synthetic(tmp.parse::<u64>().map_err(|_| {
                    DomainError::MalformedFileRef(format!("#F[{inner}]"))
                })?)
            } else {
                FileRefId::Persisted(id_field.parse::<i64>().map_err(|_| {
                    DomainError::MalformedFileRef(format!("#F[{inner}]"))
                })?)
            };

            segments.push(Segment::Ref(FileRef {
                id,
                name: name.to_string(),
                path: path.to_string(),
            }));
            rest = &after_open[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// The references this template carries.
    pub fn refs(&self) -> impl Iterator<Item = &FileRef> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Ref(r) => Some(r),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute every reference with the referenced file's current
    /// path. A synthetic id, an unknown id, or a file still lacking a
    /// path is fatal: the DAG promised a file it cannot deliver.
    pub fn render(&self, files: &HashMap<i64, TaskFile>) -> DomainResult<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Ref(file_ref) => {
                    let id = match file_ref.id {
                        FileRefId::Persisted(id) => id,
                        FileRefId::Synthetic(_) => {
                            return Err(DomainError::UnresolvedFileRef(file_ref.serialize()))
                        }
                    };
                    let file = files
                        .get(&id)
                        .ok_or_else(|| DomainError::UnresolvedFileRef(file_ref.serialize()))?;
                    let path = file
                        .path
                        .as_deref()
                        .ok_or_else(|| DomainError::UnresolvedFileRef(file_ref.serialize()))?;
                    out.push_str(&path.to_string_lossy());
                }
            }
        }
        Ok(out)
    }

    /// Re-serialize with synthetic ids swapped for their persisted
    /// files. Returns the new template text and whether anything
    /// changed. Unmapped references are left as-is.
    pub fn rewrite_synthetic(&self, mapping: &HashMap<u64, TaskFile>) -> (String, bool) {
        let mut out = String::new();
        let mut changed = false;
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Ref(file_ref) => match file_ref.id {
                    FileRefId::Synthetic(n) if mapping.contains_key(&n) => {
                        out.push_str(&mapping[&n].reference());
                        changed = true;
                    }
                    _ => out.push_str(&file_ref.serialize()),
                },
            }
        }
        (out, changed)
    }
}

/// Give every output file of a task a concrete location under its job
/// output directory. The stem is the file's name, except that a file
/// named after its own format lands at `out.<fmt>` (so `out.bam`, not
/// `bam.bam`). `dir`-formatted outputs are directories and are created
/// eagerly. Returns the `(file_id, path)` updates to persist.
pub fn synthesize_output_paths(
    files: &mut [TaskFile],
    job_output_dir: &Path,
) -> DomainResult<Vec<(i64, PathBuf)>> {
    let mut updates = Vec::new();
    for file in files.iter_mut() {
        if file.path.is_none() {
            let stem = if file.name == file.fmt { "out" } else { file.name.as_str() };
            let path = job_output_dir.join(format!("{}.{}", stem, file.fmt));
            file.path = Some(path.clone());
            updates.push((file.id, path));
        }
        if file.fmt == "dir" {
            if let Some(path) = &file.path {
                fs::ensure_dir(path)?;
            }
        }
    }
    Ok(updates)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: i64, name: &str, path: Option<&str>) -> TaskFile {
        TaskFile {
            id,
            task_id: 1,
            path: path.map(PathBuf::from),
            name: name.to_string(),
            fmt: name.to_string(),
        }
    }

    #[test]
    fn parses_and_renders_references() {
        let template =
            CommandTemplate::parse("bwa mem #F[3:fastq:/in/r1.fastq] > #F[4:bam:]").unwrap();
        assert_eq!(template.refs().count(), 2);

        let mut files = HashMap::new();
        files.insert(3, file(3, "fastq", Some("/in/r1.fastq")));
        files.insert(4, file(4, "bam", Some("/out/7/out/out.bam")));

        let rendered = template.render(&files).unwrap();
        assert_eq!(rendered, "bwa mem /in/r1.fastq > /out/7/out/out.bam");
    }

    #[test]
    fn command_without_refs_renders_verbatim() {
        let template = CommandTemplate::parse("echo plain").unwrap();
        assert_eq!(template.render(&HashMap::new()).unwrap(), "echo plain");
    }

    #[test]
    fn unknown_reference_is_fatal() {
        let template = CommandTemplate::parse("cat #F[9:bam:]").unwrap();
        assert!(matches!(
            template.render(&HashMap::new()),
            Err(DomainError::UnresolvedFileRef(_))
        ));
    }

    #[test]
    fn unrewritten_synthetic_reference_is_fatal() {
        let template = CommandTemplate::parse("cat #F[t_2:bam:]").unwrap();
        assert!(matches!(
            template.render(&HashMap::new()),
            Err(DomainError::UnresolvedFileRef(_))
        ));
    }

    #[test]
    fn malformed_references_are_rejected() {
        assert!(matches!(
            CommandTemplate::parse("cat #F[3:bam"),
            Err(DomainError::MalformedFileRef(_))
        ));
        assert!(matches!(
            CommandTemplate::parse("cat #F[3]"),
            Err(DomainError::MalformedFileRef(_))
        ));
        assert!(matches!(
            CommandTemplate::parse("cat #F[x:bam:]"),
            Err(DomainError::MalformedFileRef(_))
        ));
    }

    #[test]
    fn synthetic_ids_are_rewritten_to_persisted_refs() {
        let template = CommandTemplate::parse("sort #F[t_1:bam:] > #F[t_2:sorted_bam:]").unwrap();

        let mut mapping = HashMap::new();
        mapping.insert(1u64, file(10, "bam", None));

        let (rewritten, changed) = template.rewrite_synthetic(&mapping);
        assert!(changed);
        // Mapped ref gains its persisted id; unmapped ref is untouched.
        assert_eq!(rewritten, "sort #F[10:bam:] > #F[t_2:sorted_bam:]");
    }

    #[test]
    fn output_path_synthesis_uses_out_stem_for_name_eq_fmt() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = vec![
            file(1, "bam", None),
            TaskFile {
                id: 2,
                task_id: 1,
                path: None,
                name: "metrics".to_string(),
                fmt: "txt".to_string(),
            },
            file(3, "bam", Some("/fixed/path.bam")),
        ];

        let updates = synthesize_output_paths(&mut files, dir.path()).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(files[0].path.as_deref(), Some(dir.path().join("out.bam")).as_deref());
        assert_eq!(
            files[1].path.as_deref(),
            Some(dir.path().join("metrics.txt")).as_deref()
        );
        // Pre-set paths are left alone.
        assert_eq!(files[2].path.as_deref(), Some(Path::new("/fixed/path.bam")));
    }

    #[test]
    fn dir_outputs_are_created_eagerly() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = vec![TaskFile {
            id: 1,
            task_id: 1,
            path: None,
            name: "scratch".to_string(),
            fmt: "dir".to_string(),
        }];
        synthesize_output_paths(&mut files, dir.path()).unwrap();
        assert!(dir.path().join("scratch.dir").is_dir());
    }
}
