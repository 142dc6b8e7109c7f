//! Filesystem primitives for workflow output trees.
//!
//! Output directories are deleted with `std::fs` recursive removal,
//! which does not follow symlinks: a link inside an output directory is
//! unlinked, never traversed, so a stray symlink to shared data cannot
//! turn GC into data loss.

use std::path::Path;

use crate::domain::errors::DomainResult;

/// Create a directory and any missing parents.
pub fn ensure_dir(path: &Path) -> DomainResult<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Remove a directory tree. Missing paths are fine.
pub fn remove_tree(path: &Path) -> DomainResult<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Empty a directory without removing the directory itself. Symlinked
/// entries are unlinked, not followed. Missing directories are fine.
pub fn remove_dir_contents(path: &Path) -> DomainResult<()> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let entry_path = entry.path();
        // symlink_metadata: a link to a directory must be unlinked as a
        // file, not descended into.
        if entry.path().symlink_metadata()?.is_dir() {
            std::fs::remove_dir_all(&entry_path)?;
        } else {
            std::fs::remove_file(&entry_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_dir_contents_keeps_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "y").unwrap();

        remove_dir_contents(dir.path()).unwrap();
        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn remove_dir_contents_unlinks_symlinks_without_following() {
        let keep = tempfile::tempdir().unwrap();
        std::fs::write(keep.path().join("precious.txt"), "do not delete").unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(keep.path(), dir.path().join("link")).unwrap();

        remove_dir_contents(dir.path()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        // The link target survives untouched.
        assert!(keep.path().join("precious.txt").exists());
    }

    #[test]
    fn missing_paths_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("never/existed");
        assert!(remove_dir_contents(&gone).is_ok());
        assert!(remove_tree(&gone).is_ok());
    }
}
