//! Path sandbox for remote execution
//!
//! Every path argument is resolved against the session's working directory and
//! must land inside it after symlinks are resolved. Paths that do not exist yet
//! are checked through their nearest existing ancestor.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Allowed-root policy for handler paths
#[derive(Debug, Clone)]
pub struct PathPolicy {
    root: PathBuf,
}

impl PathPolicy {
    /// Create a policy rooted at `root`, which must exist
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| {
            Error::Config(format!("Invalid sandbox root {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    /// Canonical sandbox root
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidate(&self, path: &str) -> Result<PathBuf> {
        if path.trim().is_empty() {
            return Err(Error::Validation("Path must not be empty".to_string()));
        }
        let path = Path::new(path);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        })
    }

    fn ensure_inside(&self, canonical: &Path) -> Result<()> {
        if canonical.starts_with(&self.root) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "Access denied: {} is outside the working directory",
                canonical.display()
            )))
        }
    }

    /// Resolve a path that must already exist
    pub fn resolve_existing(&self, path: &str) -> Result<PathBuf> {
        let candidate = self.candidate(path)?;
        let canonical = candidate.canonicalize().map_err(|e| {
            Error::Validation(format!("Failed to resolve {}: {}", candidate.display(), e))
        })?;
        self.ensure_inside(&canonical)?;
        Ok(canonical)
    }

    /// Resolve a path that may not exist yet (write target)
    pub fn resolve_write(&self, path: &str) -> Result<PathBuf> {
        let candidate = self.candidate(path)?;
        // `symlink_metadata` sees dangling links too; those fail to
        // canonicalize and are rejected instead of being written through.
        if candidate.symlink_metadata().is_ok() {
            return self.resolve_existing(path);
        }
        let parent = candidate.parent().ok_or_else(|| {
            Error::Validation(format!("{} has no parent directory", candidate.display()))
        })?;
        let anchor = canonicalize_existing_ancestor(parent)?;
        self.ensure_inside(&anchor)?;

        // `..` components below the anchor could still climb out.
        let file_name = candidate
            .file_name()
            .ok_or_else(|| Error::Validation(format!("{} has no file name", candidate.display())))?;
        let rest = parent.strip_prefix(existing_ancestor(parent)).unwrap_or(Path::new(""));
        if rest
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::Validation(format!(
                "Access denied: {} is outside the working directory",
                candidate.display()
            )));
        }
        Ok(anchor.join(rest).join(file_name))
    }

    /// Resolve an existing directory, defaulting to the root
    pub fn resolve_dir(&self, path: Option<&str>) -> Result<PathBuf> {
        let dir = match path {
            None => return Ok(self.root.clone()),
            Some(p) if p.trim().is_empty() => return Ok(self.root.clone()),
            Some(p) => self.resolve_existing(p)?,
        };
        if !dir.is_dir() {
            return Err(Error::Validation(format!("{} is not a directory", dir.display())));
        }
        Ok(dir)
    }

    /// Resolve a shell working directory.
    ///
    /// The sentinel value skips validation and is only honoured here.
    pub fn resolve_shell_cwd(&self, path: Option<&str>, sentinel: &str) -> Result<PathBuf> {
        match path {
            Some(p) if !sentinel.is_empty() && p == sentinel => Ok(PathBuf::from(p)),
            other => self.resolve_dir(other),
        }
    }
}

fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|a| a.symlink_metadata().is_ok())
        .unwrap_or_else(|| Path::new("/"))
}

fn canonicalize_existing_ancestor(path: &Path) -> Result<PathBuf> {
    let ancestor = existing_ancestor(path);
    ancestor.canonicalize().map_err(|e| {
        Error::Validation(format!("Failed to resolve {}: {}", ancestor.display(), e))
    })
}
