//! Destination path validation
//!
//! Every directory creation, file creation and removal issued against the
//! model store goes through [`PathGuard::validate`] first.

use std::path::{Component, Path, PathBuf};

use common::error::{Error, Result};

/// Lexically normalises a path: drops `.` segments, keeps everything else
fn clean(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Validates `path` against `root`
///
/// Relative paths are taken relative to `root`. The path is rejected if it
/// contains a `..` segment or does not resolve strictly below `root`. Returns
/// the cleaned absolute path.
pub fn validate(path: &Path, root: &Path) -> Result<PathBuf> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::InvalidPath(format!(
            "{} contains a parent-directory segment",
            path.display()
        )));
    }

    let root = clean(root);
    let resolved = if path.is_absolute() {
        clean(path)
    } else {
        root.join(clean(path))
    };

    if resolved == root || !resolved.starts_with(&root) {
        return Err(Error::InvalidPath(format!(
            "{} does not resolve under {}",
            path.display(),
            root.display()
        )));
    }

    Ok(resolved)
}

/// Confines filesystem writes to one root directory
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Creates a guard for `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: clean(&root.into()) }
    }

    /// The confining root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// See [`validate`]
    pub fn validate(&self, path: &Path) -> Result<PathBuf> {
        validate(path, &self.root)
    }
}
