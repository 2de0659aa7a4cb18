// Template path confinement
//
// Every template name passes through PathValidator before the filesystem is
// touched, so a name can never resolve outside the template root.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TemplateError};

/// Resolves requested template names to canonical paths under a base directory.
#[derive(Debug, Clone)]
pub struct PathValidator {
    base: PathBuf,
}

impl PathValidator {
    /// Fails with a setup error if `base` is missing or not a directory.
    pub fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        let canonical = fs::canonicalize(base)
            .map_err(|e| TemplateError::setup(base, format!("cannot access directory: {}", e)))?;
        if !canonical.is_dir() {
            return Err(TemplateError::setup(base, "not a directory"));
        }
        Ok(Self { base: canonical })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Canonical absolute path for `requested`, confined to the base directory.
    ///
    /// The target does not need to exist, but its containing directory does.
    pub fn validate(&self, requested: &str) -> Result<PathBuf> {
        let normalized = normalize(requested);
        let joined = self.base.join(&normalized);
        let traversal = || TemplateError::PathTraversal {
            path: requested.replace('\0', ""),
        };

        if joined.exists() {
            let canonical = fs::canonicalize(&joined).map_err(|_| traversal())?;
            if !canonical.starts_with(&self.base) {
                return Err(traversal());
            }
            return Ok(canonical);
        }

        let parent = joined.parent().ok_or_else(traversal)?;
        let file_name = joined.file_name().ok_or_else(traversal)?;
        let canonical_parent = fs::canonicalize(parent).map_err(|_| traversal())?;
        if !canonical_parent.starts_with(&self.base) {
            return Err(traversal());
        }
        Ok(canonical_parent.join(file_name))
    }
}

/// Separators unified, null bytes and leading slashes removed.
pub(crate) fn normalize(requested: &str) -> String {
    let cleaned: String = requested
        .chars()
        .filter(|&c| c != '\0')
        .map(|c| if c == '\\' { '/' } else { c })
        .collect();
    cleaned.trim_start_matches('/').to_string()
}
