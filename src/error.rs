// Error handling for templar

use std::io;
use std::path::PathBuf;

/// Boxed failure from a user-supplied macro or filter.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every failure the engine can report.
///
/// Variants carry structured fields so host code can branch on the kind of
/// failure instead of matching on message text.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template not found: {name}")]
    TemplateNotFound { name: String },

    /// A template's `extends` pointed at something that does not exist.
    #[error("Parent template \"{parent}\" referenced by \"{child}\" not found")]
    ParentTemplateNotFound { parent: String, child: String },

    /// `chain` is in visitation order and ends with the repeated name.
    #[error("Circular template inheritance detected: {}", chain.join(" -> "))]
    CircularInheritance { chain: Vec<String> },

    #[error("Macro \"{name}\" not found")]
    MacroNotFound { name: String },

    #[error("Macro \"{name}\" failed: {source}")]
    Macro {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("Filter \"{name}\" not found")]
    FilterNotFound { name: String },

    #[error("Filter \"{name}\" failed: {source}")]
    Filter {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("Error in template \"{template}\" at line {line}: Undefined variable \"{path}\" in strict mode.")]
    UndefinedVariable {
        path: String,
        template: String,
        line: usize,
    },

    #[error("Include depth of {limit} exceeded while including \"{name}\"")]
    IncludeDepthExceeded { name: String, limit: usize },

    #[error("Path traversal detected: {path}")]
    PathTraversal { path: String },

    /// Template root or cache root missing, unreadable or unwritable.
    #[error("Setup error for {}: {reason}", path.display())]
    Setup { path: PathBuf, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TemplateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TemplateError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn setup(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TemplateError::Setup {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_yaml::Error> for TemplateError {
    fn from(err: serde_yaml::Error) -> Self {
        TemplateError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TemplateError>;
