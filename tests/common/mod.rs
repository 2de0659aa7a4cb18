// Common test utilities shared across test files

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use templar::{Engine, EngineConfig};

/// A temporary template directory plus a separate cache directory.
pub struct Fixture {
    pub templates: TempDir,
    pub cache: TempDir,
}

#[allow(dead_code)]
impl Fixture {
    pub fn new() -> Self {
        Self {
            templates: TempDir::new().expect("Failed to create template dir"),
            cache: TempDir::new().expect("Failed to create cache dir"),
        }
    }

    /// Create a fixture populated with `(name, source)` pairs.
    pub fn with_templates(files: &[(&str, &str)]) -> Self {
        let fixture = Self::new();
        for (name, source) in files {
            fixture.write(name, source);
        }
        fixture
    }

    /// Write (or overwrite) a template, creating directories as needed.
    pub fn write(&self, name: &str, source: &str) -> PathBuf {
        let path = self.templates.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create template subdir");
        }
        fs::write(&path, source).expect("Failed to write template");
        path
    }

    pub fn template_dir(&self) -> &Path {
        self.templates.path()
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache.path()
    }

    /// Config with the on-disk cache and the `tpl` default extension.
    pub fn config(&self) -> EngineConfig {
        EngineConfig::new(self.template_dir())
            .with_cache_dir(self.cache_dir())
            .with_extension("tpl")
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.config()).expect("Failed to create engine")
    }

    pub fn strict_engine(&self) -> Engine {
        Engine::new(self.config().with_strict(true)).expect("Failed to create engine")
    }
}

/// Install a test subscriber so `RUST_LOG`-style output shows up with `--nocapture`.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
