//! Template compiler and renderer.
//!
//! Templates are parsed, merged along their `extends` chain, compiled to an
//! [`ExecutableUnit`] and cached under a digest of the whole chain. Rendering
//! runs the unit against a [`Context`], in lenient or strict mode.
//!
//! ```no_run
//! use templar::{Context, Engine, EngineConfig};
//!
//! let mut engine = Engine::new(EngineConfig::new("templates").with_extension("tpl"))?;
//! engine.macros_mut().register("year", |_| Ok(2024.into()));
//! let html = engine.render("home", &Context::new().with("name", "Ada"))?;
//! # Ok::<(), templar::TemplateError>(())
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod escape;
pub mod filters;
pub mod macros;
pub mod security;
pub mod template;
pub mod value;

pub use cache::{ArtifactStore, CacheEntry, CompiledArtifactCache, FileStore, MemoryStore};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Result, TemplateError};
pub use escape::{Escaper, HtmlEscaper};
pub use filters::{Filter, FilterPipeline};
pub use macros::{Macro, MacroHandler, MacroRegistry};
pub use security::PathValidator;
pub use template::{ExecutableUnit, ParsedTemplate, ResolvedTemplate, SourceMap, TemplateParser};
pub use value::{Context, TemplateObject, Value};
