// Engine: owns configuration, registries and the artifact cache

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{CacheEntry, CompiledArtifactCache};
use crate::config::EngineConfig;
use crate::error::{Result, TemplateError};
use crate::escape::HtmlEscaper;
use crate::filters::FilterPipeline;
use crate::macros::MacroRegistry;
use crate::security::{normalize, PathValidator};
use crate::template::{
    DirectiveCompiler, IncludeResolver, InheritanceResolver, Renderer, TemplateLoader,
    TemplateSource,
};
use crate::value::Context;

/// Entry point for rendering templates from a directory.
///
/// Configure macros and filters through `macros_mut`/`filters_mut` before
/// sharing the engine; rendering only needs `&Engine`.
pub struct Engine {
    config: EngineConfig,
    validator: PathValidator,
    cache: CompiledArtifactCache,
    macros: MacroRegistry,
    filters: FilterPipeline,
    escaper: HtmlEscaper,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let validator = PathValidator::new(&config.template_dir)?;
        let escaper = HtmlEscaper::new(&config.charset)?;
        let cache = match &config.cache_dir {
            Some(dir) => CompiledArtifactCache::on_disk(dir)?,
            None => CompiledArtifactCache::in_memory(),
        }
        .with_namespace(validator.base().display().to_string());

        tracing::info!(
            template_dir = %validator.base().display(),
            cache_dir = ?config.cache_dir,
            strict = config.strict,
            "template engine ready"
        );

        Ok(Self {
            config,
            validator,
            cache,
            macros: MacroRegistry::new(),
            filters: FilterPipeline::new(),
            escaper,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn macros(&self) -> &MacroRegistry {
        &self.macros
    }

    pub fn macros_mut(&mut self) -> &mut MacroRegistry {
        &mut self.macros
    }

    pub fn filters(&self) -> &FilterPipeline {
        &self.filters
    }

    pub fn filters_mut(&mut self) -> &mut FilterPipeline {
        &mut self.filters
    }

    pub fn escaper(&self) -> &HtmlEscaper {
        &self.escaper
    }

    pub fn cache(&self) -> &CompiledArtifactCache {
        &self.cache
    }

    /// Render `name` using the configured strictness.
    pub fn render(&self, name: &str, context: &Context) -> Result<String> {
        self.render_with_mode(name, context, self.config.strict)
    }

    pub fn render_with_mode(&self, name: &str, context: &Context, strict: bool) -> Result<String> {
        self.render_at_depth(name, context, strict, 0)
    }

    /// Render template text that does not live in the template directory.
    /// It may still extend and include templates that do. Not cached.
    pub fn render_source(&self, name: &str, source: &str, context: &Context) -> Result<String> {
        let resolved =
            InheritanceResolver::new(self).resolve_source(TemplateSource::inline(name, source))?;
        let (unit, source_map) = DirectiveCompiler::compile(&resolved);
        self.renderer(self.config.strict, 0)
            .render(&unit, &source_map, name, context)
    }

    /// Compile `name` (or fetch it from the cache) without rendering.
    pub fn compile(&self, name: &str) -> Result<Arc<CacheEntry>> {
        let path = self.locate(name)?;
        self.cache.get_or_compile(
            name,
            Some(&path),
            || InheritanceResolver::new(self).resolve(name),
            |resolved| Ok(DirectiveCompiler::compile(resolved)),
        )
    }

    /// Canonical file for `name`, trying the default extension if needed.
    pub fn locate(&self, name: &str) -> Result<PathBuf> {
        let not_found = || TemplateError::TemplateNotFound {
            name: name.to_string(),
        };

        let path = self.validate(name)?;
        if path.is_file() {
            return Ok(path);
        }

        match &self.config.extension {
            Some(ext) if Path::new(name).extension().is_none() => {
                let path = self.validate(&format!("{}.{}", name, ext))?;
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(not_found())
                }
            }
            _ => Err(not_found()),
        }
    }

    /// A name in a directory that does not exist is not found rather than a
    /// traversal, unless it climbs with `..`.
    fn validate(&self, name: &str) -> Result<PathBuf> {
        self.validator.validate(name).map_err(|err| match err {
            TemplateError::PathTraversal { .. } if self.in_missing_directory(name) => {
                TemplateError::TemplateNotFound {
                    name: name.to_string(),
                }
            }
            other => other,
        })
    }

    fn in_missing_directory(&self, name: &str) -> bool {
        let normalized = normalize(name);
        let climbs = normalized.split('/').any(|part| part == "..");
        let joined = self.validator.base().join(&normalized);
        !climbs && joined.parent().is_some_and(|dir| !dir.exists())
    }

    fn render_at_depth(
        &self,
        name: &str,
        context: &Context,
        strict: bool,
        depth: usize,
    ) -> Result<String> {
        let entry = self.compile(name)?;
        self.renderer(strict, depth)
            .render(&entry.unit, &entry.source_map, name, context)
    }

    fn renderer(&self, strict: bool, depth: usize) -> Renderer<'_> {
        Renderer::new(&self.filters, &self.macros, &self.escaper)
            .strict(strict)
            .depth(depth)
            .with_includes(self)
    }
}

impl TemplateLoader for Engine {
    fn load(&self, name: &str) -> Result<TemplateSource> {
        let path = self.locate(name)?;
        let source = fs::read_to_string(&path).map_err(|e| TemplateError::io(&path, e))?;
        tracing::trace!(template = name, path = %path.display(), "template loaded");
        let file = path
            .strip_prefix(self.validator.base())
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| name.to_string());
        Ok(TemplateSource::new(name, Some(path), source).with_file(file))
    }
}

impl IncludeResolver for Engine {
    fn render_include(
        &self,
        name: &str,
        context: &Context,
        strict: bool,
        depth: usize,
    ) -> Result<String> {
        if depth > self.config.max_include_depth {
            return Err(TemplateError::IncludeDepthExceeded {
                name: name.to_string(),
                limit: self.config.max_include_depth,
            });
        }
        self.render_at_depth(name, context, strict, depth)
    }
}
