// Structured template representations produced by parsing and inheritance

use std::collections::HashMap;
use std::path::PathBuf;

/// Body of a named block and the line its body starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockBody {
    pub content: String,
    pub line: usize,
}

/// A single template after parsing. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTemplate {
    source: String,
    blocks: HashMap<String, BlockBody>,
    extends: Option<String>,
    macros: HashMap<String, Vec<Vec<String>>>,
}

impl ParsedTemplate {
    pub(crate) fn new(
        source: String,
        blocks: HashMap<String, BlockBody>,
        extends: Option<String>,
        macros: HashMap<String, Vec<Vec<String>>>,
    ) -> Self {
        Self {
            source,
            blocks,
            extends,
            macros,
        }
    }

    /// The exact text that was parsed.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn extends(&self) -> Option<&str> {
        self.extends.as_deref()
    }

    pub fn block(&self, name: &str) -> Option<&str> {
        self.blocks.get(name).map(|b| b.content.as_str())
    }

    pub fn block_body(&self, name: &str) -> Option<&BlockBody> {
        self.blocks.get(name)
    }

    pub fn block_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.blocks.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub fn has_blocks(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Raw argument lists for each call of `name`, in call order.
    pub fn macro_calls(&self, name: &str) -> Option<&[Vec<String>]> {
        self.macros.get(name).map(Vec::as_slice)
    }

    pub fn macros(&self) -> &HashMap<String, Vec<Vec<String>>> {
        &self.macros
    }
}

/// A template's name, where it was read from and its text.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSource {
    /// Name the template was requested under.
    pub name: String,
    /// File name reported in errors. Defaults to `name`.
    pub file: String,
    /// `None` for templates that did not come from the filesystem.
    pub path: Option<PathBuf>,
    pub source: String,
}

impl TemplateSource {
    pub fn new(name: impl Into<String>, path: Option<PathBuf>, source: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            file: name.clone(),
            name,
            path,
            source: source.into(),
        }
    }

    pub fn inline(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(name, None, source)
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }
}

/// A run of merged text together with the file and line it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSegment {
    pub template: String,
    pub line: usize,
    pub text: String,
}

/// The result of inheritance resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTemplate {
    /// Name the template was requested under (the leaf).
    pub name: String,
    /// Flattened template; never has an `extends` target.
    pub template: ParsedTemplate,
    /// Every template in the chain, root first, leaf last.
    pub chain: Vec<TemplateSource>,
    /// Merged body in order; concatenated it equals `template.source()`.
    pub segments: Vec<SourceSegment>,
}

impl ResolvedTemplate {
    pub fn source(&self) -> &str {
        self.template.source()
    }

    pub fn chain_names(&self) -> Vec<&str> {
        self.chain.iter().map(|t| t.name.as_str()).collect()
    }
}
