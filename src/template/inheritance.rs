// Template inheritance: walk `extends` chains and merge blocks into the root layout

use super::ast::{ParsedTemplate, ResolvedTemplate, SourceSegment, TemplateSource};
use super::lexer::Lexer;
use super::parser::{block_open_name, is_block_close, TemplateParser};
use crate::error::{Result, TemplateError};

/// Blocks nested deeper than this are kept as plain text.
const MAX_BLOCK_DEPTH: usize = 64;

/// Source of template text by name.
pub trait TemplateLoader {
    /// Load a template. A missing template is `TemplateError::TemplateNotFound`.
    fn load(&self, name: &str) -> Result<TemplateSource>;
}

/// Merged body as a tree of text runs and (overridable) blocks.
#[derive(Debug, Clone)]
enum Piece {
    Text(SourceSegment),
    Block {
        name: String,
        open: SourceSegment,
        children: Vec<Piece>,
        close: SourceSegment,
    },
}

pub struct InheritanceResolver<'a> {
    loader: &'a dyn TemplateLoader,
}

impl<'a> InheritanceResolver<'a> {
    pub fn new(loader: &'a dyn TemplateLoader) -> Self {
        Self { loader }
    }

    pub fn resolve(&self, leaf: &str) -> Result<ResolvedTemplate> {
        let source = self.loader.load(leaf)?;
        self.resolve_source(source)
    }

    /// Resolve a template whose leaf text is already in hand.
    pub fn resolve_source(&self, leaf: TemplateSource) -> Result<ResolvedTemplate> {
        let leaf_name = leaf.name.clone();
        let mut visited = vec![leaf.name.clone()];
        let mut parsed = vec![TemplateParser::parse(&leaf.source)];
        let mut chain = vec![leaf];

        loop {
            let current = chain.last().map(|t| t.name.clone()).unwrap_or_default();
            let Some(parent) = parsed.last().and_then(|p| p.extends()).map(str::to_string) else {
                break;
            };

            if visited.contains(&parent) {
                visited.push(parent);
                return Err(TemplateError::CircularInheritance { chain: visited });
            }

            tracing::debug!(child = %current, parent = %parent, "following extends");
            let source = self.loader.load(&parent).map_err(|err| match err {
                TemplateError::TemplateNotFound { .. } => TemplateError::ParentTemplateNotFound {
                    parent: parent.clone(),
                    child: current.clone(),
                },
                other => other,
            })?;

            // the same file may be reached under another spelling
            let revisited = source.path.is_some()
                && chain.iter().any(|seen| seen.path == source.path);
            visited.push(parent);
            if revisited {
                return Err(TemplateError::CircularInheritance { chain: visited });
            }
            parsed.push(TemplateParser::parse(&source.source));
            chain.push(source);
        }

        // root first, leaf last
        chain.reverse();
        parsed.reverse();

        let root = &chain[0];
        let mut pieces = build_pieces(&root.source, &root.file, 1);
        for (template, descendant) in parsed.iter().zip(chain.iter()).skip(1) {
            apply_overrides(&mut pieces, template, &descendant.file);
        }

        let mut segments = Vec::new();
        flatten(pieces, &mut segments);
        let merged: String = segments.iter().map(|s| s.text.as_str()).collect();

        Ok(ResolvedTemplate {
            name: leaf_name,
            template: TemplateParser::parse(&merged),
            chain,
            segments,
        })
    }
}

/// Split text into a block tree. Unbalanced block markers stay as text.
fn build_pieces(text: &str, template: &str, first_line: usize) -> Vec<Piece> {
    struct Frame {
        name: String,
        open: SourceSegment,
        children: Vec<Piece>,
    }

    let segment = |start: usize, end: usize, line: usize| SourceSegment {
        template: template.to_string(),
        line,
        text: text[start..end].to_string(),
    };

    let mut root: Vec<Piece> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    // block markers past MAX_BLOCK_DEPTH, still open
    let mut too_deep = 0usize;

    for token in Lexer::tokenize(text, first_line) {
        let seg = segment(token.span.start, token.span.end, token.line);

        if let Some(name) = block_open_name(&token) {
            if stack.len() >= MAX_BLOCK_DEPTH {
                if too_deep == 0 {
                    tracing::warn!(template, block = name, limit = MAX_BLOCK_DEPTH, "blocks nested too deeply");
                }
                too_deep += 1;
                push_piece(&mut stack, &mut root, Piece::Text(seg));
                continue;
            }
            stack.push(Frame {
                name: name.to_string(),
                open: seg,
                children: Vec::new(),
            });
            continue;
        }

        if is_block_close(&token) && too_deep > 0 {
            too_deep -= 1;
            push_piece(&mut stack, &mut root, Piece::Text(seg));
            continue;
        }

        if is_block_close(&token) {
            if let Some(frame) = stack.pop() {
                let block = Piece::Block {
                    name: frame.name,
                    open: frame.open,
                    children: frame.children,
                    close: seg,
                };
                push_piece(&mut stack, &mut root, block);
                continue;
            }
        }

        push_piece(&mut stack, &mut root, Piece::Text(seg));
    }

    // blocks left open degrade to their raw text
    while let Some(frame) = stack.pop() {
        let mut unwound = vec![Piece::Text(frame.open)];
        unwound.extend(frame.children);
        for piece in unwound {
            match stack.last_mut() {
                Some(parent) => parent.children.push(piece),
                None => root.push(piece),
            }
        }
    }

    fn push_piece(stack: &mut [Frame], root: &mut Vec<Piece>, piece: Piece) {
        match stack.last_mut() {
            Some(frame) => frame.children.push(piece),
            None => root.push(piece),
        }
    }

    root
}

/// Replace every block that `child` defines. Replaced content is not revisited.
fn apply_overrides(pieces: &mut [Piece], child: &ParsedTemplate, child_name: &str) {
    for piece in pieces.iter_mut() {
        if let Piece::Block { name, children, .. } = piece {
            match child.block_body(name) {
                Some(body) => {
                    tracing::trace!(block = %name, template = child_name, "block overridden");
                    *children = build_pieces(&body.content, child_name, body.line);
                }
                None => apply_overrides(children, child, child_name),
            }
        }
    }
}

fn flatten(pieces: Vec<Piece>, out: &mut Vec<SourceSegment>) {
    for piece in pieces {
        match piece {
            Piece::Text(seg) => out.push(seg),
            Piece::Block {
                open,
                children,
                close,
                ..
            } => {
                out.push(open);
                flatten(children, out);
                out.push(close);
            }
        }
    }
}
