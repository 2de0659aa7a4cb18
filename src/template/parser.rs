// Template parser: extends target, named blocks and macro call sites

use std::collections::HashMap;

use super::ast::{BlockBody, ParsedTemplate};
use super::expr::parse_quoted;
use super::lexer::{Lexer, Token, TokenKind};

pub struct TemplateParser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
}

impl<'a> TemplateParser<'a> {
    /// Parse `source`. Never fails: malformed markers are left as text.
    pub fn parse(source: &'a str) -> ParsedTemplate {
        let parser = Self {
            source,
            tokens: Lexer::tokenize(source, 1),
        };
        ParsedTemplate::new(
            source.to_string(),
            parser.collect_blocks(),
            parser.find_extends(),
            parser.collect_macros(),
        )
    }

    fn find_extends(&self) -> Option<String> {
        self.tokens.iter().find_map(|token| match &token.kind {
            TokenKind::Directive { body } => match split_directive(body) {
                ("extends", rest) => parse_quoted(rest),
                _ => None,
            },
            _ => None,
        })
    }

    fn collect_blocks(&self) -> HashMap<String, BlockBody> {
        let mut blocks = HashMap::new();

        for (i, token) in self.tokens.iter().enumerate() {
            let Some(name) = block_open_name(token) else {
                continue;
            };
            if blocks.contains_key(name) {
                tracing::warn!(block = name, "duplicate block name, keeping the first definition");
                continue;
            }
            let Some(close) = self.matching_end(i) else {
                continue;
            };

            let body_start = token.span.end;
            let body_end = self.tokens[close].span.start;
            let line = token.line + self.source[token.span.clone()].matches('\n').count();
            blocks.insert(
                name.to_string(),
                BlockBody {
                    content: self.source[body_start..body_end].to_string(),
                    line,
                },
            );
        }

        blocks
    }

    /// Index of the `endblock` closing the block opened at `open`.
    fn matching_end(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (i, token) in self.tokens.iter().enumerate().skip(open + 1) {
            if block_open_name(token).is_some() {
                depth += 1;
            } else if is_block_close(token) {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
        }
        None
    }

    fn collect_macros(&self) -> HashMap<String, Vec<Vec<String>>> {
        let mut macros: HashMap<String, Vec<Vec<String>>> = HashMap::new();
        for token in &self.tokens {
            if let TokenKind::Macro { name, args } = &token.kind {
                macros.entry(name.clone()).or_default().push(args.clone());
            }
        }
        macros
    }
}

/// Split a directive body into its keyword and the trimmed remainder.
pub(crate) fn split_directive(body: &str) -> (&str, &str) {
    let body = body.trim();
    match body.find(char::is_whitespace) {
        Some(i) => (&body[..i], body[i..].trim()),
        None => (body, ""),
    }
}

pub(crate) fn block_open_name(token: &Token) -> Option<&str> {
    match &token.kind {
        TokenKind::Directive { body } => match split_directive(body) {
            ("block", name) if is_identifier(name) => Some(name),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn is_block_close(token: &Token) -> bool {
    match &token.kind {
        TokenKind::Directive { body } => split_directive(body).0 == "endblock",
        _ => false,
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}
