// Template tokenizer
//
// Splits raw source into literal text and the four marker families:
//   [[ expr ]]  / [[! expr ]]   output (escaped / raw)
//   [% directive %]             directives
//   [# comment #]               comments
//   ##name(args)##              macro calls
// Markers that are not terminated, or macro markers that are malformed, stay
// in the literal text.

use std::collections::HashMap;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Text,
    Output { expr: String, raw: bool },
    Directive { body: String },
    Comment,
    Macro { name: String, args: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte range of the whole token in the lexed text.
    pub span: Range<usize>,
    /// 1-based line on which the token starts.
    pub line: usize,
}

pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    line: usize,
    tokens: Vec<Token>,
    text_start: usize,
    text_line: usize,
    /// Offset from which a closing delimiter no longer occurs.
    exhausted: HashMap<&'static str, usize>,
}

impl<'a> Lexer<'a> {
    /// Tokenize `input`, numbering lines from `first_line`.
    pub fn tokenize(input: &'a str, first_line: usize) -> Vec<Token> {
        let mut lexer = Self {
            input,
            pos: 0,
            line: first_line,
            tokens: Vec::new(),
            text_start: 0,
            text_line: first_line,
            exhausted: HashMap::new(),
        };
        lexer.run();
        lexer.tokens
    }

    fn run(&mut self) {
        let input = self.input;
        while self.pos < input.len() {
            let rest = &input[self.pos..];
            let marker = if rest.starts_with("[[") {
                self.lex_output()
            } else if rest.starts_with("[%") {
                self.lex_delimited("[%", "%]").map(|(body, len)| {
                    (TokenKind::Directive { body: body.trim().to_string() }, len)
                })
            } else if rest.starts_with("[#") {
                let from = self.pos + 2;
                self.find_close(from, "#]", false)
                    .map(|end| (TokenKind::Comment, end + 2 - self.pos))
            } else if rest.starts_with("##") {
                self.lex_macro()
            } else {
                None
            };

            match marker {
                Some((kind, len)) => self.emit_marker(kind, len),
                None => self.advance_char(),
            }
        }
        self.flush_text();
    }

    fn lex_output(&mut self) -> Option<(TokenKind, usize)> {
        let (body, len) = self.lex_delimited("[[", "]]")?;
        let (expr, raw) = match body.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (body, false),
        };
        let expr = expr.trim();
        if expr.is_empty() {
            return None;
        }
        Some((
            TokenKind::Output {
                expr: expr.to_string(),
                raw,
            },
            len,
        ))
    }

    /// Body between `open` and the next `close`, plus the total marker length.
    fn lex_delimited(&mut self, open: &str, close: &'static str) -> Option<(&'a str, usize)> {
        let start = self.pos + open.len();
        let end = self.find_close(start, close, true)?;
        Some((&self.input[start..end], end + close.len() - self.pos))
    }

    /// Offset of the next `close` at or after `from`. Once a delimiter is
    /// known to be absent from some offset on, later searches fail at once.
    fn find_close(&mut self, from: usize, close: &'static str, quoted: bool) -> Option<usize> {
        if self.exhausted.get(close).is_some_and(|&at| from >= at) {
            return None;
        }
        let rest = &self.input[from..];
        let found = if quoted {
            find_unquoted(rest, close)
        } else {
            rest.find(close)
        };
        if found.is_none() && !rest.contains(close) {
            self.exhausted.insert(close, from);
        }
        found.map(|offset| offset + from)
    }

    /// `##name(args)##` with a plain identifier name.
    fn lex_macro(&mut self) -> Option<(TokenKind, usize)> {
        let input = self.input;
        let start = self.pos + 2;
        let rest = &input[start..];
        let name_len = rest
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if name_len == 0 || !rest[name_len..].starts_with('(') {
            return None;
        }
        let name = &rest[..name_len];
        let args_start = start + name_len + 1;
        let close = self.find_close(args_start, ")##", true)?;
        let args = split_arguments(&input[args_start..close], ',');
        Some((
            TokenKind::Macro {
                name: name.to_string(),
                args,
            },
            close + 3 - self.pos,
        ))
    }

    fn emit_marker(&mut self, kind: TokenKind, len: usize) {
        self.flush_text();
        let span = self.pos..self.pos + len;
        let line = self.line;
        self.line += self.input[span.clone()].matches('\n').count();
        self.pos = span.end;
        self.tokens.push(Token { kind, span, line });
        self.text_start = self.pos;
        self.text_line = self.line;
    }

    fn advance_char(&mut self) {
        if let Some(ch) = self.input[self.pos..].chars().next() {
            if ch == '\n' {
                self.line += 1;
            }
            self.pos += ch.len_utf8();
        }
    }

    fn flush_text(&mut self) {
        if self.pos > self.text_start {
            self.tokens.push(Token {
                kind: TokenKind::Text,
                span: self.text_start..self.pos,
                line: self.text_line,
            });
        }
        self.text_start = self.pos;
        self.text_line = self.line;
    }
}

/// Byte offset of the first `needle` in `haystack` that is not inside quotes.
pub fn find_unquoted(haystack: &str, needle: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, ch) in haystack.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        if ch == '"' || ch == '\'' {
            quote = Some(ch);
        } else if haystack[i..].starts_with(needle) {
            return Some(i);
        }
    }
    None
}

/// Split on `separator` outside quotes and outside `()`, `[]`, `{}` nesting.
///
/// Each piece is trimmed; an all-whitespace input yields no pieces.
pub fn split_arguments(input: &str, separator: char) -> Vec<String> {
    if input.trim().is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth = 0usize;

    for ch in input.chars() {
        if let Some(q) = quote {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => {
                quote = Some(ch);
                current.push(ch);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(ch);
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            c if c == separator && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            c => current.push(c),
        }
    }
    parts.push(current.trim().to_string());
    parts
}
