// Expression classification
//
// Templates never get a full expression grammar. Pieces of directive text are
// classified as literals or dotted context paths, and condition text is
// rewritten token by token so identifiers become lookups while operators and
// keywords stay as they are.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::lexer::split_arguments;
use crate::value::Value;

/// Deepest nesting of parentheses, unary operators or array literals that
/// expressions may use.
pub const MAX_NESTING: usize = 32;

/// One step of a dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A normalized context path such as `user.profile.name` or `items.0.name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarPath {
    pub segments: Vec<PathSegment>,
}

impl VarPath {
    /// Leading `$` is stripped; purely numeric segments become indexes.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let raw = raw.strip_prefix('$').unwrap_or(raw);
        let segments = raw
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|s| {
                let s = s.strip_prefix('$').unwrap_or(s);
                match s.parse::<usize>() {
                    Ok(i) if s.chars().all(|c| c.is_ascii_digit()) => PathSegment::Index(i),
                    _ => PathSegment::Key(s.to_string()),
                }
            })
            .collect();
        Self { segments }
    }

    pub fn root(&self) -> Option<&str> {
        match self.segments.first() {
            Some(PathSegment::Key(k)) => Some(k),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for VarPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                PathSegment::Key(k) => f.write_str(k)?,
                PathSegment::Index(n) => write!(f, "{}", n)?,
            }
        }
        Ok(())
    }
}

/// A value written directly in template text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Operand>),
}

/// Either a literal or a context lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Literal(Literal),
    Path(VarPath),
}

impl Literal {
    /// Value of the literal; context paths nested in arrays become null.
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => Value::String(s.clone()),
            Literal::Array(items) => Value::from(
                items
                    .iter()
                    .map(|item| match item {
                        Operand::Literal(lit) => lit.to_value(),
                        Operand::Path(_) => Value::Null,
                    })
                    .collect::<Vec<_>>(),
            ),
        }
    }
}

/// Classify one piece of directive text.
///
/// Quoted strings, numbers, `true`/`false`/`null` (any case) and `[...]`
/// arrays are literals; everything else is a dotted context reference.
/// Arrays nested deeper than [`MAX_NESTING`] are null.
pub fn classify(raw: &str) -> Operand {
    classify_nested(raw, 0)
}

fn classify_nested(raw: &str, depth: usize) -> Operand {
    let raw = raw.trim();
    if let Some(s) = parse_quoted(raw) {
        return Operand::Literal(Literal::Str(s));
    }
    if let Some(lit) = parse_keyword_literal(raw) {
        return Operand::Literal(lit);
    }
    if let Some(lit) = parse_number(raw) {
        return Operand::Literal(lit);
    }
    if raw.starts_with('[') && raw.ends_with(']') && raw.len() >= 2 {
        if depth >= MAX_NESTING {
            return Operand::Literal(Literal::Null);
        }
        let items = split_arguments(&raw[1..raw.len() - 1], ',')
            .iter()
            .map(|item| classify_nested(item, depth + 1))
            .collect();
        return Operand::Literal(Literal::Array(items));
    }
    Operand::Path(VarPath::parse(raw))
}

/// Unquote a single- or double-quoted string, handling backslash escapes.
pub fn parse_quoted(raw: &str) -> Option<String> {
    let mut chars = raw.chars();
    let quote = chars.next()?;
    if (quote != '"' && quote != '\'') || raw.len() < 2 || !raw.ends_with(quote) {
        return None;
    }

    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            match ch {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                c => out.push(c),
            }
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == quote {
            // an unescaped quote in the middle means this is not one string
            return None;
        } else {
            out.push(ch);
        }
    }
    Some(out)
}

fn parse_keyword_literal(raw: &str) -> Option<Literal> {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Some(Literal::Bool(true)),
        "false" => Some(Literal::Bool(false)),
        "null" => Some(Literal::Null),
        _ => None,
    }
}

fn parse_number(raw: &str) -> Option<Literal> {
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || !digits.chars().next()?.is_ascii_digit() {
        return None;
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Literal::Int(i));
    }
    raw.parse::<f64>().ok().map(Literal::Float)
}

/// A condition token after rewriting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CondToken {
    Literal(Literal),
    Lookup(VarPath),
    /// Operators and keywords, kept verbatim (keywords lowercased).
    Op(String),
    Open,
    Close,
}

/// Rewritten form of an `if`/`elseif` condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub source: String,
    pub tokens: Vec<CondToken>,
}

const KEYWORDS: &[&str] = &["and", "or", "not"];

const OPERATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<>", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%",
];

impl Condition {
    pub fn parse(source: &str) -> Self {
        Self {
            source: source.trim().to_string(),
            tokens: tokenize_condition(source),
        }
    }
}

fn tokenize_condition(source: &str) -> Vec<CondToken> {
    let mut tokens = Vec::new();
    let bytes = source.as_bytes();
    let mut pos = 0;

    while pos < source.len() {
        let rest = &source[pos..];
        let ch = match rest.chars().next() {
            Some(c) => c,
            None => break,
        };

        if ch.is_whitespace() {
            pos += ch.len_utf8();
            continue;
        }

        if ch == '(' {
            tokens.push(CondToken::Open);
            pos += 1;
            continue;
        }
        if ch == ')' {
            tokens.push(CondToken::Close);
            pos += 1;
            continue;
        }

        if ch == '"' || ch == '\'' {
            let end = quoted_end(rest, ch).unwrap_or(rest.len());
            let text = &rest[..end];
            let value = parse_quoted(text).unwrap_or_else(|| text.trim_matches(ch).to_string());
            tokens.push(CondToken::Literal(Literal::Str(value)));
            pos += end;
            continue;
        }

        // a minus directly before a digit is a negative number only where an
        // operand is expected
        let expects_operand = matches!(tokens.last(), None | Some(CondToken::Op(_)) | Some(CondToken::Open));
        let starts_number = ch.is_ascii_digit()
            || (ch == '-' && expects_operand && bytes.get(pos + 1).is_some_and(|b| b.is_ascii_digit()));
        if starts_number {
            let len = 1 + rest[1..]
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(rest.len() - 1);
            let text = &rest[..len];
            match parse_number(text) {
                Some(lit) => tokens.push(CondToken::Literal(lit)),
                None => tokens.push(CondToken::Lookup(VarPath::parse(text))),
            }
            pos += len;
            continue;
        }

        if let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            tokens.push(CondToken::Op(op.to_string()));
            pos += op.len();
            continue;
        }

        let len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.' || c == '$'))
            .unwrap_or(rest.len());
        if len == 0 {
            // unknown punctuation, keep it verbatim
            tokens.push(CondToken::Op(ch.to_string()));
            pos += ch.len_utf8();
            continue;
        }

        let word = &rest[..len];
        let lower = word.to_ascii_lowercase();
        if KEYWORDS.contains(&lower.as_str()) {
            tokens.push(CondToken::Op(lower));
        } else if let Some(lit) = parse_keyword_literal(word) {
            tokens.push(CondToken::Literal(lit));
        } else {
            tokens.push(CondToken::Lookup(VarPath::parse(word)));
        }
        pos += len;
    }

    tokens
}

/// Byte length of the quoted string at the start of `text`, quotes included.
fn quoted_end(text: &str, quote: char) -> Option<usize> {
    let mut escaped = false;
    for (i, ch) in text.char_indices().skip(1) {
        if escaped {
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == quote {
            return Some(i + ch.len_utf8());
        }
    }
    None
}

/// A filter stage of an output marker: `name` or `name(arg, ...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<Operand>,
}

/// Split an output expression `value | f1 | f2(a, b)` into value and filters.
pub fn parse_output_expr(expr: &str) -> (Operand, Vec<FilterCall>) {
    let mut stages = split_arguments(expr, '|').into_iter();
    let value = classify(&stages.next().unwrap_or_default());
    let filters = stages
        .filter(|stage| !stage.is_empty())
        .map(|stage| match stage.find('(') {
            Some(open) if stage.ends_with(')') => FilterCall {
                name: stage[..open].trim().to_string(),
                args: split_arguments(&stage[open + 1..stage.len() - 1], ',')
                    .iter()
                    .map(|a| classify(a))
                    .collect(),
            },
            _ => FilterCall {
                name: stage.trim().to_string(),
                args: Vec::new(),
            },
        })
        .collect();
    (value, filters)
}
