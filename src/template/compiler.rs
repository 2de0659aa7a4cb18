// Directive compiler: lowers a resolved template into an executable unit
//
// Control flow is lowered with precomputed jump targets so the renderer can run
// the unit with a single program counter:
//
//   If { next }        false -> jump to `next` (ElseIf / Else / EndIf)
//   ElseIf { next, end } reached by jump: test; reached by fallthrough: jump to `end`
//   Else { end }       reached by fallthrough: jump to `end`
//   ForEach { end }    empty collection -> jump past `end`
//   EndForEach { start } more items -> jump back to just after `start`

use serde::{Deserialize, Serialize};

use super::ast::ResolvedTemplate;
use super::expr::{classify, parse_output_expr, parse_quoted, Condition, FilterCall, Operand, VarPath};
use super::lexer::{find_unquoted, split_arguments, Lexer, TokenKind};
use super::parser::split_directive;

/// Target of an `include` directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IncludeTarget {
    /// Quoted template name.
    Name(String),
    /// Bare identifier, resolved against the context at render time.
    Path(VarPath),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    EmitLiteral(String),
    EmitExpression {
        value: Operand,
        escape: bool,
        filters: Vec<FilterCall>,
    },
    Assign {
        name: String,
        value: Operand,
    },
    If {
        condition: Condition,
        next: usize,
    },
    ElseIf {
        condition: Condition,
        next: usize,
        end: usize,
    },
    Else {
        end: usize,
    },
    EndIf,
    ForEach {
        collection: VarPath,
        key_var: Option<String>,
        var: String,
        end: usize,
    },
    EndForEach {
        start: usize,
    },
    Include {
        target: IncludeTarget,
        overlay: Vec<(String, Operand)>,
    },
    MacroCall {
        name: String,
        args: Vec<Operand>,
    },
}

/// An operation and the source line it was lowered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Op,
    pub line: usize,
}

/// Compiled, engine-internal form of a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutableUnit {
    pub instructions: Vec<Instruction>,
}

impl ExecutableUnit {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn ops(&self) -> impl Iterator<Item = &Op> {
        self.instructions.iter().map(|i| &i.op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub template: String,
    pub line: usize,
}

/// Operation index -> originating template and line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMap {
    locations: Vec<SourceLocation>,
}

impl SourceMap {
    pub fn get(&self, index: usize) -> Option<&SourceLocation> {
        self.locations.get(index)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Open control structure awaiting its end marker.
enum Frame {
    If {
        /// If/ElseIf whose `next` still needs patching.
        pending: Option<usize>,
        /// ElseIf/Else whose `end` needs patching.
        branches: Vec<usize>,
        seen_else: bool,
    },
    For {
        start: usize,
    },
}

#[derive(Default)]
pub struct DirectiveCompiler {
    instructions: Vec<Instruction>,
    locations: Vec<SourceLocation>,
    frames: Vec<Frame>,
}

impl DirectiveCompiler {
    pub fn compile(resolved: &ResolvedTemplate) -> (ExecutableUnit, SourceMap) {
        let mut compiler = Self::default();
        let mut last = SourceLocation {
            template: resolved
                .chain
                .last()
                .map_or_else(|| resolved.name.clone(), |leaf| leaf.file.clone()),
            line: 1,
        };

        for segment in &resolved.segments {
            for token in Lexer::tokenize(&segment.text, segment.line) {
                let location = SourceLocation {
                    template: segment.template.clone(),
                    line: token.line,
                };
                let raw = &segment.text[token.span.clone()];
                compiler.lower(token.kind, raw, &location);
                last = location;
            }
        }

        compiler.close_unterminated(&last);

        (
            ExecutableUnit {
                instructions: compiler.instructions,
            },
            SourceMap {
                locations: compiler.locations,
            },
        )
    }

    fn lower(&mut self, kind: TokenKind, raw: &str, at: &SourceLocation) {
        match kind {
            TokenKind::Text => self.literal(raw, at),
            TokenKind::Comment => {}
            TokenKind::Output { expr, raw: unescaped } => {
                let (value, filters) = parse_output_expr(&expr);
                self.push(
                    Op::EmitExpression {
                        value,
                        escape: !unescaped,
                        filters,
                    },
                    at,
                );
            }
            TokenKind::Macro { name, args } => {
                let args = args.iter().map(|a| classify(a)).collect();
                self.push(Op::MacroCall { name, args }, at);
            }
            TokenKind::Directive { body } => {
                if !self.directive(&body, at) {
                    tracing::warn!(
                        template = %at.template,
                        line = at.line,
                        directive = %body,
                        "unrecognized directive left as text"
                    );
                    self.literal(raw, at);
                }
            }
        }
    }

    /// Lower one directive. Returns false if it is not valid here.
    fn directive(&mut self, body: &str, at: &SourceLocation) -> bool {
        let (keyword, rest) = split_directive(body);
        match keyword {
            // inheritance markers are already resolved
            "extends" | "block" | "endblock" => true,
            "if" if !rest.is_empty() => {
                let index = self.push(
                    Op::If {
                        condition: Condition::parse(rest),
                        next: 0,
                    },
                    at,
                );
                self.frames.push(Frame::If {
                    pending: Some(index),
                    branches: Vec::new(),
                    seen_else: false,
                });
                true
            }
            "elseif" | "elif" if !rest.is_empty() => self.else_if(rest, at),
            "else" if rest.is_empty() => self.else_branch(at),
            "endif" => self.end_if(at),
            "for" | "foreach" => self.for_each(rest, at),
            "endfor" | "endforeach" => self.end_for(at),
            "set" => self.assign(rest, at),
            "include" => self.include(rest, at),
            _ => false,
        }
    }

    fn else_if(&mut self, condition: &str, at: &SourceLocation) -> bool {
        if !matches!(self.frames.last(), Some(Frame::If { seen_else: false, .. })) {
            return false;
        }
        let index = self.push(
            Op::ElseIf {
                condition: Condition::parse(condition),
                next: 0,
                end: 0,
            },
            at,
        );
        if let Some(Frame::If {
            pending, branches, ..
        }) = self.frames.last_mut()
        {
            if let Some(prev) = pending.replace(index) {
                patch_next(&mut self.instructions[prev].op, index);
            }
            branches.push(index);
        }
        true
    }

    fn else_branch(&mut self, at: &SourceLocation) -> bool {
        if !matches!(self.frames.last(), Some(Frame::If { seen_else: false, .. })) {
            return false;
        }
        let index = self.push(Op::Else { end: 0 }, at);
        if let Some(Frame::If {
            pending,
            branches,
            seen_else,
        }) = self.frames.last_mut()
        {
            if let Some(prev) = pending.take() {
                patch_next(&mut self.instructions[prev].op, index);
            }
            branches.push(index);
            *seen_else = true;
        }
        true
    }

    fn end_if(&mut self, at: &SourceLocation) -> bool {
        if !matches!(self.frames.last(), Some(Frame::If { .. })) {
            return false;
        }
        let index = self.push(Op::EndIf, at);
        if let Some(Frame::If {
            pending, branches, ..
        }) = self.frames.pop()
        {
            if let Some(prev) = pending {
                patch_next(&mut self.instructions[prev].op, index);
            }
            for branch in branches {
                match &mut self.instructions[branch].op {
                    Op::ElseIf { end, .. } | Op::Else { end } => *end = index,
                    _ => {}
                }
            }
        }
        true
    }

    /// `for item in items` or `for key, item in items`.
    fn for_each(&mut self, rest: &str, at: &SourceLocation) -> bool {
        let Some(in_pos) = find_keyword(rest, "in") else {
            return false;
        };
        let vars: Vec<String> = rest[..in_pos]
            .split(',')
            .map(|v| v.trim().trim_start_matches('$').to_string())
            .collect();
        let collection = rest[in_pos + 2..].trim();
        if collection.is_empty() || vars.iter().any(|v| !is_name(v)) {
            return false;
        }

        let (key_var, var) = match vars.as_slice() {
            [var] => (None, var.clone()),
            [key, var] => (Some(key.clone()), var.clone()),
            _ => return false,
        };

        let index = self.push(
            Op::ForEach {
                collection: VarPath::parse(collection),
                key_var,
                var,
                end: 0,
            },
            at,
        );
        self.frames.push(Frame::For { start: index });
        true
    }

    fn end_for(&mut self, at: &SourceLocation) -> bool {
        let Some(Frame::For { start }) = self.frames.last() else {
            return false;
        };
        let start = *start;
        self.frames.pop();
        let index = self.push(Op::EndForEach { start }, at);
        if let Op::ForEach { end, .. } = &mut self.instructions[start].op {
            *end = index;
        }
        true
    }

    fn assign(&mut self, rest: &str, at: &SourceLocation) -> bool {
        let Some(eq) = find_unquoted(rest, "=") else {
            return false;
        };
        let name = rest[..eq].trim().trim_start_matches('$');
        let value = rest[eq + 1..].trim();
        if !is_name(name) || value.is_empty() || value.starts_with('=') {
            return false;
        }
        self.push(
            Op::Assign {
                name: name.to_string(),
                value: classify(value),
            },
            at,
        );
        true
    }

    /// `include 'name'`, `include var`, optionally `with {key: value, ...}`.
    fn include(&mut self, rest: &str, at: &SourceLocation) -> bool {
        let (target, overlay_text) = match find_keyword(rest, "with") {
            Some(pos) => (rest[..pos].trim(), Some(rest[pos + 4..].trim())),
            None => (rest.trim(), None),
        };
        if target.is_empty() {
            return false;
        }

        let target = match parse_quoted(target) {
            Some(name) => IncludeTarget::Name(name),
            None if is_path(target) => IncludeTarget::Path(VarPath::parse(target)),
            None => return false,
        };

        let overlay = match overlay_text {
            Some(text) => match parse_overlay(text) {
                Some(overlay) => overlay,
                None => return false,
            },
            None => Vec::new(),
        };

        self.push(Op::Include { target, overlay }, at);
        true
    }

    fn literal(&mut self, text: &str, at: &SourceLocation) {
        if text.is_empty() {
            return;
        }
        if let Some(Instruction {
            op: Op::EmitLiteral(prev),
            ..
        }) = self.instructions.last_mut()
        {
            prev.push_str(text);
            return;
        }
        self.push(Op::EmitLiteral(text.to_string()), at);
    }

    fn push(&mut self, op: Op, at: &SourceLocation) -> usize {
        self.instructions.push(Instruction { op, line: at.line });
        self.locations.push(at.clone());
        self.instructions.len() - 1
    }

    fn close_unterminated(&mut self, at: &SourceLocation) {
        while let Some(frame) = self.frames.last() {
            let kind = match frame {
                Frame::If { .. } => "if",
                Frame::For { .. } => "for",
            };
            tracing::warn!(
                template = %at.template,
                line = at.line,
                directive = kind,
                "unclosed directive closed at end of template"
            );
            match kind {
                "if" => self.end_if(at),
                _ => self.end_for(at),
            };
        }
    }
}

fn patch_next(op: &mut Op, target: usize) {
    match op {
        Op::If { next, .. } | Op::ElseIf { next, .. } => *next = target,
        _ => {}
    }
}

/// Position of `keyword` as a whole word outside quotes.
fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(pos) = find_unquoted(&text[offset..], keyword) {
        let start = offset + pos;
        let end = start + keyword.len();
        let before_ok = start == 0 || text[..start].ends_with(char::is_whitespace);
        let after_ok = end == text.len() || text[end..].starts_with(char::is_whitespace);
        if before_ok && after_ok {
            return Some(start);
        }
        offset = start + keyword.len();
    }
    None
}

fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn is_path(text: &str) -> bool {
    let text = text.strip_prefix('$').unwrap_or(text);
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == '$')
}

/// `{key: value, 'other key': "text"}`. Keys are taken literally.
fn parse_overlay(text: &str) -> Option<Vec<(String, Operand)>> {
    let inner = text.strip_prefix('{')?.strip_suffix('}')?;
    split_arguments(inner, ',')
        .into_iter()
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let colon = find_unquoted(&entry, ":")?;
            let key = entry[..colon].trim();
            let key = parse_quoted(key).unwrap_or_else(|| key.to_string());
            if key.is_empty() {
                return None;
            }
            Some((key, classify(&entry[colon + 1..])))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::ast::TemplateSource;
    use crate::template::expr::{CondToken, Literal};
    use crate::template::inheritance::{InheritanceResolver, TemplateLoader};
    use crate::error::{Result, TemplateError};

    struct Single(&'static str);

    impl TemplateLoader for Single {
        fn load(&self, name: &str) -> Result<TemplateSource> {
            if name == "t" {
                Ok(TemplateSource::inline(name, self.0))
            } else {
                Err(TemplateError::TemplateNotFound { name: name.to_string() })
            }
        }
    }

    fn compile(source: &'static str) -> (ExecutableUnit, SourceMap) {
        let resolved = InheritanceResolver::new(&Single(source)).resolve("t").unwrap();
        DirectiveCompiler::compile(&resolved)
    }

    fn ops(source: &'static str) -> Vec<Op> {
        compile(source).0.ops().cloned().collect()
    }

    #[test]
    fn test_plain_text_is_one_literal() {
        assert_eq!(
            ops("no markers\nat all"),
            vec![Op::EmitLiteral("no markers\nat all".into())]
        );
        assert!(ops("").is_empty());
    }

    #[test]
    fn test_output_escaped_and_raw() {
        assert_eq!(
            ops("[[ $user.name ]][[! body ]]"),
            vec![
                Op::EmitExpression {
                    value: Operand::Path(VarPath::parse("user.name")),
                    escape: true,
                    filters: vec![],
                },
                Op::EmitExpression {
                    value: Operand::Path(VarPath::parse("body")),
                    escape: false,
                    filters: vec![],
                },
            ]
        );
    }

    #[test]
    fn test_set_classification() {
        assert_eq!(
            ops("[% set a = 'x' %][% set $b = user.id %][% set c = [1, 2] %]"),
            vec![
                Op::Assign {
                    name: "a".into(),
                    value: Operand::Literal(Literal::Str("x".into())),
                },
                Op::Assign {
                    name: "b".into(),
                    value: Operand::Path(VarPath::parse("user.id")),
                },
                Op::Assign {
                    name: "c".into(),
                    value: Operand::Literal(Literal::Array(vec![
                        Operand::Literal(Literal::Int(1)),
                        Operand::Literal(Literal::Int(2)),
                    ])),
                },
            ]
        );
    }

    #[test]
    fn test_if_chain_jump_targets() {
        let ops = ops("[% if a %]A[% elseif b %]B[% else %]C[% endif %]");
        // 0 If, 1 A, 2 ElseIf, 3 B, 4 Else, 5 C, 6 EndIf
        assert!(matches!(ops[0], Op::If { next: 2, .. }));
        assert!(matches!(ops[2], Op::ElseIf { next: 4, end: 6, .. }));
        assert!(matches!(ops[4], Op::Else { end: 6 }));
        assert_eq!(ops[6], Op::EndIf);
    }

    #[test]
    fn test_condition_rewriting_in_if() {
        let ops = ops("[% if enabled and visible %]x[% endif %]");
        match &ops[0] {
            Op::If { condition, next } => {
                assert_eq!(*next, 2);
                assert_eq!(
                    condition.tokens,
                    vec![
                        CondToken::Lookup(VarPath::parse("enabled")),
                        CondToken::Op("and".into()),
                        CondToken::Lookup(VarPath::parse("visible")),
                    ]
                );
            }
            other => panic!("expected If, got {:?}", other),
        }
    }

    #[test]
    fn test_for_each_lowering() {
        let ops = ops("[% for $item in $items %][[ item ]][% endfor %]");
        assert_eq!(
            ops[0],
            Op::ForEach {
                collection: VarPath::parse("items"),
                key_var: None,
                var: "item".into(),
                end: 2,
            }
        );
        assert_eq!(ops[2], Op::EndForEach { start: 0 });

        let ops = self::ops("[% for key, value in config.values %][% endfor %]");
        assert!(matches!(&ops[0], Op::ForEach { key_var: Some(k), var, .. } if k == "key" && var == "value"));
    }

    #[test]
    fn test_include_lowering() {
        assert_eq!(
            ops("[% include 'partials/nav' with {active: page.id, title: \"Home\", 'n': 3} %]"),
            vec![Op::Include {
                target: IncludeTarget::Name("partials/nav".into()),
                overlay: vec![
                    ("active".into(), Operand::Path(VarPath::parse("page.id"))),
                    ("title".into(), Operand::Literal(Literal::Str("Home".into()))),
                    ("n".into(), Operand::Literal(Literal::Int(3))),
                ],
            }]
        );
        assert_eq!(
            ops("[% include widget %]"),
            vec![Op::Include {
                target: IncludeTarget::Path(VarPath::parse("widget")),
                overlay: vec![],
            }]
        );
    }

    #[test]
    fn test_macro_lowering() {
        assert_eq!(
            ops(r#"##url("user.show", userId)##"#),
            vec![Op::MacroCall {
                name: "url".into(),
                args: vec![
                    Operand::Literal(Literal::Str("user.show".into())),
                    Operand::Path(VarPath::parse("userId")),
                ],
            }]
        );
        assert_eq!(
            ops("##now()##"),
            vec![Op::MacroCall { name: "now".into(), args: vec![] }]
        );
    }

    #[test]
    fn test_malformed_directives_stay_literal() {
        assert_eq!(
            ops("a[% endif %]b[% frobnicate %]c"),
            vec![Op::EmitLiteral("a[% endif %]b[% frobnicate %]c".into())]
        );
    }

    #[test]
    fn test_unclosed_if_is_closed() {
        let ops = ops("[% if a %]x");
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], Op::If { next: 2, .. }));
        assert_eq!(ops[2], Op::EndIf);
    }

    #[test]
    fn test_source_map_lines() {
        let (unit, map) = compile("line one\n[[ a ]]\n\n[% if b %]\n[[ c ]][% endif %]");
        assert_eq!(unit.len(), map.len());
        let lines: Vec<usize> = (0..map.len()).map(|i| map.get(i).unwrap().line).collect();
        // literal, a, literal, if, literal, c, endif
        assert_eq!(lines, vec![1, 2, 2, 4, 4, 5, 5]);
        assert!(unit.instructions.iter().zip(lines).all(|(i, l)| i.line == l));
        assert_eq!(map.get(1).unwrap().template, "t");
    }
}
