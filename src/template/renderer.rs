// Renderer: executes a compiled unit against a context

use std::borrow::Cow;
use std::collections::BTreeMap;

use super::compiler::{ExecutableUnit, IncludeTarget, Op, SourceMap};
use super::condition;
use super::expr::{Literal, Operand, PathSegment, VarPath};
use crate::error::{Result, TemplateError};
use crate::escape::Escaper;
use crate::filters::FilterPipeline;
use crate::macros::MacroRegistry;
use crate::value::{Context, Entries, Value};

/// Renders `include`d templates on behalf of the renderer.
pub trait IncludeResolver {
    /// Render `name` with `context`. `depth` is the nesting level of the
    /// include being requested (1 for an include in a top-level template).
    fn render_include(&self, name: &str, context: &Context, strict: bool, depth: usize)
        -> Result<String>;
}

/// Bindings of one active `for` loop.
struct LoopFrame {
    remaining: Entries,
    key_var: Option<String>,
    var: String,
    bindings: BTreeMap<String, Value>,
}

impl LoopFrame {
    fn bind(&mut self, key: Value, value: Value) {
        if let Some(key_var) = &self.key_var {
            self.bindings.insert(key_var.clone(), key);
        }
        self.bindings.insert(self.var.clone(), value);
    }
}

fn step<'v>(value: &'v Value, segment: &PathSegment) -> Option<Cow<'v, Value>> {
    match segment {
        PathSegment::Key(key) => value.key_ref(key),
        PathSegment::Index(index) => value.index_ref(*index),
    }
}

/// Mutable state of a single render call.
struct Scope<'c> {
    context: &'c Context,
    locals: BTreeMap<String, Value>,
    loops: Vec<LoopFrame>,
}

impl Scope<'_> {
    /// Loop frames (innermost first), then locals, then the context.
    /// Missing keys and null values anywhere along the path are unresolved.
    fn lookup(&self, path: &VarPath) -> Option<Value> {
        let root = path.root()?;
        let mut current = Cow::Borrowed(
            self.loops
                .iter()
                .rev()
                .find_map(|frame| frame.bindings.get(root))
                .or_else(|| self.locals.get(root))
                .or_else(|| self.context.get(root))?,
        );

        for segment in &path.segments[1..] {
            if current.is_null() {
                return None;
            }
            current = match current {
                Cow::Borrowed(value) => step(value, segment)?,
                Cow::Owned(value) => Cow::Owned(step(&value, segment)?.into_owned()),
            };
        }

        (!current.is_null()).then(|| current.into_owned())
    }

    /// Everything visible at this point, as a context for an included template.
    fn flatten(&self) -> Context {
        let mut vars: BTreeMap<String, Value> = self
            .context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.extend(self.locals.iter().map(|(k, v)| (k.clone(), v.clone())));
        for frame in &self.loops {
            vars.extend(frame.bindings.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Context::from(vars)
    }
}

pub struct Renderer<'a> {
    filters: &'a FilterPipeline,
    macros: &'a MacroRegistry,
    escaper: &'a dyn Escaper,
    includes: Option<&'a dyn IncludeResolver>,
    strict: bool,
    depth: usize,
}

impl<'a> Renderer<'a> {
    pub fn new(
        filters: &'a FilterPipeline,
        macros: &'a MacroRegistry,
        escaper: &'a dyn Escaper,
    ) -> Self {
        Self {
            filters,
            macros,
            escaper,
            includes: None,
            strict: false,
            depth: 0,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_includes(mut self, includes: &'a dyn IncludeResolver) -> Self {
        self.includes = Some(includes);
        self
    }

    /// Include nesting level of the template being rendered.
    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn render(
        &self,
        unit: &ExecutableUnit,
        source_map: &SourceMap,
        template: &str,
        context: &Context,
    ) -> Result<String> {
        let mut scope = Scope {
            context,
            locals: BTreeMap::new(),
            loops: Vec::new(),
        };
        let mut out = String::new();
        let mut pc = 0;
        // set when control jumped to a branch because the previous test failed
        let mut testing = false;

        while let Some(instruction) = unit.instructions.get(pc) {
            let at = Location {
                source_map,
                template,
                index: pc,
                line: instruction.line,
            };
            let landed = std::mem::take(&mut testing);

            pc = match &instruction.op {
                Op::EmitLiteral(text) => {
                    out.push_str(text);
                    pc + 1
                }
                Op::EmitExpression {
                    value,
                    escape,
                    filters,
                } => {
                    let mut value = self.operand(value, &scope, &at)?;
                    if !filters.is_empty() {
                        let mut stages = Vec::with_capacity(filters.len());
                        for filter in filters {
                            let args = filter
                                .args
                                .iter()
                                .map(|arg| self.operand(arg, &scope, &at))
                                .collect::<Result<Vec<_>>>()?;
                            stages.push((filter.name.as_str(), args));
                        }
                        value = self.filters.apply(value, &stages)?;
                    }
                    if *escape {
                        out.push_str(&self.escaper.escape(&value));
                    } else {
                        out.push_str(&value.to_output());
                    }
                    pc + 1
                }
                Op::Assign { name, value } => {
                    let value = self.operand(value, &scope, &at)?;
                    scope.locals.insert(name.clone(), value);
                    pc + 1
                }
                Op::If { condition, next } => {
                    if condition::evaluate(condition, &|path| scope.lookup(path)) {
                        pc + 1
                    } else {
                        testing = true;
                        *next
                    }
                }
                Op::ElseIf {
                    condition,
                    next,
                    end,
                } => {
                    if !landed {
                        *end
                    } else if condition::evaluate(condition, &|path| scope.lookup(path)) {
                        pc + 1
                    } else {
                        testing = true;
                        *next
                    }
                }
                Op::Else { end } => {
                    if landed {
                        pc + 1
                    } else {
                        *end
                    }
                }
                Op::EndIf => pc + 1,
                Op::ForEach {
                    collection,
                    key_var,
                    var,
                    end,
                } => {
                    let entries = scope
                        .lookup(collection)
                        .map_or(Entries::Empty, |v| v.iter_entries());
                    let mut frame = LoopFrame {
                        remaining: entries,
                        key_var: key_var.clone(),
                        var: var.clone(),
                        bindings: BTreeMap::new(),
                    };
                    match frame.remaining.next() {
                        Some((key, value)) => {
                            frame.bind(key, value);
                            scope.loops.push(frame);
                            pc + 1
                        }
                        None => *end + 1,
                    }
                }
                Op::EndForEach { start } => match scope.loops.last_mut() {
                    Some(frame) => match frame.remaining.next() {
                        Some((key, value)) => {
                            frame.bind(key, value);
                            *start + 1
                        }
                        None => {
                            scope.loops.pop();
                            pc + 1
                        }
                    },
                    None => pc + 1,
                },
                Op::Include { target, overlay } => {
                    self.include(target, overlay, &scope, &at, &mut out)?;
                    pc + 1
                }
                Op::MacroCall { name, args } => {
                    let args = args
                        .iter()
                        .map(|arg| self.operand(arg, &scope, &at))
                        .collect::<Result<Vec<_>>>()?;
                    out.push_str(&self.macros.call(name, &args)?.to_output());
                    pc + 1
                }
            };
        }

        Ok(out)
    }

    fn include(
        &self,
        target: &IncludeTarget,
        overlay: &[(String, Operand)],
        scope: &Scope<'_>,
        at: &Location<'_>,
        out: &mut String,
    ) -> Result<()> {
        let name = match target {
            IncludeTarget::Name(name) => name.clone(),
            IncludeTarget::Path(path) => self.path(path, scope, at)?.to_output(),
        };
        if name.is_empty() {
            tracing::debug!(template = at.template, line = at.line, "include target resolved to nothing");
            return Ok(());
        }

        let Some(resolver) = self.includes else {
            return Err(TemplateError::TemplateNotFound { name });
        };

        let mut context = scope.flatten();
        for (key, value) in overlay {
            context.insert(key.clone(), self.operand(value, scope, at)?);
        }

        out.push_str(&resolver.render_include(&name, &context, self.strict, self.depth + 1)?);
        Ok(())
    }

    fn operand(&self, operand: &Operand, scope: &Scope<'_>, at: &Location<'_>) -> Result<Value> {
        match operand {
            Operand::Path(path) => self.path(path, scope, at),
            Operand::Literal(Literal::Array(items)) => items
                .iter()
                .map(|item| self.operand(item, scope, at))
                .collect::<Result<Vec<_>>>()
                .map(Value::from),
            Operand::Literal(lit) => Ok(lit.to_value()),
        }
    }

    fn path(&self, path: &VarPath, scope: &Scope<'_>, at: &Location<'_>) -> Result<Value> {
        match scope.lookup(path) {
            Some(value) => Ok(value),
            None if self.strict => {
                let (template, line) = at.resolve();
                Err(TemplateError::UndefinedVariable {
                    path: path.to_string(),
                    template,
                    line,
                })
            }
            None => Ok(Value::Null),
        }
    }
}

/// Position of the instruction being executed.
struct Location<'a> {
    source_map: &'a SourceMap,
    template: &'a str,
    index: usize,
    line: usize,
}

impl Location<'_> {
    /// Originating file and line, falling back to the rendered template.
    fn resolve(&self) -> (String, usize) {
        match self.source_map.get(self.index) {
            Some(location) => (location.template.clone(), location.line),
            None => (self.template.to_string(), self.line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::HtmlEscaper;
    use crate::template::ast::TemplateSource;
    use crate::template::compiler::DirectiveCompiler;
    use crate::template::inheritance::{InheritanceResolver, TemplateLoader};
    use crate::value::TemplateObject;
    use std::collections::HashMap;

    struct Templates(HashMap<&'static str, &'static str>);

    impl TemplateLoader for Templates {
        fn load(&self, name: &str) -> Result<TemplateSource> {
            self.0
                .get(name)
                .map(|src| TemplateSource::inline(name, *src))
                .ok_or_else(|| TemplateError::TemplateNotFound {
                    name: name.to_string(),
                })
        }
    }

    struct Env {
        templates: Templates,
        filters: FilterPipeline,
        macros: MacroRegistry,
        escaper: HtmlEscaper,
        max_depth: usize,
    }

    impl Env {
        fn new(templates: &[(&'static str, &'static str)]) -> Self {
            Self {
                templates: Templates(templates.iter().copied().collect()),
                filters: FilterPipeline::new(),
                macros: MacroRegistry::new(),
                escaper: HtmlEscaper::default(),
                max_depth: 4,
            }
        }

        fn render_as(&self, name: &str, context: &Context, strict: bool, depth: usize) -> Result<String> {
            let resolved = InheritanceResolver::new(&self.templates).resolve(name)?;
            let (unit, map) = DirectiveCompiler::compile(&resolved);
            Renderer::new(&self.filters, &self.macros, &self.escaper)
                .strict(strict)
                .depth(depth)
                .with_includes(self)
                .render(&unit, &map, name, context)
        }

        fn render(&self, name: &str, context: &Context) -> Result<String> {
            self.render_as(name, context, false, 0)
        }
    }

    impl IncludeResolver for Env {
        fn render_include(&self, name: &str, context: &Context, strict: bool, depth: usize) -> Result<String> {
            if depth > self.max_depth {
                return Err(TemplateError::IncludeDepthExceeded {
                    name: name.to_string(),
                    limit: self.max_depth,
                });
            }
            self.render_as(name, context, strict, depth)
        }
    }

    fn render(source: &'static str, context: &Context) -> Result<String> {
        Env::new(&[("page", source)]).render("page", context)
    }

    fn render_strict(source: &'static str, context: &Context) -> Result<String> {
        Env::new(&[("page", source)]).render_as("page", context, true, 0)
    }

    #[test]
    fn test_plain_text_is_identity() {
        let text = "<p>No markers here.</p>\n  just text & more\n";
        assert_eq!(render(text, &Context::new()).unwrap(), text);
    }

    #[test]
    fn test_lenient_unresolved_is_empty() {
        let context = Context::new().with("other_var", "world");
        assert_eq!(render("Hello [[ name ]].", &context).unwrap(), "Hello .");
        let context = Context::new().with("name", Value::Null);
        assert_eq!(render("Hello [[ name ]].", &context).unwrap(), "Hello .");
    }

    #[test]
    fn test_strict_unresolved_errors() {
        let context = Context::new().with("other_var", "world");
        let err = render_strict("Hello [[ name ]].", &context).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error in template \"page\" at line 1: Undefined variable \"name\" in strict mode."
        );

        let context = Context::new().with("name", Value::Null);
        assert!(matches!(
            render_strict("Hello [[ name ]].", &context),
            Err(TemplateError::UndefinedVariable { ref path, .. }) if path == "name"
        ));
    }

    #[test]
    fn test_strict_reports_nested_path_and_line() {
        let context = Context::from_serialize(serde_json::json!({"user": {"name": "Ada"}})).unwrap();
        let err = render_strict("ok\n\n[[ user.profile.city ]]", &context).unwrap_err();
        match err {
            TemplateError::UndefinedVariable {
                path,
                template,
                line,
            } => {
                assert_eq!(path, "user.profile.city");
                assert_eq!(template, "page");
                assert_eq!(line, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_strict_error_points_at_parent_file() {
        let env = Env::new(&[
            ("base", "<h1>title</h1>\n[% block body %][% endblock %]\n[[ footer ]]"),
            ("child", "[% extends 'base' %]\n[% block body %]ok[% endblock %]"),
        ]);
        let err = env.render_as("child", &Context::new(), true, 0).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::UndefinedVariable { ref template, line: 3, .. } if template == "base"
        ));
    }

    #[test]
    fn test_strict_conditions_and_loops_do_not_fail() {
        let out = render_strict(
            "[% if missing %]x[% else %]y[% endif %][% for i in nothing %][[ i ]][% endfor %]",
            &Context::new(),
        )
        .unwrap();
        assert_eq!(out, "y");
    }

    #[test]
    fn test_dot_paths_and_indexes() {
        let context = Context::from_serialize(serde_json::json!({
            "user": {"profile": {"name": "Ada"}},
            "items": [{"name": "first"}, {"name": "second"}],
        }))
        .unwrap();
        assert_eq!(
            render("[[ user.profile.name ]] [[ $items.1.name ]]", &context).unwrap(),
            "Ada second"
        );
    }

    #[test]
    fn test_escaping_and_raw() {
        let context = Context::new().with("html", "<b>\"x\" & 'y'</b>");
        assert_eq!(
            render("[[ html ]]|[[! html ]]", &context).unwrap(),
            "&lt;b&gt;&quot;x&quot; &amp; &#039;y&#039;&lt;/b&gt;|<b>\"x\" & 'y'</b>"
        );
    }

    #[test]
    fn test_value_stringification() {
        let context = Context::new()
            .with("yes", true)
            .with("no", false)
            .with("list", vec![1, 2])
            .with("ratio", 3.0)
            .with("half", 0.5);
        assert_eq!(
            render("[[yes]]|[[no]]|[[list]]|[[ratio]]|[[half]]", &context).unwrap(),
            "1||Array|3|0.5"
        );
    }

    #[test]
    fn test_objects() {
        struct User;
        impl TemplateObject for User {
            fn to_text(&self) -> Option<String> {
                Some("<user>".to_string())
            }
            fn get(&self, key: &str) -> Option<Value> {
                (key == "id").then(|| Value::Int(7))
            }
        }
        struct Opaque;
        impl TemplateObject for Opaque {}

        let context = Context::new()
            .with("user", Value::object(User))
            .with("thing", Value::object(Opaque));
        assert_eq!(
            render("[[ user ]] [[ user.id ]] [[ thing ]]", &context).unwrap(),
            "&lt;user&gt; 7 Object"
        );
    }

    #[test]
    fn test_if_elseif_else() {
        let source = "[% if n > 10 %]big[% elseif n > 5 %]medium[% elif n > 0 %]small[% else %]none[% endif %]";
        let cases = [(20, "big"), (7, "medium"), (1, "small"), (0, "none")];
        for (n, expected) in cases {
            let context = Context::new().with("n", n as i64);
            assert_eq!(render(source, &context).unwrap(), expected, "n = {}", n);
        }
    }

    #[test]
    fn test_deeply_nested_condition_is_false() {
        let source = format!("[% if {}a %]x[% else %]y[% endif %]", "(".repeat(200_000));
        let source: &'static str = Box::leak(source.into_boxed_str());
        assert_eq!(render(source, &Context::new().with("a", true)).unwrap(), "y");
    }

    #[test]
    fn test_nested_if_inside_taken_branch() {
        let source = "[% if a %][% if b %]ab[% else %]a[% endif %][% elseif c %]c[% endif %]";
        let context = Context::new().with("a", true).with("b", false).with("c", true);
        assert_eq!(render(source, &context).unwrap(), "a");
    }

    #[test]
    fn test_for_loops() {
        let context = Context::from_serialize(serde_json::json!({
            "items": ["a", "b", "c"],
            "scores": {"ann": 3, "bob": 5},
        }))
        .unwrap();
        assert_eq!(
            render("[% for $item in $items %]<[[ item ]]>[% endfor %]", &context).unwrap(),
            "<a><b><c>"
        );
        assert_eq!(
            render("[% for name, score in scores %][[ name ]]=[[ score ]];[% endfor %]", &context).unwrap(),
            "ann=3;bob=5;"
        );
        assert_eq!(
            render("[% for i, item in items %][[ i ]][% endfor %]", &context).unwrap(),
            "012"
        );
    }

    #[test]
    fn test_empty_loop_falls_through_to_outer_branch() {
        let source = "[% if a %][% for x in none %]x[% endfor %]A[% elseif b %]B[% else %]C[% endif %]";
        let cases = [
            (Context::new().with("a", true), "A"),
            (Context::new().with("b", true), "B"),
            (Context::new(), "C"),
        ];
        for (context, expected) in cases {
            assert_eq!(render(source, &context).unwrap(), expected);
        }
        assert_eq!(
            render("[% if a %][% for x in none %][% endfor %][% elseif b %]B[% endif %]", &Context::new().with("a", 1).with("b", 1)).unwrap(),
            ""
        );
        assert_eq!(
            render("[% if a %][% for x in none %][% endfor %][% else %]C[% endif %]", &Context::new().with("a", 1)).unwrap(),
            ""
        );
    }

    #[test]
    fn test_loop_body_can_read_its_collection() {
        let items: Vec<i64> = (0..2000).collect();
        let context = Context::new().with("items", items);
        let out = render(
            "[% for x in items %][% if items %][[ x ]],[% endif %][% endfor %][[ items.1999 ]]",
            &context,
        )
        .unwrap();
        assert!(out.starts_with("0,1,2,"));
        assert!(out.ends_with("1998,1999,1999"));
    }

    #[test]
    fn test_for_over_non_iterable_is_empty() {
        let context = Context::new().with("n", 5);
        assert_eq!(
            render("a[% for x in n %]x[% endfor %]b[% for y in nope %]y[% endfor %]c", &context).unwrap(),
            "abc"
        );
    }

    #[test]
    fn test_nested_loops() {
        let context = Context::from_serialize(serde_json::json!({
            "rows": [[1, 2], [3]],
        }))
        .unwrap();
        assert_eq!(
            render("[% for row in rows %][% for cell in row %][[ cell ]][% endfor %]|[% endfor %]", &context).unwrap(),
            "12|3|"
        );
    }

    #[test]
    fn test_set_and_scope_order() {
        let context = Context::new().with("title", "context");
        assert_eq!(
            render("[[ title ]] [% set title = 'local' %][[ title ]]", &context).unwrap(),
            "context local"
        );
        let context = Context::from_serialize(serde_json::json!({"items": ["a", "b"]})).unwrap();
        assert_eq!(
            render("[% set last = 'none' %][% for item in items %][% set last = item %][% endfor %][[ last ]]", &context).unwrap(),
            "b"
        );
        assert_eq!(
            render("[% set item = 'outer' %][% for item in items %][[ item ]][% endfor %][[ item ]]", &context).unwrap(),
            "abouter"
        );
    }

    #[test]
    fn test_filters() {
        let context = Context::new().with("name", "  Ada Lovelace ");
        assert_eq!(
            render("[[ name | trim | upper ]]", &context).unwrap(),
            "ADA LOVELACE"
        );
        let err = render("[[ name | shout ]]", &context).unwrap_err();
        assert!(matches!(err, TemplateError::FilterNotFound { ref name } if name == "shout"));
    }

    #[test]
    fn test_filter_arguments_are_resolved() {
        let mut env = Env::new(&[("page", "[[ word | repeat(times) ]]")]);
        env.filters.register_fn("repeat", |value, args| {
            let times = args.first().and_then(Value::as_number).unwrap_or(1.0) as usize;
            Ok(Value::from(value.to_output().repeat(times)))
        });
        let context = Context::new().with("word", "ab").with("times", 3);
        assert_eq!(env.render("page", &context).unwrap(), "ababab");
    }

    #[test]
    fn test_macros_are_not_escaped() {
        let mut env = Env::new(&[("page", r###"<a href="##url("user.show", userId)##">"###)]);
        env.macros.register("url", |args| {
            let route = args[0].to_output();
            Ok(Value::from(format!("/{}/{}", route.replace('.', "/"), args[1].to_output())))
        });
        let context = Context::new().with("userId", 42);
        assert_eq!(env.render("page", &context).unwrap(), r#"<a href="/user/show/42">"#);
    }

    #[test]
    fn test_unknown_macro() {
        let err = render("##nope()##", &Context::new()).unwrap_err();
        assert!(matches!(err, TemplateError::MacroNotFound { ref name } if name == "nope"));
    }

    #[test]
    fn test_include_with_overlay() {
        let env = Env::new(&[
            ("page", "[% for item in items %][% include 'row' with {label: item, n: 1} %][% endfor %]"),
            ("row", "<li>[[ label ]]:[[ n ]]:[[ title ]]</li>"),
        ]);
        let context = Context::from_serialize(serde_json::json!({"items": ["x", "y"], "title": "T"})).unwrap();
        assert_eq!(
            env.render("page", &context).unwrap(),
            "<li>x:1:T</li><li>y:1:T</li>"
        );
    }

    #[test]
    fn test_include_by_variable() {
        let env = Env::new(&[("page", "[% include partial %]"), ("card", "card for [[ who ]]")]);
        let context = Context::new().with("partial", "card").with("who", "Ada");
        assert_eq!(env.render("page", &context).unwrap(), "card for Ada");
    }

    #[test]
    fn test_include_depth_limit() {
        let env = Env::new(&[("loop", "x[% include 'loop' %]")]);
        let err = env.render("loop", &Context::new()).unwrap_err();
        assert!(matches!(err, TemplateError::IncludeDepthExceeded { limit: 4, .. }));
    }
}
