// Template inheritance through the engine

use templar::template::InheritanceResolver;
use templar::{Context, TemplateError, TemplateParser};

mod common;
use common::Fixture;

const LAYOUT: &str = "<html><head><title>[% block title %]Default title[% endblock %]</title></head>\n\
<body>[% block body %]<p>default body</p>[% endblock %]</body></html>";

#[test]
fn test_parse_preserves_source() {
    assert_eq!(TemplateParser::parse("Hello [[ name ]]").source(), "Hello [[ name ]]");
}

#[test]
fn test_child_overrides_and_parent_defaults() {
    let fixture = Fixture::with_templates(&[
        ("layout.tpl", LAYOUT),
        ("page.tpl", "[% extends 'layout' %][% block title %]Page [[ n ]][% endblock %]"),
    ]);
    let out = fixture
        .engine()
        .render("page", &Context::new().with("n", 2))
        .unwrap();
    assert_eq!(
        out,
        "<html><head><title>Page 2</title></head>\n<body><p>default body</p></body></html>"
    );
}

#[test]
fn test_child_only_blocks_are_dropped() {
    let fixture = Fixture::with_templates(&[
        ("layout.tpl", LAYOUT),
        (
            "page.tpl",
            "[% extends 'layout' %]text outside blocks[% block sidebar %]SIDEBAR[% endblock %]",
        ),
    ]);
    let out = fixture.engine().render("page", &Context::new()).unwrap();
    assert!(!out.contains("SIDEBAR"));
    assert!(!out.contains("text outside blocks"));
    assert!(out.contains("Default title"));
}

#[test]
fn test_three_level_chain() {
    let fixture = Fixture::with_templates(&[
        ("base.tpl", "{[% block header %]base header[% endblock %]|[% block content %]base content[% endblock %]}"),
        (
            "section.tpl",
            "[% extends 'base' %][% block content %]<section>[% block inner %]section inner[% endblock %]</section>[% endblock %]",
        ),
        ("article.tpl", "[% extends 'section' %][% block inner %]article [[ title ]][% endblock %]"),
    ]);
    let out = fixture
        .engine()
        .render("article", &Context::new().with("title", "<One>"))
        .unwrap();
    assert_eq!(out, "{base header|<section>article &lt;One&gt;</section>}");
}

#[test]
fn test_extends_is_found_after_leading_text() {
    let fixture = Fixture::with_templates(&[
        ("layout.tpl", LAYOUT),
        ("page.tpl", "ignored\n[% extends \"layout\" %]\n[% block body %]late[% endblock %]"),
    ]);
    let out = fixture.engine().render("page", &Context::new()).unwrap();
    assert!(out.contains("<body>late</body>"));
}

#[test]
fn test_circular_inheritance() {
    let fixture = Fixture::with_templates(&[
        ("base.tpl", "[% extends 'child' %]"),
        ("child.tpl", "[% extends 'grandchild' %]"),
        ("grandchild.tpl", "[% extends 'base' %]"),
    ]);
    let err = fixture.engine().render("base", &Context::new()).unwrap_err();
    assert!(matches!(err, TemplateError::CircularInheritance { .. }));
    assert!(err.to_string().contains("base -> child -> grandchild -> base"));
}

#[test]
fn test_missing_parent() {
    let fixture = Fixture::with_templates(&[("page.tpl", "[% extends 'nowhere' %]")]);
    let err = fixture.engine().render("page", &Context::new()).unwrap_err();
    match err {
        TemplateError::ParentTemplateNotFound { parent, child } => {
            assert_eq!(parent, "nowhere");
            assert_eq!(child, "page");
        }
        other => panic!("expected missing parent, got {:?}", other),
    }
}

#[test]
fn test_resolver_reports_chain_and_paths() {
    let fixture = Fixture::with_templates(&[
        ("layout.tpl", LAYOUT),
        ("page.tpl", "[% extends 'layout' %]"),
    ]);
    let engine = fixture.engine();
    let resolved = InheritanceResolver::new(&engine).resolve("page").unwrap();

    assert_eq!(resolved.chain_names(), vec!["layout", "page"]);
    assert!(resolved.chain[0].path.as_ref().unwrap().ends_with("layout.tpl"));
    assert_eq!(resolved.source(), LAYOUT);
    assert!(resolved.template.extends().is_none());
    assert_eq!(resolved.template.block_names(), vec!["body", "title"]);
}

#[test]
fn test_block_markers_with_conditions_inside() {
    let fixture = Fixture::with_templates(&[
        ("layout.tpl", "[% block nav %][% endblock %]"),
        (
            "page.tpl",
            "[% extends 'layout' %][% block nav %][% if user %]Hi [[ user ]][% else %]Login[% endif %][% endblock %]",
        ),
    ]);
    let engine = fixture.engine();
    assert_eq!(engine.render("page", &Context::new()).unwrap(), "Login");
    assert_eq!(
        engine.render("page", &Context::new().with("user", "ann")).unwrap(),
        "Hi ann"
    );
}
