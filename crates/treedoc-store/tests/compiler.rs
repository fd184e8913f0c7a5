use treedoc_store::query::{ElementPath, QueryNode, RangeOp};
use treedoc_store::state::{
    KEY_ANCESTOR_IDS, KEY_ID, KEY_IS_TRASHED, KEY_LIFECYCLE_STATE, KEY_MIXIN_TYPES,
    KEY_PRIMARY_TYPE, KEY_READ_ACL,
};
use treedoc_store::expr::{Operand, Reference};
use treedoc_store::{
    CompilerConfig, Expression, FieldType, Literal, Operator, QueryCompiler, StoreError,
    TrashMode, TypeCatalog, WireType,
};

fn catalog() -> TypeCatalog {
    TypeCatalog::new()
        .with_field("size", FieldType::Scalar(WireType::Long))
        .with_field("dc:title", FieldType::Scalar(WireType::String))
        .with_field("dc:subjects", FieldType::ScalarList(WireType::String))
        .with_document_type("Folder", ["Folderish"])
        .with_document_type("Workspace", ["Folderish"])
        .with_facet("Folderish", false)
        .with_facet("Hidden", true)
}

fn compile(config: &CompilerConfig, filter: &Expression) -> Result<QueryNode, StoreError> {
    let catalog = catalog();
    QueryCompiler::new(&catalog, config).compile_filter(filter)
}

fn is_parse_error(result: Result<QueryNode, StoreError>) -> bool {
    matches!(result, Err(StoreError::Parse(_)))
}

#[test]
fn test_negated_indexed_range_flips_operator() {
    let config = CompilerConfig::new().with_range_index("size", WireType::Long);
    let filter = Expression::not(Expression::compare("size", Operator::Lt, Literal::Integer(5)));

    match compile(&config, &filter).unwrap() {
        QueryNode::Range { op, list, .. } => {
            assert_eq!(op, RangeOp::Ge);
            assert!(!list);
        }
        other => panic!("expected a range, got {other:?}"),
    }
}

#[test]
fn test_negated_list_comparison_stays_a_negation() {
    let filter = Expression::compare("dc:subjects", Operator::NotEq, Literal::string("art"));

    let node = compile(&CompilerConfig::new(), &filter).unwrap();
    assert_eq!(
        node,
        QueryNode::Not(Box::new(QueryNode::value(
            ElementPath::field("dc:subjects"),
            "art"
        )))
    );
}

#[test]
fn test_negated_wildcard_inverts_the_scoped_predicate() {
    let items = ElementPath::field("dc:subjects").item(None);
    let some_art = QueryNode::scoped(items, QueryNode::value(ElementPath::new(), "art"));

    let not_eq = Expression::compare("dc:subjects/*", Operator::NotEq, Literal::string("art"));
    assert_eq!(
        compile(&CompilerConfig::new(), &not_eq).unwrap(),
        QueryNode::Not(Box::new(some_art.clone()))
    );

    let not_expr = Expression::not(Expression::compare(
        "dc:subjects/*",
        Operator::Eq,
        Literal::string("art"),
    ));
    assert_eq!(
        compile(&CompilerConfig::new(), &not_expr).unwrap(),
        QueryNode::Not(Box::new(some_art))
    );
}

#[test]
fn test_principals_restrict_by_read_acl() {
    let catalog = catalog();
    let config = CompilerConfig::new();
    let principals = vec!["alice".to_string(), "members".to_string()];
    let filter = Expression::compare("dc:title", Operator::Eq, Literal::string("Hello"));

    let node = QueryCompiler::new(&catalog, &config)
        .with_principals(&principals)
        .compile_filter(&filter)
        .unwrap();

    assert_eq!(
        node,
        QueryNode::And(vec![
            QueryNode::value(ElementPath::field("dc:title"), "Hello"),
            QueryNode::values(ElementPath::field(KEY_READ_ACL), ["alice", "members"]),
        ])
    );
}

#[test]
fn test_mixin_expands_to_types_and_per_instance_facets() {
    let config = CompilerConfig::new();

    let folderish = Expression::compare("ecm:mixinType", Operator::Eq, Literal::string("Folderish"));
    assert_eq!(
        compile(&config, &folderish).unwrap(),
        QueryNode::values(ElementPath::field(KEY_PRIMARY_TYPE), ["Folder", "Workspace"])
    );

    let hidden = Expression::compare("ecm:mixinType", Operator::Eq, Literal::string("Hidden"));
    assert_eq!(
        compile(&config, &hidden).unwrap(),
        QueryNode::values(ElementPath::field(KEY_MIXIN_TYPES), ["Hidden"])
    );
}

#[test]
fn test_trash_modes() {
    let trashed = Expression::compare(KEY_IS_TRASHED, Operator::Eq, Literal::Boolean(true));
    let lifecycle = QueryNode::value(ElementPath::field(KEY_LIFECYCLE_STATE), "deleted");
    let property = QueryNode::value(ElementPath::field(KEY_IS_TRASHED), "true");

    let config = CompilerConfig::new().with_trash_mode(TrashMode::LifeCycle);
    assert_eq!(compile(&config, &trashed).unwrap(), lifecycle);

    let config = CompilerConfig::new().with_trash_mode(TrashMode::Property);
    assert_eq!(compile(&config, &trashed).unwrap(), property);

    let config = CompilerConfig::new().with_trash_mode(TrashMode::Migration);
    assert_eq!(
        compile(&config, &trashed).unwrap(),
        QueryNode::Or(vec![lifecycle.clone(), property.clone()])
    );

    let kept = Expression::compare(KEY_IS_TRASHED, Operator::Eq, Literal::Boolean(false));
    assert_eq!(
        compile(&config, &kept).unwrap(),
        QueryNode::And(vec![
            QueryNode::Not(Box::new(lifecycle)),
            QueryNode::Not(Box::new(property)),
        ])
    );
}

#[test]
fn test_path_predicates_use_the_resolver() {
    let catalog = catalog();
    let config = CompilerConfig::new();
    let resolver = |path: &str| (path == "/workspaces").then(|| "ws-1".to_string());

    let exact = Expression::compare("ecm:path", Operator::Eq, Literal::string("/workspaces"));
    let node = QueryCompiler::new(&catalog, &config)
        .with_path_resolver(&resolver)
        .compile_filter(&exact)
        .unwrap();
    assert_eq!(node, QueryNode::value(ElementPath::field(KEY_ID), "ws-1"));

    let below = Expression::compare("ecm:path", Operator::StartsWith, Literal::string("/workspaces"));
    let node = QueryCompiler::new(&catalog, &config)
        .with_path_resolver(&resolver)
        .compile_filter(&below)
        .unwrap();
    assert_eq!(node, QueryNode::value(ElementPath::field(KEY_ANCESTOR_IDS), "ws-1"));

    let unknown = Expression::compare("ecm:path", Operator::Eq, Literal::string("/nowhere"));
    let node = QueryCompiler::new(&catalog, &config)
        .with_path_resolver(&resolver)
        .compile_filter(&unknown)
        .unwrap();
    assert_eq!(
        node,
        QueryNode::Not(Box::new(QueryNode::exists(ElementPath::field(KEY_ID))))
    );

    assert!(is_parse_error(compile(&config, &exact)));
}

#[test]
fn test_rejections() {
    let config = CompilerConfig::new().with_fulltext_disabled(true);
    let fulltext = Expression::compare("ecm:fulltext", Operator::Eq, Literal::string("hello"));
    assert!(is_parse_error(compile(&config, &fulltext)));

    let config = CompilerConfig::new();
    let bad_cast = Expression::new(
        Operand::Reference(Reference::with_cast("dc:title", "DATE")),
        Operator::Eq,
        Some(Operand::Literal(Literal::string("2024-01-01"))),
    );
    assert!(is_parse_error(compile(&config, &bad_cast)));

    let nested = Expression::compare("dc:title/0", Operator::Eq, Literal::string("x"));
    assert!(is_parse_error(compile(&config, &nested)));

    let between = Expression::compare_list("size", Operator::Between, vec![Literal::Integer(1)]);
    assert!(is_parse_error(compile(&config, &between)));
}
