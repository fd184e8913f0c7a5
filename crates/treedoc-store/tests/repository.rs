use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use treedoc_store::state::{
    KEY_ID, KEY_MIXIN_TYPES, KEY_NAME, KEY_PARENT_ID, KEY_PRIMARY_TYPE, KEY_READ_ACL,
};
use treedoc_store::{
    CompilerConfig, CountMode, Delta, Expression, FieldType, ListDiff, Literal, Lock,
    MemoryBackend, Operator, OrderByClause, QueryRequest, SelectClause, State, StateDiff,
    StoreError, TotalSize, TreeRepository, TypeCatalog, Value, WireType,
};

fn catalog() -> TypeCatalog {
    TypeCatalog::new()
        .with_field("dc:title", FieldType::Scalar(WireType::String))
        .with_field("dc:modified", FieldType::Scalar(WireType::Calendar))
        .with_field("tags", FieldType::ScalarList(WireType::String))
        .with_field("dc:contributors", FieldType::ScalarList(WireType::String))
        .with_field("size", FieldType::Scalar(WireType::Long))
        .with_field("counter", FieldType::Scalar(WireType::Long))
        .with_field(
            "files",
            FieldType::complex_list([
                ("a", FieldType::Scalar(WireType::Long)),
                ("b", FieldType::Scalar(WireType::Long)),
            ]),
        )
        .with_field("file:content", FieldType::Blob)
        .with_document_type("Folder", ["Folderish"])
        .with_document_type("File", Vec::<String>::new())
        .with_facet("Folderish", false)
        .with_facet("Hidden", true)
        .with_facet("Orphan", false)
}

fn setup() -> (MemoryBackend, TreeRepository) {
    let backend = MemoryBackend::new();
    let repo = TreeRepository::new(Arc::new(backend.clone()), catalog()).with_compiler_config(
        CompilerConfig::new().with_range_index("size", WireType::Long),
    );
    (backend, repo)
}

fn record(id: &str) -> State {
    State::new().with(KEY_ID, id)
}

fn eq(field: &str, literal: Literal) -> Expression {
    Expression::compare(field, Operator::Eq, literal)
}

async fn ids(repo: &TreeRepository, filter: Expression) -> Vec<String> {
    let result = repo
        .query_and_fetch(&QueryRequest::new(filter))
        .await
        .unwrap();
    let mut ids: Vec<String> = result
        .items
        .iter()
        .filter_map(|s| s.id().map(str::to_string))
        .collect();
    ids.sort();
    ids
}

async fn seed_numbered(repo: &TreeRepository, count: i64) {
    let states: Vec<State> = (1..=count)
        .map(|i| record(&format!("doc{i:02}")).with("size", i))
        .collect();
    repo.create_states(&states).await.unwrap();
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_insert_update_with_push_and_read_back() {
    let (backend, repo) = setup();
    let state = record("doc1")
        .with("dc:title", "Hello")
        .with("tags", Value::Array(vec!["a".into()]));
    repo.create_state(&state).await.unwrap();

    let diff = StateDiff::new()
        .set("dc:title", "World")
        .list("tags", ListDiff::push(vec!["b".into()]))
        .delta("counter", Delta::Long(2));
    repo.update_state("doc1", &diff).await.unwrap();

    let read = repo.read_state("doc1").await.unwrap().unwrap();
    assert_eq!(read.get("dc:title"), Some(&Value::from("World")));
    assert_eq!(
        read.get("tags"),
        Some(&Value::Array(vec!["a".into(), "b".into()]))
    );
    assert_eq!(read.get("counter"), Some(&Value::Long(2)));
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn test_duplicate_create_is_already_exists() {
    let (_backend, repo) = setup();
    repo.create_state(&record("doc1")).await.unwrap();
    let err = repo.create_state(&record("doc1")).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { ref id } if id == "doc1"));
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_create_without_id_is_rejected() {
    let (backend, repo) = setup();
    let err = repo
        .create_state(&State::new().with("dc:title", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidState(_)));
    assert_eq!(backend.document_count(), 0);
}

#[tokio::test]
async fn test_update_missing_record_is_not_found() {
    let (backend, repo) = setup();
    let err = repo
        .update_state("nope", &StateDiff::new().set("dc:title", "x"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn test_delta_on_string_field_fails_before_backend() {
    let (backend, repo) = setup();
    repo.create_state(&record("doc1").with("dc:title", "Hello"))
        .await
        .unwrap();
    let err = repo
        .update_state("doc1", &StateDiff::new().delta("dc:title", Delta::Long(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidDiff { .. }));
    assert_eq!(
        repo.read_state("doc1").await.unwrap().unwrap().get("dc:title"),
        Some(&Value::from("Hello"))
    );
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn test_empty_diff_is_a_no_op() {
    let (_backend, repo) = setup();
    // no patch is sent, so even an unknown id succeeds
    repo.update_state("nope", &StateDiff::new()).await.unwrap();
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (backend, repo) = setup();
    repo.create_state(&record("doc1")).await.unwrap();
    let ids = vec!["doc1".to_string(), "missing".to_string()];
    repo.delete_states(&ids).await.unwrap();
    repo.delete_states(&ids).await.unwrap();
    assert_eq!(repo.read_state("doc1").await.unwrap(), None);
    assert_eq!(backend.document_count(), 0);
}

#[tokio::test]
async fn test_removing_a_field_twice() {
    let (_backend, repo) = setup();
    repo.create_state(&record("doc1").with("dc:title", "Hello").with("size", 3i64))
        .await
        .unwrap();
    let expected = record("doc1").with("size", 3i64);

    let diff = StateDiff::new().remove("dc:title");
    repo.update_state("doc1", &diff).await.unwrap();
    assert_eq!(repo.read_state("doc1").await.unwrap(), Some(expected.clone()));

    repo.update_state("doc1", &diff).await.unwrap();
    assert_eq!(repo.read_state("doc1").await.unwrap(), Some(expected));
}

#[tokio::test]
async fn test_batch_duplicate_names_the_existing_record() {
    let (backend, repo) = setup();
    repo.create_state(&record("doc2")).await.unwrap();
    let err = repo
        .create_states(&[record("doc1"), record("doc2")])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { ref id } if id == "doc2"));
    assert_eq!(backend.document_count(), 1);
}

#[tokio::test]
async fn test_read_states_keeps_requested_order() {
    let (_backend, repo) = setup();
    seed_numbered(&repo, 3).await;
    let wanted = vec!["doc03".to_string(), "gone".to_string(), "doc01".to_string()];
    let states = repo.read_states(&wanted).await.unwrap();
    let got: Vec<_> = states.iter().filter_map(State::id).collect();
    assert_eq!(got, vec!["doc03", "doc01"]);
}

#[tokio::test]
async fn test_read_partial_state() {
    let (_backend, repo) = setup();
    repo.create_state(&record("doc1").with("dc:title", "Hello").with("size", 3i64))
        .await
        .unwrap();
    let partial = repo
        .read_partial_state("doc1", &["size", "absent"])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(partial, State::new().with("size", 3i64));
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_key_value_lookups() {
    let (_backend, repo) = setup();
    repo.create_states(&[
        record("doc1").with("dc:title", "Hello"),
        record("doc2").with("dc:title", "Hello"),
        record("doc3").with("dc:title", "World"),
    ])
    .await
    .unwrap();

    let found = repo
        .query_key_value("dc:title", &Value::from("Hello"))
        .await
        .unwrap();
    assert_eq!(found.len(), 2);

    let mut found_ids = repo
        .query_key_value_ids("dc:title", &Value::from("Hello"))
        .await
        .unwrap();
    found_ids.sort();
    assert_eq!(found_ids, vec!["doc1", "doc2"]);

    assert!(repo
        .query_key_value_presence("dc:title", &Value::from("World"), &[])
        .await
        .unwrap());
    assert!(!repo
        .query_key_value_presence("dc:title", &Value::from("World"), &["doc3".into()])
        .await
        .unwrap());
}

#[tokio::test]
async fn test_child_lookup() {
    let (_backend, repo) = setup();
    repo.create_states(&[
        record("root"),
        record("c1").with(KEY_PARENT_ID, "root").with(KEY_NAME, "notes"),
        record("c2").with(KEY_PARENT_ID, "root").with(KEY_NAME, "photos"),
    ])
    .await
    .unwrap();

    let child = repo.read_child_state("root", "notes", &[]).await.unwrap();
    assert_eq!(child.as_ref().and_then(State::id), Some("c1"));
    assert!(repo.has_child("root", "photos", &[]).await.unwrap());
    assert!(!repo.has_child("root", "photos", &["c2".into()]).await.unwrap());
    assert!(!repo.has_child("c1", "notes", &[]).await.unwrap());
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_list_equality_and_inequality() {
    let (_backend, repo) = setup();
    repo.create_state(
        &record("doc1")
            .with("dc:title", "Hello")
            .with("tags", Value::Array(vec!["a".into(), "b".into()])),
    )
    .await
    .unwrap();

    assert_eq!(ids(&repo, eq("tags", Literal::string("b"))).await, vec!["doc1"]);
    let not_b = Expression::compare("tags", Operator::NotEq, Literal::string("b"));
    assert!(ids(&repo, not_b).await.is_empty());
    let not_world = Expression::compare("dc:title", Operator::NotEq, Literal::string("World"));
    assert_eq!(ids(&repo, not_world).await, vec!["doc1"]);
}

#[tokio::test]
async fn test_wildcard_correlation() {
    let (_backend, repo) = setup();
    let files = Value::List(vec![
        State::new().with("a", 1i64).with("b", 2i64),
        State::new().with("a", 2i64).with("b", 1i64),
    ]);
    repo.create_state(&record("doc1").with("files", files))
        .await
        .unwrap();

    let correlated = Expression::and(vec![
        eq("files/*1/a", Literal::Integer(1)),
        eq("files/*1/b", Literal::Integer(1)),
    ]);
    assert!(ids(&repo, correlated).await.is_empty());

    let independent = Expression::and(vec![
        eq("files/*1/a", Literal::Integer(1)),
        eq("files/*2/b", Literal::Integer(1)),
    ]);
    assert_eq!(ids(&repo, independent).await, vec!["doc1"]);
}

#[tokio::test]
async fn test_negated_wildcard_means_no_element_matches() {
    let (_backend, repo) = setup();
    let contributors = |names: &[&str]| {
        Value::Array(names.iter().map(|n| Value::from(*n)).collect())
    };
    repo.create_states(&[
        record("doc1").with("dc:contributors", contributors(&["bob", "alice"])),
        record("doc2").with("dc:contributors", contributors(&["alice"])),
        record("doc3"),
    ])
    .await
    .unwrap();

    for op in [Operator::NotEq, Operator::NotLike] {
        let plain = Expression::compare("dc:contributors", op, Literal::string("bob"));
        let wildcard = Expression::compare("dc:contributors/*", op, Literal::string("bob"));
        assert_eq!(ids(&repo, plain).await, vec!["doc2", "doc3"]);
        assert_eq!(ids(&repo, wildcard).await, vec!["doc2", "doc3"]);
    }

    let not_in = Expression::compare_list(
        "dc:contributors/*",
        Operator::NotIn,
        vec![Literal::string("bob"), Literal::string("carol")],
    );
    assert_eq!(ids(&repo, not_in).await, vec!["doc2", "doc3"]);

    let some = eq("dc:contributors/*", Literal::string("alice"));
    assert_eq!(ids(&repo, some).await, vec!["doc1", "doc2"]);
}

#[tokio::test]
async fn test_like_and_ilike() {
    let (_backend, repo) = setup();
    repo.create_states(&[
        record("doc1").with("dc:title", "Hello World"),
        record("doc2").with("dc:title", "hello there"),
        record("doc3").with("dc:title", "Goodbye"),
    ])
    .await
    .unwrap();
    let like = |op, pattern: &str| Expression::compare("dc:title", op, Literal::string(pattern));

    assert_eq!(ids(&repo, like(Operator::Like, "Hello%")).await, vec!["doc1"]);
    assert_eq!(
        ids(&repo, like(Operator::ILike, "hello%")).await,
        vec!["doc1", "doc2"]
    );
    assert_eq!(
        ids(&repo, like(Operator::NotLike, "Hello%")).await,
        vec!["doc2", "doc3"]
    );
    assert_eq!(ids(&repo, like(Operator::NotILike, "HELLO%")).await, vec!["doc3"]);
    assert_eq!(ids(&repo, like(Operator::Like, "Goodby_")).await, vec!["doc3"]);
}

#[tokio::test]
async fn test_in_and_not_in() {
    let (_backend, repo) = setup();
    seed_numbered(&repo, 5).await;
    let sizes = vec![Literal::Integer(2), Literal::Integer(4)];

    let within = Expression::compare_list("size", Operator::In, sizes.clone());
    assert_eq!(ids(&repo, within).await, vec!["doc02", "doc04"]);

    let outside = Expression::compare_list("size", Operator::NotIn, sizes);
    assert_eq!(ids(&repo, outside).await, vec!["doc01", "doc03", "doc05"]);

    repo.create_states(&[
        record("t1").with("dc:title", "a"),
        record("t2").with("dc:title", "b"),
    ])
    .await
    .unwrap();
    let titles = Expression::compare_list(
        "dc:title",
        Operator::In,
        vec![Literal::string("b"), Literal::string("z")],
    );
    assert_eq!(ids(&repo, titles).await, vec!["t2"]);
}

#[tokio::test]
async fn test_is_null_and_is_not_null() {
    let (_backend, repo) = setup();
    repo.create_states(&[
        record("doc1")
            .with("dc:title", "Hello")
            .with("tags", Value::Array(vec!["a".into()])),
        record("doc2").with("tags", Value::Array(Vec::new())),
        record("doc3"),
    ])
    .await
    .unwrap();

    let null_title = Expression::unary("dc:title", Operator::IsNull);
    assert_eq!(ids(&repo, null_title).await, vec!["doc2", "doc3"]);
    let has_title = Expression::unary("dc:title", Operator::IsNotNull);
    assert_eq!(ids(&repo, has_title).await, vec!["doc1"]);

    // an empty list counts as absent
    let null_tags = Expression::unary("tags", Operator::IsNull);
    assert_eq!(ids(&repo, null_tags).await, vec!["doc2", "doc3"]);
    let has_tags = Expression::unary("tags", Operator::IsNotNull);
    assert_eq!(ids(&repo, has_tags).await, vec!["doc1"]);
}

#[tokio::test]
async fn test_starts_with_on_a_plain_field() {
    let (_backend, repo) = setup();
    repo.create_states(&[
        record("doc1").with("dc:title", "/a/b"),
        record("doc2").with("dc:title", "/a"),
        record("doc3").with("dc:title", "/ab"),
        record("doc4").with("dc:title", "/c/a"),
    ])
    .await
    .unwrap();

    for prefix in ["/a", "/a/"] {
        let below = Expression::compare("dc:title", Operator::StartsWith, Literal::string(prefix));
        assert_eq!(ids(&repo, below).await, vec!["doc1", "doc2"]);
    }
}

#[tokio::test]
async fn test_mixin_filters() {
    let (_backend, repo) = setup();
    repo.create_states(&[
        record("folder").with(KEY_PRIMARY_TYPE, "Folder"),
        record("hidden")
            .with(KEY_PRIMARY_TYPE, "File")
            .with(KEY_MIXIN_TYPES, Value::Array(vec!["Hidden".into()])),
        record("plain").with(KEY_PRIMARY_TYPE, "File"),
    ])
    .await
    .unwrap();
    let mixin = |op, facet: &str| Expression::compare("ecm:mixinType", op, Literal::string(facet));

    assert_eq!(ids(&repo, mixin(Operator::Eq, "Folderish")).await, vec!["folder"]);
    assert_eq!(ids(&repo, mixin(Operator::Eq, "Hidden")).await, vec!["hidden"]);
    assert_eq!(
        ids(&repo, mixin(Operator::NotEq, "Folderish")).await,
        vec!["hidden", "plain"]
    );
    // no type declares it and no record can carry it
    assert!(ids(&repo, mixin(Operator::Eq, "Orphan")).await.is_empty());
    assert_eq!(
        ids(&repo, mixin(Operator::NotEq, "Orphan")).await,
        vec!["folder", "hidden", "plain"]
    );
}

#[tokio::test]
async fn test_manual_projection_rows_per_binding() {
    let (_backend, repo) = setup();
    let files = Value::List(vec![
        State::new().with("a", 1i64).with("b", 2i64),
        State::new().with("a", 2i64).with("b", 1i64),
    ]);
    repo.create_state(&record("doc1").with("files", files))
        .await
        .unwrap();

    let request = QueryRequest::new(eq("files/*1/b", Literal::Integer(1)))
        .with_select(SelectClause::new().field("files/*1/a"))
        .with_count(CountMode::Exact);
    let result = repo.query_and_fetch(&request).await.unwrap();
    assert_eq!(
        result.items,
        vec![State::new().with("files/*1/a", 2i64)]
    );
    assert_eq!(result.total, TotalSize::Exact(1));
}

#[tokio::test]
async fn test_between_and_date_equality() {
    let (_backend, repo) = setup();
    seed_numbered(&repo, 5).await;
    let between = Expression::compare_list(
        "size",
        Operator::Between,
        vec![Literal::Integer(2), Literal::Integer(4)],
    );
    assert_eq!(ids(&repo, between).await, vec!["doc02", "doc03", "doc04"]);

    let day = |d: u32, h: u32| Utc.with_ymd_and_hms(2024, 3, d, h, 30, 0).unwrap();
    repo.create_states(&[
        record("morning").with("dc:modified", day(1, 9)),
        record("evening").with("dc:modified", day(1, 23)),
        record("next").with("dc:modified", day(2, 0)),
    ])
    .await
    .unwrap();
    let same_day = eq(
        "dc:modified",
        Literal::Date {
            value: day(1, 0),
            date_only: true,
        },
    );
    assert_eq!(ids(&repo, same_day).await, vec!["evening", "morning"]);
}

#[tokio::test]
async fn test_order_limit_and_counts() {
    let (_backend, repo) = setup();
    seed_numbered(&repo, 5).await;

    let request = QueryRequest::new(Expression::and(Vec::new()))
        .with_order_by(OrderByClause::new().desc("size"))
        .with_limit(2)
        .with_offset(1)
        .with_count(CountMode::Exact);
    let result = repo.query_and_fetch(&request).await.unwrap();
    let got: Vec<_> = result.items.iter().filter_map(State::id).collect();
    assert_eq!(got, vec!["doc04", "doc03"]);
    assert_eq!(result.total, TotalSize::Exact(5));

    let capped = QueryRequest::new(Expression::and(Vec::new())).with_count(CountMode::UpTo(3));
    assert_eq!(
        repo.query_and_fetch(&capped).await.unwrap().total,
        TotalSize::Truncated
    );
    let roomy = QueryRequest::new(Expression::and(Vec::new())).with_count(CountMode::UpTo(10));
    assert_eq!(
        repo.query_and_fetch(&roomy).await.unwrap().total,
        TotalSize::Exact(5)
    );
    let uncounted = QueryRequest::new(Expression::and(Vec::new()));
    assert_eq!(
        repo.query_and_fetch(&uncounted).await.unwrap().total,
        TotalSize::NotCounted
    );
}

#[tokio::test]
async fn test_order_without_index_is_a_parse_error() {
    let (backend, repo) = setup();
    let request = QueryRequest::new(Expression::and(Vec::new()))
        .with_order_by(OrderByClause::new().asc("dc:title"));
    let err = repo.query_and_fetch(&request).await.unwrap_err();
    assert!(matches!(err, StoreError::Parse(_)));
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn test_field_projection_and_score() {
    let (_backend, repo) = setup();
    repo.create_states(&[
        record("doc1").with("dc:title", "hello world").with("size", 1i64),
        record("doc2").with("dc:title", "goodbye").with("size", 2i64),
    ])
    .await
    .unwrap();

    let request = QueryRequest::new(eq("ecm:fulltext", Literal::string("hello")))
        .with_select(SelectClause::new().field(KEY_ID).field("ecm:fulltextScore"));
    let result = repo.query_and_fetch(&request).await.unwrap();
    assert_eq!(result.items.len(), 1);
    let row = &result.items[0];
    assert_eq!(row.get(KEY_ID), Some(&Value::from("doc1")));
    assert!(matches!(row.get("ecm:fulltextScore"), Some(Value::Double(s)) if *s > 0.0));
    assert_eq!(row.get("dc:title"), None);
}

#[tokio::test]
async fn test_principals_restrict_results() {
    let (_backend, repo) = setup();
    repo.create_states(&[
        record("mine").with(KEY_READ_ACL, Value::Array(vec!["alice".into()])),
        record("theirs").with(KEY_READ_ACL, Value::Array(vec!["bob".into()])),
    ])
    .await
    .unwrap();
    let request = QueryRequest::new(Expression::and(Vec::new())).with_principals(["alice"]);
    let result = repo.query_and_fetch(&request).await.unwrap();
    let got: Vec<_> = result.items.iter().filter_map(State::id).collect();
    assert_eq!(got, vec!["mine"]);
}

// ---------------------------------------------------------------------------
// Streams and scrolls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_find_all_streams_and_releases() {
    let (backend, repo) = setup();
    seed_numbered(&repo, 3).await;

    let mut stream = repo.find_all(&Expression::and(Vec::new())).await.unwrap();
    assert_eq!(backend.open_sessions(), 1);
    let mut seen = 0;
    while let Some(state) = stream.next().await {
        state.unwrap();
        seen += 1;
    }
    assert_eq!(seen, 3);
    assert_eq!(backend.open_sessions(), 0);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_find_all_fetches_pages_lazily() {
    let backend = MemoryBackend::new().with_stream_page_size(2);
    let repo = TreeRepository::new(Arc::new(backend.clone()), catalog());
    seed_numbered(&repo, 5).await;

    let mut stream = repo
        .find_all(&Expression::compare("size", Operator::Gt, Literal::Integer(0)))
        .await
        .unwrap();
    assert_eq!(backend.searches(), 0);
    stream.next().await.unwrap().unwrap();
    assert_eq!(backend.searches(), 1);

    let mut seen = 1;
    while let Some(state) = stream.next().await {
        state.unwrap();
        seen += 1;
    }
    assert_eq!(seen, 5);
    // pages of 2, 2 and 1
    assert_eq!(backend.searches(), 3);
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn test_dropped_stream_releases_session() {
    let (backend, repo) = setup();
    seed_numbered(&repo, 3).await;

    let mut stream = repo.find_all(&Expression::and(Vec::new())).await.unwrap();
    stream.next().await.unwrap().unwrap();
    drop(stream);
    for _ in 0..10 {
        if backend.open_sessions() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn test_scroll_batches_and_release() {
    let (backend, repo) = setup();
    seed_numbered(&repo, 25).await;

    let first = repo
        .scroll(&Expression::and(Vec::new()), 10, None)
        .await
        .unwrap();
    assert_eq!(first.ids.len(), 10);
    assert_eq!(repo.active_scrolls(), 1);
    assert_eq!(backend.open_sessions(), 1);

    let second = repo.scroll_next(&first.scroll_id).await.unwrap();
    assert_eq!(second.ids.len(), 10);
    let third = repo.scroll_next(&first.scroll_id).await.unwrap();
    assert_eq!(third.ids.len(), 5);
    let last = repo.scroll_next(&first.scroll_id).await.unwrap();
    assert!(!last.has_results());

    assert_eq!(repo.active_scrolls(), 0);
    assert_eq!(backend.open_sessions(), 0);

    let mut all: Vec<String> = [first.ids, second.ids, third.ids].concat();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 25);

    let err = repo.scroll_next(&first.scroll_id).await.unwrap_err();
    assert!(matches!(err, StoreError::ScrollNotFound { .. }));
}

#[tokio::test]
async fn test_close_scroll_early() {
    let (backend, repo) = setup();
    seed_numbered(&repo, 5).await;
    let first = repo
        .scroll(&Expression::and(Vec::new()), 2, None)
        .await
        .unwrap();
    assert!(repo.close_scroll(&first.scroll_id).await.unwrap());
    assert!(!repo.close_scroll(&first.scroll_id).await.unwrap());
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_scroll_is_reclaimed() {
    let (backend, repo) = setup();
    seed_numbered(&repo, 5).await;
    let first = repo
        .scroll(&Expression::and(Vec::new()), 2, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(repo.active_scrolls(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let err = repo.scroll_next(&first.scroll_id).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(repo.active_scrolls(), 0);
    assert_eq!(backend.open_sessions(), 0);
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_lock_lifecycle() {
    let (backend, repo) = setup();
    repo.create_state(&record("doc1")).await.unwrap();
    let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let bob = Lock::new("bob", created);

    assert_eq!(repo.get_lock("doc1").await.unwrap(), None);
    assert_eq!(repo.set_lock("doc1", &bob).await.unwrap(), None);
    assert_eq!(repo.get_lock("doc1").await.unwrap(), Some(bob.clone()));

    let alice = Lock::new("alice", created);
    assert_eq!(repo.set_lock("doc1", &alice).await.unwrap(), Some(bob.clone()));

    let err = repo.remove_lock("doc1", Some("alice")).await.unwrap_err();
    assert!(matches!(err, StoreError::LockMismatch { ref owner, .. } if owner == "bob"));

    assert_eq!(
        repo.remove_lock("doc1", Some("bob")).await.unwrap(),
        Some(bob)
    );
    assert_eq!(repo.get_lock("doc1").await.unwrap(), None);
    assert_eq!(repo.remove_lock("doc1", None).await.unwrap(), None);
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn test_lock_on_missing_record() {
    let (_backend, repo) = setup();
    let err = repo.get_lock("nope").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { ref id } if id == "nope"));
}

// ---------------------------------------------------------------------------
// Blobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_mark_referenced_blobs() {
    let (backend, repo) = setup();
    let blob = |key: &str| {
        State::new()
            .with("name", "a.txt")
            .with("length", 3i64)
            .with("data", key)
    };
    repo.create_states(&[
        record("doc1").with("file:content", blob("k1")),
        record("doc2").with("file:content", blob("k2")),
        record("doc3").with("dc:title", "no blob"),
    ])
    .await
    .unwrap();

    let mut marked = Vec::new();
    let count = repo
        .mark_referenced_blobs(|key| marked.push(key.to_string()))
        .await
        .unwrap();
    marked.sort();
    assert_eq!(count, 2);
    assert_eq!(marked, vec!["k1", "k2"]);
    assert_eq!(backend.open_sessions(), 0);
}
