//! End-to-end properties of writing, reading and diffing the store.

use normql_cache::{
    default_data_id, CacheConfig, DiffEngine, DiffOptions, IdValue, NormalizedStore,
    QueryContext, SharedCache, StoreReader, StoreValue, StoreWriter, ROOT_QUERY,
};
use normql_core::CacheError;
use normql_syntax::{
    get_operation_definition, parse_query, print, Definition, Document, Selection, Variables,
};
use serde_json::{json, Map, Value as JsonValue};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn obj(value: JsonValue) -> Map<String, JsonValue> {
    value.as_object().cloned().unwrap_or_default()
}

fn write(
    config: &CacheConfig,
    store: &mut NormalizedStore,
    doc: &Document,
    vars: &Variables,
    result: &Map<String, JsonValue>,
) {
    let ctx = QueryContext::operation(doc, None, vars).unwrap();
    StoreWriter::new(config).write(store, &ctx, result).unwrap();
}

fn read(
    config: &CacheConfig,
    store: &NormalizedStore,
    doc: &Document,
    vars: &Variables,
) -> Result<Map<String, JsonValue>, CacheError> {
    let ctx = QueryContext::operation(doc, None, vars).unwrap();
    StoreReader::new(config).read(store, &ctx)
}

const PROFILE: &str = r#"
query Profile($id: ID!, $size: Int = 64) {
  user(id: $id) {
    __typename
    id
    name
    avatar(size: $size)
    settings
    friends(first: 2) {
      __typename
      id
      name
    }
    stats {
      followers
      tags
    }
  }
}
"#;

fn profile_result() -> Map<String, JsonValue> {
    obj(json!({
        "user": {
            "__typename": "User",
            "id": "1",
            "name": "Ada",
            "avatar": "ada-64.png",
            "settings": {"theme": "dark", "beta": [1, 2]},
            "friends": [
                {"__typename": "User", "id": "2", "name": "Grace"},
                null,
                {"__typename": "User", "id": "3", "name": "Edsger"}
            ],
            "stats": {"followers": 10, "tags": [["a"], []]}
        }
    }))
}

#[test]
fn test_read_after_write_returns_the_response() {
    init_tracing();
    let config = CacheConfig::new().data_id_from_object(default_data_id);
    let doc = parse_query(PROFILE).unwrap();
    let vars = obj(json!({"id": "1"}));
    let mut store = NormalizedStore::new();

    write(&config, &mut store, &doc, &vars, &profile_result());
    assert_eq!(read(&config, &store, &doc, &vars).unwrap(), profile_result());

    assert!(store.contains("User:2"));
    assert!(store.contains("$User:1.stats"));
    assert_eq!(
        store.get("User:1").and_then(|r| r.get("settings")),
        Some(&StoreValue::Json(json!({"theme": "dark", "beta": [1, 2]})))
    );
}

#[test]
fn test_normalizes_nested_objects_without_identity() {
    let config = CacheConfig::new();
    let doc = parse_query("{ a d { e } }").unwrap();
    let mut store = NormalizedStore::new();
    write(
        &config,
        &mut store,
        &doc,
        &Variables::new(),
        &obj(json!({"a": 1, "d": {"e": 4}})),
    );

    let expected = NormalizedStore::from_json(json!({
        "ROOT_QUERY": {
            "a": 1,
            "d": {"type": "id", "id": "$ROOT_QUERY.d", "generated": true}
        },
        "$ROOT_QUERY.d": {"e": 4}
    }))
    .unwrap();
    assert_eq!(store, expected);
}

#[test]
fn test_disjoint_writes_merge_fields() {
    let config = CacheConfig::new().data_id_from_object(default_data_id);
    let mut store = NormalizedStore::new();
    let vars = Variables::new();

    write(
        &config,
        &mut store,
        &parse_query("{ me { __typename id name } }").unwrap(),
        &vars,
        &obj(json!({"me": {"__typename": "User", "id": "1", "name": "Ada"}})),
    );
    write(
        &config,
        &mut store,
        &parse_query("{ viewer { __typename id email } }").unwrap(),
        &vars,
        &obj(json!({"viewer": {"__typename": "User", "id": "1", "email": "ada@x"}})),
    );

    let user = store.get("User:1").unwrap();
    assert_eq!(user.get("name"), Some(&StoreValue::Scalar(json!("Ada"))));
    assert_eq!(user.get("email"), Some(&StoreValue::Scalar(json!("ada@x"))));
    assert_eq!(
        store.get(ROOT_QUERY).and_then(|r| r.get("viewer")),
        Some(&StoreValue::Reference(
            IdValue::new("User:1").with_typename("User")
        ))
    );
}

#[test]
fn test_variables_and_literals_share_storage_keys() {
    let config = CacheConfig::new();
    let mut store = NormalizedStore::new();
    write(
        &config,
        &mut store,
        &parse_query(r#"query($n: Int) { items(first: $n, order: {by: "name", dir: ASC}) }"#)
            .unwrap(),
        &obj(json!({"n": 3})),
        &obj(json!({"items": [1, 2, 3]})),
    );

    let literal = parse_query(r#"{ items(order: {dir: ASC, by: "name"}, first: 3) }"#).unwrap();
    assert_eq!(
        read(&config, &store, &literal, &Variables::new()).unwrap(),
        obj(json!({"items": [1, 2, 3]}))
    );

    let other = parse_query("{ items(first: 4) }").unwrap();
    assert!(read(&config, &store, &other, &Variables::new())
        .unwrap_err()
        .is_missing_data());
}

#[test]
fn test_store_json_round_trip_is_byte_identical() {
    let config = CacheConfig::new().data_id_from_object(default_data_id);
    let doc = parse_query(PROFILE).unwrap();
    let vars = obj(json!({"id": "1"}));
    let mut store = NormalizedStore::new();
    write(&config, &mut store, &doc, &vars, &profile_result());

    let json = store.to_json_string().unwrap();
    let restored = NormalizedStore::from_json_str(&json).unwrap();
    assert_eq!(restored.to_json_string().unwrap(), json);
    assert_eq!(
        read(&config, &restored, &doc, &vars).unwrap(),
        read(&config, &store, &doc, &vars).unwrap()
    );
}

#[test]
fn test_rejects_unknown_persisted_value_shapes() {
    let err = NormalizedStore::from_json(json!({"ROOT_QUERY": {"a": {"type": "blob"}}}))
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidStoreValue(_)));
}

#[test]
fn test_skip_and_include_apply_to_reads_and_writes() {
    let config = CacheConfig::new();
    let doc = parse_query(
        "query($full: Boolean!) { id details @include(if: $full) { bio } extra @skip(if: $full) }",
    )
    .unwrap();
    let mut store = NormalizedStore::new();
    let lean = obj(json!({"full": false}));
    write(
        &config,
        &mut store,
        &doc,
        &lean,
        &obj(json!({"id": 1, "extra": "e"})),
    );

    assert_eq!(
        read(&config, &store, &doc, &lean).unwrap(),
        obj(json!({"id": 1, "extra": "e"}))
    );
    assert!(read(&config, &store, &doc, &obj(json!({"full": true}))).is_err());
}

#[test]
fn test_dangling_references_are_errors() {
    let config = CacheConfig::new();
    let store = NormalizedStore::from_json(json!({
        "ROOT_QUERY": {"me": {"type": "id", "id": "User:gone", "generated": false}}
    }))
    .unwrap();

    let err = read(
        &config,
        &store,
        &parse_query("{ me { name } }").unwrap(),
        &Variables::new(),
    )
    .unwrap_err();
    assert_eq!(err, CacheError::dangling("User:gone"));
}

#[test]
fn test_residual_queries_are_self_contained() {
    let config = CacheConfig::new().data_id_from_object(default_data_id);
    let source = r#"
        query Feed($first: Int) {
          feed(first: $first) { ...Story }
        }
        fragment Story on Story { __typename id title author { ...Author } }
        fragment Author on User { __typename id name avatar }
    "#;
    let doc = parse_query(source).unwrap();
    let vars = obj(json!({"first": 1}));
    let mut store = NormalizedStore::new();
    write(
        &config,
        &mut store,
        &parse_query(
            "query($first: Int) { feed(first: $first) { __typename id title author { __typename id name } } }",
        )
        .unwrap(),
        &vars,
        &obj(json!({"feed": [{
            "__typename": "Story", "id": "s1", "title": "t",
            "author": {"__typename": "User", "id": "u1", "name": "Ada"}
        }]})),
    );

    let ctx = QueryContext::operation(&doc, None, &vars).unwrap();
    let diff = DiffEngine::new(&config)
        .diff(&store, &ctx, DiffOptions::new())
        .unwrap();
    assert!(!diff.complete);

    let op = get_operation_definition(&doc, None).unwrap();
    let residual = diff.residual_document(op).unwrap();
    assert!(residual
        .definitions
        .iter()
        .all(|d| matches!(d, Definition::Operation(_))));
    insta::assert_snapshot!(print(&residual), @r"
    query Feed($first: Int) {
      feed(first: $first) {
        ... on Story {
          author {
            ... on User {
              avatar
            }
          }
        }
      }
    }
    ");

    // Nothing in the residual refers to a named fragment.
    let reparsed = parse_query(&print(&residual)).unwrap();
    let root = &get_operation_definition(&reparsed, None).unwrap().selection_set;
    assert!(!root
        .iter()
        .any(|s| matches!(s, Selection::FragmentSpread(_))));
}

#[test]
fn test_residual_for_an_empty_store_inlines_every_fragment() {
    let config = CacheConfig::new().data_id_from_object(default_data_id);
    let source = r#"
        query Me {
          me { ...Profile }
        }
        fragment Profile on User { __typename id name best { ...Friend } }
        fragment Friend on User { __typename id name }
    "#;
    let doc = parse_query(source).unwrap();
    let vars = Variables::new();
    let mut store = NormalizedStore::new();

    let ctx = QueryContext::operation(&doc, None, &vars).unwrap();
    let diff = DiffEngine::new(&config)
        .diff(&store, &ctx, DiffOptions::new())
        .unwrap();
    let op = get_operation_definition(&doc, None).unwrap();
    let residual = diff.residual_document(op).unwrap();

    // The printed residual parses on its own.
    let reparsed = parse_query(&print(&residual)).unwrap();
    assert_eq!(reparsed.fragments().count(), 0);
    assert!(!print(&reparsed).contains("...Profile"));
    assert!(!print(&reparsed).contains("...Friend"));

    write(
        &config,
        &mut store,
        &reparsed,
        &vars,
        &obj(json!({"me": {
            "__typename": "User", "id": "1", "name": "Ada",
            "best": {"__typename": "User", "id": "2", "name": "Grace"}
        }})),
    );
    let again = DiffEngine::new(&config)
        .diff(&store, &ctx, DiffOptions::new())
        .unwrap();
    assert!(again.complete);
}

#[tokio::test]
async fn test_optimistic_layers_compose_and_roll_back() {
    init_tracing();
    let cache = SharedCache::new(
        CacheConfig::new()
            .data_id_from_object(default_data_id)
            .add_typename(false),
    );
    let query = parse_query("{ post { __typename id likes title } }").unwrap();
    cache
        .write_query(
            &query,
            &Variables::new(),
            &obj(json!({"post": {"__typename": "Post", "id": "1", "likes": 1, "title": "a"}})),
        )
        .await
        .unwrap();

    let like = parse_query("mutation { like { __typename id likes } }").unwrap();
    let rename = parse_query("mutation { rename { __typename id title } }").unwrap();
    cache
        .apply_optimistic(
            &like,
            &Variables::new(),
            "like",
            &obj(json!({"like": {"__typename": "Post", "id": "1", "likes": 2}})),
            &[],
        )
        .await
        .unwrap();
    cache
        .apply_optimistic(
            &rename,
            &Variables::new(),
            "rename",
            &obj(json!({"rename": {"__typename": "Post", "id": "1", "title": "b"}})),
            &[],
        )
        .await
        .unwrap();

    let optimistic = cache
        .read_query(&query, &Variables::new(), true)
        .await
        .unwrap();
    assert_eq!(
        JsonValue::Object(optimistic),
        json!({"post": {"__typename": "Post", "id": "1", "likes": 2, "title": "b"}})
    );

    assert!(cache.remove_optimistic("like").await);
    let after = cache
        .read_query(&query, &Variables::new(), true)
        .await
        .unwrap();
    assert_eq!(
        JsonValue::Object(after),
        json!({"post": {"__typename": "Post", "id": "1", "likes": 1, "title": "b"}})
    );

    assert!(cache.remove_optimistic("rename").await);
    assert_eq!(cache.extract(true).await, cache.extract(false).await);
}
