//! End-to-end parsing and printing of realistic documents.

use normql_syntax::{
    add_typename_to_document, create_fragment_map, get_operation_definition, parse_query, print,
    Selection, Variables,
};

const FEED: &str = r#"
# The home feed, paginated.
query HomeFeed($first: Int = 20, $after: String) {
  viewer {
    id
    feed(first: $first, after: $after) @connection(key: "home") {
      edges {
        cursor
        node {
          ...FeedItem
        }
      }
    }
  }
}

fragment FeedItem on Story {
  id
  title
  author { ...Author }
}

fragment Author on User {
  id
  name
}
"#;

#[test]
fn test_parses_and_reprints_a_feed_query() {
    let doc = parse_query(FEED).unwrap();
    assert_eq!(doc.operations().count(), 1);
    assert_eq!(create_fragment_map(&doc).len(), 2);

    let printed = print(&doc);
    assert!(printed.starts_with("query HomeFeed($first: Int = 20, $after: String) {"));
    assert!(printed.contains(r#"feed(first: $first, after: $after) @connection(key: "home") {"#));

    let reparsed = parse_query(&printed).unwrap();
    assert_eq!(print(&reparsed), printed);
}

#[test]
fn test_typename_insertion_leaves_operation_root_alone() {
    let doc = add_typename_to_document(&parse_query(FEED).unwrap());
    let op = get_operation_definition(&doc, Some("HomeFeed")).unwrap();

    let root_has_typename = op
        .selection_set
        .selections
        .iter()
        .any(|sel| matches!(sel, Selection::Field(f) if f.name == "__typename"));
    assert!(!root_has_typename);
    assert_eq!(print(&doc).matches("__typename").count(), 7);
}

#[test]
fn test_syntax_errors_render_with_source() {
    let err = parse_query("query { user(id: ) }").unwrap_err();
    let rendered = format!("{:?}", miette::Report::new(err));
    assert!(rendered.contains("expected a value"));
}

#[test]
fn test_argument_values_resolve_against_variables() {
    let doc = parse_query(FEED).unwrap();
    let op = get_operation_definition(&doc, None).unwrap();
    let vars = normql_syntax::variables_with_defaults(op, &Variables::new());
    assert_eq!(vars.get("first"), Some(&serde_json::json!(20)));
    assert!(vars.get("after").is_none());
}
