//! Document-level helpers shared by the cache's read and write paths.

use crate::ast::*;
use normql_core::{CacheError, CacheResult};
use rustc_hash::FxHashMap;
use serde_json::Value as JsonValue;

/// Name of the introspection field recording an object's concrete type.
pub const TYPENAME_FIELD: &str = "__typename";

/// Fragments of a document, by name.
pub type FragmentMap<'a> = FxHashMap<&'a str, &'a FragmentDefinition>;

/// Builds the fragment map of a document.
pub fn create_fragment_map(document: &Document) -> FragmentMap<'_> {
    document
        .fragments()
        .map(|frag| (frag.name.as_str(), frag))
        .collect()
}

/// Selects the operation to run.
///
/// With no name, the document must contain exactly one operation.
pub fn get_operation_definition<'a>(
    document: &'a Document,
    name: Option<&str>,
) -> CacheResult<&'a OperationDefinition> {
    match name {
        Some(name) => document
            .operations()
            .find(|op| op.name.as_deref() == Some(name))
            .ok_or_else(|| CacheError::malformed(format!("no operation named `{name}`"))),
        None => {
            let mut operations = document.operations();
            match (operations.next(), operations.next()) {
                (Some(op), None) => Ok(op),
                (None, _) => Err(CacheError::malformed("document contains no operations")),
                (Some(_), Some(_)) => Err(CacheError::malformed(
                    "document contains multiple operations; an operation name is required",
                )),
            }
        }
    }
}

/// Wraps a fragment document into a query that spreads the chosen fragment.
///
/// The result is `{ ...Name }` followed by every fragment of the input, so it
/// can be read against any entity record.
pub fn get_fragment_query_document(
    document: &Document,
    fragment_name: Option<&str>,
) -> CacheResult<Document> {
    if document.operations().next().is_some() {
        return Err(CacheError::malformed(
            "found an operation where only fragments were expected",
        ));
    }

    let name = match fragment_name {
        Some(name) => {
            if document.fragment(name).is_none() {
                return Err(CacheError::malformed(format!("no fragment named `{name}`")));
            }
            name.to_string()
        }
        None => {
            let mut fragments = document.fragments();
            match (fragments.next(), fragments.next()) {
                (Some(frag), None) => frag.name.clone(),
                (None, _) => return Err(CacheError::malformed("document contains no fragments")),
                (Some(_), Some(_)) => {
                    return Err(CacheError::malformed(
                        "document contains multiple fragments; a fragment name is required",
                    ))
                }
            }
        }
    };

    let query = OperationDefinition {
        operation: OperationType::Query,
        name: None,
        variables: Vec::new(),
        directives: Vec::new(),
        selection_set: SelectionSet::new(vec![Selection::FragmentSpread(FragmentSpread {
            name,
            directives: Vec::new(),
            span: normql_core::Span::SYNTHETIC,
        })]),
        span: normql_core::Span::SYNTHETIC,
    };

    let mut definitions = vec![Definition::Operation(query)];
    definitions.extend(document.definitions.iter().cloned());
    Ok(Document::new(definitions))
}

/// Evaluates `@skip(if:)` and `@include(if:)`.
pub fn should_include(directives: &[Directive], variables: &Variables) -> CacheResult<bool> {
    for directive in directives {
        let skip_when = match directive.name.as_str() {
            "skip" => true,
            "include" => false,
            _ => continue,
        };

        let condition = directive.argument("if").ok_or_else(|| {
            CacheError::malformed(format!("@{} requires an `if` argument", directive.name))
        })?;
        let value = match condition.to_json(variables) {
            Some(JsonValue::Bool(b)) => b,
            _ => {
                return Err(CacheError::malformed(format!(
                    "@{}(if:) must resolve to a boolean",
                    directive.name
                )))
            }
        };

        if value == skip_when {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Merges declared variable defaults under the caller's variables.
pub fn variables_with_defaults(operation: &OperationDefinition, variables: &Variables) -> Variables {
    let mut merged = Variables::new();
    for def in &operation.variables {
        if let Some(default) = &def.default_value {
            if let Some(value) = default.to_json(&Variables::new()) {
                merged.insert(def.name.clone(), value);
            }
        }
    }
    for (name, value) in variables {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

/// Adds `__typename` to every selection set below the operation roots.
pub fn add_typename_to_document(document: &Document) -> Document {
    let definitions = document
        .definitions
        .iter()
        .map(|def| match def {
            Definition::Operation(op) => {
                let mut op = op.clone();
                op.selection_set = add_typename_below(&op.selection_set);
                Definition::Operation(op)
            }
            Definition::Fragment(frag) => {
                let mut frag = frag.clone();
                frag.selection_set = add_typename(&frag.selection_set);
                Definition::Fragment(frag)
            }
        })
        .collect();

    Document {
        definitions,
        span: document.span,
    }
}

fn add_typename(selection_set: &SelectionSet) -> SelectionSet {
    let mut result = add_typename_below(selection_set);
    let has_typename = result.selections.iter().any(|sel| {
        matches!(sel, Selection::Field(f) if f.name == TYPENAME_FIELD && f.alias.is_none())
    });
    if !has_typename {
        result
            .selections
            .push(Selection::Field(Field::new(TYPENAME_FIELD)));
    }
    result
}

fn add_typename_below(selection_set: &SelectionSet) -> SelectionSet {
    let selections = selection_set
        .selections
        .iter()
        .map(|selection| match selection {
            Selection::Field(field) => Selection::Field(
                field.with_selection_set(field.selection_set.as_ref().map(add_typename)),
            ),
            Selection::InlineFragment(inline) => {
                let mut inline = inline.clone();
                inline.selection_set = add_typename(&inline.selection_set);
                Selection::InlineFragment(inline)
            }
            Selection::FragmentSpread(spread) => Selection::FragmentSpread(spread.clone()),
        })
        .collect();

    SelectionSet {
        selections,
        span: selection_set.span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_query;
    use crate::printer::print;
    use insta::assert_snapshot;
    use serde_json::json;

    fn vars(value: JsonValue) -> Variables {
        match value {
            JsonValue::Object(map) => map,
            _ => Variables::new(),
        }
    }

    #[test]
    fn test_add_typename() {
        let doc = parse_query(
            "{ user { name friends { name } } } fragment F on User { id __typename }",
        )
        .unwrap();
        assert_snapshot!(print(&add_typename_to_document(&doc)), @r"
        {
          user {
            name
            friends {
              name
              __typename
            }
            __typename
          }
        }

        fragment F on User {
          id
          __typename
        }
        ");
    }

    #[test]
    fn test_get_operation_definition() {
        let doc = parse_query("query A { a } query B { b }").unwrap();
        assert!(get_operation_definition(&doc, None).is_err());
        assert_eq!(
            get_operation_definition(&doc, Some("B")).unwrap().name.as_deref(),
            Some("B")
        );
        assert!(get_operation_definition(&doc, Some("C")).is_err());

        let doc = parse_query("fragment F on T { a }").unwrap();
        assert!(matches!(
            get_operation_definition(&doc, None),
            Err(CacheError::MalformedQuery(_))
        ));
    }

    #[test]
    fn test_fragment_query_document() {
        let doc = parse_query("fragment F on User { id }").unwrap();
        let query = get_fragment_query_document(&doc, None).unwrap();
        assert_eq!(query.operations().count(), 1);
        assert_eq!(query.fragments().count(), 1);

        let two = parse_query("fragment F on User { id } fragment G on User { name }").unwrap();
        assert!(get_fragment_query_document(&two, None).is_err());
        assert!(get_fragment_query_document(&two, Some("G")).is_ok());

        let with_op = parse_query("{ a } fragment F on User { id }").unwrap();
        assert!(get_fragment_query_document(&with_op, Some("F")).is_err());
    }

    #[test]
    fn test_should_include() {
        let doc = parse_query(
            "query($on: Boolean) { a @skip(if: true) b @include(if: $on) c @include(if: 1) }",
        )
        .unwrap();
        let op = get_operation_definition(&doc, None).unwrap();
        let dirs: Vec<_> = op
            .selection_set
            .selections
            .iter()
            .map(Selection::directives)
            .collect();

        let on = vars(json!({"on": true}));
        assert_eq!(should_include(dirs[0], &on), Ok(false));
        assert_eq!(should_include(dirs[1], &on), Ok(true));
        assert_eq!(should_include(dirs[1], &vars(json!({"on": false}))), Ok(false));
        assert!(should_include(dirs[2], &on).is_err());
    }

    #[test]
    fn test_variables_with_defaults() {
        let doc = parse_query("query($first: Int = 10, $after: String) { a }").unwrap();
        let op = get_operation_definition(&doc, None).unwrap();

        let merged = variables_with_defaults(op, &vars(json!({"after": "c1"})));
        assert_eq!(JsonValue::Object(merged), json!({"first": 10, "after": "c1"}));

        let merged = variables_with_defaults(op, &vars(json!({"first": 5})));
        assert_eq!(JsonValue::Object(merged), json!({"first": 5}));
    }
}
