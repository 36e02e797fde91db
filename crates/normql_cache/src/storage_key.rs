//! Storage-key derivation for fields.
//!
//! A field's storage key is its name plus its resolved arguments, so two
//! selections of the same field with different arguments occupy different
//! slots of the same record.

use normql_core::canonical_json;
use normql_syntax::{Field, Variables};
use rustc_hash::FxHashSet;
use serde_json::{Map, Value as JsonValue};

/// Derives the record slot a field is stored under.
pub trait StorageKeyStrategy: Send + Sync {
    /// Returns the storage key for `field` under `variables`.
    fn storage_key(&self, field: &Field, variables: &Variables) -> String;
}

/// Resolves a field's arguments to JSON, dropping arguments bound to
/// undefined variables.
pub fn resolve_arguments(field: &Field, variables: &Variables) -> Map<String, JsonValue> {
    field
        .arguments
        .iter()
        .filter_map(|arg| Some((arg.name.clone(), arg.value.to_json(variables)?)))
        .collect()
}

/// `name` or `name({canonical args})`, optionally ignoring pagination arguments.
#[derive(Debug, Clone, Default)]
pub struct CanonicalStorageKeys {
    excluded: FxHashSet<String>,
}

impl CanonicalStorageKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaves the named arguments out of every key, so paginated pages of a
    /// field share one slot.
    pub fn exclude_arguments<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(names.into_iter().map(Into::into));
        self
    }
}

impl StorageKeyStrategy for CanonicalStorageKeys {
    fn storage_key(&self, field: &Field, variables: &Variables) -> String {
        let mut args = resolve_arguments(field, variables);
        args.retain(|name, _| !self.excluded.contains(name));

        if args.is_empty() {
            field.name.clone()
        } else {
            format!("{}({})", field.name, canonical_json(&JsonValue::Object(args)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use normql_syntax::{parse_query, Selection};
    use serde_json::json;

    fn first_field(source: &str) -> Field {
        let doc = parse_query(source).unwrap();
        let op = doc.operations().next().unwrap();
        match &op.selection_set.selections[0] {
            Selection::Field(field) => field.clone(),
            _ => panic!("expected field"),
        }
    }

    fn vars(value: JsonValue) -> Variables {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_no_arguments() {
        let keys = CanonicalStorageKeys::new();
        assert_eq!(keys.storage_key(&first_field("{ hero }"), &Variables::new()), "hero");
    }

    #[test]
    fn test_literal_and_variable_arguments_agree() {
        let keys = CanonicalStorageKeys::new();
        let literal = first_field(r#"{ items(b: "x", a: 1) }"#);
        let variable = first_field("query($a: Int) { items(a: $a, b: \"x\") }");

        let expected = r#"items({"a":1,"b":"x"})"#;
        assert_eq!(keys.storage_key(&literal, &Variables::new()), expected);
        assert_eq!(keys.storage_key(&variable, &vars(json!({"a": 1}))), expected);
        assert_ne!(keys.storage_key(&variable, &vars(json!({"a": 2}))), expected);
    }

    #[test]
    fn test_alias_does_not_change_key() {
        let keys = CanonicalStorageKeys::new();
        let field = first_field("{ small: image(size: 10) }");
        assert_eq!(keys.storage_key(&field, &Variables::new()), r#"image({"size":10})"#);
    }

    #[test]
    fn test_unbound_variable_is_dropped() {
        let keys = CanonicalStorageKeys::new();
        let field = first_field("query($q: String) { search(q: $q) }");
        assert_eq!(keys.storage_key(&field, &Variables::new()), "search");
    }

    #[test]
    fn test_pagination_arguments_excluded() {
        let keys = CanonicalStorageKeys::new().exclude_arguments(["after", "first"]);
        let field = first_field(r#"{ feed(kind: TOP, first: 10, after: "c1") }"#);
        assert_eq!(
            keys.storage_key(&field, &Variables::new()),
            r#"feed({"kind":"TOP"})"#
        );
    }
}
