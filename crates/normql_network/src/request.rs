//! Outgoing operations and their responses.

use normql_core::canonical_json;
use normql_syntax::{print, Document, Variables};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::sync::Arc;

/// One operation to send: a document, its variables and the operation to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub query: Arc<Document>,
    pub variables: Variables,
    pub operation_name: Option<String>,
}

impl Request {
    pub fn new(query: impl Into<Arc<Document>>) -> Self {
        Self {
            query: query.into(),
            variables: Variables::new(),
            operation_name: None,
        }
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// The printed document.
    pub fn query_string(&self) -> String {
        print(&self.query)
    }

    /// Identity of the request on the wire.
    ///
    /// Requests whose printed documents, variables and operation names agree
    /// share a fingerprint regardless of whitespace or variable order.
    pub fn fingerprint(&self) -> Fingerprint {
        let variables = canonical_json(&JsonValue::Object(self.variables.clone()));
        Fingerprint(format!(
            "{}|{}|{}",
            self.query_string(),
            variables,
            self.operation_name.as_deref().unwrap_or_default()
        ))
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.operation_name.is_some() { 3 } else { 2 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("query", &self.query_string())?;
        map.serialize_entry("variables", &self.variables)?;
        if let Some(name) = &self.operation_name {
            map.serialize_entry("operationName", name)?;
        }
        map.end()
    }
}

/// See [`Request::fingerprint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An error reported by the server for one operation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, JsonValue>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
            extensions: None,
        }
    }
}

impl fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The result of one operation. Data and errors may both be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl Response {
    pub fn from_data(data: Map<String, JsonValue>) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        Self { data: None, errors }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use normql_syntax::parse_query;
    use serde_json::json;

    fn vars(value: JsonValue) -> Variables {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_fingerprint_ignores_formatting() {
        let a = Request::new(parse_query("query Q($a: Int) { x(a: $a) }").unwrap())
            .variables(vars(json!({"a": 1, "b": {"d": 1, "c": 2}})));
        let b = Request::new(parse_query("query Q($a: Int) {\n  x(a: $a)\n}").unwrap())
            .variables(vars(json!({"b": {"c": 2, "d": 1}, "a": 1})));
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_inputs() {
        let doc = Arc::new(parse_query("query Q { x } query R { y }").unwrap());
        let q = Request::new(doc.clone()).operation_name("Q");
        let r = Request::new(doc.clone()).operation_name("R");
        assert_ne!(q.fingerprint(), r.fingerprint());

        let one = Request::new(doc.clone()).variables(vars(json!({"a": 1})));
        let two = Request::new(doc).variables(vars(json!({"a": 2})));
        assert_ne!(one.fingerprint(), two.fingerprint());
    }

    #[test]
    fn test_wire_format() {
        let request = Request::new(parse_query("{ x }").unwrap()).operation_name("X");
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"query": "{\n  x\n}", "variables": {}, "operationName": "X"})
        );

        let response: Response =
            serde_json::from_value(json!({"data": null, "errors": [{"message": "boom"}]}))
                .unwrap();
        assert!(response.data.is_none());
        assert_eq!(response.errors, vec![GraphQLError::new("boom")]);
    }
}
