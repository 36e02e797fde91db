//! Order-stable JSON serialization.
//!
//! Storage keys and request fingerprints both embed JSON. Object keys are
//! emitted in sorted order at every depth so that two values that compare
//! equal always serialize to the same string, independent of how the map
//! that produced them was ordered.

use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Serializes `value` with recursively sorted object keys and no whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    // Keys are strings and values are plain JSON, so this cannot fail.
    serde_json::to_string(&Sorted(value)).unwrap_or_default()
}

/// Borrowed JSON that serializes its objects in key order.
struct Sorted<'a>(&'a Value);

impl Serialize for Sorted<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Array(items) => serializer.collect_seq(items.iter().map(Sorted)),
            Value::Object(map) => serializer.collect_map(
                map.iter()
                    .map(|(key, item)| (key.as_str(), Sorted(item)))
                    .collect::<BTreeMap<_, _>>(),
            ),
            other => other.serialize(serializer),
        }
    }
}
