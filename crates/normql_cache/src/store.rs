//! The normalized entity store.
//!
//! A [`NormalizedStore`] maps identity keys to [`StoreObject`] records, which
//! map storage keys to [`StoreValue`]s. Nested entities never appear inline;
//! they are linked through [`IdValue`] references.

use indexmap::{IndexMap, IndexSet};
use normql_core::{CacheError, CacheResult};
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::borrow::Cow;

/// Field recording an entity's concrete type.
pub const TYPENAME_KEY: &str = "__typename";

/// A reference to an entity record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdValue {
    /// Identity key of the target record.
    pub id: String,
    /// True when the key was synthesized from the response path.
    pub generated: bool,
    /// `__typename` of the target, when known at write time.
    pub typename: Option<String>,
}

impl IdValue {
    /// A reference to an entity with a real identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            generated: false,
            typename: None,
        }
    }

    /// A reference to a path-derived identity.
    pub fn generated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            generated: true,
            typename: None,
        }
    }

    pub fn with_typename(mut self, typename: impl Into<String>) -> Self {
        self.typename = Some(typename.into());
        self
    }
}

/// A value held in a store record slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub enum StoreValue {
    /// A leaf value, `null` included.
    Scalar(JsonValue),
    /// A link to another record.
    Reference(IdValue),
    /// An element-wise normalized list.
    List(Vec<StoreValue>),
    /// An object value stored without normalization.
    Json(JsonValue),
}

impl StoreValue {
    pub fn null() -> Self {
        Self::Scalar(JsonValue::Null)
    }

    /// Stores a plain JSON value that has no selection set.
    pub fn from_plain(value: &JsonValue) -> Self {
        match value {
            JsonValue::Object(_) => Self::Json(value.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(Self::from_plain).collect()),
            other => Self::Scalar(other.clone()),
        }
    }

    pub fn as_reference(&self) -> Option<&IdValue> {
        match self {
            Self::Reference(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StoreValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(JsonValue::Null))
    }
}

impl From<IdValue> for StoreValue {
    fn from(id: IdValue) -> Self {
        Self::Reference(id)
    }
}

impl From<StoreValue> for JsonValue {
    fn from(value: StoreValue) -> Self {
        match value {
            StoreValue::Scalar(v) => v,
            StoreValue::Reference(id) => {
                let mut obj = serde_json::Map::new();
                obj.insert("type".into(), json!("id"));
                obj.insert("id".into(), JsonValue::String(id.id));
                obj.insert("generated".into(), JsonValue::Bool(id.generated));
                if let Some(typename) = id.typename {
                    obj.insert("typename".into(), JsonValue::String(typename));
                }
                JsonValue::Object(obj)
            }
            StoreValue::List(items) => {
                JsonValue::Array(items.into_iter().map(JsonValue::from).collect())
            }
            StoreValue::Json(v) => json!({ "type": "json", "json": v }),
        }
    }
}

impl TryFrom<JsonValue> for StoreValue {
    type Error = CacheError;

    fn try_from(value: JsonValue) -> CacheResult<Self> {
        match value {
            JsonValue::Array(items) => items
                .into_iter()
                .map(StoreValue::try_from)
                .collect::<CacheResult<Vec<_>>>()
                .map(StoreValue::List),
            JsonValue::Object(mut obj) => {
                let kind = obj
                    .get("type")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                match kind.as_deref() {
                    Some("id") => {
                        let id = match obj.remove("id") {
                            Some(JsonValue::String(id)) => id,
                            _ => {
                                return Err(CacheError::InvalidStoreValue(
                                    "reference without a string `id`".into(),
                                ))
                            }
                        };
                        let generated = obj
                            .get("generated")
                            .and_then(JsonValue::as_bool)
                            .unwrap_or(false);
                        let typename = obj
                            .get("typename")
                            .and_then(JsonValue::as_str)
                            .map(str::to_string);
                        Ok(StoreValue::Reference(IdValue {
                            id,
                            generated,
                            typename,
                        }))
                    }
                    Some("json") => Ok(StoreValue::Json(
                        obj.remove("json").unwrap_or(JsonValue::Null),
                    )),
                    _ => Err(CacheError::InvalidStoreValue(format!(
                        "unrecognized object value {}",
                        JsonValue::Object(obj)
                    ))),
                }
            }
            scalar => Ok(StoreValue::Scalar(scalar)),
        }
    }
}

/// A single entity record: storage key to value, in insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreObject(IndexMap<String, StoreValue, FxBuildHasher>);

impl StoreObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&StoreValue> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut StoreValue> {
        self.0.get_mut(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: StoreValue) -> Option<StoreValue> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<StoreValue> {
        self.0.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StoreValue)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The entity's `__typename`, if it was written.
    pub fn typename(&self) -> Option<&str> {
        match self.0.get(TYPENAME_KEY) {
            Some(StoreValue::Scalar(JsonValue::String(name))) => Some(name),
            _ => None,
        }
    }

    /// Merges `other` into this record field by field; `other` wins.
    pub fn merge(&mut self, other: &StoreObject) {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }
}

impl FromIterator<(String, StoreValue)> for StoreObject {
    fn from_iter<T: IntoIterator<Item = (String, StoreValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The flat entity store: identity key to record, in insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedStore(IndexMap<String, StoreObject, FxBuildHasher>);

impl NormalizedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, data_id: &str) -> Option<&StoreObject> {
        self.0.get(data_id)
    }

    pub fn get_mut(&mut self, data_id: &str) -> Option<&mut StoreObject> {
        self.0.get_mut(data_id)
    }

    /// Returns the record for `data_id`, creating an empty one if needed.
    pub fn record_mut(&mut self, data_id: &str) -> &mut StoreObject {
        self.0.entry(data_id.to_string()).or_default()
    }

    pub fn insert(&mut self, data_id: impl Into<String>, record: StoreObject) -> Option<StoreObject> {
        self.0.insert(data_id.into(), record)
    }

    pub fn remove(&mut self, data_id: &str) -> Option<StoreObject> {
        self.0.shift_remove(data_id)
    }

    pub fn contains(&self, data_id: &str) -> bool {
        self.0.contains_key(data_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StoreObject)> {
        self.0.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Applies a patch: tombstoned records are removed, then patch records
    /// are merged field by field.
    pub fn apply_patch(&mut self, patch: &StorePatch) {
        for id in &patch.tombstones {
            self.0.shift_remove(id);
        }
        for (id, record) in patch.records.iter() {
            self.record_mut(id).merge(record);
        }
    }

    /// Serializes the store in its persisted layout.
    pub fn to_json_string(&self) -> CacheResult<String> {
        serde_json::to_string(self).map_err(|e| CacheError::InvalidStoreValue(e.to_string()))
    }

    /// Loads a store from its persisted layout.
    pub fn from_json_str(source: &str) -> CacheResult<Self> {
        serde_json::from_str(source).map_err(|e| CacheError::InvalidStoreValue(e.to_string()))
    }

    /// Loads a store from an already-parsed JSON value.
    pub fn from_json(value: JsonValue) -> CacheResult<Self> {
        serde_json::from_value(value).map_err(|e| CacheError::InvalidStoreValue(e.to_string()))
    }
}

impl FromIterator<(String, StoreObject)> for NormalizedStore {
    fn from_iter<T: IntoIterator<Item = (String, StoreObject)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A set of record changes applied as one unit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StorePatch {
    /// Field-level writes, by identity key.
    pub records: NormalizedStore,
    /// Identity keys removed before `records` are merged.
    pub tombstones: IndexSet<String, FxBuildHasher>,
}

impl StorePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.tombstones.is_empty()
    }

    /// Writes a single field.
    pub fn set_field(&mut self, data_id: &str, key: impl Into<String>, value: StoreValue) {
        self.records.record_mut(data_id).insert(key, value);
    }

    /// Marks a record for removal, discarding any pending writes to it.
    pub fn tombstone(&mut self, data_id: &str) {
        self.records.remove(data_id);
        self.tombstones.insert(data_id.to_string());
    }

    /// Composes `later` on top of this patch.
    pub fn merge(&mut self, later: &StorePatch) {
        for id in &later.tombstones {
            self.tombstone(id);
        }
        for (id, record) in later.records.iter() {
            self.records.record_mut(id).merge(record);
        }
    }

    /// Computes the patch that turns `before` into `after`.
    ///
    /// Records that lost fields are tombstoned and rewritten in full.
    pub fn between(before: &NormalizedStore, after: &NormalizedStore) -> Self {
        let mut patch = Self::new();
        for id in before.ids() {
            if !after.contains(id) {
                patch.tombstones.insert(id.clone());
            }
        }
        for (id, record) in after.iter() {
            match before.get(id) {
                None => {
                    patch.records.insert(id.clone(), record.clone());
                }
                Some(old) if old.keys().any(|key| !record.contains_key(key)) => {
                    patch.tombstones.insert(id.clone());
                    patch.records.insert(id.clone(), record.clone());
                }
                Some(old) => {
                    let changed: StoreObject = record
                        .iter()
                        .filter(|(key, value)| old.get(key) != Some(*value))
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect();
                    if !changed.is_empty() {
                        patch.records.insert(id.clone(), changed);
                    }
                }
            }
        }
        patch
    }
}

/// Read access to entity records.
pub trait StoreView: Send + Sync {
    /// Returns the record for `data_id`, if present.
    fn get(&self, data_id: &str) -> Option<Cow<'_, StoreObject>>;
}

impl StoreView for NormalizedStore {
    fn get(&self, data_id: &str) -> Option<Cow<'_, StoreObject>> {
        NormalizedStore::get(self, data_id).map(Cow::Borrowed)
    }
}

/// A base store seen through a stack of patches, later patches winning.
#[derive(Debug, Clone)]
pub struct LayeredStore<'a> {
    base: &'a NormalizedStore,
    layers: Vec<&'a StorePatch>,
}

impl<'a> LayeredStore<'a> {
    pub fn new(base: &'a NormalizedStore) -> Self {
        Self {
            base,
            layers: Vec::new(),
        }
    }

    /// Pushes a patch on top of the current layers.
    pub fn layer(mut self, patch: &'a StorePatch) -> Self {
        self.layers.push(patch);
        self
    }

    /// Flattens the view into a standalone store.
    pub fn materialize(&self) -> NormalizedStore {
        let mut store = self.base.clone();
        for patch in &self.layers {
            store.apply_patch(patch);
        }
        store
    }
}

impl StoreView for LayeredStore<'_> {
    fn get(&self, data_id: &str) -> Option<Cow<'_, StoreObject>> {
        let mut current = self.base.get(data_id).map(Cow::Borrowed);
        for patch in &self.layers {
            if patch.tombstones.contains(data_id) {
                current = None;
            }
            if let Some(record) = patch.records.get(data_id) {
                current = Some(match current {
                    None => Cow::Borrowed(record),
                    Some(existing) => {
                        let mut merged = existing.into_owned();
                        merged.merge(record);
                        Cow::Owned(merged)
                    }
                });
            }
        }
        current
    }
}
