//! Cache configuration.

use crate::fragment_matcher::{FragmentMatcher, HeuristicFragmentMatcher};
use crate::storage_key::{CanonicalStorageKeys, StorageKeyStrategy};
use crate::store::{StoreObject, StoreValue};
use normql_syntax::OperationType;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// Root record for query results.
pub const ROOT_QUERY: &str = "ROOT_QUERY";
/// Root record for mutation results.
pub const ROOT_MUTATION: &str = "ROOT_MUTATION";
/// Root record for subscription results.
pub const ROOT_SUBSCRIPTION: &str = "ROOT_SUBSCRIPTION";

/// Returns the root record id for an operation type.
pub fn root_id(operation: OperationType) -> &'static str {
    match operation {
        OperationType::Query => ROOT_QUERY,
        OperationType::Mutation => ROOT_MUTATION,
        OperationType::Subscription => ROOT_SUBSCRIPTION,
    }
}

/// Computes an entity's identity key from its response fields.
pub type DataIdFn = Arc<dyn Fn(&Map<String, JsonValue>) -> Option<String> + Send + Sync>;

/// `Typename:id` (or `Typename:_id`) when both fields are present.
pub fn default_data_id(object: &Map<String, JsonValue>) -> Option<String> {
    let typename = object.get("__typename")?.as_str()?;
    let id = object.get("id").or_else(|| object.get("_id"))?;
    match id {
        JsonValue::String(id) => Some(format!("{typename}:{id}")),
        JsonValue::Number(id) => Some(format!("{typename}:{id}")),
        _ => None,
    }
}

/// Resolves a field from its parent record instead of the field's own slot.
///
/// Returning a [`StoreValue::Reference`] redirects the read to another
/// record; returning `None` falls back to the stored value.
pub trait FieldResolver: Send + Sync {
    fn resolve(&self, parent: &StoreObject, args: &Map<String, JsonValue>) -> Option<StoreValue>;
}

impl<F> FieldResolver for F
where
    F: Fn(&StoreObject, &Map<String, JsonValue>) -> Option<StoreValue> + Send + Sync,
{
    fn resolve(&self, parent: &StoreObject, args: &Map<String, JsonValue>) -> Option<StoreValue> {
        self(parent, args)
    }
}

/// Configuration shared by the writer, reader, diff engine and integrator.
#[derive(Clone)]
pub struct CacheConfig {
    /// Identity function. Objects it returns `None` for get path-derived keys.
    pub data_id_from_object: Option<DataIdFn>,
    /// Storage-key derivation.
    pub storage_keys: Arc<dyn StorageKeyStrategy>,
    /// Type-condition matching.
    pub fragment_matcher: Arc<dyn FragmentMatcher>,
    /// Whether documents get `__typename` added before use.
    pub add_typename: bool,
    /// Custom field resolvers, keyed by `Typename.field`.
    pub resolvers: FxHashMap<String, Arc<dyn FieldResolver>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_id_from_object: None,
            storage_keys: Arc::new(CanonicalStorageKeys::default()),
            fragment_matcher: Arc::new(HeuristicFragmentMatcher),
            add_typename: true,
            resolvers: FxHashMap::default(),
        }
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("data_id_from_object", &self.data_id_from_object.is_some())
            .field("add_typename", &self.add_typename)
            .field("resolvers", &self.resolvers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl CacheConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the identity function.
    pub fn data_id_from_object<F>(mut self, f: F) -> Self
    where
        F: Fn(&Map<String, JsonValue>) -> Option<String> + Send + Sync + 'static,
    {
        self.data_id_from_object = Some(Arc::new(f));
        self
    }

    /// Sets the storage-key strategy.
    pub fn storage_keys(mut self, strategy: impl StorageKeyStrategy + 'static) -> Self {
        self.storage_keys = Arc::new(strategy);
        self
    }

    /// Sets the fragment matcher.
    pub fn fragment_matcher(mut self, matcher: impl FragmentMatcher + 'static) -> Self {
        self.fragment_matcher = Arc::new(matcher);
        self
    }

    /// Enables or disables `__typename` insertion.
    pub fn add_typename(mut self, enabled: bool) -> Self {
        self.add_typename = enabled;
        self
    }

    /// Registers a resolver for `typename.field`.
    pub fn resolver(
        mut self,
        typename: &str,
        field: &str,
        resolver: impl FieldResolver + 'static,
    ) -> Self {
        self.resolvers
            .insert(format!("{typename}.{field}"), Arc::new(resolver));
        self
    }

    /// Computes the identity key of a response object.
    pub fn data_id(&self, object: &Map<String, JsonValue>) -> Option<String> {
        self.data_id_from_object.as_ref().and_then(|f| f(object))
    }

    /// Looks up the resolver for a field on a record.
    pub(crate) fn resolver_for(
        &self,
        data_id: &str,
        record: &StoreObject,
        field: &str,
    ) -> Option<&Arc<dyn FieldResolver>> {
        if self.resolvers.is_empty() {
            return None;
        }
        let typename = record.typename().or(match data_id {
            ROOT_QUERY => Some("Query"),
            ROOT_MUTATION => Some("Mutation"),
            ROOT_SUBSCRIPTION => Some("Subscription"),
            _ => None,
        })?;
        self.resolvers.get(&format!("{typename}.{field}"))
    }
}
