//! Integration of mutation results into the store.
//!
//! The result is first normalized like any response, so entities it
//! returns update in place. Declarative [`PatchOperation`]s then edit list
//! membership and remove records, and finally custom [`ResultReducer`]s run
//! in the order they are listed.

use crate::config::CacheConfig;
use crate::query::QueryContext;
use crate::store::{NormalizedStore, StoreValue};
use crate::writer::StoreWriter;
use normql_core::{CacheError, CacheResult};
use normql_syntax::{Field, Selection, SelectionSet, Variables};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Where in a list an inserted reference goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayPosition {
    Prepend,
    Append,
}

/// A list slot: a record id and the storage keys leading to the list.
///
/// Intermediate keys must hold references, which are followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePath {
    pub data_id: String,
    pub keys: Vec<String>,
}

impl StorePath {
    pub fn new<I, S>(data_id: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            data_id: data_id.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.data_id)?;
        for key in &self.keys {
            write!(f, ".{key}")?;
        }
        Ok(())
    }
}

/// A store edit applied after the mutation result is merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOperation {
    /// Inserts the value found at `result_path` (response keys from the
    /// mutation root) into the list at `store_path`.
    ArrayInsert {
        result_path: Vec<String>,
        store_path: StorePath,
        position: ArrayPosition,
    },
    /// Removes a record. References to it are left dangling.
    Delete { data_id: String },
    /// Removes references to `data_id` from the list at `store_path`.
    ArrayDelete {
        store_path: StorePath,
        data_id: String,
    },
    /// Runs the reducer registered under `tag`.
    Custom { tag: String },
}

/// What a custom reducer is told about the mutation.
#[derive(Debug, Clone, Copy)]
pub struct ReducerAction<'a> {
    pub tag: &'a str,
    pub mutation_id: &'a str,
    pub result: &'a Map<String, JsonValue>,
    pub variables: &'a Variables,
}

/// Application-specific store edits keyed by an action tag.
pub trait ResultReducer: Send + Sync {
    fn reduce(
        &self,
        state: NormalizedStore,
        action: &ReducerAction<'_>,
    ) -> CacheResult<NormalizedStore>;
}

impl<F> ResultReducer for F
where
    F: Fn(NormalizedStore, &ReducerAction<'_>) -> CacheResult<NormalizedStore> + Send + Sync,
{
    fn reduce(
        &self,
        state: NormalizedStore,
        action: &ReducerAction<'_>,
    ) -> CacheResult<NormalizedStore> {
        self(state, action)
    }
}

/// Registered reducers, by tag.
#[derive(Clone, Default)]
pub struct ReducerRegistry {
    reducers: FxHashMap<String, Arc<dyn ResultReducer>>,
}

impl fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.reducers.keys()).finish()
    }
}

impl ReducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reducer.
    pub fn register(mut self, tag: impl Into<String>, reducer: impl ResultReducer + 'static) -> Self {
        self.reducers.insert(tag.into(), Arc::new(reducer));
        self
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<dyn ResultReducer>> {
        self.reducers.get(tag)
    }
}

/// A mutation response plus the edits it requests.
#[derive(Debug, Clone, Copy)]
pub struct MutationResult<'a> {
    pub mutation_id: &'a str,
    pub result: &'a Map<String, JsonValue>,
    pub patch_operations: &'a [PatchOperation],
}

/// Merges mutation results into a store.
#[derive(Debug, Clone, Copy)]
pub struct MutationIntegrator<'c> {
    config: &'c CacheConfig,
    reducers: &'c ReducerRegistry,
}

impl<'c> MutationIntegrator<'c> {
    pub fn new(config: &'c CacheConfig, reducers: &'c ReducerRegistry) -> Self {
        Self { config, reducers }
    }

    /// Returns `store` with the mutation integrated. `store` itself is never
    /// modified, so a failure leaves it exactly as it was.
    pub fn integrate(
        &self,
        store: &NormalizedStore,
        ctx: &QueryContext<'_>,
        mutation: &MutationResult<'_>,
    ) -> CacheResult<NormalizedStore> {
        let mut next = store.clone();
        StoreWriter::new(self.config).write(&mut next, ctx, mutation.result)?;

        for operation in mutation.patch_operations {
            match operation {
                PatchOperation::ArrayInsert {
                    result_path,
                    store_path,
                    position,
                } => {
                    let value = self.value_at_result_path(&next, ctx, result_path)?;
                    let list = list_at_mut(&mut next, store_path)?;
                    match position {
                        ArrayPosition::Prepend => list.insert(0, value),
                        ArrayPosition::Append => list.push(value),
                    }
                    debug!(path = %store_path, ?position, "inserted mutation result into list");
                }
                PatchOperation::Delete { data_id } => {
                    if next.remove(data_id).is_none() {
                        debug!(data_id = %data_id, "delete of unknown record");
                    }
                }
                PatchOperation::ArrayDelete {
                    store_path,
                    data_id,
                } => {
                    let list = list_at_mut(&mut next, store_path)?;
                    list.retain(|item| item.as_reference().map_or(true, |r| &r.id != data_id));
                }
                PatchOperation::Custom { .. } => {}
            }
        }

        for operation in mutation.patch_operations {
            let PatchOperation::Custom { tag } = operation else {
                continue;
            };
            let reducer = self
                .reducers
                .get(tag)
                .ok_or_else(|| CacheError::UnknownReducer(tag.clone()))?;
            let action = ReducerAction {
                tag,
                mutation_id: mutation.mutation_id,
                result: mutation.result,
                variables: &ctx.variables,
            };
            next = reducer.reduce(next, &action)?;
        }

        Ok(next)
    }

    /// Follows response keys from the context root to a stored value.
    fn value_at_result_path(
        &self,
        store: &NormalizedStore,
        ctx: &QueryContext<'_>,
        result_path: &[String],
    ) -> CacheResult<StoreValue> {
        let invalid = |reason: String| CacheError::InvalidStorePath {
            path: result_path.join("."),
            reason,
        };

        let mut data_id = ctx.root_id.clone();
        let mut selection_set = ctx.selection_set;
        let mut value = None;

        for (depth, segment) in result_path.iter().enumerate() {
            let record = store
                .get(&data_id)
                .ok_or_else(|| invalid(format!("no record `{data_id}`")))?;
            let field = find_field(ctx, selection_set, segment)
                .ok_or_else(|| invalid(format!("`{segment}` is not selected")))?;
            let storage_key = self.config.storage_keys.storage_key(field, &ctx.variables);
            let found = record
                .get(&storage_key)
                .ok_or_else(|| invalid(format!("`{storage_key}` missing on `{data_id}`")))?;

            if depth + 1 < result_path.len() {
                let reference = found
                    .as_reference()
                    .ok_or_else(|| invalid(format!("`{segment}` is not an object")))?;
                selection_set = field
                    .selection_set
                    .as_ref()
                    .ok_or_else(|| invalid(format!("`{segment}` has no selection set")))?;
                data_id = reference.id.clone();
            }
            value = Some(found.clone());
        }

        value.ok_or_else(|| invalid("empty result path".into()))
    }
}

/// Finds the field with `response_key`, looking through fragments.
fn find_field<'q>(
    ctx: &QueryContext<'q>,
    selection_set: &'q SelectionSet,
    response_key: &str,
) -> Option<&'q Field> {
    selection_set
        .selections
        .iter()
        .find_map(|selection| match selection {
            Selection::Field(field) if field.response_key() == response_key => Some(field),
            Selection::Field(_) => None,
            Selection::InlineFragment(inline) => {
                find_field(ctx, &inline.selection_set, response_key)
            }
            Selection::FragmentSpread(spread) => ctx
                .fragments
                .get(spread.name.as_str())
                .and_then(|fragment| find_field(ctx, &fragment.selection_set, response_key)),
        })
}

/// Resolves a store path to the list it names.
fn list_at_mut<'s>(
    store: &'s mut NormalizedStore,
    path: &StorePath,
) -> CacheResult<&'s mut Vec<StoreValue>> {
    let invalid = |reason: String| CacheError::InvalidStorePath {
        path: path.to_string(),
        reason,
    };

    let (last, intermediate) = path
        .keys
        .split_last()
        .ok_or_else(|| invalid("path has no keys".into()))?;

    let mut data_id = path.data_id.clone();
    for key in intermediate {
        let record = store
            .get(&data_id)
            .ok_or_else(|| invalid(format!("no record `{data_id}`")))?;
        let reference = record
            .get(key)
            .and_then(StoreValue::as_reference)
            .ok_or_else(|| invalid(format!("`{key}` on `{data_id}` is not a reference")))?;
        data_id = reference.id.clone();
    }

    let record = store
        .get_mut(&data_id)
        .ok_or_else(|| invalid(format!("no record `{data_id}`")))?;
    match record.get_mut(last) {
        Some(StoreValue::List(items)) => Ok(items),
        Some(_) => Err(invalid(format!("`{last}` on `{data_id}` is not a list"))),
        None => Err(invalid(format!("`{last}` missing on `{data_id}`"))),
    }
}
