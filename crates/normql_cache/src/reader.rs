//! Resolution of selection sets against the store.

use crate::config::CacheConfig;
use crate::query::QueryContext;
use crate::storage_key::resolve_arguments;
use crate::store::{StoreObject, StoreValue, StoreView};
use normql_core::{CacheError, CacheResult};
use normql_syntax::{should_include, Field, Selection, SelectionSet};
use serde_json::{Map, Value as JsonValue};
use std::borrow::Cow;
use tracing::trace;

/// A read that tolerated missing data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartialRead {
    /// Everything that could be resolved. Missing fields are absent.
    pub data: Map<String, JsonValue>,
    /// `MissingField` and `DanglingReference` errors met along the way.
    pub missing: Vec<CacheError>,
}

impl PartialRead {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Reads result trees out of a store.
#[derive(Debug, Clone, Copy)]
pub struct StoreReader<'c> {
    config: &'c CacheConfig,
}

struct ReadState<'r, 'q> {
    view: &'r dyn StoreView,
    ctx: &'r QueryContext<'q>,
    /// `Some` when missing data is collected instead of failing the read.
    missing: Option<Vec<CacheError>>,
}

impl ReadState<'_, '_> {
    fn report(&mut self, error: CacheError) -> CacheResult<()> {
        match &mut self.missing {
            Some(missing) if error.is_missing_data() => {
                missing.push(error);
                Ok(())
            }
            _ => Err(error),
        }
    }
}

impl<'c> StoreReader<'c> {
    pub fn new(config: &'c CacheConfig) -> Self {
        Self { config }
    }

    /// Reads the selection set, failing on the first missing field or
    /// dangling reference.
    pub fn read(
        &self,
        view: &dyn StoreView,
        ctx: &QueryContext<'_>,
    ) -> CacheResult<Map<String, JsonValue>> {
        let mut state = ReadState {
            view,
            ctx,
            missing: None,
        };
        self.read_root(&mut state)
    }

    /// Reads as much of the selection set as the store holds.
    pub fn read_partial(
        &self,
        view: &dyn StoreView,
        ctx: &QueryContext<'_>,
    ) -> CacheResult<PartialRead> {
        let mut state = ReadState {
            view,
            ctx,
            missing: Some(Vec::new()),
        };
        let data = self.read_root(&mut state)?;
        Ok(PartialRead {
            data,
            missing: state.missing.unwrap_or_default(),
        })
    }

    fn read_root(&self, st: &mut ReadState<'_, '_>) -> CacheResult<Map<String, JsonValue>> {
        let view = st.view;
        let ctx = st.ctx;
        // A missing root behaves like an empty record.
        let root = view
            .get(&ctx.root_id)
            .unwrap_or_else(|| Cow::Owned(StoreObject::new()));

        let mut out = Map::new();
        self.read_object(st, &ctx.root_id, &root, ctx.selection_set, &mut out)?;
        Ok(out)
    }

    fn read_object(
        &self,
        st: &mut ReadState<'_, '_>,
        data_id: &str,
        record: &StoreObject,
        selection_set: &SelectionSet,
        out: &mut Map<String, JsonValue>,
    ) -> CacheResult<()> {
        for selection in &selection_set.selections {
            if !should_include(selection.directives(), &st.ctx.variables)? {
                continue;
            }

            match selection {
                Selection::Field(field) => {
                    let Some(value) = self.field_value(st, data_id, record, field) else {
                        let storage_key = self
                            .config
                            .storage_keys
                            .storage_key(field, &st.ctx.variables);
                        st.report(CacheError::missing_field(storage_key, data_id))?;
                        continue;
                    };

                    if let Some(json) = self.read_value(st, field, &value)? {
                        match out.get_mut(field.response_key()) {
                            Some(slot) => merge_values(slot, json),
                            None => {
                                out.insert(field.response_key().to_string(), json);
                            }
                        }
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let fragment = st.ctx.fragment(&spread.name)?;
                    if self.config.fragment_matcher.matches(
                        &fragment.type_condition,
                        record.typename(),
                        data_id,
                    ) {
                        self.read_object(st, data_id, record, &fragment.selection_set, out)?;
                    }
                }
                Selection::InlineFragment(inline) => {
                    let applies = inline.type_condition.as_deref().map_or(true, |condition| {
                        self.config
                            .fragment_matcher
                            .matches(condition, record.typename(), data_id)
                    });
                    if applies {
                        self.read_object(st, data_id, record, &inline.selection_set, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// The value a field resolves to: a custom resolver's answer, or the slot.
    fn field_value<'v>(
        &self,
        st: &ReadState<'_, '_>,
        data_id: &str,
        record: &'v StoreObject,
        field: &Field,
    ) -> Option<Cow<'v, StoreValue>> {
        if let Some(resolver) = self.config.resolver_for(data_id, record, &field.name) {
            let args = resolve_arguments(field, &st.ctx.variables);
            if let Some(value) = resolver.resolve(record, &args) {
                trace!(data_id, field = %field.name, "field served by custom resolver");
                return Some(Cow::Owned(value));
            }
        }
        let storage_key = self
            .config
            .storage_keys
            .storage_key(field, &st.ctx.variables);
        record.get(&storage_key).map(Cow::Borrowed)
    }

    /// Converts a stored value to JSON. `None` means a dangling reference was
    /// tolerated and the value should be left out.
    fn read_value(
        &self,
        st: &mut ReadState<'_, '_>,
        field: &Field,
        value: &StoreValue,
    ) -> CacheResult<Option<JsonValue>> {
        match value {
            StoreValue::Scalar(v) | StoreValue::Json(v) => Ok(Some(v.clone())),
            StoreValue::List(items) => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    list.push(self.read_value(st, field, item)?.unwrap_or(JsonValue::Null));
                }
                Ok(Some(JsonValue::Array(list)))
            }
            StoreValue::Reference(id) => {
                let view = st.view;
                let Some(record) = view.get(&id.id) else {
                    st.report(CacheError::dangling(&id.id))?;
                    return Ok(None);
                };
                match &field.selection_set {
                    Some(selection_set) => {
                        let mut nested = Map::new();
                        self.read_object(st, &id.id, &record, selection_set, &mut nested)?;
                        Ok(Some(JsonValue::Object(nested)))
                    }
                    None => Ok(Some(JsonValue::from(value.clone()))),
                }
            }
        }
    }
}

/// Merges a field read through several selections into one response value.
fn merge_values(target: &mut JsonValue, incoming: JsonValue) {
    match (target, incoming) {
        (JsonValue::Object(existing), JsonValue::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (JsonValue::Array(existing), JsonValue::Array(incoming))
            if existing.len() == incoming.len() =>
        {
            for (slot, value) in existing.iter_mut().zip(incoming) {
                merge_values(slot, value);
            }
        }
        (target, incoming) => *target = incoming,
    }
}
