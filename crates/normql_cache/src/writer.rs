//! Normalization of response trees into store records.

use crate::config::CacheConfig;
use crate::query::QueryContext;
use crate::store::{IdValue, NormalizedStore, StorePatch, StoreValue, StoreView, TYPENAME_KEY};
use normql_core::CacheResult;
use normql_syntax::{should_include, Field, Selection, SelectionSet};
use serde_json::{Map, Value as JsonValue};
use std::borrow::Cow;
use std::fmt::Write as _;
use tracing::{debug, trace};

/// Writes response trees into a store.
#[derive(Debug, Clone, Copy)]
pub struct StoreWriter<'c> {
    config: &'c CacheConfig,
}

struct WriteState<'w, 'q> {
    base: &'w dyn StoreView,
    ctx: &'w QueryContext<'q>,
    patch: StorePatch,
}

impl<'c> StoreWriter<'c> {
    pub fn new(config: &'c CacheConfig) -> Self {
        Self { config }
    }

    /// Normalizes `result` against `base`, returning the changes as a patch.
    ///
    /// `base` is only consulted (for slot reuse and identity merges); the
    /// caller decides where the patch is applied.
    pub fn normalize(
        &self,
        base: &dyn StoreView,
        ctx: &QueryContext<'_>,
        result: &Map<String, JsonValue>,
    ) -> CacheResult<StorePatch> {
        let mut state = WriteState {
            base,
            ctx,
            patch: StorePatch::new(),
        };
        self.write_object(&mut state, &ctx.root_id, result, ctx.selection_set)?;
        Ok(state.patch)
    }

    /// Normalizes `result` and merges it into `store`. Nothing is written if
    /// normalization fails.
    pub fn write(
        &self,
        store: &mut NormalizedStore,
        ctx: &QueryContext<'_>,
        result: &Map<String, JsonValue>,
    ) -> CacheResult<()> {
        let patch = self.normalize(&*store, ctx, result)?;
        debug!(
            root_id = %ctx.root_id,
            records = patch.records.len(),
            tombstones = patch.tombstones.len(),
            "writing response to store"
        );
        store.apply_patch(&patch);
        Ok(())
    }

    fn write_object(
        &self,
        st: &mut WriteState<'_, '_>,
        data_id: &str,
        object: &Map<String, JsonValue>,
        selection_set: &SelectionSet,
    ) -> CacheResult<()> {
        let typename = object
            .get(TYPENAME_KEY)
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .or_else(|| {
                st.base
                    .get(data_id)
                    .and_then(|record| record.typename().map(str::to_string))
            });

        for selection in &selection_set.selections {
            if !should_include(selection.directives(), &st.ctx.variables)? {
                continue;
            }

            match selection {
                Selection::Field(field) => {
                    let Some(value) = object.get(field.response_key()) else {
                        trace!(data_id, field = field.response_key(), "field absent from response");
                        continue;
                    };
                    let storage_key = self
                        .config
                        .storage_keys
                        .storage_key(field, &st.ctx.variables);
                    let existing = st
                        .base
                        .get(data_id)
                        .and_then(|record| record.get(&storage_key).cloned());

                    let stored = self.write_value(
                        st,
                        data_id,
                        &storage_key,
                        &[],
                        field,
                        value,
                        existing.as_ref(),
                    )?;
                    trace!(data_id, storage_key = %storage_key, "write field");
                    st.patch.set_field(data_id, storage_key, stored);
                }
                Selection::FragmentSpread(spread) => {
                    let fragment = st.ctx.fragment(&spread.name)?;
                    if self.config.fragment_matcher.matches(
                        &fragment.type_condition,
                        typename.as_deref(),
                        data_id,
                    ) {
                        self.write_object(st, data_id, object, &fragment.selection_set)?;
                    }
                }
                Selection::InlineFragment(inline) => {
                    let applies = match &inline.type_condition {
                        Some(condition) => self.config.fragment_matcher.matches(
                            condition,
                            typename.as_deref(),
                            data_id,
                        ),
                        None => true,
                    };
                    if applies {
                        self.write_object(st, data_id, object, &inline.selection_set)?;
                    }
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_value(
        &self,
        st: &mut WriteState<'_, '_>,
        parent_id: &str,
        storage_key: &str,
        indices: &[usize],
        field: &Field,
        value: &JsonValue,
        existing: Option<&StoreValue>,
    ) -> CacheResult<StoreValue> {
        let Some(selection_set) = &field.selection_set else {
            return Ok(StoreValue::from_plain(value));
        };

        match value {
            JsonValue::Null => Ok(StoreValue::null()),
            JsonValue::Array(items) => {
                let existing_items = existing.and_then(StoreValue::as_list);
                let mut stored = Vec::with_capacity(items.len());
                let mut path = indices.to_vec();
                for (index, item) in items.iter().enumerate() {
                    path.push(index);
                    stored.push(self.write_value(
                        st,
                        parent_id,
                        storage_key,
                        &path,
                        field,
                        item,
                        existing_items.and_then(|slots| slots.get(index)),
                    )?);
                    path.pop();
                }
                Ok(StoreValue::List(stored))
            }
            JsonValue::Object(object) => {
                let path_id = generated_id(parent_id, storage_key, indices);
                let id = self.identify(st, object, path_id, existing);
                self.write_object(st, &id.id, object, selection_set)?;
                Ok(StoreValue::Reference(id))
            }
            scalar => Ok(StoreValue::Scalar(scalar.clone())),
        }
    }

    /// Picks the identity of a nested object.
    fn identify(
        &self,
        st: &mut WriteState<'_, '_>,
        object: &Map<String, JsonValue>,
        path_id: String,
        existing: Option<&StoreValue>,
    ) -> IdValue {
        let typename = object
            .get(TYPENAME_KEY)
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let previous = existing.and_then(StoreValue::as_reference);

        match (self.config.data_id(object), previous) {
            (Some(real), previous) => {
                if let Some(previous) = previous.filter(|p| p.generated && p.id != real) {
                    self.absorb_generated(st, &previous.id, &real);
                }
                IdValue {
                    id: real,
                    generated: false,
                    typename,
                }
            }
            // The slot already points at an entity of the same type: keep
            // writing into it.
            (None, Some(previous))
                if previous.generated || self.same_type(st, previous, typename.as_deref()) =>
            {
                IdValue {
                    id: previous.id.clone(),
                    generated: previous.generated,
                    typename: typename.or_else(|| previous.typename.clone()),
                }
            }
            (None, _) => IdValue {
                id: path_id,
                generated: true,
                typename,
            },
        }
    }

    /// Whether an anonymous object typed `incoming` may be written into the
    /// real entity `previous`. Unknown types on either side are compatible.
    fn same_type(
        &self,
        st: &WriteState<'_, '_>,
        previous: &IdValue,
        incoming: Option<&str>,
    ) -> bool {
        let Some(incoming) = incoming else {
            return true;
        };
        let stored = previous.typename.clone().or_else(|| {
            st.base
                .get(&previous.id)
                .and_then(|record| record.typename().map(str::to_string))
        });
        stored.map_or(true, |stored| stored == incoming)
    }

    /// Folds a generated record into the real record replacing it.
    /// Fields already on the real record win.
    fn absorb_generated(&self, st: &mut WriteState<'_, '_>, generated_id: &str, real_id: &str) {
        let Some(generated) = st.base.get(generated_id).map(Cow::into_owned) else {
            return;
        };
        let real = st.base.get(real_id).map(Cow::into_owned).unwrap_or_default();

        for (key, value) in generated.iter() {
            let pending = st
                .patch
                .records
                .get(real_id)
                .is_some_and(|record| record.contains_key(key));
            match (value, real.get(key)) {
                (_, None) if !pending => st.patch.set_field(real_id, key.clone(), value.clone()),
                (StoreValue::Reference(child), Some(StoreValue::Reference(real_child)))
                    if child.generated && child.id != real_child.id =>
                {
                    self.absorb_generated(st, &child.id, &real_child.id);
                }
                _ => {}
            }
        }

        st.patch.tombstone(generated_id);
        debug!(generated_id, real_id, "merged generated record into real identity");
    }
}

/// Builds a path-derived identity key. Generated parents are not re-prefixed.
pub fn generated_id(parent_id: &str, storage_key: &str, indices: &[usize]) -> String {
    let mut id = String::with_capacity(parent_id.len() + storage_key.len() + 2);
    if !parent_id.starts_with('$') {
        id.push('$');
    }
    id.push_str(parent_id);
    id.push('.');
    id.push_str(storage_key);
    for index in indices {
        let _ = write!(id, ".{index}");
    }
    id
}
