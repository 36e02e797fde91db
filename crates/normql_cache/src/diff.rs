//! Classifies a query against the store and computes what is missing.
//!
//! The residual selection set keeps only the fields the store cannot
//! answer, with their aliases, arguments, directives and full
//! sub-selections. Named fragment spreads become inline fragments on the
//! fragment's type condition so the residual needs no fragment definitions.

use crate::config::CacheConfig;
use crate::query::QueryContext;
use crate::reader::StoreReader;
use crate::storage_key::resolve_arguments;
use crate::store::{StoreObject, StoreValue, StoreView};
use normql_core::{CacheError, CacheResult, Span};
use normql_syntax::{
    should_include, Definition, Document, InlineFragment, OperationDefinition, Selection,
    SelectionSet,
};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

/// Options for [`DiffEngine::diff`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Return the resolvable part of the result even when fields are missing.
    pub allow_partial: bool,
}

impl DiffOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_partial(mut self, allow: bool) -> Self {
        self.allow_partial = allow;
        self
    }
}

/// The outcome of a diff.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    /// True when the store fully answers the query.
    pub complete: bool,
    /// The result, when complete or when partial results are allowed.
    pub result: Option<Map<String, JsonValue>>,
    /// What to fetch. `None` when complete.
    pub missing_selection_set: Option<SelectionSet>,
    /// The missing fields and dangling references found by the read.
    pub missing: Vec<CacheError>,
}

impl DiffResult {
    /// Wraps the residual into a standalone document for `operation`,
    /// keeping its type, name and variable definitions.
    pub fn residual_document(&self, operation: &OperationDefinition) -> Option<Document> {
        let selection_set = self.missing_selection_set.clone()?;
        Some(Document::new(vec![Definition::Operation(
            OperationDefinition {
                operation: operation.operation,
                name: operation.name.clone(),
                variables: operation.variables.clone(),
                directives: operation.directives.clone(),
                selection_set,
                span: Span::SYNTHETIC,
            },
        )]))
    }
}

/// Computes diffs between queries and the store.
#[derive(Debug, Clone, Copy)]
pub struct DiffEngine<'c> {
    config: &'c CacheConfig,
}

impl<'c> DiffEngine<'c> {
    pub fn new(config: &'c CacheConfig) -> Self {
        Self { config }
    }

    /// Diffs the context's selection set against `view`.
    pub fn diff(
        &self,
        view: &dyn StoreView,
        ctx: &QueryContext<'_>,
        options: DiffOptions,
    ) -> CacheResult<DiffResult> {
        let partial = StoreReader::new(self.config).read_partial(view, ctx)?;
        if partial.is_complete() {
            return Ok(DiffResult {
                complete: true,
                result: Some(partial.data),
                missing_selection_set: None,
                missing: Vec::new(),
            });
        }

        let root = view.get(&ctx.root_id);
        let selections =
            self.missing_in_object(view, ctx, &ctx.root_id, root.as_deref(), ctx.selection_set)?;
        debug!(
            root_id = %ctx.root_id,
            missing = partial.missing.len(),
            residual_selections = selections.len(),
            "query not fully cached"
        );

        Ok(DiffResult {
            complete: false,
            result: options.allow_partial.then_some(partial.data),
            missing_selection_set: Some(SelectionSet::new(selections)),
            missing: partial.missing,
        })
    }

    fn missing_in_object(
        &self,
        view: &dyn StoreView,
        ctx: &QueryContext<'_>,
        data_id: &str,
        record: Option<&StoreObject>,
        selection_set: &SelectionSet,
    ) -> CacheResult<Vec<Selection>> {
        let typename = record.and_then(StoreObject::typename);
        let mut residual = Vec::new();

        for selection in &selection_set.selections {
            if !should_include(selection.directives(), &ctx.variables)? {
                continue;
            }

            match selection {
                Selection::Field(field) => {
                    let Some(record) = record else {
                        residual.push(inline_spreads(ctx, selection, &mut Vec::new())?);
                        continue;
                    };

                    let resolved = self
                        .config
                        .resolver_for(data_id, record, &field.name)
                        .and_then(|resolver| {
                            resolver.resolve(record, &resolve_arguments(field, &ctx.variables))
                        });
                    let storage_key = self.config.storage_keys.storage_key(field, &ctx.variables);
                    let Some(value) = resolved.as_ref().or_else(|| record.get(&storage_key))
                    else {
                        residual.push(inline_spreads(ctx, selection, &mut Vec::new())?);
                        continue;
                    };

                    if let Some(sub_selection) = &field.selection_set {
                        let missing = self.missing_in_value(view, ctx, value, sub_selection)?;
                        if !missing.is_empty() {
                            residual.push(Selection::Field(
                                field.with_selection_set(Some(SelectionSet::new(missing))),
                            ));
                        }
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let fragment = ctx.fragment(&spread.name)?;
                    if !self.config.fragment_matcher.matches(
                        &fragment.type_condition,
                        typename,
                        data_id,
                    ) {
                        continue;
                    }
                    let missing = self.missing_in_object(
                        view,
                        ctx,
                        data_id,
                        record,
                        &fragment.selection_set,
                    )?;
                    if !missing.is_empty() {
                        residual.push(Selection::InlineFragment(InlineFragment {
                            type_condition: Some(fragment.type_condition.clone()),
                            directives: spread.directives.clone(),
                            selection_set: SelectionSet::new(missing),
                            span: spread.span,
                        }));
                    }
                }
                Selection::InlineFragment(inline) => {
                    let applies = inline.type_condition.as_deref().map_or(true, |condition| {
                        self.config
                            .fragment_matcher
                            .matches(condition, typename, data_id)
                    });
                    if !applies {
                        continue;
                    }
                    let missing =
                        self.missing_in_object(view, ctx, data_id, record, &inline.selection_set)?;
                    if !missing.is_empty() {
                        residual.push(Selection::InlineFragment(InlineFragment {
                            selection_set: SelectionSet::new(missing),
                            ..inline.clone()
                        }));
                    }
                }
            }
        }

        Ok(residual)
    }

    fn missing_in_value(
        &self,
        view: &dyn StoreView,
        ctx: &QueryContext<'_>,
        value: &StoreValue,
        selection_set: &SelectionSet,
    ) -> CacheResult<Vec<Selection>> {
        match value {
            StoreValue::Scalar(_) | StoreValue::Json(_) => Ok(Vec::new()),
            StoreValue::List(items) => {
                let mut union: Vec<Selection> = Vec::new();
                for item in items {
                    for selection in self.missing_in_value(view, ctx, item, selection_set)? {
                        if !union.contains(&selection) {
                            union.push(selection);
                        }
                    }
                }
                Ok(union)
            }
            StoreValue::Reference(id) => match view.get(&id.id) {
                // Dangling: refetch the whole sub-selection.
                None => selection_set
                    .selections
                    .iter()
                    .map(|selection| inline_spreads(ctx, selection, &mut Vec::new()))
                    .collect(),
                Some(record) => {
                    self.missing_in_object(view, ctx, &id.id, Some(&*record), selection_set)
                }
            },
        }
    }
}

/// Copies `selection` with every named spread below it replaced by an
/// inline fragment on the fragment's type condition.
fn inline_spreads<'q>(
    ctx: &QueryContext<'q>,
    selection: &Selection,
    active: &mut Vec<&'q str>,
) -> CacheResult<Selection> {
    let inline_set = |set: &SelectionSet, active: &mut Vec<&'q str>| {
        set.selections
            .iter()
            .map(|selection| inline_spreads(ctx, selection, active))
            .collect::<CacheResult<Vec<_>>>()
            .map(SelectionSet::new)
    };

    match selection {
        Selection::Field(field) => {
            let selection_set = match &field.selection_set {
                Some(set) => Some(inline_set(set, active)?),
                None => None,
            };
            Ok(Selection::Field(field.with_selection_set(selection_set)))
        }
        Selection::InlineFragment(inline) => Ok(Selection::InlineFragment(InlineFragment {
            selection_set: inline_set(&inline.selection_set, active)?,
            ..inline.clone()
        })),
        Selection::FragmentSpread(spread) => {
            let fragment = ctx.fragment(&spread.name)?;
            if active.contains(&fragment.name.as_str()) {
                return Err(CacheError::malformed(format!(
                    "fragment `{}` spreads itself",
                    fragment.name
                )));
            }
            active.push(fragment.name.as_str());
            let selection_set = inline_set(&fragment.selection_set, active)?;
            active.pop();
            Ok(Selection::InlineFragment(InlineFragment {
                type_condition: Some(fragment.type_condition.clone()),
                directives: spread.directives.clone(),
                selection_set,
                span: spread.span,
            }))
        }
    }
}
