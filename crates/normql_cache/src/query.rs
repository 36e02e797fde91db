//! The evaluation context shared by the write, read and diff walks.

use crate::config::root_id;
use normql_core::{CacheError, CacheResult};
use normql_syntax::{
    create_fragment_map, get_operation_definition, variables_with_defaults, Document,
    FragmentDefinition, FragmentMap, OperationDefinition, SelectionSet, Variables,
};

/// A selection set together with the fragments and variables it is
/// evaluated under.
#[derive(Debug, Clone)]
pub struct QueryContext<'a> {
    pub selection_set: &'a SelectionSet,
    pub fragments: FragmentMap<'a>,
    /// Variables with operation defaults applied.
    pub variables: Variables,
    /// Root record the selection set starts from.
    pub root_id: String,
}

impl<'a> QueryContext<'a> {
    pub fn new(
        selection_set: &'a SelectionSet,
        fragments: FragmentMap<'a>,
        variables: Variables,
        root_id: impl Into<String>,
    ) -> Self {
        Self {
            selection_set,
            fragments,
            variables,
            root_id: root_id.into(),
        }
    }

    /// Builds the context for an operation of `document`.
    pub fn operation(
        document: &'a Document,
        operation_name: Option<&str>,
        variables: &Variables,
    ) -> CacheResult<Self> {
        let operation = get_operation_definition(document, operation_name)?;
        Ok(Self::for_definition(document, operation, variables))
    }

    /// Builds the context for an already-selected operation.
    pub fn for_definition(
        document: &'a Document,
        operation: &'a OperationDefinition,
        variables: &Variables,
    ) -> Self {
        Self {
            selection_set: &operation.selection_set,
            fragments: create_fragment_map(document),
            variables: variables_with_defaults(operation, variables),
            root_id: root_id(operation.operation).to_string(),
        }
    }

    /// Re-roots the context at another record.
    pub fn rooted_at(mut self, root_id: impl Into<String>) -> Self {
        self.root_id = root_id.into();
        self
    }

    /// Looks up a fragment used by a spread.
    pub fn fragment(&self, name: &str) -> CacheResult<&'a FragmentDefinition> {
        self.fragments
            .get(name)
            .copied()
            .ok_or_else(|| CacheError::malformed(format!("no fragment named `{name}`")))
    }
}
