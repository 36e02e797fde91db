//! Decides whether a type-conditional fragment applies to an object.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// Matches fragment type conditions against an object's `__typename`.
pub trait FragmentMatcher: Send + Sync {
    /// Returns true if a fragment on `type_condition` applies to the object
    /// identified by `data_id` whose concrete type is `typename`.
    fn matches(&self, type_condition: &str, typename: Option<&str>, data_id: &str) -> bool;
}

/// Exact type-name matching.
///
/// Objects without a `__typename` match every fragment; the approximation is
/// logged because interface or union conditions cannot be checked this way.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicFragmentMatcher;

impl FragmentMatcher for HeuristicFragmentMatcher {
    fn matches(&self, type_condition: &str, typename: Option<&str>, data_id: &str) -> bool {
        match typename {
            Some(typename) => typename == type_condition,
            None => {
                debug!(
                    data_id,
                    type_condition, "no __typename on object, matching fragment heuristically"
                );
                true
            }
        }
    }
}

/// Matches interface and union conditions using a possible-types table.
#[derive(Debug, Clone, Default)]
pub struct PossibleTypesMatcher {
    possible_types: FxHashMap<String, FxHashSet<String>>,
}

impl PossibleTypesMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the concrete types of an abstract type.
    pub fn possible_types<I, S>(mut self, abstract_type: impl Into<String>, concrete: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.possible_types
            .entry(abstract_type.into())
            .or_default()
            .extend(concrete.into_iter().map(Into::into));
        self
    }
}

impl FragmentMatcher for PossibleTypesMatcher {
    fn matches(&self, type_condition: &str, typename: Option<&str>, data_id: &str) -> bool {
        let Some(typename) = typename else {
            return HeuristicFragmentMatcher.matches(type_condition, None, data_id);
        };
        typename == type_condition
            || self
                .possible_types
                .get(type_condition)
                .is_some_and(|types| types.contains(typename))
    }
}

/// Matches every fragment.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveFragmentMatcher;

impl FragmentMatcher for PermissiveFragmentMatcher {
    fn matches(&self, _type_condition: &str, _typename: Option<&str>, _data_id: &str) -> bool {
        true
    }
}
