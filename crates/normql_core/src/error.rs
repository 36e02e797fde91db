//! Error taxonomy shared by the normalized cache.

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised while writing, reading, diffing or patching the store.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CacheError {
    /// The selection set or document cannot be evaluated as given.
    #[error("malformed query: {0}")]
    #[diagnostic(code(normql::malformed_query))]
    MalformedQuery(String),

    /// A requested field has no slot in its entity record.
    #[error("can't find field `{field}` on object `{data_id}`")]
    #[diagnostic(code(normql::missing_field))]
    MissingField {
        /// Storage key that was looked up.
        field: String,
        /// Identity key of the record that lacked it.
        data_id: String,
    },

    /// A reference points at an identity key with no record.
    #[error("reference to `{id}` has no record in the store")]
    #[diagnostic(
        code(normql::dangling_reference),
        help("the entity was deleted or the store was only partially restored")
    )]
    DanglingReference {
        /// The unresolved identity key.
        id: String,
    },

    /// A store path did not lead to a list.
    #[error("invalid store path `{path}`: {reason}")]
    #[diagnostic(code(normql::invalid_store_path))]
    InvalidStorePath {
        /// Rendered path.
        path: String,
        /// What went wrong along it.
        reason: String,
    },

    /// A custom patch operation names a reducer nobody registered.
    #[error("no result reducer registered for `{0}`")]
    #[diagnostic(code(normql::unknown_reducer))]
    UnknownReducer(String),

    /// A custom reducer rejected the mutation result.
    #[error("result reducer `{tag}` failed: {message}")]
    #[diagnostic(code(normql::reducer))]
    Reducer {
        /// Reducer tag.
        tag: String,
        /// Reducer-provided message.
        message: String,
    },

    /// A persisted store value has an unrecognized shape.
    #[error("invalid store value: {0}")]
    #[diagnostic(code(normql::invalid_store_value))]
    InvalidStoreValue(String),
}

impl CacheError {
    /// Creates a malformed query error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedQuery(message.into())
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>, data_id: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
            data_id: data_id.into(),
        }
    }

    /// Creates a dangling reference error.
    pub fn dangling(id: impl Into<String>) -> Self {
        Self::DanglingReference { id: id.into() }
    }

    /// Returns true for errors a diff can recover from by refetching.
    #[must_use]
    pub fn is_missing_data(&self) -> bool {
        matches!(self, Self::MissingField { .. } | Self::DanglingReference { .. })
    }
}

/// Result alias for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
