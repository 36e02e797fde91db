//! Normalized client-side cache for normql.
//!
//! This crate provides:
//! - `store`: Records, references, patches and layered views
//! - `storage_key`: Field storage-key derivation
//! - `fragment_matcher`: Type-condition matching
//! - `config`: Identity function, resolvers and cache configuration
//! - `query`: Evaluation context for selection sets
//! - `writer`: Normalization of response trees
//! - `reader`: Resolution of selection sets against the store
//! - `diff`: Missing-data classification and residual queries
//! - `optimistic`: Optimistic patch stack
//! - `mutation`: Mutation-result integration
//! - `cache`: Shared async handle

pub mod cache;
pub mod config;
pub mod diff;
pub mod fragment_matcher;
pub mod mutation;
pub mod optimistic;
pub mod query;
pub mod reader;
pub mod storage_key;
pub mod store;
pub mod writer;

pub use cache::{CacheState, SharedCache};
pub use config::{
    default_data_id, root_id, CacheConfig, DataIdFn, FieldResolver, ROOT_MUTATION, ROOT_QUERY,
    ROOT_SUBSCRIPTION,
};
pub use diff::{DiffEngine, DiffOptions, DiffResult};
pub use fragment_matcher::{
    FragmentMatcher, HeuristicFragmentMatcher, PermissiveFragmentMatcher, PossibleTypesMatcher,
};
pub use mutation::{
    ArrayPosition, MutationIntegrator, MutationResult, PatchOperation, ReducerAction,
    ReducerRegistry, ResultReducer, StorePath,
};
pub use optimistic::{OptimisticEntry, OptimisticLayer};
pub use query::QueryContext;
pub use reader::{PartialRead, StoreReader};
pub use storage_key::{resolve_arguments, CanonicalStorageKeys, StorageKeyStrategy};
pub use store::{
    IdValue, LayeredStore, NormalizedStore, StoreObject, StorePatch, StoreValue, StoreView,
    TYPENAME_KEY,
};
pub use writer::{generated_id, StoreWriter};
