//! The shared, async handle over a store and its optimistic layer.

use crate::config::CacheConfig;
use crate::diff::{DiffEngine, DiffOptions, DiffResult};
use crate::mutation::{MutationIntegrator, MutationResult, PatchOperation, ReducerRegistry};
use crate::optimistic::OptimisticLayer;
use crate::query::QueryContext;
use crate::reader::StoreReader;
use crate::store::{NormalizedStore, StorePatch};
use crate::writer::StoreWriter;
use normql_core::{CacheError, CacheResult};
use normql_syntax::{add_typename_to_document, get_fragment_query_document, Document, Variables};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value as JsonValue};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// The base store plus the optimistic entries layered on it.
#[derive(Debug, Clone, Default)]
pub struct CacheState {
    pub store: NormalizedStore,
    pub optimistic: OptimisticLayer,
    /// What each optimistic entry was computed from.
    pending: FxHashMap<String, PendingMutation>,
}

/// A speculative mutation result, kept so its entry can be recomputed when
/// the store beneath it changes.
#[derive(Debug, Clone)]
struct PendingMutation {
    document: Document,
    variables: Variables,
    result: Map<String, JsonValue>,
    patch_operations: Vec<PatchOperation>,
}

struct Inner {
    config: CacheConfig,
    reducers: ReducerRegistry,
    state: RwLock<CacheState>,
    version: watch::Sender<u64>,
}

/// A cloneable handle to one cache.
///
/// Writes take the write lock and finish before any later read starts.
/// Every committed change bumps the version published by
/// [`subscribe`](Self::subscribe).
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCache")
            .field("config", &self.inner.config)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl SharedCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_reducers(config, ReducerRegistry::default())
    }

    /// Creates a cache whose mutations can use the given custom reducers.
    pub fn with_reducers(config: CacheConfig, reducers: ReducerRegistry) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                reducers,
                state: RwLock::new(CacheState::default()),
                version,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Current version. Starts at zero.
    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    /// Receives the version after every committed change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Applies the document transforms the configuration asks for.
    pub fn transform_document<'d>(&self, document: &'d Document) -> Cow<'d, Document> {
        if self.inner.config.add_typename {
            Cow::Owned(add_typename_to_document(document))
        } else {
            Cow::Borrowed(document)
        }
    }

    fn bump(&self) {
        self.inner.version.send_modify(|version| *version += 1);
    }

    /// Integrates `pending` against `before` and returns the difference.
    fn optimistic_patch(
        &self,
        before: &NormalizedStore,
        mutation_id: &str,
        pending: &PendingMutation,
    ) -> CacheResult<StorePatch> {
        let ctx = QueryContext::operation(&pending.document, None, &pending.variables)?;
        let after = MutationIntegrator::new(&self.inner.config, &self.inner.reducers).integrate(
            before,
            &ctx,
            &MutationResult {
                mutation_id,
                result: &pending.result,
                patch_operations: &pending.patch_operations,
            },
        )?;
        Ok(StorePatch::between(before, &after))
    }

    /// Recomputes every optimistic entry on top of `store`, bottom to top.
    ///
    /// An entry that no longer applies is dropped. If that entry is
    /// `required`, its error is returned instead.
    fn replay_optimistic(
        &self,
        store: &NormalizedStore,
        optimistic: &mut OptimisticLayer,
        pending: &mut FxHashMap<String, PendingMutation>,
        required: Option<&str>,
    ) -> Option<CacheError> {
        let mut failure = None;
        optimistic.rebase(store, |mutation_id, composite| {
            let recorded = pending.get(mutation_id)?;
            match self.optimistic_patch(composite, mutation_id, recorded) {
                Ok(patch) => Some(patch),
                Err(error) if required == Some(mutation_id) => {
                    failure = Some(error);
                    None
                }
                Err(error) => {
                    warn!(mutation_id, %error, "optimistic entry no longer applies");
                    None
                }
            }
        });
        pending.retain(|mutation_id, _| optimistic.contains(mutation_id));
        failure
    }

    /// Normalizes a response for the document's single operation into the
    /// base store.
    pub async fn write_query(
        &self,
        document: &Document,
        variables: &Variables,
        result: &Map<String, JsonValue>,
    ) -> CacheResult<()> {
        let document = self.transform_document(document);
        let ctx = QueryContext::operation(&document, None, variables)?;
        {
            let mut state = self.inner.state.write().await;
            StoreWriter::new(&self.inner.config).write(&mut state.store, &ctx, result)?;
        }
        self.bump();
        Ok(())
    }

    /// Reads a query. With `optimistic`, active optimistic entries are
    /// visible.
    pub async fn read_query(
        &self,
        document: &Document,
        variables: &Variables,
        optimistic: bool,
    ) -> CacheResult<Map<String, JsonValue>> {
        let document = self.transform_document(document);
        let ctx = QueryContext::operation(&document, None, variables)?;
        let state = self.inner.state.read().await;
        let reader = StoreReader::new(&self.inner.config);
        if optimistic {
            reader.read(&state.optimistic.read_through(&state.store), &ctx)
        } else {
            reader.read(&state.store, &ctx)
        }
    }

    /// Diffs a query against the store.
    pub async fn diff_query(
        &self,
        document: &Document,
        variables: &Variables,
        options: DiffOptions,
        optimistic: bool,
    ) -> CacheResult<DiffResult> {
        let document = self.transform_document(document);
        let ctx = QueryContext::operation(&document, None, variables)?;
        let state = self.inner.state.read().await;
        let engine = DiffEngine::new(&self.inner.config);
        if optimistic {
            engine.diff(&state.optimistic.read_through(&state.store), &ctx, options)
        } else {
            engine.diff(&state.store, &ctx, options)
        }
    }

    /// Reads a fragment rooted at the record `data_id`.
    pub async fn read_fragment(
        &self,
        document: &Document,
        fragment_name: Option<&str>,
        data_id: &str,
        variables: &Variables,
        optimistic: bool,
    ) -> CacheResult<Map<String, JsonValue>> {
        let query = get_fragment_query_document(document, fragment_name)?;
        let query = self.transform_document(&query);
        let ctx = QueryContext::operation(&query, None, variables)?.rooted_at(data_id);
        let state = self.inner.state.read().await;
        let reader = StoreReader::new(&self.inner.config);
        if optimistic {
            reader.read(&state.optimistic.read_through(&state.store), &ctx)
        } else {
            reader.read(&state.store, &ctx)
        }
    }

    /// Writes fragment data into the record `data_id`.
    pub async fn write_fragment(
        &self,
        document: &Document,
        fragment_name: Option<&str>,
        data_id: &str,
        variables: &Variables,
        data: &Map<String, JsonValue>,
    ) -> CacheResult<()> {
        let query = get_fragment_query_document(document, fragment_name)?;
        let query = self.transform_document(&query);
        let ctx = QueryContext::operation(&query, None, variables)?.rooted_at(data_id);
        {
            let mut state = self.inner.state.write().await;
            StoreWriter::new(&self.inner.config).write(&mut state.store, &ctx, data)?;
        }
        self.bump();
        Ok(())
    }

    /// Integrates a confirmed mutation result into the base store.
    ///
    /// An optimistic entry under the same id is removed in the same commit.
    pub async fn integrate_mutation(
        &self,
        document: &Document,
        variables: &Variables,
        mutation_id: &str,
        result: &Map<String, JsonValue>,
        patch_operations: &[PatchOperation],
    ) -> CacheResult<()> {
        let document = self.transform_document(document);
        let ctx = QueryContext::operation(&document, None, variables)?;
        let integrator = MutationIntegrator::new(&self.inner.config, &self.inner.reducers);
        let mutation = MutationResult {
            mutation_id,
            result,
            patch_operations,
        };

        {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            state.store = integrator.integrate(&state.store, &ctx, &mutation)?;
            state.optimistic.remove(mutation_id);
            state.pending.remove(mutation_id);
            self.replay_optimistic(&state.store, &mut state.optimistic, &mut state.pending, None);
        }
        info!(mutation_id, "mutation result integrated");
        self.bump();
        Ok(())
    }

    /// Records a speculative mutation result as an optimistic entry.
    ///
    /// The result is integrated against the composite store below the
    /// entry, and the difference becomes the entry's patch. Re-applying an
    /// id recomputes it and every entry above it.
    pub async fn apply_optimistic(
        &self,
        document: &Document,
        variables: &Variables,
        mutation_id: &str,
        result: &Map<String, JsonValue>,
        patch_operations: &[PatchOperation],
    ) -> CacheResult<()> {
        let recorded = PendingMutation {
            document: self.transform_document(document).into_owned(),
            variables: variables.clone(),
            result: result.clone(),
            patch_operations: patch_operations.to_vec(),
        };

        {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            if state.optimistic.contains(mutation_id) {
                let mut optimistic = state.optimistic.clone();
                let mut pending = state.pending.clone();
                pending.insert(mutation_id.to_string(), recorded);
                let required = Some(mutation_id);
                if let Some(error) =
                    self.replay_optimistic(&state.store, &mut optimistic, &mut pending, required)
                {
                    return Err(error);
                }
                state.optimistic = optimistic;
                state.pending = pending;
            } else {
                let before = state.optimistic.materialize(&state.store);
                let patch = self.optimistic_patch(&before, mutation_id, &recorded)?;
                state.optimistic.apply(mutation_id, patch);
                state.pending.insert(mutation_id.to_string(), recorded);
            }
        }
        self.bump();
        Ok(())
    }

    /// Drops an optimistic entry and recomputes the entries above it.
    /// Returns whether one existed.
    pub async fn remove_optimistic(&self, mutation_id: &str) -> bool {
        let removed = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let removed = state.optimistic.remove(mutation_id);
            if removed {
                state.pending.remove(mutation_id);
                self.replay_optimistic(
                    &state.store,
                    &mut state.optimistic,
                    &mut state.pending,
                    None,
                );
            }
            removed
        };
        if removed {
            self.bump();
        }
        removed
    }

    /// A copy of the store, optionally with optimistic entries flattened in.
    pub async fn extract(&self, optimistic: bool) -> NormalizedStore {
        let state = self.inner.state.read().await;
        if optimistic {
            state.optimistic.materialize(&state.store)
        } else {
            state.store.clone()
        }
    }

    /// The base store in its persisted JSON layout.
    pub async fn extract_json(&self) -> CacheResult<String> {
        self.inner.state.read().await.store.to_json_string()
    }

    /// Replaces the base store. Optimistic entries are kept.
    pub async fn restore(&self, store: NormalizedStore) {
        let records = store.len();
        self.inner.state.write().await.store = store;
        debug!(records, "store restored");
        self.bump();
    }

    /// Replaces the base store with one loaded from its JSON layout.
    pub async fn restore_json(&self, source: &str) -> CacheResult<()> {
        let store = NormalizedStore::from_json_str(source)?;
        self.restore(store).await;
        Ok(())
    }

    /// Clears the store and every optimistic entry.
    pub async fn reset(&self) {
        {
            let mut state = self.inner.state.write().await;
            state.store.clear();
            state.optimistic.clear();
            state.pending.clear();
        }
        info!("cache reset");
        self.bump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_data_id;
    use crate::mutation::{ArrayPosition, StorePath};
    use normql_syntax::parse_query;
    use serde_json::json;

    fn obj(value: JsonValue) -> Map<String, JsonValue> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn cache() -> SharedCache {
        SharedCache::new(CacheConfig::new().data_id_from_object(default_data_id))
    }

    const TODOS: &str = "{ todos { id text } }";
    const ADD_TODO: &str = "mutation($text: String!) { addTodo(text: $text) { id text } }";

    async fn seeded() -> SharedCache {
        let cache = cache();
        cache
            .write_query(
                &parse_query(TODOS).unwrap(),
                &Variables::new(),
                &obj(json!({"todos": [{"__typename": "Todo", "id": "1", "text": "a"}]})),
            )
            .await
            .unwrap();
        cache
    }

    fn insert_todo() -> Vec<PatchOperation> {
        vec![PatchOperation::ArrayInsert {
            result_path: vec!["addTodo".into()],
            store_path: StorePath::new("ROOT_QUERY", ["todos"]),
            position: ArrayPosition::Append,
        }]
    }

    async fn todo_texts(cache: &SharedCache, optimistic: bool) -> JsonValue {
        let data = cache
            .read_query(&parse_query(TODOS).unwrap(), &Variables::new(), optimistic)
            .await
            .unwrap();
        JsonValue::Array(
            data["todos"]
                .as_array()
                .into_iter()
                .flatten()
                .map(|todo| todo["text"].clone())
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let cache = seeded().await;
        let data = cache
            .read_query(&parse_query(TODOS).unwrap(), &Variables::new(), false)
            .await
            .unwrap();
        assert_eq!(
            JsonValue::Object(data),
            json!({"todos": [{"__typename": "Todo", "id": "1", "text": "a"}]})
        );
        assert_eq!(cache.version(), 1);
    }

    #[tokio::test]
    async fn test_optimistic_then_confirmed() {
        let cache = seeded().await;
        let mutation = parse_query(ADD_TODO).unwrap();
        let vars = obj(json!({"text": "b"}));
        let mut versions = cache.subscribe();

        cache
            .apply_optimistic(
                &mutation,
                &vars,
                "m1",
                &obj(json!({"addTodo": {"__typename": "Todo", "id": "tmp", "text": "b"}})),
                &insert_todo(),
            )
            .await
            .unwrap();
        assert!(versions.has_changed().unwrap());
        assert_eq!(todo_texts(&cache, true).await, json!(["a", "b"]));
        assert_eq!(todo_texts(&cache, false).await, json!(["a"]));

        cache
            .integrate_mutation(
                &mutation,
                &vars,
                "m1",
                &obj(json!({"addTodo": {"__typename": "Todo", "id": "2", "text": "b"}})),
                &insert_todo(),
            )
            .await
            .unwrap();
        assert_eq!(todo_texts(&cache, true).await, json!(["a", "b"]));
        assert_eq!(todo_texts(&cache, false).await, json!(["a", "b"]));
        assert!(!cache.extract(false).await.contains("Todo:tmp"));
    }

    #[tokio::test]
    async fn test_optimistic_rollback() {
        let cache = seeded().await;
        let before = cache.extract(true).await;
        cache
            .apply_optimistic(
                &parse_query(ADD_TODO).unwrap(),
                &obj(json!({"text": "b"})),
                "m1",
                &obj(json!({"addTodo": {"__typename": "Todo", "id": "tmp", "text": "b"}})),
                &insert_todo(),
            )
            .await
            .unwrap();

        assert!(cache.remove_optimistic("m1").await);
        assert!(!cache.remove_optimistic("m1").await);
        assert_eq!(cache.extract(true).await, before);
    }

    #[tokio::test]
    async fn test_rollback_replays_later_entries() {
        let cache = seeded().await;
        let mutation = parse_query(ADD_TODO).unwrap();
        for (id, tmp, text) in [("m1", "tmp1", "b"), ("m2", "tmp2", "c")] {
            cache
                .apply_optimistic(
                    &mutation,
                    &obj(json!({"text": text})),
                    id,
                    &obj(json!({"addTodo": {"__typename": "Todo", "id": tmp, "text": text}})),
                    &insert_todo(),
                )
                .await
                .unwrap();
        }
        assert_eq!(todo_texts(&cache, true).await, json!(["a", "b", "c"]));

        assert!(cache.remove_optimistic("m1").await);
        assert_eq!(todo_texts(&cache, true).await, json!(["a", "c"]));
        let optimistic = cache.extract(true).await;
        assert!(!optimistic.contains("Todo:tmp1"));
        assert!(optimistic.contains("Todo:tmp2"));

        cache
            .integrate_mutation(
                &mutation,
                &obj(json!({"text": "c"})),
                "m2",
                &obj(json!({"addTodo": {"__typename": "Todo", "id": "3", "text": "c"}})),
                &insert_todo(),
            )
            .await
            .unwrap();
        assert_eq!(todo_texts(&cache, true).await, json!(["a", "c"]));
        assert_eq!(cache.extract(true).await, cache.extract(false).await);
    }

    #[tokio::test]
    async fn test_confirmation_replays_entries_above() {
        let cache = seeded().await;
        let mutation = parse_query(ADD_TODO).unwrap();
        for (id, tmp, text) in [("m1", "tmp1", "b"), ("m2", "tmp2", "c")] {
            cache
                .apply_optimistic(
                    &mutation,
                    &obj(json!({"text": text})),
                    id,
                    &obj(json!({"addTodo": {"__typename": "Todo", "id": tmp, "text": text}})),
                    &insert_todo(),
                )
                .await
                .unwrap();
        }

        cache
            .integrate_mutation(
                &mutation,
                &obj(json!({"text": "b"})),
                "m1",
                &obj(json!({"addTodo": {"__typename": "Todo", "id": "2", "text": "b"}})),
                &insert_todo(),
            )
            .await
            .unwrap();
        assert_eq!(todo_texts(&cache, true).await, json!(["a", "b", "c"]));
        assert_eq!(todo_texts(&cache, false).await, json!(["a", "b"]));
        assert!(!cache.extract(true).await.contains("Todo:tmp1"));
    }

    #[tokio::test]
    async fn test_failed_reapply_keeps_entry() {
        let cache = seeded().await;
        let mutation = parse_query(ADD_TODO).unwrap();
        let vars = obj(json!({"text": "b"}));
        let added = obj(json!({"addTodo": {"__typename": "Todo", "id": "tmp", "text": "b"}}));
        cache
            .apply_optimistic(&mutation, &vars, "m1", &added, &insert_todo())
            .await
            .unwrap();

        let bad_path = vec![PatchOperation::ArrayInsert {
            result_path: vec!["addTodo".into()],
            store_path: StorePath::new("ROOT_QUERY", ["missing"]),
            position: ArrayPosition::Append,
        }];
        let err = cache
            .apply_optimistic(&mutation, &vars, "m1", &added, &bad_path)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidStorePath { .. }));
        assert_eq!(todo_texts(&cache, true).await, json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_fragments() {
        let cache = seeded().await;
        let fragment = parse_query("fragment T on Todo { text }").unwrap();

        cache
            .write_fragment(
                &fragment,
                None,
                "Todo:1",
                &Variables::new(),
                &obj(json!({"__typename": "Todo", "text": "edited"})),
            )
            .await
            .unwrap();
        let data = cache
            .read_fragment(&fragment, Some("T"), "Todo:1", &Variables::new(), false)
            .await
            .unwrap();
        assert_eq!(
            JsonValue::Object(data),
            json!({"__typename": "Todo", "text": "edited"})
        );
    }

    #[tokio::test]
    async fn test_extract_restore_reset() {
        let cache = seeded().await;
        let json = cache.extract_json().await.unwrap();

        let other = SharedCache::new(cache.config().clone());
        other.restore_json(&json).await.unwrap();
        assert_eq!(other.extract_json().await.unwrap(), json);

        other.reset().await;
        assert!(other.extract(true).await.is_empty());
        let diff = other
            .diff_query(
                &parse_query(TODOS).unwrap(),
                &Variables::new(),
                DiffOptions::new(),
                false,
            )
            .await
            .unwrap();
        assert!(!diff.complete);
    }
}
