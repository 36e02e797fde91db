//! Transient, named patches layered over the base store.
//!
//! Each in-flight optimistic mutation owns one entry. Reads see the base
//! store with every entry applied in insertion order; removing an entry
//! leaves the base and the other entries untouched.

use crate::store::{LayeredStore, NormalizedStore, StorePatch};
use tracing::debug;

/// One optimistic mutation's speculative changes.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticEntry {
    pub mutation_id: String,
    pub patch: StorePatch,
}

/// Ordered stack of optimistic patches.
#[derive(Debug, Clone, Default)]
pub struct OptimisticLayer {
    entries: Vec<OptimisticEntry>,
}

impl OptimisticLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a patch on top of the stack. Re-applying an existing id replaces
    /// its patch in place.
    pub fn apply(&mut self, mutation_id: impl Into<String>, patch: StorePatch) {
        let mutation_id = mutation_id.into();
        debug!(
            mutation_id = %mutation_id,
            records = patch.records.len(),
            tombstones = patch.tombstones.len(),
            "applying optimistic patch"
        );

        match self
            .entries
            .iter_mut()
            .find(|entry| entry.mutation_id == mutation_id)
        {
            Some(entry) => entry.patch = patch,
            None => self.entries.push(OptimisticEntry { mutation_id, patch }),
        }
    }

    /// Drops the entry for `mutation_id`. Unknown ids are ignored.
    pub fn remove(&mut self, mutation_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.mutation_id != mutation_id);
        let removed = self.entries.len() != before;
        if removed {
            debug!(mutation_id, "rolled back optimistic patch");
        }
        removed
    }

    pub fn contains(&self, mutation_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.mutation_id == mutation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Ids in application order.
    pub fn mutation_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.mutation_id.as_str())
    }

    pub fn entries(&self) -> &[OptimisticEntry] {
        &self.entries
    }

    /// A view of `base` with every patch applied in order.
    pub fn read_through<'a>(&'a self, base: &'a NormalizedStore) -> LayeredStore<'a> {
        self.entries
            .iter()
            .fold(LayeredStore::new(base), |view, entry| view.layer(&entry.patch))
    }

    /// Like [`read_through`](Self::read_through), leaving out one entry.
    pub fn read_through_without<'a>(
        &'a self,
        base: &'a NormalizedStore,
        mutation_id: &str,
    ) -> LayeredStore<'a> {
        self.entries
            .iter()
            .filter(|entry| entry.mutation_id != mutation_id)
            .fold(LayeredStore::new(base), |view, entry| view.layer(&entry.patch))
    }

    /// Flattens base plus all patches into a standalone store.
    pub fn materialize(&self, base: &NormalizedStore) -> NormalizedStore {
        self.read_through(base).materialize()
    }

    /// Recomputes every patch in order on top of `base`.
    ///
    /// `replay` receives an entry's id and the composite of `base` with the
    /// recomputed entries below it, and returns the entry's new patch.
    /// Entries it returns `None` for are dropped.
    pub fn rebase<F>(&mut self, base: &NormalizedStore, mut replay: F)
    where
        F: FnMut(&str, &NormalizedStore) -> Option<StorePatch>,
    {
        let mut composite = base.clone();
        self.entries.retain_mut(|entry| {
            let Some(patch) = replay(&entry.mutation_id, &composite) else {
                debug!(mutation_id = %entry.mutation_id, "dropped optimistic patch on rebase");
                return false;
            };
            composite.apply_patch(&patch);
            entry.patch = patch;
            true
        });
    }
}
