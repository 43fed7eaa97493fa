//! Feature store: live features, trash, and an ordered child index.
//!
//! The live map and the trash are held behind `Arc`s and copied on write,
//! so committed snapshots stay immutable and "did the feature set change"
//! is a pointer comparison.
//!
//! ```text
//! features: id -> Feature        (live)
//! trash:    id -> Feature        (soft-deleted, `at` preserved)
//! children: parent -> {(at, id)} (ordered, live features only)
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::{At, Feature};

pub type FeatureMap = FxHashMap<String, Feature>;

/// Ordered children per parent id, keyed by `(at, id)`.
///
/// The id in the key settles ties between equal `at` keys, which keeps the
/// order independent of hash map iteration.
type ChildIndex = FxHashMap<String, BTreeSet<(At, String)>>;

#[derive(Debug, Clone, Default)]
pub struct FeatureStore {
    features: Arc<FeatureMap>,
    trash: Arc<FeatureMap>,
    children: Arc<ChildIndex>,
}

impl FeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from raw maps.
    ///
    /// Ids present in both maps are kept only in the trash.
    pub fn from_maps(mut features: FeatureMap, trash: FeatureMap) -> Self {
        features.retain(|id, _| !trash.contains_key(id));
        let mut children = ChildIndex::default();
        for feature in features.values() {
            children
                .entry(feature.parent_id().to_string())
                .or_default()
                .insert((feature.at.clone(), feature.id.clone()));
        }
        Self {
            features: Arc::new(features),
            trash: Arc::new(trash),
            children: Arc::new(children),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn features(&self) -> &FeatureMap {
        &self.features
    }

    pub fn trash(&self) -> &FeatureMap {
        &self.trash
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.get(id)
    }

    pub fn get_trashed(&self, id: &str) -> Option<&Feature> {
        self.trash.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.features.contains_key(id)
    }

    pub fn is_trashed(&self, id: &str) -> bool {
        self.trash.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Ids of live children of `parent`, in display order.
    pub fn child_ids<'a>(&'a self, parent: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.children
            .get(parent)
            .into_iter()
            .flat_map(|set| set.iter().map(|(_, id)| id.as_str()))
    }

    /// Sorted `at` keys of live children of `parent`.
    pub fn child_keys(&self, parent: &str) -> Vec<&At> {
        self.children
            .get(parent)
            .map(|set| set.iter().map(|(at, _)| at).collect())
            .unwrap_or_default()
    }

    /// Whether the live map is the same allocation as `other`'s.
    ///
    /// Cheap change detection: any mutation produces a new allocation.
    pub fn same_features(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.features, &other.features)
    }

    /// Whether the trash is the same allocation as `other`'s.
    pub fn same_trash(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.trash, &other.trash)
    }

    // =========================================================================
    // Mutations (copy-on-write)
    // =========================================================================

    /// Insert or replace a live feature, taking it out of the trash if needed.
    pub fn insert(&mut self, feature: Feature) {
        if self.trash.contains_key(&feature.id) {
            Arc::make_mut(&mut self.trash).remove(&feature.id);
        }
        let features = Arc::make_mut(&mut self.features);
        let children = Arc::make_mut(&mut self.children);
        if let Some(old) = features.get(&feature.id) {
            index_remove(children, old);
        }
        index_insert(children, &feature);
        features.insert(feature.id.clone(), feature);
    }

    /// Remove a live feature without trashing it. Returns the removed feature.
    pub fn remove(&mut self, id: &str) -> Option<Feature> {
        if !self.features.contains_key(id) {
            return None;
        }
        let removed = Arc::make_mut(&mut self.features).remove(id)?;
        index_remove(Arc::make_mut(&mut self.children), &removed);
        Some(removed)
    }

    /// Insert or replace a trashed feature, taking it out of the live map.
    pub fn insert_trashed(&mut self, feature: Feature) {
        self.remove(&feature.id);
        Arc::make_mut(&mut self.trash).insert(feature.id.clone(), feature);
    }

    /// Drop a trash entry entirely.
    pub fn remove_trashed(&mut self, id: &str) -> Option<Feature> {
        if !self.trash.contains_key(id) {
            return None;
        }
        Arc::make_mut(&mut self.trash).remove(id)
    }

    /// Move the given live ids into the trash in one step, `at` untouched.
    pub fn trash_all(&mut self, ids: &[String]) {
        let features = Arc::make_mut(&mut self.features);
        let children = Arc::make_mut(&mut self.children);
        let trash = Arc::make_mut(&mut self.trash);
        for id in ids {
            if let Some(feature) = features.remove(id) {
                index_remove(children, &feature);
                trash.insert(feature.id.clone(), feature);
            }
        }
    }

    /// Move a trashed feature back into the live map.
    pub fn restore(&mut self, id: &str) -> Option<&Feature> {
        let feature = self.remove_trashed(id)?;
        self.insert(feature);
        self.features.get(id)
    }
}

fn index_insert(children: &mut ChildIndex, feature: &Feature) {
    children
        .entry(feature.parent_id().to_string())
        .or_default()
        .insert((feature.at.clone(), feature.id.clone()));
}

fn index_remove(children: &mut ChildIndex, feature: &Feature) {
    let parent = feature.parent_id();
    if let Some(set) = children.get_mut(parent) {
        set.remove(&(feature.at.clone(), feature.id.clone()));
        if set.is_empty() {
            children.remove(parent);
        }
    }
}
