//! Projections between application state and the replicated document.
//!
//! Document layout:
//!
//! ```text
//! features/<id>       live feature
//! featureTrash/<id>   trashed feature
//! layers              ordered layer list
//! ```
//!
//! Both directions are diffs. Publish writes only the keys whose value
//! differs from the last published state. Absorb turns the changed keys into
//! a `SyncPatch` holding only what differs from the current local state, so
//! untouched parts of the state keep their identity.
//!
//! A feature whose trash key is set is trashed, whatever its live key says.
//! Concurrent delete and restore therefore settle on the same side on every
//! replica.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use serde_json::Value;

use super::doc::ReplicatedDoc;
use crate::debug;
use crate::feature::{Feature, FeatureStore};
use crate::state::SyncData;
use crate::style::Layer;

pub const FEATURES_PREFIX: &str = "features/";
pub const TRASH_PREFIX: &str = "featureTrash/";
pub const LAYERS_KEY: &str = "layers";

/// One document write; `None` deletes the key.
pub type DocWrite = (String, Option<Value>);

/// Where a feature lives according to the document.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureEntry {
    Live(Feature),
    Trashed(Feature),
    Gone,
}

impl FeatureEntry {
    fn matches(&self, store: &FeatureStore, id: &str) -> bool {
        match self {
            Self::Live(f) => store.get(id) == Some(f) && !store.is_trashed(id),
            Self::Trashed(f) => store.get_trashed(id) == Some(f),
            Self::Gone => !store.contains(id) && !store.is_trashed(id),
        }
    }
}

/// Changes absorbed from the document, ready to reduce into local state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPatch {
    pub features: BTreeMap<String, FeatureEntry>,
    pub layers: Option<Vec<Layer>>,
}

impl SyncPatch {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.layers.is_none()
    }

    /// Drop entries `data` already holds.
    pub fn against(mut self, data: &SyncData) -> Self {
        self.features
            .retain(|id, entry| !entry.matches(&data.features, id));
        if self.layers.as_deref() == Some(data.layers.as_slice()) {
            self.layers = None;
        }
        self
    }

    pub fn apply_to(&self, data: &SyncData) -> SyncData {
        let mut next = data.clone();
        for (id, entry) in &self.features {
            match entry {
                FeatureEntry::Live(feature) => next.features.insert(feature.clone()),
                FeatureEntry::Trashed(feature) => next.features.insert_trashed(feature.clone()),
                FeatureEntry::Gone => {
                    next.features.remove(id);
                    next.features.remove_trashed(id);
                }
            }
        }
        if let Some(layers) = &self.layers {
            next.layers = layers.clone().into();
        }
        next
    }
}

// =============================================================================
// Publish
// =============================================================================

/// Document writes turning the published `prev` into `next`.
pub fn publish_writes(prev: &SyncData, next: &SyncData) -> Vec<DocWrite> {
    let mut writes = Vec::new();

    if !(prev.features.same_features(&next.features) && prev.features.same_trash(&next.features)) {
        let mut ids: Vec<&str> = touched_ids(&prev.features, &next.features)
            .into_iter()
            .collect();
        ids.sort_unstable();
        for id in ids {
            let live = next.features.get(id).filter(|_| !next.features.is_trashed(id));
            writes.push((format!("{FEATURES_PREFIX}{id}"), live.and_then(encode)));
            let trashed = next.features.get_trashed(id);
            writes.push((format!("{TRASH_PREFIX}{id}"), trashed.and_then(encode)));
        }
    }

    if prev.layers != next.layers {
        match serde_json::to_value(next.layers.as_slice()) {
            Ok(value) => writes.push((LAYERS_KEY.to_string(), Some(value))),
            Err(e) => debug!("sync"; "cannot encode layers: {}", e),
        }
    }

    writes
}

/// Ids whose live or trash entry differs between the two stores.
fn touched_ids<'a>(prev: &'a FeatureStore, next: &'a FeatureStore) -> FxHashSet<&'a str> {
    let mut ids = FxHashSet::default();
    let pairs = [
        (prev.features(), next.features()),
        (prev.trash(), next.trash()),
    ];
    for (before, after) in pairs {
        for (id, feature) in after {
            if before.get(id) != Some(feature) {
                ids.insert(id.as_str());
            }
        }
        for id in before.keys() {
            if !after.contains_key(id) {
                ids.insert(id.as_str());
            }
        }
    }
    ids
}

fn encode(feature: &Feature) -> Option<Value> {
    serde_json::to_value(feature)
        .inspect_err(|e| debug!("sync"; "cannot encode feature {}: {}", feature.id, e))
        .ok()
}

// =============================================================================
// Absorb
// =============================================================================

/// Patch describing the current document value of every changed key.
///
/// Both keys of a touched feature are read, so the result only depends on
/// the document, not on the order the keys changed in.
pub fn absorb(doc: &dyn ReplicatedDoc, changed: &[String]) -> SyncPatch {
    let mut patch = SyncPatch::default();

    for key in changed {
        let id = key
            .strip_prefix(FEATURES_PREFIX)
            .or_else(|| key.strip_prefix(TRASH_PREFIX));
        if let Some(id) = id {
            if !patch.features.contains_key(id) {
                patch.features.insert(id.to_string(), read_feature(doc, id));
            }
        } else if key == LAYERS_KEY {
            patch.layers = Some(read_layers(doc));
        } else {
            debug!("sync"; "ignoring unknown document key {}", key);
        }
    }

    patch
}

fn read_feature(doc: &dyn ReplicatedDoc, id: &str) -> FeatureEntry {
    let decode = |value: &Value| -> Option<Feature> {
        let mut feature: Feature = serde_json::from_value(value.clone())
            .inspect_err(|e| debug!("sync"; "skipping malformed feature {}: {}", id, e))
            .ok()?;
        // The key is authoritative for the id
        feature.id = id.to_string();
        Some(feature)
    };

    let trashed = doc.get(&format!("{TRASH_PREFIX}{id}")).and_then(decode);
    if let Some(feature) = trashed {
        return FeatureEntry::Trashed(feature);
    }
    match doc.get(&format!("{FEATURES_PREFIX}{id}")).and_then(decode) {
        Some(feature) => FeatureEntry::Live(feature),
        None => FeatureEntry::Gone,
    }
}

fn read_layers(doc: &dyn ReplicatedDoc) -> Vec<Layer> {
    doc.get(LAYERS_KEY)
        .and_then(|value| {
            serde_json::from_value(value.clone())
                .inspect_err(|e| debug!("sync"; "skipping malformed layers: {}", e))
                .ok()
        })
        .unwrap_or_default()
}
