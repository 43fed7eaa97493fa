//! Tree queries and mutations over a `FeatureStore`.
//!
//! Mutations take the store by reference and return a new store; the input
//! is never modified, so a failed mutation leaves nothing half-applied.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::order::{key_after, key_last};
use super::{At, Feature, FeatureError, FeatureStore, ROOT_FEATURE};

/// Partial feature update: top-level property name to new value.
pub type FeatureUpdate = Map<String, Value>;

/// Keyboard-style navigation direction for the active selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    In,
    Out,
}

// =============================================================================
// Queries
// =============================================================================

/// All live features directly under `parent`.
pub fn children_of<'a>(parent: &str, store: &'a FeatureStore) -> Vec<&'a Feature> {
    store
        .child_ids(parent)
        .filter_map(|id| store.get(id))
        .collect()
}

/// Live children of `parent`, sorted by `at` (ties by id).
///
/// The child index is kept in that order, so this is `children_of`.
pub fn display_list_of<'a>(parent: &str, store: &'a FeatureStore) -> Vec<&'a Feature> {
    children_of(parent, store)
}

/// Ids of every live descendant of `id`, depth first.
///
/// Each feature is visited once, so a parent cycle in replicated data
/// terminates.
pub fn descendants_of(id: &str, store: &FeatureStore) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    seen.insert(id);
    let mut stack: Vec<&str> = store.child_ids(id).collect();
    stack.reverse();
    while let Some(next) = stack.pop() {
        if !seen.insert(next) {
            continue;
        }
        out.push(next.to_string());
        let mut children: Vec<&str> = store.child_ids(next).collect();
        children.reverse();
        stack.extend(children);
    }
    out
}

/// Chain of ancestor ids from `id`'s parent up to (excluding) the root.
pub fn ancestors_of(id: &str, store: &FeatureStore) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = store.get(id).map(|f| f.parent_id());
    while let Some(parent) = current {
        if parent == ROOT_FEATURE || out.iter().any(|seen: &String| seen == parent) {
            break;
        }
        out.push(parent.to_string());
        current = store.get(parent).map(|f| f.parent_id());
    }
    out
}

// =============================================================================
// Ordering
// =============================================================================

/// Key for a new child of `parent` placed right after `after`.
///
/// `after = None` places it first. Fails if `after` is not a live child of
/// `parent`.
pub fn insert_after(
    store: &FeatureStore,
    parent: &str,
    after: Option<&str>,
) -> Result<At, FeatureError> {
    let siblings = store.child_keys(parent);
    let after_key = match after {
        Some(id) => {
            let feature = store
                .get(id)
                .filter(|f| f.parent_id() == parent)
                .ok_or_else(|| FeatureError::NotFound(id.to_string()))?;
            Some(&feature.at)
        }
        None => None,
    };
    Ok(key_after(parent, &siblings, after_key))
}

/// Key for a feature created while `active` is selected.
///
/// New features go right after the active one, as its sibling. With nothing
/// selected they are appended to the top level.
pub fn at_for_new(store: &FeatureStore, active: Option<&str>) -> At {
    active
        .and_then(|id| store.get(id))
        .and_then(|active| insert_after(store, active.parent_id(), Some(active.id.as_str())).ok())
        .unwrap_or_else(|| key_last(ROOT_FEATURE, &store.child_keys(ROOT_FEATURE)))
}

// =============================================================================
// Navigation
// =============================================================================

/// Next active feature after moving in `direction`.
///
/// `None` means the selection does not change.
pub fn move_active(
    direction: Direction,
    store: &FeatureStore,
    active: Option<&str>,
) -> Option<String> {
    let Some(current) = active.and_then(|id| store.get(id)) else {
        return first_child(ROOT_FEATURE, store);
    };

    match direction {
        Direction::In => {
            if !current.is_group() {
                return None;
            }
            first_child(&current.id, store)
        }
        Direction::Out => {
            let parent = current.parent_id();
            (parent != ROOT_FEATURE && store.contains(parent)).then(|| parent.to_string())
        }
        Direction::Up | Direction::Down => {
            let siblings = display_list_of(current.parent_id(), store);
            let idx = siblings.iter().position(|f| f.id == current.id)?;
            let len = siblings.len();
            let next = match direction {
                Direction::Up => (idx + len - 1) % len,
                _ => (idx + 1) % len,
            };
            (siblings[next].id != current.id).then(|| siblings[next].id.clone())
        }
    }
}

fn first_child(parent: &str, store: &FeatureStore) -> Option<String> {
    display_list_of(parent, store).first().map(|f| f.id.clone())
}

// =============================================================================
// Mutations
// =============================================================================

/// Trash `id` and all of its descendants.
///
/// Returns the new store and the feature to select next: the following
/// sibling, else the preceding one, else nothing.
pub fn delete_feature(
    store: &FeatureStore,
    id: &str,
) -> Result<(FeatureStore, Option<String>), FeatureError> {
    let feature = store
        .get(id)
        .ok_or_else(|| FeatureError::NotFound(id.to_string()))?;

    let siblings = display_list_of(feature.parent_id(), store);
    let next_active = siblings.iter().position(|s| s.id == id).and_then(|idx| {
        siblings
            .get(idx + 1)
            .or_else(|| idx.checked_sub(1).and_then(|prev| siblings.get(prev)))
            .map(|s| s.id.clone())
    });

    let mut doomed = vec![id.to_string()];
    doomed.extend(descendants_of(id, store));

    let mut next = store.clone();
    next.trash_all(&doomed);
    Ok((next, next_active))
}

/// Bring a trashed feature back, together with the trashed features below it.
///
/// Keys are untouched, so everything lands where it was deleted from.
pub fn restore_feature(store: &FeatureStore, id: &str) -> Result<FeatureStore, FeatureError> {
    if !store.is_trashed(id) {
        return Err(FeatureError::NotFound(id.to_string()));
    }

    let trash = store.trash();
    let in_subtree = |candidate: &str| {
        let mut current = candidate;
        // Bounded walk: a corrupt cycle in the trash must not hang
        for _ in 0..=trash.len() {
            if current == id {
                return true;
            }
            match trash.get(current) {
                Some(feature) => current = feature.parent_id(),
                None => return false,
            }
        }
        false
    };

    let mut next = store.clone();
    for candidate in trash.keys().filter(|c| in_subtree(c.as_str())) {
        next.restore(candidate);
    }
    Ok(next)
}

/// Apply a partial update to a live feature.
///
/// Each top-level property is replaced, except that when both the existing
/// and the new value are objects, the new object's keys are merged over the
/// old object's keys (one level deep). `id` and `type` are immutable; `at`
/// must be a valid key whose parent is not the feature or one of its
/// descendants.
pub fn update_feature(
    store: &FeatureStore,
    id: &str,
    update: &FeatureUpdate,
) -> Result<FeatureStore, FeatureError> {
    let mut feature = store
        .get(id)
        .cloned()
        .ok_or_else(|| FeatureError::NotFound(id.to_string()))?;

    for (key, value) in update {
        match key.as_str() {
            "id" | "type" => {
                return Err(FeatureError::ImmutableField {
                    id: id.to_string(),
                    field: key.clone(),
                });
            }
            "at" => {
                let raw = value.as_str().ok_or_else(|| FeatureError::InvalidUpdate {
                    id: id.to_string(),
                    field: key.clone(),
                    reason: "expected a string".to_string(),
                })?;
                let at = At::parse(raw).map_err(|e| FeatureError::InvalidUpdate {
                    id: id.to_string(),
                    field: key.clone(),
                    reason: e.to_string(),
                })?;
                let parent = at.parent();
                if parent == id || ancestors_of(parent, store).iter().any(|a| a == id) {
                    return Err(FeatureError::InvalidUpdate {
                        id: id.to_string(),
                        field: key.clone(),
                        reason: format!("`{parent}` is inside `{id}`"),
                    });
                }
                feature.at = at;
            }
            _ => merge_prop(&mut feature.props, key, value),
        }
    }

    let mut next = store.clone();
    next.insert(feature);
    Ok(next)
}

fn merge_prop(props: &mut Map<String, Value>, key: &str, value: &Value) {
    match (props.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(update)) => {
            for (k, v) in update {
                existing.insert(k.clone(), v.clone());
            }
        }
        _ => {
            props.insert(key.to_string(), value.clone());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
