//! The reducer: `(state, action) -> next state`.

use std::sync::Arc;

use serde_json::json;

use super::{Action, AppState, Creating, StateError};
use crate::feature::tree::{
    at_for_new, delete_feature, move_active, restore_feature, update_feature,
};
use crate::feature::{Feature, FeatureKind};

/// Compute the state after `action`.
///
/// Returns `Ok(None)` when the action changes nothing, so no transition is
/// published. On error `state` is untouched.
pub fn reduce(state: &AppState, action: Action) -> Result<Option<AppState>, StateError> {
    let mut next = state.clone();

    match action {
        Action::SetActive(id) => {
            if state.active == id {
                return Ok(None);
            }
            next.active = id;
        }

        Action::EnterLatlngPicker(kind) => {
            let at = at_for_new(state.features(), state.active.as_deref());
            next.creating = Some(Creating { kind, at });
        }

        Action::CancelCreating => {
            if state.creating.is_none() {
                return Ok(None);
            }
            next.creating = None;
        }

        Action::CreateGroup { id } => {
            ensure_unused(state, &id)?;
            let at = at_for_new(state.features(), state.active.as_deref());
            next.sync
                .features
                .insert(Feature::new(id.clone(), FeatureKind::Group, at));
            next.active = Some(id);
        }

        Action::CreatePoint { id, at, lng_lat } => {
            ensure_unused(state, &id)?;
            let point = Feature::new(id.clone(), FeatureKind::Point, at)
                .with_prop("lngLat", json!(lng_lat))
                .with_prop("style", json!({}));
            next.sync.features.insert(point);
            next.active = Some(id);
            next.creating = None;
        }

        Action::UpdateFeature { id, update } => {
            next.sync.features = update_feature(state.features(), &id, &update)?;
        }

        Action::DeleteFeature { id } => {
            let (features, active) = delete_feature(state.features(), &id)?;
            next.sync.features = features;
            next.active = active;
        }

        Action::RestoreFeature { id } => {
            next.sync.features = restore_feature(state.features(), &id)?;
        }

        Action::MoveActive(direction) => {
            match move_active(direction, state.features(), state.active.as_deref()) {
                Some(id) if state.active.as_deref() != Some(id.as_str()) => next.active = Some(id),
                _ => return Ok(None),
            }
        }

        Action::AddLayer(mut layer) => {
            layer.opacity = checked_opacity(layer.opacity)?;
            Arc::make_mut(&mut next.sync.layers).push(layer);
        }

        Action::RemoveLayer { index } => {
            if index >= state.sync.layers.len() {
                return Err(StateError::LayerIndex(index));
            }
            Arc::make_mut(&mut next.sync.layers).remove(index);
        }

        Action::MoveLayer { from, to } => {
            let len = state.sync.layers.len();
            if from >= len {
                return Err(StateError::LayerIndex(from));
            }
            if to >= len {
                return Err(StateError::LayerIndex(to));
            }
            if from == to {
                return Ok(None);
            }
            let layers = Arc::make_mut(&mut next.sync.layers);
            let layer = layers.remove(from);
            layers.insert(to, layer);
        }

        Action::SetLayerOpacity { index, opacity } => {
            let current = state
                .sync
                .layers
                .get(index)
                .ok_or(StateError::LayerIndex(index))?;
            let opacity = checked_opacity(opacity)?;
            if current.opacity == opacity {
                return Ok(None);
            }
            Arc::make_mut(&mut next.sync.layers)[index].opacity = opacity;
        }

        Action::AddSprites(sprites) => {
            let fresh: Vec<_> = sprites
                .into_iter()
                .filter(|(id, _)| !state.sprites.contains_key(id))
                .collect();
            if fresh.is_empty() {
                return Ok(None);
            }
            Arc::make_mut(&mut next.sprites).extend(fresh);
        }

        Action::RemoteUpdate(patch) => {
            if patch.is_empty() {
                return Ok(None);
            }
            next.sync = patch.apply_to(&state.sync);
        }

        Action::RemoteAwareUpdate(peers) => {
            if *state.peers == peers {
                return Ok(None);
            }
            next.peers = Arc::new(peers);
        }

        Action::WsReportStatus(status) => {
            if state.status == status {
                return Ok(None);
            }
            next.status = status;
        }
    }

    Ok(Some(next))
}

fn ensure_unused(state: &AppState, id: &str) -> Result<(), StateError> {
    let features = state.features();
    if features.contains(id) || features.is_trashed(id) {
        return Err(StateError::DuplicateId(id.to_string()));
    }
    Ok(())
}

/// Clamp into `[0, 1]`; NaN and infinities are errors.
fn checked_opacity(opacity: f64) -> Result<f64, StateError> {
    if !opacity.is_finite() {
        return Err(StateError::InvalidOpacity(opacity));
    }
    Ok(opacity.clamp(0.0, 1.0))
}
