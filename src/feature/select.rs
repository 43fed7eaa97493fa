//! Derived views over the feature store.
//!
//! These are recomputed by callers only when the store's feature map
//! identity changes (see `FeatureStore::same_features`).

use rustc_hash::FxHashMap;
use serde_json::{Value, json};

use super::{Feature, FeatureKind, FeatureStore};

/// Number of sprites offered as "common" in pickers.
pub const COMMON_COUNT: usize = 14;

/// Padding for the common sprite list when few sprites are in use.
pub const DEFAULT_COMMON: &[&str] = &[
    "feature:maki-circle",
    "feature:maki-circle-stroked",
    "feature:maki-triangle",
    "feature:maki-triangle-stroked",
    "feature:maki-square",
    "feature:maki-square-stroked",
    "feature:maki-star",
    "feature:maki-star-stroked",
    "feature:maki-heart",
    "feature:maki-embassy",
    "feature:maki-marker",
    "feature:maki-marker-stroked",
    "feature:maki-campsite",
    "feature:maki-parking",
    "feature:maki-water",
];

/// GeoJSON FeatureCollection of every live point and route.
///
/// Each GeoJSON feature carries `id`, `type` and `parentId` properties so
/// style layers can filter on them. Points without a position and routes with
/// fewer than two vertices are skipped.
pub fn features_geojson(store: &FeatureStore) -> Value {
    let mut features: Vec<&Feature> = store.features().values().collect();
    features.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.id.cmp(&b.id)));

    let items: Vec<Value> = features
        .into_iter()
        .filter_map(|feature| {
            let geometry = match feature.kind {
                FeatureKind::Point => {
                    let [lng, lat] = feature.lng_lat()?;
                    json!({"type": "Point", "coordinates": [lng, lat]})
                }
                FeatureKind::Route => {
                    let coords = feature.coordinates();
                    if coords.len() < 2 {
                        return None;
                    }
                    json!({"type": "LineString", "coordinates": coords})
                }
                FeatureKind::Group => return None,
            };
            Some(json!({
                "type": "Feature",
                "id": feature.id,
                "geometry": geometry,
                "properties": {
                    "id": feature.id,
                    "type": feature.kind.as_str(),
                    "parentId": feature.parent_id(),
                },
            }))
        })
        .collect();

    json!({"type": "FeatureCollection", "features": items})
}

/// Most used icon images, padded with defaults to `COMMON_COUNT` entries.
///
/// Counts point styles, group child point and route-label styles, and route
/// label styles. At most `COMMON_COUNT - 1` entries come from usage, so at
/// least one default is always offered.
pub fn common_sprites(store: &FeatureStore) -> Vec<String> {
    let mut counts: FxHashMap<&str, usize> = FxHashMap::default();
    for feature in store.features().values() {
        let style_props: &[&str] = match feature.kind {
            FeatureKind::Point => &["style"],
            FeatureKind::Group => &["childPointStyle", "childRouteLabelStyle"],
            FeatureKind::Route => &["labelStyle"],
        };
        for style_prop in style_props {
            let sprite = feature
                .style_value(style_prop, "icon-image")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty());
            if let Some(sprite) = sprite {
                *counts.entry(sprite).or_default() += 1;
            }
        }
    }

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut out: Vec<String> = ranked
        .into_iter()
        .take(COMMON_COUNT - 1)
        .map(|(sprite, _)| sprite.to_string())
        .collect();

    for sprite in DEFAULT_COMMON {
        if out.len() == COMMON_COUNT {
            break;
        }
        if !out.iter().any(|s| s == sprite) {
            out.push((*sprite).to_string());
        }
    }
    out
}
