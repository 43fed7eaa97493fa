//! Feature data types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::At;

/// Sentinel parent id for top-level features. Never names a real feature.
pub const ROOT_FEATURE: &str = "root";

/// Kind of a feature. Fixed once the feature is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Point,
    Route,
    Group,
}

impl FeatureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::Route => "route",
            Self::Group => "group",
        }
    }
}

/// A point, route or group in the feature tree.
///
/// Type-specific geometry and style live in `props`, flattened into the
/// serialized form next to `id`, `type` and `at`:
///
/// ```json
/// { "id": "f1", "type": "point", "at": "root.V",
///   "lngLat": [-1.5, 52.1], "style": { "icon-image": "maki-circle" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FeatureKind,
    pub at: At,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl Feature {
    pub fn new(id: impl Into<String>, kind: FeatureKind, at: At) -> Self {
        Self {
            id: id.into(),
            kind,
            at,
            props: Map::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn parent_id(&self) -> &str {
        self.at.parent()
    }

    pub fn is_group(&self) -> bool {
        self.kind == FeatureKind::Group
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Display name, if one was set.
    pub fn name(&self) -> Option<&str> {
        self.prop("name").and_then(Value::as_str)
    }

    /// Position of a point feature.
    pub fn lng_lat(&self) -> Option<[f64; 2]> {
        self.prop("lngLat").and_then(as_lng_lat)
    }

    /// Vertices of a route feature.
    pub fn coordinates(&self) -> Vec<[f64; 2]> {
        self.prop("coordinates")
            .and_then(Value::as_array)
            .map(|points| points.iter().filter_map(as_lng_lat).collect())
            .unwrap_or_default()
    }

    /// Look up `key` inside the object-valued property `style_prop`.
    pub fn style_value(&self, style_prop: &str, key: &str) -> Option<&Value> {
        self.prop(style_prop)
            .and_then(Value::as_object)
            .and_then(|style| style.get(key))
    }
}

fn as_lng_lat(value: &Value) -> Option<[f64; 2]> {
    match value.as_array()?.as_slice() {
        [lng, lat] => Some([lng.as_f64()?, lat.as_f64()?]),
        _ => None,
    }
}
